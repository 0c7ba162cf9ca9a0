//! Server-Sent Events publication (C8, §4.8 `GET /events`).
//!
//! `ctxward_core::EventBus` is a plain `tokio::broadcast` with no history,
//! so late subscribers miss whatever fired before they connected. `SseHub`
//! is the projection the core's `event.rs` doc comment calls for: it
//! subscribes once, stamps every event with a monotonically increasing
//! `seq`, keeps the last `capacity` of them in a ring for `Last-Event-ID`
//! replay, and re-broadcasts to however many SSE clients are attached.

use axum::response::sse::{Event, KeepAlive};
use ctxward_core::{EventBus, GovernorEvent};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SeqEvent {
    pub seq: u64,
    #[serde(flatten)]
    pub event: GovernorEvent,
}

fn event_type_name(event: &GovernorEvent) -> &'static str {
    match event {
        GovernorEvent::SessionCreated { .. } => "session:created",
        GovernorEvent::SessionUpdated { .. } => "session:updated",
        GovernorEvent::SessionClosed { .. } => "session:closed",
        GovernorEvent::Decision(_) => "decision",
        GovernorEvent::AlertTriggered(_) => "alert:triggered",
        GovernorEvent::ContextCleared { .. } => "context:cleared",
        GovernorEvent::ParallelSessions { .. } => "pattern:parallel-sessions",
        GovernorEvent::HighVelocity { .. } => "pattern:high-velocity",
    }
}

fn to_sse_event(tagged: &SeqEvent) -> Event {
    let data = serde_json::to_string(tagged).unwrap_or_else(|_| "{}".to_string());
    Event::default()
        .id(tagged.seq.to_string())
        .event(event_type_name(&tagged.event))
        .data(data)
}

struct Ring {
    items: Mutex<VecDeque<SeqEvent>>,
    capacity: usize,
}

impl Ring {
    fn push(&self, event: SeqEvent) {
        let mut items = self.items.lock();
        items.push_back(event);
        while items.len() > self.capacity {
            items.pop_front();
        }
    }
}

/// Fans core events out to SSE clients with replay. Cheap to clone (`Arc`
/// internally via the fields it's normally held behind).
pub struct SseHub {
    ring: Arc<Ring>,
    next_seq: Arc<AtomicU64>,
    live: broadcast::Sender<SeqEvent>,
}

impl SseHub {
    /// Spawns the background pump that drains `events` for the lifetime of
    /// the process; there is exactly one of these per running server.
    pub fn new(events: EventBus, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let ring = Arc::new(Ring {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        });
        let next_seq = Arc::new(AtomicU64::new(1));
        let (live, _) = broadcast::channel(capacity.max(16));

        tokio::spawn(Self::pump(events, ring.clone(), next_seq.clone(), live.clone()));

        Self { ring, next_seq, live }
    }

    async fn pump(
        events: EventBus,
        ring: Arc<Ring>,
        next_seq: Arc<AtomicU64>,
        live: broadcast::Sender<SeqEvent>,
    ) {
        let mut rx = events.subscribe();
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let seq = next_seq.fetch_add(1, Ordering::Relaxed);
                    let tagged = SeqEvent { seq, event };
                    ring.push(tagged.clone());
                    let _ = live.send(tagged);
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// `Last-Event-ID` replay (§4.8 ordering guarantees): at most the last
    /// `capacity` events newer than `last_event_id`, then the live tail.
    /// seq-filtering on the live side makes this correct regardless of the
    /// exact interleaving between the ring snapshot and the subscribe call:
    /// any event already in the snapshot is skipped when it also shows up
    /// live.
    pub fn stream(&self, last_event_id: Option<u64>) -> impl Stream<Item = Result<Event, Infallible>> {
        let (replay, watermark, live_rx) = {
            let items = self.ring.items.lock();
            let replay: Vec<SeqEvent> = items
                .iter()
                .filter(|e| last_event_id.is_none_or(|id| e.seq > id))
                .cloned()
                .collect();
            let watermark = items.back().map(|e| e.seq).unwrap_or(0);
            (replay, watermark, self.live.subscribe())
        };

        let replay_stream = stream::iter(replay.into_iter().map(|e| Ok(to_sse_event(&e))));
        let live_stream = BroadcastStream::new(live_rx).filter_map(move |res| {
            let out = match res {
                Ok(tagged) if tagged.seq > watermark => Some(Ok(to_sse_event(&tagged))),
                _ => None,
            };
            std::future::ready(out)
        });

        replay_stream.chain(live_stream)
    }

    pub fn keep_alive() -> KeepAlive {
        KeepAlive::default()
    }
}
