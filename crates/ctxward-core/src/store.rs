//! State Store Adapter (C7, §4.7): the minimal durability contract the rest
//! of the system depends on, plus a file-per-session implementation.
//!
//! Writes are crash-safe via temp-file + atomic rename (§6 "a partial write
//! must never yield a non-parseable blob"), favoring simple, dependency-light
//! persistence over an embedded database when the contract is this small.

use crate::error::CoreError;
use crate::models::{LearnedThresholds, SessionId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

/// One entry in a session's append-only checkpoint log (§4.7 `appendCheckpoint`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub created_at: u64,
    pub utilization_at_checkpoint: f64,
    pub kind: String,
    pub note: Option<String>,
}

/// Durable shape written by `putSession` — deliberately independent of the
/// live `SessionRecord` so the wire/disk format doesn't shift every time an
/// in-memory-only field is added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlob {
    pub session_id: String,
    pub project_id: String,
    pub model: Option<String>,
    pub current_tokens: u64,
    pub window_size: u64,
    pub operations: u64,
    pub checkpoints: u64,
    pub compaction_saves: u64,
    pub status: String,
    pub saved_at: u64,
}

/// The contract in §4.7. Any engine satisfying these operations is
/// acceptable; this crate ships a file-per-session implementation.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn put_session(&self, session_id: &SessionId, blob: &SessionBlob) -> Result<(), CoreError>;
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionBlob>, CoreError>;
    async fn append_checkpoint(
        &self,
        session_id: &SessionId,
        record: &CheckpointRecord,
    ) -> Result<(), CoreError>;
    async fn put_thresholds(
        &self,
        session_id: &SessionId,
        thresholds: &LearnedThresholds,
    ) -> Result<(), CoreError>;
    async fn get_thresholds(&self, session_id: &SessionId) -> Result<Option<LearnedThresholds>, CoreError>;
    /// Blobs quarantined because they failed to parse (§6).
    async fn list_quarantined(&self) -> Result<Vec<String>, CoreError>;
    async fn close(&self) -> Result<(), CoreError>;
}

/// File-per-session implementation: one directory tree containing a blob,
/// a thresholds file, and an append-only checkpoint log per session (§6
/// "Persisted state layout").
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(root.join("sessions")).await?;
        fs::create_dir_all(root.join("thresholds")).await?;
        fs::create_dir_all(root.join("checkpoints")).await?;
        fs::create_dir_all(root.join("quarantine")).await?;
        Ok(Self { root })
    }

    fn session_path(&self, session_id: &SessionId) -> PathBuf {
        self.root.join("sessions").join(format!("{session_id}.json"))
    }

    fn thresholds_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("thresholds")
            .join(format!("{session_id}.json"))
    }

    fn checkpoints_path(&self, session_id: &SessionId) -> PathBuf {
        self.root
            .join("checkpoints")
            .join(format!("{session_id}.jsonl"))
    }

    /// Write-temp + rename: the rename is atomic on the same filesystem, so
    /// a crash mid-write leaves either the old blob or nothing, never a
    /// truncated one (§6).
    async fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), CoreError> {
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, contents).await?;
        fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn quarantine(&self, path: &Path, session_id: &str) -> Result<(), CoreError> {
        let ts = crate::models::now_millis();
        let dest = self
            .root
            .join("quarantine")
            .join(format!("{session_id}.corrupt.{ts}"));
        warn!(session_id, dest = %dest.display(), "quarantining corrupt blob");
        if fs::rename(path, &dest).await.is_err() {
            // Source may already be gone; not fatal to quarantining.
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put_session(&self, session_id: &SessionId, blob: &SessionBlob) -> Result<(), CoreError> {
        let path = self.session_path(session_id);
        let contents = serde_json::to_vec_pretty(blob)?;
        Self::atomic_write(&path, &contents).await?;
        info!(session_id = %session_id, "session blob persisted");
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionBlob>, CoreError> {
        let path = self.session_path(session_id);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(blob) => Ok(Some(blob)),
                Err(e) => {
                    self.quarantine(&path, session_id.as_str()).await?;
                    warn!(session_id = %session_id, error = %e, "corrupt session blob quarantined");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    async fn append_checkpoint(
        &self,
        session_id: &SessionId,
        record: &CheckpointRecord,
    ) -> Result<(), CoreError> {
        use tokio::io::AsyncWriteExt;
        let path = self.checkpoints_path(session_id);
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn put_thresholds(
        &self,
        session_id: &SessionId,
        thresholds: &LearnedThresholds,
    ) -> Result<(), CoreError> {
        let path = self.thresholds_path(session_id);
        let contents = serde_json::to_vec_pretty(thresholds)?;
        Self::atomic_write(&path, &contents).await
    }

    async fn get_thresholds(&self, session_id: &SessionId) -> Result<Option<LearnedThresholds>, CoreError> {
        let path = self.thresholds_path(session_id);
        match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(t) => Ok(Some(t)),
                Err(e) => {
                    self.quarantine(&path, session_id.as_str()).await?;
                    warn!(session_id = %session_id, error = %e, "corrupt thresholds blob quarantined");
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CoreError::Io(e)),
        }
    }

    async fn list_quarantined(&self) -> Result<Vec<String>, CoreError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(self.root.join("quarantine")).await?;
        while let Some(entry) = entries.next_entry().await? {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_session_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        let id: SessionId = "s-1".into();
        let blob = SessionBlob {
            session_id: "s-1".into(),
            project_id: "p".into(),
            model: None,
            current_tokens: 1000,
            window_size: 200_000,
            operations: 1,
            checkpoints: 0,
            compaction_saves: 0,
            status: "active".into(),
            saved_at: 0,
        };
        store.put_session(&id, &blob).await.unwrap();
        let loaded = store.get_session(&id).await.unwrap().unwrap();
        assert_eq!(loaded.current_tokens, 1000);
    }

    #[tokio::test]
    async fn get_session_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        assert!(store.get_session(&"nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_blob_is_quarantined_and_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        let id: SessionId = "s-2".into();
        let path = store.session_path(&id);
        fs::write(&path, b"{not valid json").await.unwrap();

        let result = store.get_session(&id).await.unwrap();
        assert!(result.is_none());
        assert!(!path.exists());
        let quarantined = store.list_quarantined().await.unwrap();
        assert_eq!(quarantined.len(), 1);
    }

    #[tokio::test]
    async fn checkpoint_log_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        let id: SessionId = "s-3".into();
        let record = CheckpointRecord {
            created_at: 0,
            utilization_at_checkpoint: 0.75,
            kind: "checkpoint-recommended".into(),
            note: None,
        };
        store.append_checkpoint(&id, &record).await.unwrap();
        store.append_checkpoint(&id, &record).await.unwrap();

        let contents = fs::read_to_string(store.checkpoints_path(&id)).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn thresholds_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).await.unwrap();
        let id: SessionId = "s-4".into();
        let thresholds = LearnedThresholds::default();
        store.put_thresholds(&id, &thresholds).await.unwrap();
        let loaded = store.get_thresholds(&id).await.unwrap().unwrap();
        assert_eq!(loaded.checkpoint_threshold, thresholds.checkpoint_threshold);
    }
}
