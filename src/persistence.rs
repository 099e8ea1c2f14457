//! Disk-backed `Persistence`: a single bincode-encoded file holding
//! `(current_term, voted_for, log)`, written atomically via a temp file and
//! rename so a crash mid-write can never leave a torn file behind.
//!
//! Grounded in the teacher's `persist_state_to_disk`/`load_state_from_disk`
//! (bincode + `RaftState` snapshotted to `raft_state_<id>.bin`), generalized
//! here to go through the `Persistence` port and to fsync before rename.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};
use crate::log::LogEntry;
use crate::ports::{Persistence, PersistedState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OnDiskState {
    current_term: u64,
    voted_for: Option<String>,
    log: Vec<LogEntry>,
}

pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone();
        let file_name = tmp.file_name().map(|n| n.to_owned()).unwrap_or_default();
        tmp.set_file_name(format!("{}.tmp", file_name.to_string_lossy()));
        tmp
    }

    async fn write_atomic(&self, state: &OnDiskState) -> Result<()> {
        let bytes = bincode::serialize(state).map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;

        let tmp_path = self.tmp_path();
        let file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;
        use tokio::io::AsyncWriteExt;
        let mut file = file;
        file.write_all(&bytes).await.map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;
        file.sync_all().await.map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;
        Ok(())
    }

    async fn read_current(&self) -> Result<OnDiskState> {
        if !Path::new(&self.path).exists() {
            return Ok(OnDiskState::default());
        }
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| RaftError::PersistenceFailure(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| RaftError::PersistenceFailure(e.to_string()))
    }
}

#[async_trait::async_trait]
impl Persistence for FilePersistence {
    async fn load(&self) -> Result<PersistedState> {
        let on_disk = self.read_current().await?;
        Ok(PersistedState {
            current_term: on_disk.current_term,
            voted_for: on_disk.voted_for,
            log: on_disk.log,
        })
    }

    async fn save_term_vote(&self, term: u64, voted_for: Option<String>) -> Result<()> {
        let mut on_disk = self.read_current().await?;
        on_disk.current_term = term;
        on_disk.voted_for = voted_for;
        self.write_atomic(&on_disk).await
    }

    async fn save_log(&self, entries: &[LogEntry]) -> Result<()> {
        let mut on_disk = self.read_current().await?;
        on_disk.log = entries.to_vec();
        self.write_atomic(&on_disk).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::LogEntry;

    #[tokio::test]
    async fn round_trips_term_vote_and_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        let persistence = FilePersistence::new(path);

        persistence.save_term_vote(3, Some("node-1".to_string())).await.unwrap();
        persistence
            .save_log(&[LogEntry { index: 1, term: 1, command: vec![1, 2, 3] }])
            .await
            .unwrap();

        let loaded = persistence.load().await.unwrap();
        assert_eq!(loaded.current_term, 3);
        assert_eq!(loaded.voted_for, Some("node-1".to_string()));
        assert_eq!(loaded.log.len(), 1);
        assert_eq!(loaded.log[0].command, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn missing_file_loads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does_not_exist.bin");
        let persistence = FilePersistence::new(path);

        let loaded = persistence.load().await.unwrap();
        assert_eq!(loaded.current_term, 0);
        assert_eq!(loaded.voted_for, None);
        assert!(loaded.log.is_empty());
    }
}
