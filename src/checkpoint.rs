//! Durable copy of the run state.
//!
//! Every STATE message the engine emits is also written here when a state
//! file is configured, so a restart can resume without replaying the
//! output stream.
//!
//! # Example
//!
//! ```rust,no_run
//! use mongo_capture::bookmarks::State;
//! use mongo_capture::checkpoint::CheckpointManager;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = CheckpointManager::new("state.json");
//!
//!     let state = match manager.load().await? {
//!         Some(state) => state,
//!         None => State::new(),
//!     };
//!     println!("Resuming with {} bookmarked streams", state.bookmarks.len());
//!
//!     manager.save(&state).await?;
//!     Ok(())
//! }
//! ```

use crate::bookmarks::State;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Persists [`State`] to a single JSON file.
///
/// Writes go through a temporary file that is synced and renamed over the
/// target, so a crash mid-write leaves the previous state intact.
pub struct CheckpointManager {
    file_path: PathBuf,
}

impl CheckpointManager {
    pub fn new(state_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: state_path.as_ref().to_path_buf(),
        }
    }

    /// Loads the state file if it exists.
    ///
    /// Returns `None` on a first run. A file that exists but does not hold
    /// a state object is a configuration error.
    pub async fn load(&self) -> Result<Option<State>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No state file found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read state file: {}", e);
            Error::Io(e)
        })?;
        match serde_json::from_str::<State>(&content) {
            Ok(state) => {
                info!(
                    streams = state.bookmarks.len(),
                    currently_syncing = ?state.currently_syncing,
                    "Loaded state from {:?}",
                    self.file_path
                );
                Ok(Some(state))
            }
            Err(e) => {
                error!("Failed to parse state file: {}", e);
                Err(Error::Config(format!(
                    "Invalid state file {}: {}",
                    self.file_path.display(),
                    e
                )))
            }
        }
    }

    /// Saves `state` atomically.
    pub async fn save(&self, state: &State) -> Result<()> {
        let temp_path = self.file_path.with_extension("tmp");

        let json = serde_json::to_string_pretty(state)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.file_path).await?;

        debug!(currently_syncing = ?state.currently_syncing, "State saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mongo::OplogPosition;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_state_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("state.json"));

        assert!(manager.load().await.unwrap().is_none());

        let mut state = State::new();
        state.set_currently_syncing(Some("shop-orders"));
        state
            .bookmark_mut("shop-orders")
            .set_oplog_position(OplogPosition::new(1_700_000_000, 4));
        manager.save(&state).await.unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn test_save_replaces_previous_state() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        let manager = CheckpointManager::new(&path);

        let mut state = State::new();
        state.bookmark_mut("shop-orders").set_version(1);
        manager.save(&state).await.unwrap();
        state.bookmark_mut("shop-orders").set_version(2);
        manager.save(&state).await.unwrap();

        let loaded = manager.load().await.unwrap().unwrap();
        assert_eq!(loaded.bookmark("shop-orders").unwrap().version(), Some(2));
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_state_is_configuration_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "{ not json").await.unwrap();

        let err = CheckpointManager::new(&path).load().await.unwrap_err();
        assert!(err.is_configuration());
    }
}
