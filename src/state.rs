//! State Store (C4, §4.4).
//!
//! `state.json` is the single source of truth, written atomically via
//! a temp file and rename. Writers serialize through an advisory
//! lockfile (`state.json.lock`) created with exclusive-create
//! semantics and reclaimed once stale; readers never take the lock.

use crate::error::{CoordinatorError, Result};
use crate::model::ServerState;
use crate::paths::CoordinatorPaths;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
struct LockFileContents {
    pid: u32,
    acquired_at: chrono::DateTime<chrono::Utc>,
}

pub struct StateStore {
    paths: Arc<CoordinatorPaths>,
    stale_after: Duration,
    wait_budget: Duration,
    poll_interval: Duration,
}

impl StateStore {
    pub fn new(paths: Arc<CoordinatorPaths>, config: &crate::config::CoordinatorConfig) -> Self {
        Self {
            paths,
            stale_after: Duration::from_millis(config.state_lock_stale_ms),
            wait_budget: Duration::from_millis(config.state_lock_wait_budget_ms),
            poll_interval: Duration::from_millis(config.state_lock_poll_ms),
        }
    }

    /// Read `state.json` without taking any lock. Returns `None` if the
    /// file is absent or empty; a parse failure is logged and also
    /// yields `None` rather than an error (§4.4).
    pub async fn read(&self) -> Option<ServerState> {
        let path = self.paths.state_file();
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(_) => return None,
        };
        if bytes.is_empty() {
            return None;
        }
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(error = %e, "state.json failed to parse");
                None
            }
        }
    }

    /// Write `state` atomically: serialize to `state.json.tmp`, fsync
    /// is left to the OS page cache (per teacher convention), then
    /// rename over `state.json` (§4.4).
    async fn write(&self, state: &ServerState) -> Result<()> {
        let tmp = self.paths.state_tmp_file();
        let json = serde_json::to_vec_pretty(state)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, self.paths.state_file()).await?;
        Ok(())
    }

    /// Acquire the advisory lockfile, run `updater` against the
    /// current state (or a freshly-initialized one if absent), persist
    /// the result, then release the lock.
    ///
    /// `updater` may return an error to abort the update without
    /// writing; the lock is still released.
    pub async fn update_state<F>(&self, updater: F) -> Result<ServerState>
    where
        F: FnOnce(&mut ServerState) -> Result<()>,
    {
        self.acquire_lock().await?;
        let result = async {
            let mut state = self.read().await.unwrap_or_else(|| {
                ServerState::new(
                    self.paths.project_root.to_string_lossy().to_string(),
                    crate::config::CoordinatorConfig::default(),
                )
            });
            updater(&mut state)?;
            self.write(&state).await?;
            Ok(state)
        }
        .await;
        self.release_lock().await;
        result
    }

    async fn acquire_lock(&self) -> Result<()> {
        let lock_path = self.paths.state_lock_file();
        let deadline = tokio::time::Instant::now() + self.wait_budget;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await
            {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    let contents = LockFileContents {
                        pid: std::process::id(),
                        acquired_at: chrono::Utc::now(),
                    };
                    let json = serde_json::to_vec(&contents)?;
                    file.write_all(&json).await?;
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if self.reclaim_if_stale(&lock_path).await {
                        continue;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(CoordinatorError::ContendedState {
                            waited_ms: self.wait_budget.as_millis() as u64,
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Remove the lockfile if it is older than `stale_after`, treating
    /// it as abandoned by a crashed holder (§4.4).
    async fn reclaim_if_stale(&self, lock_path: &std::path::Path) -> bool {
        let Ok(bytes) = tokio::fs::read(lock_path).await else {
            return false;
        };
        let Ok(contents) = serde_json::from_slice::<LockFileContents>(&bytes) else {
            return false;
        };
        let age = chrono::Utc::now() - contents.acquired_at;
        if age.num_milliseconds() as u64 > self.stale_after.as_millis() as u64 {
            debug!(pid = contents.pid, "reclaiming stale state lock");
            let _ = tokio::fs::remove_file(lock_path).await;
            true
        } else {
            false
        }
    }

    async fn release_lock(&self) {
        let _ = tokio::fs::remove_file(self.paths.state_lock_file()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinatorConfig;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(CoordinatorPaths::new(dir.path()));
        let config = CoordinatorConfig::default();
        (dir, StateStore::new(paths, &config))
    }

    #[tokio::test]
    async fn read_absent_file_returns_none() {
        let (_dir, store) = store();
        assert!(store.read().await.is_none());
    }

    #[tokio::test]
    async fn update_state_initializes_and_persists() {
        let (_dir, store) = store();
        tokio::fs::create_dir_all(store.paths.coordinator_dir.clone()).await.unwrap();

        let state = store
            .update_state(|s| {
                s.task_queue.push("t1".into());
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(state.task_queue, vec!["t1".to_string()]);

        let reread = store.read().await.unwrap();
        assert_eq!(reread.task_queue, vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn lock_released_after_update_even_on_error() {
        let (_dir, store) = store();
        tokio::fs::create_dir_all(store.paths.coordinator_dir.clone()).await.unwrap();

        let err = store
            .update_state(|_s| Err(CoordinatorError::InvalidPath("nope".into())))
            .await;
        assert!(err.is_err());
        assert!(!store.paths.state_lock_file().exists());
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed() {
        let (_dir, store) = store();
        tokio::fs::create_dir_all(store.paths.coordinator_dir.clone()).await.unwrap();

        let stale = LockFileContents {
            pid: 999_999,
            acquired_at: chrono::Utc::now() - chrono::Duration::milliseconds(60_000),
        };
        tokio::fs::write(store.paths.state_lock_file(), serde_json::to_vec(&stale).unwrap())
            .await
            .unwrap();

        let result = store.update_state(|_| Ok(())).await;
        assert!(result.is_ok());
    }
}
