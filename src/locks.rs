//! Lock Manager (C5, §4.5).
//!
//! Locks are held in memory, keyed by canonicalized path, and mirrored
//! to `locks/active.json` after every mutation so a restarted
//! coordinator can reload non-expired locks. Acquisition sweeps
//! expired locks first, then an all-or-nothing request is honored
//! per-path: a failed path does not roll back paths already acquired
//! in the same call (§9 open question 1).

use crate::message::{LockConflict, LockRequest, LockResult};
use crate::model::FileLock;
use crate::paths::CoordinatorPaths;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct LockManager {
    paths: Arc<CoordinatorPaths>,
    locks: Mutex<HashMap<String, FileLock>>,
    default_timeout_ms: u64,
}

impl LockManager {
    pub fn new(paths: Arc<CoordinatorPaths>, default_timeout_ms: u64) -> Self {
        Self {
            paths,
            locks: Mutex::new(HashMap::new()),
            default_timeout_ms,
        }
    }

    /// Reload non-expired locks from `locks/active.json` on startup
    /// (§4.5). Missing or corrupt files start from an empty table.
    pub async fn load(&self) -> std::io::Result<()> {
        let path = self.paths.locks_file();
        if !path.exists() {
            return Ok(());
        }
        let bytes = tokio::fs::read(&path).await?;
        let Ok(all) = serde_json::from_slice::<Vec<FileLock>>(&bytes) else {
            return Ok(());
        };
        let now = Utc::now();
        let mut locks = self.locks.lock().await;
        for lock in all {
            if !lock.is_expired(now) {
                locks.insert(lock.path.clone(), lock);
            }
        }
        Ok(())
    }

    async fn persist(&self, locks: &HashMap<String, FileLock>) -> std::io::Result<()> {
        tokio::fs::create_dir_all(self.paths.locks_dir()).await?;
        let all: Vec<&FileLock> = locks.values().collect();
        let json = serde_json::to_vec_pretty(&all).expect("locks always serialize");
        tokio::fs::write(self.paths.locks_file(), json).await
    }

    fn sweep_expired(locks: &mut HashMap<String, FileLock>) {
        let now = Utc::now();
        locks.retain(|_, lock| !lock.is_expired(now));
    }

    /// Attempt to acquire every path in `request`, canonicalizing each
    /// first. Paths already held by another agent in an incompatible
    /// mode are reported as conflicts; everything else succeeds, even
    /// if some paths in the same request fail (§4.5, §9).
    pub async fn acquire_locks(&self, request: &LockRequest) -> std::io::Result<LockResult> {
        let timeout_ms = request.timeout_ms.unwrap_or(self.default_timeout_ms);
        let now = Utc::now();
        let expires_at = now + chrono::Duration::milliseconds(timeout_ms as i64);

        let mut locks = self.locks.lock().await;
        Self::sweep_expired(&mut locks);

        let mut acquired = Vec::new();
        let mut failed = Vec::new();
        let mut conflicts = Vec::new();

        for raw_path in &request.paths {
            let path = self.paths.canonicalize_lock_path(raw_path);
            match locks.get(&path) {
                Some(existing) if existing.agent_id != request.agent_id => {
                    if existing.lock_type.compatible_with(request.lock_type) {
                        acquired.push(path);
                    } else {
                        failed.push(path.clone());
                        conflicts.push(LockConflict {
                            path,
                            held_by: existing.agent_id.clone(),
                        });
                    }
                }
                _ => {
                    locks.insert(
                        path.clone(),
                        FileLock {
                            path: path.clone(),
                            agent_id: request.agent_id.clone(),
                            task_id: request.task_id.clone(),
                            locked_at: now,
                            expires_at,
                            lock_type: request.lock_type,
                        },
                    );
                    acquired.push(path);
                }
            }
        }

        self.persist(&locks).await?;
        debug!(acquired = acquired.len(), failed = failed.len(), "lock acquisition attempt");

        Ok(LockResult {
            success: failed.is_empty(),
            acquired,
            failed,
            conflicts,
        })
    }

    pub async fn release_locks(&self, agent_id: &str, paths: &[String]) -> std::io::Result<()> {
        let mut locks = self.locks.lock().await;
        for raw_path in paths {
            let path = self.paths.canonicalize_lock_path(raw_path);
            if locks.get(&path).map(|l| l.agent_id.as_str()) == Some(agent_id) {
                locks.remove(&path);
            }
        }
        self.persist(&locks).await
    }

    pub async fn release_all_for_agent(&self, agent_id: &str) -> std::io::Result<()> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.agent_id != agent_id);
        self.persist(&locks).await
    }

    pub async fn release_task_locks(&self, task_id: &str) -> std::io::Result<()> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| lock.task_id.as_deref() != Some(task_id));
        self.persist(&locks).await
    }

    /// Unconditionally remove a lock regardless of owner, for operator
    /// intervention (§4.5).
    pub async fn force_release(&self, raw_path: &str) -> std::io::Result<()> {
        let path = self.paths.canonicalize_lock_path(raw_path);
        let mut locks = self.locks.lock().await;
        locks.remove(&path);
        self.persist(&locks).await
    }

    /// Extend an existing lock's expiry; only the owning agent may
    /// extend, and extension is additive from now rather than from the
    /// original expiry (§4.5).
    pub async fn extend_lock(&self, agent_id: &str, raw_path: &str, extra_ms: u64) -> std::io::Result<bool> {
        let path = self.paths.canonicalize_lock_path(raw_path);
        let mut locks = self.locks.lock().await;
        match locks.get_mut(&path) {
            Some(lock) if lock.agent_id == agent_id => {
                lock.expires_at = Utc::now() + chrono::Duration::milliseconds(extra_ms as i64);
                self.persist(&locks).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Snapshot of all non-expired locks, for status reporting (§6.3).
    pub async fn list(&self) -> Vec<FileLock> {
        let mut locks = self.locks.lock().await;
        Self::sweep_expired(&mut locks);
        locks.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LockType;

    fn manager() -> (tempfile::TempDir, LockManager) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(CoordinatorPaths::new(dir.path()));
        (dir, LockManager::new(paths, 300_000))
    }

    fn request(agent: &str, paths: &[&str], lock_type: LockType) -> LockRequest {
        LockRequest {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            lock_type,
            agent_id: agent.to_string(),
            task_id: None,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn disjoint_paths_both_succeed() {
        let (_dir, mgr) = manager();
        let r1 = mgr.acquire_locks(&request("a1", &["a.rs"], LockType::Write)).await.unwrap();
        let r2 = mgr.acquire_locks(&request("a2", &["b.rs"], LockType::Write)).await.unwrap();
        assert!(r1.success);
        assert!(r2.success);
    }

    #[tokio::test]
    async fn conflicting_write_locks_are_reported_without_rolling_back_others() {
        let (_dir, mgr) = manager();
        mgr.acquire_locks(&request("a1", &["a.rs"], LockType::Write)).await.unwrap();

        let result = mgr
            .acquire_locks(&request("a2", &["a.rs", "b.rs"], LockType::Write))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.acquired, vec!["b.rs".to_string()]);
        assert_eq!(result.failed, vec!["a.rs".to_string()]);
        assert_eq!(result.conflicts[0].held_by, "a1");
    }

    #[tokio::test]
    async fn read_locks_are_shareable() {
        let (_dir, mgr) = manager();
        mgr.acquire_locks(&request("a1", &["a.rs"], LockType::Read)).await.unwrap();
        let r2 = mgr.acquire_locks(&request("a2", &["a.rs"], LockType::Read)).await.unwrap();
        assert!(r2.success);
    }

    #[tokio::test]
    async fn release_then_reacquire_by_different_agent_succeeds() {
        let (_dir, mgr) = manager();
        mgr.acquire_locks(&request("a1", &["a.rs"], LockType::Write)).await.unwrap();
        mgr.release_locks("a1", &["a.rs".to_string()]).await.unwrap();
        let r2 = mgr.acquire_locks(&request("a2", &["a.rs"], LockType::Write)).await.unwrap();
        assert!(r2.success);
    }

    #[tokio::test]
    async fn load_skips_expired_locks() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(CoordinatorPaths::new(dir.path()));
        tokio::fs::create_dir_all(paths.locks_dir()).await.unwrap();
        let expired = FileLock {
            path: "a.rs".into(),
            agent_id: "a1".into(),
            task_id: None,
            locked_at: Utc::now() - chrono::Duration::seconds(100),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            lock_type: LockType::Write,
        };
        tokio::fs::write(paths.locks_file(), serde_json::to_vec(&vec![expired]).unwrap())
            .await
            .unwrap();

        let mgr = LockManager::new(paths, 300_000);
        mgr.load().await.unwrap();
        assert!(mgr.list().await.is_empty());
    }
}
