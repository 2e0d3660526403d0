//! File Message Queue (C3, §4.3).
//!
//! Each message is one file, named so a lexicographic directory
//! listing yields chronological order within a single producer.
//! Reads never crash on a partial/corrupt file — such files are
//! skipped and logged (§4.3, §7).

use crate::message::Message;
use crate::paths::CoordinatorPaths;
use moka::sync::Cache;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Recently-seen envelope ids, so handlers can dedupe at-least-once
/// delivery by id (§4.3, §9). Shared by both coordinator and agent
/// sides; each process gets its own instance.
#[derive(Clone)]
pub struct SeenIds {
    cache: Cache<String, ()>,
}

impl SeenIds {
    pub fn new() -> Self {
        Self {
            cache: Cache::builder()
                .max_capacity(1024)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    /// Returns true the first time `id` is observed, false on repeats.
    pub fn observe(&self, id: &str) -> bool {
        if self.cache.contains_key(id) {
            false
        } else {
            self.cache.insert(id.to_string(), ());
            true
        }
    }
}

impl Default for SeenIds {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FileMessageQueue {
    paths: Arc<CoordinatorPaths>,
}

impl FileMessageQueue {
    pub fn new(paths: Arc<CoordinatorPaths>) -> Self {
        Self { paths }
    }

    pub async fn send_to_agent(&self, agent_id: &str, msg: &Message) -> std::io::Result<()> {
        let dir = self.paths.agent_inbox(agent_id);
        write_envelope(&dir, msg).await
    }

    pub async fn post_to_outbox(&self, agent_id: &str, msg: &Message) -> std::io::Result<()> {
        let dir = self.paths.agent_outbox(agent_id);
        write_envelope(&dir, msg).await
    }

    /// Fan out `msg` to every currently present agent subdirectory,
    /// optionally excluding one (§4.3).
    pub async fn broadcast(&self, msg: &Message, exclude_agent: Option<&str>) -> std::io::Result<()> {
        let agents_dir = self.paths.agents_dir();
        if !agents_dir.exists() {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(&agents_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let agent_id = entry.file_name().to_string_lossy().to_string();
            if Some(agent_id.as_str()) == exclude_agent {
                continue;
            }
            self.send_to_agent(&agent_id, msg).await?;
        }
        Ok(())
    }

    pub async fn post_global(&self, msg: &Message) -> std::io::Result<()> {
        write_envelope(&self.paths.messages_dir(), msg).await
    }

    pub async fn read_inbox(&self, agent_id: &str, delete_after_read: bool) -> Vec<Message> {
        read_envelopes(&self.paths.agent_inbox(agent_id), delete_after_read).await
    }

    pub async fn read_outbox(&self, agent_id: &str, delete_after_read: bool) -> Vec<Message> {
        read_envelopes(&self.paths.agent_outbox(agent_id), delete_after_read).await
    }

    /// Returns global-board envelopes with `timestamp > since`;
    /// read errors are ignored — the file may be mid-write (§4.3).
    pub async fn read_global_messages(&self, since: chrono::DateTime<chrono::Utc>) -> Vec<Message> {
        read_envelopes(&self.paths.messages_dir(), false)
            .await
            .into_iter()
            .filter(|m| m.timestamp > since)
            .collect()
    }

    /// Delete envelopes older than `max_age` across every inbox,
    /// outbox, and the global board (§4.3).
    pub async fn clean_old_messages(&self, max_age: chrono::Duration) -> std::io::Result<usize> {
        let cutoff = chrono::Utc::now() - max_age;
        let mut removed = 0;
        removed += clean_dir(&self.paths.messages_dir(), cutoff).await?;

        let agents_dir = self.paths.agents_dir();
        if agents_dir.exists() {
            let mut entries = tokio::fs::read_dir(&agents_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = entry.path();
                removed += clean_dir(&path.join("inbox"), cutoff).await?;
                removed += clean_dir(&path.join("outbox"), cutoff).await?;
            }
        }
        Ok(removed)
    }
}

async fn write_envelope(dir: &Path, msg: &Message) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(msg.file_name());
    let json = serde_json::to_vec_pretty(msg).expect("Message always serializes");
    tokio::fs::write(path, json).await
}

/// Read all `.json` files in `dir` in chronological (filename) order,
/// skipping and logging any file that fails to parse (§4.3).
async fn read_envelopes(dir: &Path, delete_after_read: bool) -> Vec<Message> {
    if !dir.exists() {
        return Vec::new();
    }
    let mut file_names = match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => {
            let mut names = Vec::new();
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let name = entry.file_name().to_string_lossy().to_string();
                        if name.ends_with(".json") {
                            names.push(name);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(dir = %dir.display(), error = %e, "failed to list message directory");
                        break;
                    }
                }
            }
            names
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to open message directory");
            return Vec::new();
        }
    };
    file_names.sort();

    let mut messages = Vec::with_capacity(file_names.len());
    for name in file_names {
        let path = dir.join(&name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Message>(&bytes) {
                Ok(msg) => {
                    if delete_after_read {
                        if let Err(e) = tokio::fs::remove_file(&path).await {
                            warn!(file = %path.display(), error = %e, "failed to unlink delivered message");
                        }
                    }
                    messages.push(msg);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping corrupt or partial message file");
                }
            },
            Err(e) => {
                warn!(file = %path.display(), error = %e, "skipping unreadable message file");
            }
        }
    }
    messages
}

async fn clean_dir(dir: &Path, cutoff: chrono::DateTime<chrono::Utc>) -> std::io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(bytes) = tokio::fs::read(&path).await {
            if let Ok(msg) = serde_json::from_slice::<Message>(&bytes) {
                if msg.timestamp < cutoff {
                    tokio::fs::remove_file(&path).await?;
                    removed += 1;
                }
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePayload;
    use std::sync::Arc;

    fn test_paths() -> (tempfile::TempDir, Arc<CoordinatorPaths>) {
        let dir = tempfile::tempdir().unwrap();
        let paths = Arc::new(CoordinatorPaths::new(dir.path()));
        (dir, paths)
    }

    #[tokio::test]
    async fn send_then_read_inbox_round_trips() {
        let (_dir, paths) = test_paths();
        let queue = FileMessageQueue::new(paths);
        let msg = Message::new("coordinator", MessagePayload::AgentDisconnect { agent_id: "a1".into() });
        queue.send_to_agent("a1", &msg).await.unwrap();

        let received = queue.read_inbox("a1", true).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, msg.id);

        // Delivery unlinked the file: a second read sees nothing.
        let again = queue.read_inbox("a1", true).await;
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_is_skipped_not_fatal() {
        let (_dir, paths) = test_paths();
        let queue = FileMessageQueue::new(paths.clone());
        tokio::fs::create_dir_all(paths.agent_inbox("a1")).await.unwrap();
        tokio::fs::write(paths.agent_inbox("a1").join("0-corrupt.json"), b"{not json")
            .await
            .unwrap();
        let good = Message::new("coordinator", MessagePayload::AgentDisconnect { agent_id: "a1".into() });
        queue.send_to_agent("a1", &good).await.unwrap();

        let received = queue.read_inbox("a1", false).await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].id, good.id);
    }

    #[tokio::test]
    async fn broadcast_excludes_requested_agent() {
        let (_dir, paths) = test_paths();
        let queue = FileMessageQueue::new(paths);
        tokio::fs::create_dir_all(queue.paths.agent_dir("a1")).await.unwrap();
        tokio::fs::create_dir_all(queue.paths.agent_dir("a2")).await.unwrap();

        let msg = Message::new("coordinator", MessagePayload::Broadcast { data: serde_json::json!({}) });
        queue.broadcast(&msg, Some("a1")).await.unwrap();

        assert!(queue.read_inbox("a1", false).await.is_empty());
        assert_eq!(queue.read_inbox("a2", false).await.len(), 1);
    }

    #[test]
    fn seen_ids_dedupes() {
        let seen = SeenIds::new();
        assert!(seen.observe("m1"));
        assert!(!seen.observe("m1"));
        assert!(seen.observe("m2"));
    }
}
