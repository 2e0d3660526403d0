//! Paths & Config (C1) — directory layout resolution.
//!
//! Resolves the coordinator root relative to a project directory and
//! derives every path the rest of the crate needs, matching the
//! on-disk layout fixed in §6.1 of the spec.

use std::path::{Path, PathBuf};

/// Marker files/directories whose presence identifies a project root
/// when walking upward from a starting directory.
const ROOT_MARKERS: &[&str] = &[".git", "Cargo.toml", "package.json", ".agent-coordinator"];

const COORDINATOR_DIR_NAME: &str = ".agent-coordinator";

/// Walk upward from `start` looking for the first ancestor containing
/// any of [`ROOT_MARKERS`]. Falls back to `start` itself if none is
/// found.
pub fn find_project_root(start: &Path) -> PathBuf {
    let mut current = start;
    loop {
        if ROOT_MARKERS.iter().any(|marker| current.join(marker).exists()) {
            return current.to_path_buf();
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return start.to_path_buf(),
        }
    }
}

/// All paths derived from a project root, per §6.1.
#[derive(Debug, Clone)]
pub struct CoordinatorPaths {
    pub project_root: PathBuf,
    pub coordinator_dir: PathBuf,
}

impl CoordinatorPaths {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let coordinator_dir = project_root.join(COORDINATOR_DIR_NAME);
        Self {
            project_root,
            coordinator_dir,
        }
    }

    pub fn discover(start: &Path) -> Self {
        Self::new(find_project_root(start))
    }

    pub fn state_file(&self) -> PathBuf {
        self.coordinator_dir.join("state.json")
    }

    pub fn state_lock_file(&self) -> PathBuf {
        self.coordinator_dir.join("state.json.lock")
    }

    pub fn state_tmp_file(&self) -> PathBuf {
        self.coordinator_dir.join("state.json.tmp")
    }

    pub fn config_file(&self) -> PathBuf {
        self.coordinator_dir.join("config.json")
    }

    pub fn gitignore_file(&self) -> PathBuf {
        self.coordinator_dir.join(".gitignore")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.coordinator_dir.join("tasks")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.coordinator_dir.join("locks")
    }

    pub fn locks_file(&self) -> PathBuf {
        self.locks_dir().join("active.json")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.coordinator_dir.join("agents")
    }

    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_dir().join(agent_id)
    }

    pub fn agent_inbox(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("inbox")
    }

    pub fn agent_outbox(&self, agent_id: &str) -> PathBuf {
        self.agent_dir(agent_id).join("outbox")
    }

    pub fn messages_dir(&self) -> PathBuf {
        self.coordinator_dir.join("messages")
    }

    /// Normalize a path as the Lock Manager requires: absolute paths
    /// become relative to the project root; all paths are
    /// forward-slash normalized with trailing slashes stripped
    /// (§4.5, §9 open question 4).
    pub fn canonicalize_lock_path(&self, path: &str) -> String {
        let p = Path::new(path);
        let relative = if p.is_absolute() {
            p.strip_prefix(&self.project_root).unwrap_or(p)
        } else {
            p
        };
        let normalized = relative
            .to_string_lossy()
            .replace('\\', "/");
        normalized.trim_end_matches('/').to_string()
    }

    const GITIGNORE_CONTENTS: &'static str =
        "state.json\nstate.json.lock\nstate.json.tmp\nagents/\nmessages/\nlocks/\n";

    pub async fn ensure_layout(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.coordinator_dir).await?;
        tokio::fs::create_dir_all(self.tasks_dir()).await?;
        tokio::fs::create_dir_all(self.locks_dir()).await?;
        tokio::fs::create_dir_all(self.agents_dir()).await?;
        tokio::fs::create_dir_all(self.messages_dir()).await?;
        if !self.gitignore_file().exists() {
            tokio::fs::write(self.gitignore_file(), Self::GITIGNORE_CONTENTS).await?;
        }
        Ok(())
    }
}
