//! Per-agent memory store.
//!
//! Each agent owns one append-only JSONL file under `.storyforge/memory/`.
//! Access is scoped by agent id; appends to the same agent are serialized.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_key: Option<String>,
    pub text: String,
}

impl MemoryEntry {
    pub fn new(story_key: Option<&str>, text: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            story_key: story_key.map(String::from),
            text: text.to_string(),
        }
    }
}

pub struct MemoryStore {
    dir: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, agent_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", agent_id))
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// All entries for an agent, oldest first. Unparseable lines are skipped.
    pub fn read(&self, agent_id: &str) -> Result<Vec<MemoryEntry>> {
        let path = self.path_for(agent_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read memory file: {}", path.display()))?;
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// The most recent `limit` entries, oldest first.
    pub fn recent(&self, agent_id: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let mut entries = self.read(agent_id)?;
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }

    pub fn append(&self, agent_id: &str, entry: &MemoryEntry) -> Result<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        fs::create_dir_all(&self.dir).context("Failed to create memory directory")?;
        let mut line = serde_json::to_string(entry).context("Failed to serialize memory entry")?;
        line.push('\n');

        let path = self.path_for(agent_id);
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open memory file: {}", path.display()))?
            .write_all(line.as_bytes())
            .context("Failed to append memory entry")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_are_scoped_per_agent() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store
            .append("developer", &MemoryEntry::new(Some("1-1"), "uses axum"))
            .unwrap();
        store
            .append("reviewer", &MemoryEntry::new(None, "flag unwraps"))
            .unwrap();

        let dev = store.read("developer").unwrap();
        assert_eq!(dev.len(), 1);
        assert_eq!(dev[0].text, "uses axum");
        assert_eq!(dev[0].story_key.as_deref(), Some("1-1"));
        assert_eq!(store.read("reviewer").unwrap().len(), 1);
        assert!(store.read("architect").unwrap().is_empty());
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        for i in 0..5 {
            store
                .append("developer", &MemoryEntry::new(None, &format!("note {}", i)))
                .unwrap();
        }
        let recent = store.recent("developer", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "note 3");
        assert_eq!(recent[1].text, "note 4");
    }

    #[test]
    fn concurrent_appends_do_not_interleave() {
        let dir = tempdir().unwrap();
        let store = Arc::new(MemoryStore::new(dir.path()));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .append("developer", &MemoryEntry::new(None, &format!("entry {}", i)))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.read("developer").unwrap().len(), 8);
    }
}
