use super::Session;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};

/// Closed sessions, one JSON file per run under `sessions/`.
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn save(&self, session: &Session) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).context("Failed to create sessions directory")?;
        let path = self.dir.join(format!("{}.json", session.file_key()));
        let json = serde_json::to_string_pretty(session).context("Failed to serialize session")?;
        crate::util::write_atomic(&path, json.as_bytes())
            .with_context(|| format!("Failed to write session file: {}", path.display()))?;
        Ok(path)
    }

    /// Session files, most recent first.
    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read sessions directory: {}", self.dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .collect();
        files.sort();
        files.reverse();
        Ok(files)
    }

    pub fn load(&self, path: &Path) -> Result<Session> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse session file: {}", path.display()))
    }

    /// All sessions, most recent first. Unreadable files are skipped with a warning.
    pub fn list(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        for path in self.list_files()? {
            match self.load(&path) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable session"),
            }
        }
        Ok(sessions)
    }

    pub fn total_cost_since(&self, cutoff: DateTime<Utc>) -> Result<f64> {
        Ok(total_cost_since(&self.list()?, cutoff))
    }
}

/// Sum of session costs whose start is at or after `cutoff`.
pub fn total_cost_since(sessions: &[Session], cutoff: DateTime<Utc>) -> f64 {
    sessions
        .iter()
        .filter(|s| s.start >= cutoff)
        .map(|s| s.totals.cost)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Usage;
    use crate::usage::UsageEvent;
    use chrono::Duration;
    use tempfile::tempdir;

    fn session_with_cost(cost: f64, days_ago: i64) -> Session {
        let mut session = Session::new(None);
        session.start = Utc::now() - Duration::days(days_ago);
        session.record(&UsageEvent::from_usage(&Usage::new("sonnet", 10, 10, cost)));
        session.close();
        session
    }

    #[test]
    fn save_then_list_round_trips() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(&dir.path().join("sessions"));
        let session = session_with_cost(1.25, 0);
        let path = store.save(&session).unwrap();

        assert!(path.file_name().unwrap().to_string_lossy().ends_with(".json"));
        let listed = store.list().unwrap();
        assert_eq!(listed, vec![session]);
    }

    #[test]
    fn list_is_newest_first() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save(&session_with_cost(1.0, 10)).unwrap();
        store.save(&session_with_cost(2.0, 1)).unwrap();
        let listed = store.list().unwrap();
        assert!(listed[0].start > listed[1].start);
    }

    #[test]
    fn total_cost_respects_cutoff() {
        let sessions = vec![
            session_with_cost(1.0, 1),
            session_with_cost(2.0, 20),
            session_with_cost(4.0, 40),
        ];
        let cutoff = Utc::now() - Duration::days(30);
        assert!((total_cost_since(&sessions, cutoff) - 3.0).abs() < 1e-9);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(&dir.path().join("absent"));
        assert!(store.list().unwrap().is_empty());
    }
}
