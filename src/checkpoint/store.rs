use super::{Checkpoint, CheckpointId};
use crate::errors::CheckpointError;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Checkpoint series on disk: `<root>/<story>/<sequence:06>.json`.
///
/// Saves for one story are serialized by an in-process mutex and an advisory
/// lock file, so sequence numbers are strictly increasing even across
/// processes. Reads take no lock.
pub struct CheckpointStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Series directory for a story. Keys that are not a plain path
    /// component are rejected so nothing lands outside `root`.
    fn story_dir(&self, story_id: &str) -> Result<PathBuf, CheckpointError> {
        crate::story::validate_key(story_id).map_err(|_| CheckpointError::InvalidStory {
            story: story_id.to_string(),
        })?;
        Ok(self.root.join(story_id))
    }

    fn checkpoint_path(&self, id: &CheckpointId) -> Result<PathBuf, CheckpointError> {
        Ok(self.story_dir(&id.story_id)?.join(format!("{:06}.json", id.sequence)))
    }

    fn story_lock(&self, story_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(story_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn lock_file(&self, story_id: &str) -> Result<File, CheckpointError> {
        let dir = self.story_dir(story_id)?;
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(".lock"))
            .map_err(|source| CheckpointError::Lock {
                story: story_id.to_string(),
                source,
            })?;
        fs2::FileExt::lock_exclusive(&file).map_err(|source| CheckpointError::Lock {
            story: story_id.to_string(),
            source,
        })?;
        Ok(file)
    }

    /// Sequence numbers present for a story, ascending.
    fn sequences(&self, story_id: &str) -> Result<Vec<u64>, CheckpointError> {
        let dir = self.story_dir(story_id)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        let mut seqs: Vec<u64> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".json")?.parse::<u64>().ok()
            })
            .collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    /// Persist a checkpoint, assigning `sequence = latest + 1` and its digest.
    pub fn save(&self, mut checkpoint: Checkpoint) -> Result<CheckpointId, CheckpointError> {
        let story_id = checkpoint.story_id.clone();
        let lock = self.story_lock(&story_id);
        let _guard = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file_lock = self.lock_file(&story_id)?;

        let next = self.sequences(&story_id)?.last().copied().unwrap_or(0) + 1;
        checkpoint.sequence = next;
        checkpoint.digest = checkpoint.compute_digest();

        let id = checkpoint.id();
        let path = self.checkpoint_path(&id)?;
        let json = serde_json::to_vec_pretty(&checkpoint).map_err(|e| CheckpointError::Corrupt {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        crate::util::write_atomic(&path, &json)?;
        debug!(checkpoint = %id, phase = %checkpoint.phase_name, trigger = %checkpoint.trigger, "checkpoint saved");
        Ok(id)
    }

    /// Load and verify one checkpoint.
    pub fn restore(&self, id: &CheckpointId) -> Result<Checkpoint, CheckpointError> {
        let path = self.checkpoint_path(id)?;
        if !path.exists() {
            return Err(CheckpointError::NotFound { id: id.to_string() });
        }
        let content = fs::read_to_string(&path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        let checkpoint: Checkpoint =
            serde_json::from_str(&content).map_err(|e| CheckpointError::Corrupt {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        if checkpoint.id() != *id {
            return Err(CheckpointError::Corrupt {
                id: id.to_string(),
                reason: format!("file holds {}", checkpoint.id()),
            });
        }
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    /// Highest-sequence checkpoint for a story.
    pub fn latest(&self, story_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        match self.sequences(story_id)?.last() {
            Some(seq) => self.restore(&CheckpointId::new(story_id, *seq)).map(Some),
            None => Ok(None),
        }
    }

    /// All checkpoints for a story, ascending by sequence.
    pub fn list(&self, story_id: &str) -> Result<Vec<Checkpoint>, CheckpointError> {
        self.sequences(story_id)?
            .into_iter()
            .map(|seq| self.restore(&CheckpointId::new(story_id, seq)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointTrigger;
    use tempfile::tempdir;

    fn cp(story: &str, phase: &str, state: &str) -> Checkpoint {
        Checkpoint::new(story, phase, CheckpointTrigger::PhaseEnd, state.to_string(), 100)
    }

    #[test]
    fn test_save_assigns_increasing_sequences() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let a = store.save(cp("S", "plan", "{\"n\":1}")).unwrap();
        let b = store.save(cp("S", "implement", "{\"n\":2}")).unwrap();
        let other = store.save(cp("T", "plan", "{}")).unwrap();
        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        assert_eq!(other.sequence, 1);
    }

    #[test]
    fn test_restore_latest_returns_third_state_exactly() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(cp("S", "plan", "{\"done\":[\"plan\"]}")).unwrap();
        store.save(cp("S", "implement", "{\"done\":[\"plan\",\"implement\"]}")).unwrap();
        store.save(cp("S", "review", "{\"only\":\"third\"}")).unwrap();

        let latest = store.latest("S").unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        let restored = store.restore(&latest.id()).unwrap();
        assert_eq!(restored.serialized_state, "{\"only\":\"third\"}");
        assert_eq!(restored.phase_name, "review");
    }

    #[test]
    fn test_list_is_ascending() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for i in 0..3 {
            store.save(cp("S", "plan", &format!("{{\"i\":{}}}", i))).unwrap();
        }
        let seqs: Vec<u64> = store.list("S").unwrap().iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert!(store.list("unknown").unwrap().is_empty());
        assert!(store.latest("unknown").unwrap().is_none());
    }

    #[test]
    fn test_restore_missing_is_not_found() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let err = store.restore(&CheckpointId::new("S", 9)).unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[test]
    fn test_tampered_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let id = store.save(cp("S", "plan", "{\"a\":1}")).unwrap();
        let path = dir.path().join("S").join("000001.json");
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("{\\\"a\\\":1}", "{\\\"a\\\":2}")).unwrap();
        assert!(matches!(
            store.restore(&id),
            Err(CheckpointError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        store.save(cp("S", "plan", "{}")).unwrap();
        let mut names: Vec<String> = fs::read_dir(dir.path().join("S"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec![".lock".to_string(), "000001.json".to_string()]);
    }

    #[test]
    fn test_concurrent_saves_get_unique_sequences() {
        let dir = tempdir().unwrap();
        let store = Arc::new(CheckpointStore::new(dir.path()));
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.save(cp("S", "plan", &format!("{{\"i\":{}}}", i))).unwrap())
            })
            .collect();
        let mut seqs: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap().sequence).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_key_outside_root_is_rejected() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(&dir.path().join("checkpoints"));

        let err = store.save(cp("../escape", "plan", "state")).unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidStory { .. }));
        assert!(matches!(store.list("a/b"), Err(CheckpointError::InvalidStory { .. })));
        assert!(!dir.path().join("escape").exists());
    }
}
