use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-story run locks. Holding a story's guard is what makes a run the
/// only in-flight execution for that story; schedulers that share a
/// `StoryLocks` serialize on it.
#[derive(Debug, Clone, Default)]
pub struct StoryLocks {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl StoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, story: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(story.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive access to `story`.
    pub async fn acquire(&self, story: &str) -> OwnedMutexGuard<()> {
        self.lock_for(story).lock_owned().await
    }

    pub fn try_acquire(&self, story: &str) -> Option<OwnedMutexGuard<()>> {
        self.lock_for(story).try_lock_owned().ok()
    }
}
