//! Id-keyed entries with last-activity tracking

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Tracked<T> {
    value: T,
    last_activity: Instant,
}

/// Registry whose entries expire after a period without activity
pub struct IdleRegistry<T: Clone> {
    entries: Mutex<HashMap<String, Tracked<T>>>,
}

impl<T: Clone> Default for IdleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IdleRegistry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, id: String, value: T, now: Instant) {
        self.entries.lock().insert(
            id,
            Tracked {
                value,
                last_activity: now,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.entries.lock().get(id).map(|t| t.value.clone())
    }

    /// Fetch and mark as active in one step
    pub fn touch(&self, id: &str, now: Instant) -> Option<T> {
        let mut entries = self.entries.lock();
        let tracked = entries.get_mut(id)?;
        tracked.last_activity = now;
        Some(tracked.value.clone())
    }

    pub fn remove(&self, id: &str) -> Option<T> {
        self.entries.lock().remove(id).map(|t| t.value)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Remove and return entries idle for strictly longer than `timeout`
    pub fn reap(&self, now: Instant, timeout: Duration) -> Vec<(String, T)> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, t)| now.saturating_duration_since(t.last_activity) > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| entries.remove(&id).map(|t| (id, t.value)))
            .collect()
    }

    /// Remove everything
    pub fn drain(&self) -> Vec<(String, T)> {
        self.entries
            .lock()
            .drain()
            .map(|(id, t)| (id, t.value))
            .collect()
    }
}
