use std::collections::HashMap;
use tokio::sync::Mutex;

/// Results memoized for the lifetime of one pipeline run.
///
/// Concurrent misses on the same key may both fetch; the last insert wins.
pub struct RunCache<V> {
    entries: Mutex<HashMap<String, V>>,
}

impl<V: Clone> RunCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn insert(&self, key: impl Into<String>, value: V) {
        self.entries.lock().await.insert(key.into(), value);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

impl<V: Clone> Default for RunCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
