use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::capability::sorted_labels;
use super::{Task, TaskOutput};

pub const CACHE_TTL: Duration = Duration::from_secs(600);
pub const CACHE_CAPACITY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: String,
    capabilities: Vec<String>,
    query: String,
}

impl CacheKey {
    pub fn for_task(model: &str, task: &Task) -> Self {
        Self {
            model: model.to_string(),
            capabilities: sorted_labels(task.required_capabilities()),
            query: task.query().to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    output: TaskOutput,
    stored_at: Instant,
}

/// Response cache private to one agent. Entries expire after the TTL; once
/// over capacity the oldest entries go first.
#[derive(Debug)]
pub struct ResponseCache {
    entries: HashMap<CacheKey, CacheEntry>,
    ttl: Duration,
    capacity: usize,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAPACITY)
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<TaskOutput> {
        self.get_at(key, Instant::now())
    }

    pub fn insert(&mut self, key: CacheKey, output: TaskOutput) {
        self.insert_at(key, output, Instant::now());
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn get_at(&mut self, key: &CacheKey, now: Instant) -> Option<TaskOutput> {
        let expired = match self.entries.get(key) {
            Some(entry) => now.saturating_duration_since(entry.stored_at) > self.ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| e.output.clone())
    }

    fn insert_at(&mut self, key: CacheKey, output: TaskOutput, now: Instant) {
        self.entries.insert(key, CacheEntry { output, stored_at: now });
        while self.entries.len() > self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }
}
