//! In-process memory layer
//!
//! Memory is a plain store: no expiration or size policy lives here.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;

use crate::record::Record;

/// Process-local record store keyed by composed key
pub trait Memory: Send + Sync {
    /// Look up a record
    fn get(&self, key: &str) -> Option<Record<Value>>;

    /// Insert or replace a record
    fn put(&self, key: &str, record: Record<Value>);

    /// Remove a record
    fn evict(&self, key: &str);

    /// Remove every record
    fn evict_all(&self);

    /// Snapshot of the stored keys
    fn keys(&self) -> HashSet<String>;
}

/// Thread-safe map-backed memory layer
///
/// Uses RwLock for concurrent read access with exclusive write access.
/// Records are cloned out so callers never alias stored state.
#[derive(Debug, Default)]
pub struct ReferenceMapMemory {
    records: RwLock<HashMap<String, Record<Value>>>,
}

impl ReferenceMapMemory {
    /// Create an empty memory layer
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored records
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl Memory for ReferenceMapMemory {
    fn get(&self, key: &str) -> Option<Record<Value>> {
        self.records.read().get(key).cloned()
    }

    fn put(&self, key: &str, record: Record<Value>) {
        self.records.write().insert(key.to_string(), record);
    }

    fn evict(&self, key: &str) {
        self.records.write().remove(key);
    }

    fn evict_all(&self) {
        // Swap under the write lock so a concurrent put lands either before or after the clear
        let cleared = std::mem::take(&mut *self.records.write());
        drop(cleared);
    }

    fn keys(&self) -> HashSet<String> {
        self.records.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn record(data: Value) -> Record<Value> {
        Record::new(data, "serde_json::Value", 0)
    }

    #[test]
    fn test_memory_basic_operations() {
        let memory = ReferenceMapMemory::new();

        memory.put("a$$", record(json!(1)));
        memory.put("b$$", record(json!(2)));
        assert_eq!(memory.get("a$$").unwrap().data, json!(1));
        assert_eq!(memory.len(), 2);

        memory.evict("a$$");
        assert!(memory.get("a$$").is_none());
        assert_eq!(memory.keys(), HashSet::from(["b$$".to_string()]));

        memory.evict_all();
        assert!(memory.is_empty());
    }

    #[test]
    fn test_returned_records_are_detached() {
        let memory = ReferenceMapMemory::new();
        memory.put("k$$", record(json!({"n": 1})));

        let mut copy = memory.get("k$$").unwrap();
        copy.data = json!({"n": 2});

        assert_eq!(memory.get("k$$").unwrap().data, json!({"n": 1}));
    }

    #[test]
    fn test_concurrent_put_and_evict_all() {
        let memory = Arc::new(ReferenceMapMemory::new());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let memory = Arc::clone(&memory);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        memory.put(&format!("{t}-{i}$$"), record(json!(i)));
                        if i % 50 == 0 {
                            memory.evict_all();
                        }
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        for key in memory.keys() {
            assert!(memory.get(&key).is_some());
        }
    }
}
