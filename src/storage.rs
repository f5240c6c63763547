//! Storage engine interface and the in-memory backend.

use crate::error::Result;
use crate::versioned::{antichain_insert, RawVersioned};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A key/value backend local to the current node.
///
/// Each key maps to an antichain of versioned values; `put` accepts a value
/// only when its clock is not before or equal to an existing version.
/// Durable backends are injected by the embedder through
/// [`Ctx::register_store_with_engine`](crate::ctx::Ctx::register_store_with_engine).
pub trait StorageEngine: Send + Sync {
    /// The antichain of values for a key; empty when the key is unknown.
    fn get(&self, key: &[u8]) -> Result<Vec<RawVersioned>>;

    /// Store a versioned value. Returns `false` when the value is obsolete
    /// (before or equal to every existing version).
    fn put(&self, key: &[u8], value: &RawVersioned) -> Result<bool>;

    fn name(&self) -> &str;
}

/// Non-persistent storage engine backed by a mutex-protected map.
pub struct InMemoryStorageEngine {
    name: String,
    records: Mutex<HashMap<Vec<u8>, Vec<RawVersioned>>>,
}

impl InMemoryStorageEngine {
    pub fn new(name: impl Into<String>) -> Self {
        InMemoryStorageEngine {
            name: name.into(),
            records: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageEngine for InMemoryStorageEngine {
    fn get(&self, key: &[u8]) -> Result<Vec<RawVersioned>> {
        let records = self.records.lock();
        Ok(records.get(key).cloned().unwrap_or_default())
    }

    fn put(&self, key: &[u8], value: &RawVersioned) -> Result<bool> {
        let mut records = self.records.lock();
        let values = records.entry(key.to_vec()).or_default();
        Ok(antichain_insert(values, value))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{NodeId, VectorClock};
    use crate::versioned::Versioned;
    use std::time::SystemTime;

    fn versioned(value: &str, id: &[u32], counter: u64) -> RawVersioned {
        Versioned::new(
            Some(value.as_bytes().to_vec()),
            VectorClock::with_entries(
                SystemTime::now(),
                vec![(NodeId::new(id.to_vec()), counter)],
            ),
        )
    }

    #[test]
    fn test_get_unknown_key_is_empty() {
        let engine = InMemoryStorageEngine::new("test");
        assert!(engine.get(b"missing").unwrap().is_empty());
        assert_eq!("test", engine.name());
    }

    #[test]
    fn test_put_then_get() {
        let engine = InMemoryStorageEngine::new("test");
        let v = versioned("hello", &[1], 1);
        assert!(engine.put(b"k", &v).unwrap());
        assert_eq!(vec![v], engine.get(b"k").unwrap());
    }

    #[test]
    fn test_put_obsolete_rejected() {
        let engine = InMemoryStorageEngine::new("test");
        assert!(engine.put(b"k", &versioned("new", &[1], 2)).unwrap());
        assert!(!engine.put(b"k", &versioned("old", &[1], 1)).unwrap());
        assert!(!engine.put(b"k", &versioned("same", &[1], 2)).unwrap());
    }

    #[test]
    fn test_put_concurrent_builds_antichain() {
        let engine = InMemoryStorageEngine::new("test");
        assert!(engine.put(b"k", &versioned("a", &[1], 1)).unwrap());
        assert!(engine.put(b"k", &versioned("b", &[2], 1)).unwrap());
        assert_eq!(2, engine.get(b"k").unwrap().len());
    }
}
