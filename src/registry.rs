//! Store registry.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::processor::Processor;
use crate::storage::{InMemoryStorageEngine, StorageEngine};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::debug;

/// Creates and owns one processor per registered store.
///
/// Iteration order is the store-name order, so start and stop walk the
/// processors deterministically.
pub(crate) struct StoreRegistry {
    stores: Mutex<BTreeMap<String, Arc<Processor>>>,
}

impl StoreRegistry {
    pub(crate) fn new() -> Self {
        StoreRegistry {
            stores: Mutex::new(BTreeMap::new()),
        }
    }

    /// Register a store, creating its processor. A `persistent` store with
    /// no injected engine falls back to a write-through in-memory engine.
    pub(crate) fn register(&self, name: &str, config: StoreConfig) {
        let delegate: Option<Box<dyn StorageEngine>> = if config.persistent {
            Some(Box::new(InMemoryStorageEngine::new(name)))
        } else {
            None
        };
        self.register_with_engine(name, config, delegate);
    }

    pub(crate) fn register_with_engine(
        &self,
        name: &str,
        config: StoreConfig,
        engine: Option<Box<dyn StorageEngine>>,
    ) {
        debug!(target: "warren::store", store = name, "registering store");
        let processor = Processor::new(name, config, engine);
        self.stores.lock().insert(name.to_string(), processor);
    }

    pub(crate) fn get(&self, name: &str) -> Result<Arc<Processor>> {
        self.stores
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownStore(name.to_string()))
    }

    pub(crate) fn start(&self, handle: &Handle) {
        for processor in self.stores.lock().values() {
            processor.start(handle);
        }
    }

    pub(crate) fn stop(&self) {
        for processor in self.stores.lock().values() {
            processor.stop();
        }
    }
}
