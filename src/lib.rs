//! warren: an embeddable, distributed, eventually-consistent, versioned
//! key-value store.
//!
//! Nodes are arranged in a topological hierarchy (datacenter / pod / rack /
//! node) and grouped into neighborhoods coordinated by master nodes. Each
//! node runs the library in-process: stores are registered by name on a
//! [`Ctx`], accessed through typed [`StoreClient`]s, and replicated across
//! the cluster using vector-clock causality to detect concurrent updates.
//! Conflicts are reduced to a single value by pluggable resolvers.
//!
//! The library provides eventual consistency only; there is no consensus,
//! no linearizability, and no automatic master election.

pub mod client;
pub mod clock;
pub mod config;
pub mod ctx;
pub mod error;
pub mod processor;
pub mod rpc;
pub mod storage;
pub mod task;
pub mod versioned;

mod registry;

pub use client::{
    default_resolver, BincodeSerializer, RawSerializer, Resolver, Serializer, StoreClient,
};
pub use clock::{NodeId, Occurred, VectorClock};
pub use config::{ClusterConfig, Neighborhood, NodeRecord, StoreConfig, NEIGH_STORE, NODE_STORE};
pub use ctx::{Ctx, DEFAULT_WORKER_POOL_SIZE};
pub use error::{Error, Result};
pub use processor::{Processor, RawListener};
pub use storage::{InMemoryStorageEngine, StorageEngine};
pub use task::{SingletonTask, TaskFn};
pub use versioned::{RawVersioned, Versioned};
