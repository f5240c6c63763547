//! Store and cluster configuration.

use crate::clock::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Name of the system store mapping node IDs to node records.
pub const NODE_STORE: &str = "__sys_node_store";

/// Name of the system store mapping neighborhood prefixes to neighborhoods.
pub const NEIGH_STORE: &str = "__sys_neigh_store";

/// Per-store configuration.
///
/// `scope` governs how far keys propagate through the topology;
/// `replication_factor` governs how many nodes hold copies within scope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Write values through to a durable backend when one is available.
    pub persistent: bool,
    /// Number of copies to hold within scope.
    pub replication_factor: u8,
    /// Topological distance keys propagate.
    pub scope: u8,
    /// Values older than this are expired by the processor timer.
    /// Zero means values never expire.
    pub object_timeout: Duration,
    /// Tombstones older than this are garbage-collected.
    pub tombstone_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            persistent: false,
            replication_factor: 3,
            scope: 1,
            object_timeout: Duration::ZERO,
            tombstone_timeout: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Address and role information for a cluster node, stored in the system
/// node store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub hostname: String,
    pub port: u16,
    pub master_eligible: bool,
}

/// A set of nodes sharing a node-ID prefix, plus the masters that
/// coordinate traffic on the neighborhood's behalf.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighborhood {
    pub prefix: NodeId,
    pub masters: Vec<NodeId>,
}

/// An immutable snapshot of the cluster topology: a mapping from
/// neighborhood prefix to neighborhood.
///
/// Readers hold an `Arc<ClusterConfig>` snapshot and work lock-free after
/// the load.
#[derive(Clone, Debug, Default)]
pub struct ClusterConfig {
    neighborhoods: HashMap<NodeId, Arc<Neighborhood>>,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a neighborhood keyed by its prefix.
    pub fn add_neighborhood(&mut self, neigh: Neighborhood) {
        self.neighborhoods
            .insert(neigh.prefix.clone(), Arc::new(neigh));
    }

    pub fn neighborhood(&self, prefix: &NodeId) -> Option<&Arc<Neighborhood>> {
        self.neighborhoods.get(prefix)
    }

    pub fn neighborhoods(&self) -> impl Iterator<Item = &Arc<Neighborhood>> {
        self.neighborhoods.values()
    }

    pub fn is_empty(&self) -> bool {
        self.neighborhoods.is_empty()
    }
}
