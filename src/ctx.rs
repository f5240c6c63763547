//! Library context: local identity, registered stores, and the cluster
//! runtime.

use crate::client::{BincodeSerializer, Serializer, StoreClient};
use crate::clock::NodeId;
use crate::config::{ClusterConfig, StoreConfig, NEIGH_STORE, NODE_STORE};
use crate::error::{Error, Result};
use crate::processor::{Processor, RawListener};
use crate::registry::StoreRegistry;
use crate::rpc::service::RpcService;
use crate::storage::StorageEngine;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::info;

/// Default number of worker threads serving the IO loop.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 3;

struct LocalConfig {
    node_id: NodeId,
    hostname: String,
    port: u16,
    master_eligible: bool,
    configured: bool,
}

/// State shared between the public context, store clients, and the RPC
/// subsystem.
pub(crate) struct CtxShared {
    local: Mutex<LocalConfig>,
    seeds: Mutex<Vec<(String, u16)>>,
    cluster_config: RwLock<Option<Arc<ClusterConfig>>>,
    registry: StoreRegistry,
}

impl CtxShared {
    fn new() -> Arc<Self> {
        let shared = Arc::new(CtxShared {
            local: Mutex::new(LocalConfig {
                node_id: NodeId::empty(),
                hostname: String::new(),
                port: 0,
                master_eligible: false,
                configured: false,
            }),
            seeds: Mutex::new(Vec::new()),
            cluster_config: RwLock::new(None),
            registry: StoreRegistry::new(),
        });

        // The stores every node carries: who the nodes are and how the
        // neighborhoods are laid out.
        let system_config = StoreConfig {
            persistent: true,
            ..StoreConfig::default()
        };
        shared.registry.register(NODE_STORE, system_config.clone());
        shared.registry.register(NEIGH_STORE, system_config);
        shared
    }

    pub(crate) fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    pub(crate) fn local_node_id(&self) -> NodeId {
        self.local.lock().node_id.clone()
    }

    pub(crate) fn master_eligible(&self) -> bool {
        self.local.lock().master_eligible
    }

    pub(crate) fn local_endpoint_config(&self) -> Option<(String, u16)> {
        let local = self.local.lock();
        local
            .configured
            .then(|| (local.hostname.clone(), local.port))
    }

    pub(crate) fn seeds(&self) -> Vec<(String, u16)> {
        self.seeds.lock().clone()
    }

    /// The current topology snapshot; readers work lock-free afterwards.
    pub(crate) fn cluster_config(&self) -> Option<Arc<ClusterConfig>> {
        self.cluster_config.read().clone()
    }

    fn is_configured(&self) -> bool {
        self.local.lock().configured
    }
}

struct CtxState {
    runtime: Option<Runtime>,
    rpc: Option<Arc<RpcService>>,
    started: bool,
}

/// Configuration and state management for one node of the cluster.
///
/// Lifecycle: [`configure_local`](Ctx::configure_local), any number of
/// [`add_seed`](Ctx::add_seed) and [`register_store`](Ctx::register_store)
/// calls, then [`start`](Ctx::start). Stores must be registered before the
/// context starts.
pub struct Ctx {
    shared: Arc<CtxShared>,
    state: Mutex<CtxState>,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl Ctx {
    pub fn new() -> Self {
        Ctx {
            shared: CtxShared::new(),
            state: Mutex::new(CtxState {
                runtime: None,
                rpc: None,
                started: false,
            }),
        }
    }

    pub(crate) fn shared(&self) -> Arc<CtxShared> {
        self.shared.clone()
    }

    /// Set the local node's identity and endpoint. Must precede `start`.
    /// Port zero binds an ephemeral port, observable through
    /// [`local_endpoint`](Ctx::local_endpoint).
    pub fn configure_local(
        &self,
        node_id: NodeId,
        hostname: impl Into<String>,
        port: u16,
        master_eligible: bool,
    ) {
        let mut local = self.shared.local.lock();
        local.node_id = node_id;
        local.hostname = hostname.into();
        local.port = port;
        local.master_eligible = master_eligible;
        local.configured = true;
    }

    /// Add a bootstrap seed; seeds are tried in insertion order.
    pub fn add_seed(&self, hostname: impl Into<String>, port: u16) {
        self.shared.seeds.lock().push((hostname.into(), port));
    }

    /// Register a store with default configuration.
    pub fn register_store(&self, name: &str) {
        self.register_store_with_config(name, StoreConfig::default());
    }

    pub fn register_store_with_config(&self, name: &str, config: StoreConfig) {
        self.shared.registry.register(name, config);
    }

    /// Register a store backed by an injected storage engine.
    pub fn register_store_with_engine(
        &self,
        name: &str,
        config: StoreConfig,
        engine: Box<dyn StorageEngine>,
    ) {
        self.shared
            .registry
            .register_with_engine(name, config, Some(engine));
    }

    /// Start the worker pool, the RPC service, and all store processors.
    pub fn start(&self, worker_pool_size: usize) -> Result<()> {
        let mut state = self.state.lock();
        if state.started {
            return Ok(());
        }
        if !self.shared.is_configured() {
            return Err(Error::NotConfigured);
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_pool_size.max(1))
            .thread_name("warren-worker")
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();

        let rpc = RpcService::new(self.shared.clone(), handle.clone())?;
        runtime.block_on(rpc.start())?;
        self.shared.registry.start(&handle);

        info!(target: "warren::cluster",
              local = %self.shared.local_node_id(), "context started");
        state.runtime = Some(runtime);
        state.rpc = Some(rpc);
        state.started = true;
        Ok(())
    }

    /// Stop the RPC service, the processors, and the worker pool.
    /// Idempotent.
    pub fn stop(&self) {
        let (runtime, rpc) = {
            let mut state = self.state.lock();
            if !state.started {
                return;
            }
            state.started = false;
            (state.runtime.take(), state.rpc.take())
        };

        if let Some(rpc) = rpc {
            rpc.stop();
        }
        self.shared.registry.stop();
        if let Some(runtime) = runtime {
            runtime.shutdown_timeout(Duration::from_secs(5));
        }
        info!(target: "warren::cluster",
              local = %self.shared.local_node_id(), "context stopped");
    }

    /// The raw byte-level store registered under `name`.
    pub fn get_raw_store(&self, name: &str) -> Result<Arc<Processor>> {
        self.shared.registry.get(name)
    }

    /// A typed client for a registered store, with bincode serialization
    /// and the default last-writer-wins resolver.
    pub fn store_client<K, V>(&self, name: &str) -> Result<StoreClient<K, V>>
    where
        BincodeSerializer<K>: Serializer<K>,
        BincodeSerializer<V>: Serializer<V>,
    {
        StoreClient::new(self, name)
    }

    /// Subscribe to raw change notifications for a store.
    pub fn add_raw_listener(&self, name: &str, listener: RawListener) -> Result<()> {
        self.shared.registry.get(name)?.add_listener(listener);
        Ok(())
    }

    pub fn get_local_node_id(&self) -> NodeId {
        self.shared.local_node_id()
    }

    /// Install a static topology snapshot and nudge connection
    /// maintenance.
    pub fn set_static_config(&self, config: ClusterConfig) {
        *self.shared.cluster_config.write() = Some(Arc::new(config));
        if let Some(rpc) = self.state.lock().rpc.as_ref() {
            rpc.kick_maintenance();
        }
    }

    /// Whether a ready connection to the given node exists.
    pub fn is_node_ready(&self, id: &NodeId) -> bool {
        self.state
            .lock()
            .rpc
            .as_ref()
            .map(|rpc| rpc.is_ready(id))
            .unwrap_or(false)
    }

    /// The actually bound RPC endpoint, once started.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .rpc
            .as_ref()
            .and_then(|rpc| rpc.local_addr())
    }

    /// Ask a remote node for its versions of a key in `store`. The reply
    /// is applied into the local store and observable through listeners as
    /// a remote-origin change.
    pub fn fetch_remote(&self, node: &NodeId, store: &str, key: &[u8]) -> Result<()> {
        // Fail fast for stores that were never registered.
        let _ = self.shared.registry.get(store)?;
        let rpc = self
            .state
            .lock()
            .rpc
            .as_ref()
            .cloned()
            .ok_or(Error::NotConfigured)?;
        rpc.fetch_remote(node, store, key);
        Ok(())
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        self.stop();
    }
}
