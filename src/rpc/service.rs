//! The connection manager.
//!
//! Maintains at most one live connection per remote node as required by the
//! cluster topology, bootstraps from seeds, and queues per-node actions
//! until the node's connection becomes ready.

use crate::client::{default_resolver, StoreClient};
use crate::clock::NodeId;
use crate::config::{Neighborhood, NodeRecord, NODE_STORE};
use crate::ctx::CtxShared;
use crate::error::{Error, Result};
use crate::rpc::connection::{RpcConnection, StopHandler};
use crate::rpc::handler::ConnectionHandler;
use crate::rpc::message::{ReqGet, Request, RpcMessage};
use crate::task::SingletonTask;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Period of the connection maintenance pass.
const MANAGE_CONNS_INTERVAL: Duration = Duration::from_secs(3);

/// An action to run on a node's connection once it is ready.
pub(crate) type NodeAction = Box<dyn FnOnce(Arc<RpcConnection>) + Send>;

struct NodeConn {
    conn: Option<Arc<RpcConnection>>,
    ready: bool,
    last_required: Instant,
    /// Pending actions in insertion order, coalesced by key.
    actions: Vec<(String, NodeAction)>,
}

impl NodeConn {
    fn new(now: Instant) -> Self {
        NodeConn {
            conn: None,
            ready: false,
            last_required: now,
            actions: Vec::new(),
        }
    }
}

struct ServiceState {
    seed_index: usize,
    bootstrap_conn_id: Option<u64>,
    node_connections: HashMap<NodeId, NodeConn>,
}

pub(crate) struct RpcService {
    self_ref: Weak<RpcService>,
    ctx: Arc<CtxShared>,
    handle: Handle,
    running: AtomicBool,
    next_conn_id: AtomicU64,
    /// Every live connection by connection ID, including ones whose remote
    /// node is not yet known.
    connections: DashMap<u64, Arc<RpcConnection>>,
    state: Mutex<ServiceState>,
    manage_task: SingletonTask,
    listener_addr: Mutex<Option<SocketAddr>>,
    accept_shutdown: Mutex<Option<watch::Sender<bool>>>,
    node_client: StoreClient<NodeId, NodeRecord>,
}

impl RpcService {
    pub(crate) fn new(ctx: Arc<CtxShared>, handle: Handle) -> Result<Arc<Self>> {
        let node_client = StoreClient::new_shared(ctx.clone(), NODE_STORE, default_resolver())?;
        Ok(Arc::new_cyclic(|self_ref: &Weak<RpcService>| {
            let task_ref = self_ref.clone();
            let manage_task = SingletonTask::new(
                handle.clone(),
                Arc::new(move || {
                    let task_ref = task_ref.clone();
                    async move {
                        if let Some(service) = task_ref.upgrade() {
                            service.manage_conns();
                        }
                    }
                    .boxed()
                }),
            );
            RpcService {
                self_ref: self_ref.clone(),
                ctx,
                handle,
                running: AtomicBool::new(false),
                next_conn_id: AtomicU64::new(0),
                connections: DashMap::new(),
                state: Mutex::new(ServiceState {
                    seed_index: 0,
                    bootstrap_conn_id: None,
                    node_connections: HashMap::new(),
                }),
                manage_task,
                listener_addr: Mutex::new(None),
                accept_shutdown: Mutex::new(None),
                node_client,
            }
        }))
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.listener_addr.lock()
    }

    /// Bind the local endpoint, start accepting, and kick off bootstrap and
    /// connection maintenance.
    pub(crate) async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (hostname, port) = self.ctx.local_endpoint_config().ok_or(Error::NotConfigured)?;
        let listener = TcpListener::bind((hostname.as_str(), port)).await?;
        let addr = listener.local_addr()?;
        *self.listener_addr.lock() = Some(addr);
        info!(target: "warren::rpc",
              local = %self.ctx.local_node_id(), "listening on {addr}");

        let (tx, rx) = watch::channel(false);
        *self.accept_shutdown.lock() = Some(tx);
        if let Some(service) = self.self_ref.upgrade() {
            self.handle.spawn(accept_loop(service, listener, rx));
        }

        self.bootstrap();
        self.schedule_manage(Duration::ZERO);
        Ok(())
    }

    /// Disconnect everything and stop the service. Idempotent.
    pub(crate) fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.manage_task.cancel();
        if let Some(tx) = self.accept_shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let conns: Vec<_> = self
            .connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for conn in conns {
            conn.stop();
        }
    }

    /// Whether there is a ready connection for the given node.
    pub(crate) fn is_ready(&self, id: &NodeId) -> bool {
        let state = self.state.lock();
        state
            .node_connections
            .get(id)
            .map(|entry| entry.ready && entry.conn.is_some())
            .unwrap_or(false)
    }

    /// Nudge the maintenance pass after a lifecycle change.
    pub(crate) fn kick_maintenance(&self) {
        self.schedule_manage(Duration::ZERO);
    }

    fn schedule_manage(&self, delay: Duration) {
        if self.running() {
            self.manage_task.schedule(delay);
        }
    }

    fn new_conn(&self, intended: NodeId) -> Arc<RpcConnection> {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let handler = Arc::new(ConnectionHandler::new(self.ctx.clone()));

        let weak = self.self_ref.clone();
        let intended_ready = intended.clone();
        handler.add_ready_listener(Arc::new(move |conn| {
            if let Some(service) = weak.upgrade() {
                service.handle_ready(&intended_ready, conn);
            }
        }));

        let weak = self.self_ref.clone();
        let stop_handler: StopHandler = Box::new(move |conn| {
            if let Some(service) = weak.upgrade() {
                service.handle_stop(&intended, conn);
            }
        });

        RpcConnection::new(self.ctx.clone(), conn_id, handler, Some(stop_handler))
    }

    /// Try the next seed; called at start and whenever the current
    /// bootstrap connection dies.
    fn bootstrap(&self) {
        let seeds = self.ctx.seeds();
        let (conn, hostname, port) = {
            let mut state = self.state.lock();
            if state.seed_index >= seeds.len() {
                if !seeds.is_empty() {
                    error!(target: "warren::rpc",
                           local = %self.ctx.local_node_id(),
                           "could not connect to any seed for bootstrapping");
                }
                return;
            }
            let (hostname, port) = seeds[state.seed_index].clone();
            state.seed_index += 1;
            let conn = self.new_conn(NodeId::empty());
            state.bootstrap_conn_id = Some(conn.conn_id());
            (conn, hostname, port)
        };

        info!(target: "warren::rpc",
              local = %self.ctx.local_node_id(),
              "bootstrapping via {hostname}:{port}");
        self.connections.insert(conn.conn_id(), conn.clone());
        conn.start_client(&self.handle, hostname, port);
    }

    /// Ready transition for a connection: reset the seed iterator, check
    /// that the remote is who we dialed, install the connection in the
    /// per-node table, and flush queued actions in insertion order.
    fn handle_ready(&self, intended: &NodeId, conn: &Arc<RpcConnection>) {
        let mut to_stop: Vec<Arc<RpcConnection>> = Vec::new();
        let mut to_run: Vec<(NodeAction, Arc<RpcConnection>)> = Vec::new();
        {
            let mut state = self.state.lock();
            state.seed_index = 0;

            let rid = conn.handler().remote_node_id();
            if !intended.is_empty() && rid != *intended {
                error!(target: "warren::rpc",
                       local = %self.ctx.local_node_id(), conn = conn.conn_id(),
                       "remote node ID {rid} unexpected; should be {intended}");
                to_stop.push(conn.clone());
            } else if !rid.is_empty() {
                let now = Instant::now();
                let entry = state
                    .node_connections
                    .entry(rid.clone())
                    .or_insert_with(|| NodeConn::new(now));
                let same = entry
                    .conn
                    .as_ref()
                    .map(|existing| Arc::ptr_eq(existing, conn))
                    .unwrap_or(false);
                if !same {
                    if let Some(old) = entry.conn.take() {
                        error!(target: "warren::rpc",
                               local = %self.ctx.local_node_id(), conn = conn.conn_id(),
                               "removing old connection from {rid}");
                        to_stop.push(old);
                    }
                    entry.conn = Some(conn.clone());
                }
                entry.ready = true;
                for (_, action) in entry.actions.drain(..) {
                    to_run.push((action, conn.clone()));
                }
            }
        }
        for old in to_stop {
            old.stop();
        }
        for (action, conn) in to_run {
            self.handle.spawn(async move { action(conn) });
        }
    }

    /// Stop transition: clear the per-node slot and, when the bootstrap
    /// connection failed, roll over to the next seed.
    fn handle_stop(&self, intended: &NodeId, conn: &Arc<RpcConnection>) {
        self.connections.remove(&conn.conn_id());

        let mut need_bootstrap = false;
        {
            let mut state = self.state.lock();
            let effective = if intended.is_empty() {
                conn.handler().remote_node_id()
            } else {
                intended.clone()
            };
            if !effective.is_empty() {
                if let Some(entry) = state.node_connections.get_mut(&effective) {
                    let same = entry
                        .conn
                        .as_ref()
                        .map(|existing| Arc::ptr_eq(existing, conn))
                        .unwrap_or(false);
                    if same {
                        entry.conn = None;
                        entry.ready = false;
                    }
                }
            }
            if self.running() && state.bootstrap_conn_id == Some(conn.conn_id()) {
                state.bootstrap_conn_id = None;
                need_bootstrap = true;
            }
        }
        if need_bootstrap {
            self.bootstrap();
        }
        self.schedule_manage(Duration::ZERO);
    }

    /// One maintenance pass: ensure the topology-required connections exist
    /// and evict entries nothing has required for two intervals.
    fn manage_conns(&self) {
        if !self.running() {
            return;
        }

        if let Some(config) = self.ctx.cluster_config() {
            let local = self.ctx.local_node_id();
            if self.ctx.master_eligible() {
                // A master keeps a connection to every master above it,
                // in every neighborhood.
                for neigh in config.neighborhoods() {
                    self.connect_to_neighborhood(neigh);
                }
            } else if let Some(neigh) = config.neighborhood(&local.neighborhood_prefix()) {
                self.connect_to_neighborhood(neigh);
            }
        }

        let now = Instant::now();
        let mut to_stop = Vec::new();
        {
            let mut state = self.state.lock();
            state.node_connections.retain(|id, entry| {
                if entry.actions.is_empty()
                    && now > entry.last_required + MANAGE_CONNS_INTERVAL * 2
                {
                    debug!(target: "warren::rpc",
                           local = %self.ctx.local_node_id(), node = %id,
                           "node connection no longer required");
                    if let Some(conn) = entry.conn.take() {
                        to_stop.push(conn);
                    }
                    false
                } else {
                    true
                }
            });
        }
        for conn in to_stop {
            conn.stop();
        }

        self.schedule_manage(MANAGE_CONNS_INTERVAL);
    }

    fn connect_to_neighborhood(&self, neigh: &Neighborhood) {
        let local = self.ctx.local_node_id();
        for master in &neigh.masters {
            if *master == local {
                continue;
            }
            // Between masters only the lower ID dials, so each pair holds
            // a single connection.
            if self.ctx.master_eligible() && *master <= local {
                continue;
            }
            let mut state = self.state.lock();
            self.connect_to_node_locked(&mut state, master);
        }
    }

    /// Mark the node required and open a connection when none exists. The
    /// node's address comes from the system node store; when the record is
    /// not yet known the connect stays deferred until replication delivers
    /// it.
    fn connect_to_node_locked(&self, state: &mut ServiceState, id: &NodeId) {
        let now = Instant::now();
        if let Some(entry) = state.node_connections.get_mut(id) {
            entry.last_required = now;
            if entry.conn.is_some() {
                return;
            }
        } else {
            state.node_connections.insert(id.clone(), NodeConn::new(now));
        }

        let record = match self.node_client.get(id) {
            Ok(record) => record,
            Err(err) => {
                warn!(target: "warren::rpc",
                      local = %self.ctx.local_node_id(), node = %id,
                      "node record lookup failed: {err}");
                return;
            }
        };
        let Some(record) = record.get().cloned() else {
            debug!(target: "warren::rpc",
                   local = %self.ctx.local_node_id(), node = %id,
                   "address unknown, deferring connect");
            return;
        };

        let conn = self.new_conn(id.clone());
        self.connections.insert(conn.conn_id(), conn.clone());
        if let Some(entry) = state.node_connections.get_mut(id) {
            entry.conn = Some(conn.clone());
        }
        conn.start_client(&self.handle, record.hostname, record.port);
    }

    /// Run `action` on the node's connection as soon as it is ready; when
    /// the node is already ready the action runs immediately but
    /// asynchronously. Actions queued under an already-pending key are
    /// dropped.
    pub(crate) fn dispatch_node_action(&self, id: &NodeId, action_key: &str, action: NodeAction) {
        let mut action = Some(action);
        let mut run_now: Option<(Arc<RpcConnection>, NodeAction)> = None;
        {
            let mut state = self.state.lock();
            self.connect_to_node_locked(&mut state, id);
            if let Some(entry) = state.node_connections.get_mut(id) {
                if entry.ready {
                    if let (Some(conn), Some(action)) = (entry.conn.clone(), action.take()) {
                        run_now = Some((conn, action));
                    }
                } else if !entry.actions.iter().any(|(key, _)| key == action_key) {
                    if let Some(action) = action.take() {
                        entry.actions.push((action_key.to_string(), action));
                    }
                }
            }
        }
        if let Some((conn, action)) = run_now {
            self.handle.spawn(async move { action(conn) });
        }
    }

    /// Ask a remote node for its versions of a key; the reply is applied
    /// into the local store as remote-origin writes.
    pub(crate) fn fetch_remote(&self, id: &NodeId, store: &str, key: &[u8]) {
        let req = ReqGet {
            store: store.to_string(),
            key: key.to_vec(),
        };
        let action_key = format!("get:{}:{:x?}", store, key);
        self.dispatch_node_action(
            id,
            &action_key,
            Box::new(move |conn| {
                let xid = conn.next_xid();
                conn.handler().register_pending_get(xid, req.clone());
                conn.send_message(RpcMessage::request(xid, Request::Get(req)));
            }),
        );
    }
}

async fn accept_loop(
    service: Arc<RpcService>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    if !service.running() {
                        break;
                    }
                    let conn = service.new_conn(NodeId::empty());
                    service.connections.insert(conn.conn_id(), conn.clone());
                    conn.start_server(&service.handle, stream);
                }
                Err(err) => {
                    warn!(target: "warren::rpc",
                          local = %service.ctx.local_node_id(),
                          "accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
        }
    }
}
