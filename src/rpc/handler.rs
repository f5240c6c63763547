//! Message dispatch and the handshake state machine.
//!
//! A connection starts in `New`, sends its own HELLO as soon as the socket
//! is up, and becomes `Ready` on the first well-formed HELLO request or
//! reply it receives. Per-method logic is a function over
//! `(connection, xid, body)`; unknown or malformed combinations get an
//! UNSUPPORTED error reply.

use crate::clock::NodeId;
use crate::error::Error;
use crate::rpc::connection::RpcConnection;
use crate::rpc::message::{
    Method, RepGet, RepHello, Reply, ReplyBody, ReqGet, ReqHello, Request, RpcMessage, Status,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnState {
    New,
    HelloPending,
    Ready,
}

/// Callback invoked when the handshake completes.
pub(crate) type ReadyListener = Arc<dyn Fn(&Arc<RpcConnection>) + Send + Sync>;

/// Handles RPC messages for one connection.
pub(crate) struct ConnectionHandler {
    ctx: Arc<crate::ctx::CtxShared>,
    remote_node_id: Mutex<NodeId>,
    state: Mutex<ConnState>,
    ready_listeners: Mutex<Vec<ReadyListener>>,
    /// Outstanding GET requests by xid, so replies can be applied to the
    /// right store.
    pending_gets: Mutex<HashMap<u64, ReqGet>>,
}

impl ConnectionHandler {
    pub(crate) fn new(ctx: Arc<crate::ctx::CtxShared>) -> Self {
        ConnectionHandler {
            ctx,
            remote_node_id: Mutex::new(NodeId::empty()),
            state: Mutex::new(ConnState::New),
            ready_listeners: Mutex::new(Vec::new()),
            pending_gets: Mutex::new(HashMap::new()),
        }
    }

    /// The remote node ID as reported in the hello message; empty until
    /// then.
    pub(crate) fn remote_node_id(&self) -> NodeId {
        self.remote_node_id.lock().clone()
    }

    pub(crate) fn add_ready_listener(&self, listener: ReadyListener) {
        self.ready_listeners.lock().push(listener);
    }

    /// Send our own HELLO; both ends do this as soon as the socket is up.
    pub(crate) fn handle_connect(&self, conn: &Arc<RpcConnection>) {
        let neighborhoods = self
            .ctx
            .cluster_config()
            .map(|config| {
                config
                    .neighborhoods()
                    .map(|n| (**n).clone())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let req = Request::Hello(ReqHello {
            id: self.ctx.local_node_id(),
            neighborhoods,
        });
        {
            let mut state = self.state.lock();
            if *state == ConnState::New {
                *state = ConnState::HelloPending;
            }
        }
        conn.send_message(RpcMessage::request(conn.next_xid(), req));
    }

    /// Dispatch one received message.
    pub(crate) fn handle_message(&self, conn: &Arc<RpcConnection>, msg: RpcMessage) {
        let RpcMessage {
            xid,
            method,
            req,
            rep,
        } = msg;

        match (method, req, rep) {
            (Method::Hello, Some(Request::Hello(body)), _) => {
                self.handle_req_hello(conn, xid, body)
            }
            (Method::Hello, None, Some(rep)) => match check_status(rep) {
                Ok(Some(ReplyBody::Hello(_))) | Ok(None) => {
                    self.handle_rep_hello(conn, xid, RepHello {})
                }
                Ok(Some(_)) => self.handle_unsupported(conn, xid, method),
                Err((status, message)) => {
                    self.handle_error_hello(conn, xid, status, &message)
                }
            },
            (Method::Get, Some(Request::Get(body)), _) => self.handle_req_get(conn, xid, body),
            (Method::Get, None, Some(rep)) => match check_status(rep) {
                Ok(Some(ReplyBody::Get(body))) => self.handle_rep_get(conn, xid, body),
                Ok(_) => self.handle_unsupported(conn, xid, method),
                Err((status, message)) => self.handle_error_get(conn, xid, status, &message),
            },
            _ => self.handle_unsupported(conn, xid, method),
        }
    }

    fn handle_req_hello(&self, conn: &Arc<RpcConnection>, xid: u64, req: ReqHello) {
        *self.remote_node_id.lock() = req.id.clone();
        if !req.neighborhoods.is_empty() {
            debug!(target: "warren::rpc",
                   local = %self.ctx.local_node_id(), remote = %req.id,
                   "hello announced {} neighborhoods", req.neighborhoods.len());
        }

        conn.send_message(RpcMessage::reply(xid, ReplyBody::Hello(RepHello {})));
        info!(target: "warren::rpc",
              local = %self.ctx.local_node_id(), remote = %req.id,
              "handshake succeeded");
        self.handle_ready(conn);
    }

    fn handle_rep_hello(&self, conn: &Arc<RpcConnection>, _xid: u64, _rep: RepHello) {
        self.handle_ready(conn);
    }

    fn handle_error_hello(
        &self,
        conn: &Arc<RpcConnection>,
        _xid: u64,
        status: Status,
        message: &str,
    ) {
        self.handle_error(Method::Hello, status, message);
        conn.stop();
    }

    fn handle_req_get(&self, conn: &Arc<RpcConnection>, xid: u64, req: ReqGet) {
        match self
            .ctx
            .registry()
            .get(&req.store)
            .and_then(|store| store.get(&req.key))
        {
            Ok(values) => {
                conn.send_message(RpcMessage::reply(xid, ReplyBody::Get(RepGet { values })));
            }
            Err(err @ Error::UnknownStore(_)) => {
                conn.send_error_reply(xid, Method::Get, Status::Error, err.to_string());
            }
            Err(err) => {
                error!(target: "warren::rpc",
                       local = %self.ctx.local_node_id(), store = %req.store,
                       "get request failed: {err}");
                conn.send_error_reply(xid, Method::Get, Status::Error, err.to_string());
            }
        }
    }

    /// Apply the values of a GET reply to the local store as remote-origin
    /// writes.
    fn handle_rep_get(&self, _conn: &Arc<RpcConnection>, xid: u64, rep: RepGet) {
        let Some(pending) = self.pending_gets.lock().remove(&xid) else {
            debug!(target: "warren::rpc",
                   local = %self.ctx.local_node_id(),
                   "dropping uncorrelated get reply (xid {xid})");
            return;
        };
        let store = match self.ctx.registry().get(&pending.store) {
            Ok(store) => store,
            Err(err) => {
                warn!(target: "warren::rpc",
                      local = %self.ctx.local_node_id(), store = %pending.store,
                      "cannot apply get reply: {err}");
                return;
            }
        };
        for value in rep.values {
            if let Err(err) = store.put_remote(&pending.key, &value) {
                warn!(target: "warren::rpc",
                      local = %self.ctx.local_node_id(), store = %pending.store,
                      "failed to apply remote value: {err}");
            }
        }
    }

    fn handle_error_get(
        &self,
        _conn: &Arc<RpcConnection>,
        xid: u64,
        status: Status,
        message: &str,
    ) {
        self.pending_gets.lock().remove(&xid);
        self.handle_error(Method::Get, status, message);
    }

    fn handle_unsupported(&self, conn: &Arc<RpcConnection>, xid: u64, method: Method) {
        conn.send_error_reply(xid, method, Status::Unsupported, "unsupported message");
    }

    fn handle_error(&self, method: Method, status: Status, message: &str) {
        error!(target: "warren::rpc",
               local = %self.ctx.local_node_id(),
               remote = %self.remote_node_id(),
               "error for {method:?}: {status:?}: {message}");
    }

    /// Fire the ready event once the handshake completes; later hellos on
    /// the same connection are ignored.
    fn handle_ready(&self, conn: &Arc<RpcConnection>) {
        {
            let mut state = self.state.lock();
            if *state == ConnState::Ready {
                return;
            }
            *state = ConnState::Ready;
        }
        let listeners = self.ready_listeners.lock().clone();
        for listener in listeners {
            listener(conn);
        }
    }

    /// Record an outstanding GET so its reply can be routed.
    pub(crate) fn register_pending_get(&self, xid: u64, req: ReqGet) {
        self.pending_gets.lock().insert(xid, req);
    }
}

/// Split a reply into its body (OK) or its error status.
fn check_status(rep: Reply) -> std::result::Result<Option<ReplyBody>, (Status, String)> {
    if rep.status == Status::Ok {
        Ok(rep.body)
    } else {
        Err((rep.status, rep.status_message))
    }
}
