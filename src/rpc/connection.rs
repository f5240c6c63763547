//! A single connection to a remote node.
//!
//! All reads, writes, and the close event for one connection are
//! serialized: one reader task walks the frame stream (size, body,
//! dispatch, repeat) and one writer task drains the outbound queue, so
//! frames complete in `send_message` order.

use crate::ctx::CtxShared;
use crate::rpc::handler::ConnectionHandler;
use crate::rpc::message::{self, Method, RpcMessage, Status, MAX_FRAME_LEN};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(15);

/// Called exactly once when the connection stops.
pub(crate) type StopHandler = Box<dyn FnOnce(&Arc<RpcConnection>) + Send>;

pub(crate) struct RpcConnection {
    self_ref: Weak<RpcConnection>,
    ctx: Arc<CtxShared>,
    conn_id: u64,
    handler: Arc<ConnectionHandler>,
    out_tx: mpsc::UnboundedSender<RpcMessage>,
    out_rx: Mutex<Option<mpsc::UnboundedReceiver<RpcMessage>>>,
    next_xid: AtomicU64,
    last_read: Mutex<Instant>,
    last_write: Mutex<Instant>,
    stopped: AtomicBool,
    stop_handler: Mutex<Option<StopHandler>>,
    shutdown: watch::Sender<bool>,
}

impl RpcConnection {
    pub(crate) fn new(
        ctx: Arc<CtxShared>,
        conn_id: u64,
        handler: Arc<ConnectionHandler>,
        stop_handler: Option<StopHandler>,
    ) -> Arc<Self> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let now = Instant::now();
        Arc::new_cyclic(|self_ref| RpcConnection {
            self_ref: self_ref.clone(),
            ctx,
            conn_id,
            handler,
            out_tx,
            out_rx: Mutex::new(Some(out_rx)),
            next_xid: AtomicU64::new(0),
            last_read: Mutex::new(now),
            last_write: Mutex::new(now),
            stopped: AtomicBool::new(false),
            stop_handler: Mutex::new(stop_handler),
            shutdown,
        })
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub(crate) fn handler(&self) -> &Arc<ConnectionHandler> {
        &self.handler
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Allocate the next transaction ID for this connection.
    pub(crate) fn next_xid(&self) -> u64 {
        self.next_xid.fetch_add(1, Ordering::SeqCst)
    }

    /// Start as a client by connecting to the given host and port.
    pub(crate) fn start_client(&self, handle: &Handle, hostname: String, port: u16) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        handle.spawn(async move {
            info!(target: "warren::rpc",
                  local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                  "connecting to {hostname}:{port}");
            let connect = TcpStream::connect((hostname.as_str(), port));
            match tokio::time::timeout(CONNECT_TIMEOUT, connect).await {
                Ok(Ok(stream)) => conn.run(stream).await,
                Ok(Err(err)) => {
                    warn!(target: "warren::rpc",
                          local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                          "failed to connect to {hostname}:{port}: {err}");
                    conn.stop();
                }
                Err(_) => {
                    warn!(target: "warren::rpc",
                          local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                          "timed out connecting to {hostname}:{port}");
                    conn.stop();
                }
            }
        });
    }

    /// Start as a server on an accepted socket.
    pub(crate) fn start_server(&self, handle: &Handle, stream: TcpStream) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        handle.spawn(async move {
            if let Ok(peer) = stream.peer_addr() {
                info!(target: "warren::rpc",
                      local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                      "new remote connection from {peer}");
            }
            conn.run(stream).await;
        });
    }

    async fn run(self: Arc<Self>, stream: TcpStream) {
        if self.is_stopped() {
            return;
        }
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        self.handler.handle_connect(&self);

        let out_rx = self.take_out_rx();
        if let Some(out_rx) = out_rx {
            tokio::spawn(write_loop(self.clone(), write_half, out_rx));
        }
        tokio::spawn(idle_loop(self.clone()));

        read_loop(self.clone(), read_half).await;
        self.stop();
    }

    /// Take the outbound queue; the writer task owns it for the life of
    /// the connection.
    pub(crate) fn take_out_rx(&self) -> Option<mpsc::UnboundedReceiver<RpcMessage>> {
        self.out_rx.lock().take()
    }

    /// Queue a message for sending; frames go out in call order.
    pub(crate) fn send_message(&self, message: RpcMessage) {
        if self.is_stopped() {
            return;
        }
        let _ = self.out_tx.send(message);
    }

    pub(crate) fn send_error_reply(
        &self,
        xid: u64,
        method: Method,
        status: Status,
        status_message: impl Into<String>,
    ) {
        self.send_message(RpcMessage::error_reply(xid, method, status, status_message));
    }

    /// Stop the connection. Idempotent; the stop handler runs once.
    pub(crate) fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(target: "warren::rpc",
              local = %self.ctx.local_node_id(), conn = self.conn_id,
              "closing connection");
        let _ = self.shutdown.send(true);
        let stop_handler = self.stop_handler.lock().take();
        if let Some(stop_handler) = stop_handler {
            if let Some(conn) = self.self_ref.upgrade() {
                stop_handler(&conn);
            }
        }
    }

    fn idle_for(&self) -> Duration {
        let last = (*self.last_read.lock()).max(*self.last_write.lock());
        Instant::now().saturating_duration_since(last)
    }
}

async fn read_loop(conn: Arc<RpcConnection>, mut socket: OwnedReadHalf) {
    let mut shutdown = conn.shutdown.subscribe();
    loop {
        if conn.is_stopped() {
            return;
        }

        let mut len_buf = [0u8; 4];
        tokio::select! {
            _ = shutdown.changed() => return,
            read = socket.read_exact(&mut len_buf) => {
                if let Err(err) = read {
                    if !conn.is_stopped() {
                        debug!(target: "warren::rpc",
                               local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                               "could not read from socket: {err}");
                    }
                    return;
                }
            }
        }

        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            error!(target: "warren::rpc",
                   local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                   "invalid message length: {len}");
            return;
        }

        let mut body = vec![0u8; len as usize];
        tokio::select! {
            _ = shutdown.changed() => return,
            read = socket.read_exact(&mut body) => {
                if let Err(err) = read {
                    if !conn.is_stopped() {
                        debug!(target: "warren::rpc",
                               local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                               "could not read from socket: {err}");
                    }
                    return;
                }
            }
        }

        match message::decode_body(&body) {
            Ok(msg) => {
                *conn.last_read.lock() = Instant::now();
                conn.handler.handle_message(&conn, msg);
            }
            Err(err) => {
                error!(target: "warren::rpc",
                       local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                       "malformed message: {err}");
                return;
            }
        }
    }
}

async fn write_loop(
    conn: Arc<RpcConnection>,
    mut socket: OwnedWriteHalf,
    mut out_rx: mpsc::UnboundedReceiver<RpcMessage>,
) {
    let mut shutdown = conn.shutdown.subscribe();
    loop {
        if conn.is_stopped() {
            break;
        }
        let msg = tokio::select! {
            _ = shutdown.changed() => break,
            msg = out_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };

        let frame = match message::encode_frame(&msg) {
            Ok(frame) => frame,
            Err(err) => {
                error!(target: "warren::rpc",
                       local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                       "dropping unencodable message: {err}");
                continue;
            }
        };
        if let Err(err) = socket.write_all(&frame).await {
            if !conn.is_stopped() {
                debug!(target: "warren::rpc",
                       local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                       "could not write to socket: {err}");
            }
            break;
        }
        *conn.last_write.lock() = Instant::now();
    }
    conn.stop();
}

/// Close connections idle in both directions beyond the threshold.
async fn idle_loop(conn: Arc<RpcConnection>) {
    let mut shutdown = conn.shutdown.subscribe();
    let mut check = tokio::time::interval(IDLE_CHECK_PERIOD);
    check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = check.tick() => {
                if conn.is_stopped() {
                    return;
                }
                if conn.idle_for() > IDLE_TIMEOUT {
                    info!(target: "warren::rpc",
                          local = %conn.ctx.local_node_id(), conn = conn.conn_id,
                          "closing idle connection");
                    conn.stop();
                    return;
                }
            }
        }
    }
}
