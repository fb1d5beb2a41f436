// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Socket server: connection accept loop and per-connection I/O tasks.
//!
//! Each connection gets one reader task and one writer task joined by a
//! bounded outbox queue. The writer serializes all outbound frames for the
//! connection, so responses and unsolicited `channel_message`/`prompt`
//! frames never interleave mid-frame on the wire.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use photon_core::{Clock, SessionId};
use tokio::io::{BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::dispatcher::{DaemonCtx, Inbound};
use crate::protocol::{self, Response};

/// Bounded outbox per connection; publishes drop frames when full.
pub const OUTBOX_CAPACITY: usize = 1024;

/// Consecutive parse failures before a connection is closed.
const MAX_PARSE_FAILURES: u32 = 3;

/// Connection identity, unique for the daemon's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

impl ConnId {
    /// Synthetic publisher id for user code calling `emit()` from inside a
    /// method body ("this instance"). Never assigned to a real connection.
    pub const INSTANCE: ConnId = ConnId(u64::MAX);
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live client connection.
pub struct Connection {
    pub id: ConnId,
    session: Mutex<Option<SessionId>>,
    outbox: mpsc::Sender<Response>,
    closed: AtomicBool,
}

impl Connection {
    fn new(id: ConnId, outbox: mpsc::Sender<Response>) -> Self {
        Self {
            id,
            session: Mutex::new(None),
            outbox,
            closed: AtomicBool::new(false),
        }
    }

    /// Queue a frame without blocking. Returns false if the connection is
    /// closed or its outbox is full (the publish drop path).
    pub fn try_send(&self, frame: Response) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbox.try_send(frame).is_ok()
    }

    /// Queue a frame, waiting for outbox capacity. Returns false if the
    /// connection closed underneath us.
    pub async fn send(&self, frame: Response) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbox.send(frame).await.is_ok()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Last session label seen on this connection.
    pub fn session(&self) -> Option<SessionId> {
        self.session.lock().clone()
    }

    pub fn set_session(&self, session: SessionId) {
        *self.session.lock() = Some(session);
    }
}

/// Registry of live connections, shared with the channel bus.
pub struct ConnRegistry {
    next_id: AtomicU64,
    conns: Mutex<HashMap<ConnId, Arc<Connection>>>,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new connection; the returned receiver feeds its writer task.
    pub fn register(&self) -> (Arc<Connection>, mpsc::Receiver<Response>) {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = mpsc::channel(OUTBOX_CAPACITY);
        let conn = Arc::new(Connection::new(id, tx));
        self.conns.lock().insert(id, Arc::clone(&conn));
        (conn, rx)
    }

    /// Create an unregistered internal connection whose frames drain into
    /// the log. Used by the scheduler to submit fires like any client.
    pub fn internal(&self, label: &'static str) -> Arc<Connection> {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, mut rx) = mpsc::channel(OUTBOX_CAPACITY);
        let conn = Arc::new(Connection::new(id, tx));
        conn.set_session(SessionId::new(label));
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match frame {
                    Response::Error { id, error, kind } => {
                        warn!(source = label, request = %id, ?kind, %error, "internal call failed")
                    }
                    Response::Result { id, .. } => {
                        debug!(source = label, request = %id, "internal call completed")
                    }
                    other => debug!(source = label, frame = ?other, "internal frame"),
                }
            }
        });
        conn
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.conns.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: ConnId) {
        self.conns.lock().remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.conns.lock().len()
    }

    /// Mark every connection closed (shutdown path).
    pub fn close_all(&self) {
        for conn in self.conns.lock().values() {
            conn.close();
        }
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener task for accepting socket connections.
pub struct Listener<C: Clock> {
    socket: UnixListener,
    ctx: Arc<DaemonCtx<C>>,
}

impl<C: Clock + 'static> Listener<C> {
    pub fn new(socket: UnixListener, ctx: Arc<DaemonCtx<C>>) -> Self {
        Self { socket, ctx }
    }

    /// Run the accept loop until the task is aborted at shutdown.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    if self.ctx.is_shutting_down() {
                        // Shutdown has begun; stop taking work.
                        continue;
                    }
                    let ctx = Arc::clone(&self.ctx);
                    tokio::spawn(handle_connection(stream, ctx));
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Drive one client connection until EOF, error, or three strikes.
async fn handle_connection<C: Clock + 'static>(stream: UnixStream, ctx: Arc<DaemonCtx<C>>) {
    let (read_half, write_half) = stream.into_split();
    let (conn, mut outbox_rx) = ctx.conns.register();
    ctx.activity.touch();
    debug!(conn = conn.id.0, "client connected");

    // Writer task: sole owner of the write half.
    let writer_conn = Arc::clone(&conn);
    let writer = tokio::spawn(async move {
        let mut writer = BufWriter::new(write_half);
        while let Some(frame) = outbox_rx.recv().await {
            if let Err(e) = protocol::write_frame(&mut writer, &frame).await {
                debug!(conn = writer_conn.id.0, error = %e, "write failed, closing");
                writer_conn.close();
                break;
            }
        }
    });

    // Reader loop.
    let mut reader = BufReader::new(read_half);
    let mut parse_failures = 0u32;
    loop {
        let line = match protocol::read_frame(&mut reader).await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!(conn = conn.id.0, error = %e, "read failed");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        ctx.activity.touch();

        match protocol::decode_request(&line) {
            Ok(request) => {
                parse_failures = 0;
                if let Some(session) = request.session_id() {
                    conn.set_session(session.clone());
                }
                let inbound = Inbound {
                    conn: Arc::clone(&conn),
                    request,
                };
                if ctx.inbound_tx.send(inbound).is_err() {
                    break; // dispatcher gone: daemon is shutting down
                }
            }
            Err(decode) => {
                parse_failures += 1;
                let frame = Response::invalid(decode.id, decode.message);
                if !conn.send(frame).await {
                    break;
                }
                if parse_failures >= MAX_PARSE_FAILURES {
                    warn!(conn = conn.id.0, "closing connection after repeated parse failures");
                    break;
                }
            }
        }
    }

    cleanup_connection(&conn, &ctx);
    // Dropping our Arc lets the writer drain and exit once the bus and
    // registry references are gone.
    drop(conn);
    let _ = writer.await;
}

/// Remove every trace of a connection before any further delivery attempt.
pub fn cleanup_connection<C: Clock + 'static>(conn: &Arc<Connection>, ctx: &DaemonCtx<C>) {
    conn.close();
    ctx.channels.drop_connection(conn.id);
    ctx.runner.cancel_prompts_for_conn(conn.id);
    if ctx.release_locks_on_disconnect {
        if let Some(session) = conn.session() {
            let released = ctx.locks.release_all(&session);
            if released > 0 {
                debug!(conn = conn.id.0, session = %session, released, "released locks on disconnect");
            }
        }
    }
    ctx.conns.remove(conn.id);
    ctx.activity.touch();
    debug!(conn = conn.id.0, "client disconnected");
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
