// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon client for CLI commands.
//!
//! One connection, one reader task, one writer task. Responses resolve
//! pending requests by id (30 s timeout each); unsolicited frames
//! (`channel_message`, `prompt`) land on the notification queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use photon_daemon::protocol::{self, ProtocolError, Request, Response};
use thiserror::Error;
use tokio::io::{BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};

/// Pending requests time out after 30 s.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `ensure_running` waits for a spawned daemon to come up.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(5);
const SPAWN_POLL: Duration = Duration::from_millis(50);

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running for photon {0:?} (start it with `photon start {0}`)")]
    DaemonNotRunning(String),

    #[error("failed to start daemon: {0}")]
    DaemonStartFailed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Socket path for a photon, from the shared discovery contract.
pub fn socket_path(photon: &str) -> PathBuf {
    photon_daemon::env::runtime_dir().join(format!("{}.sock", photon))
}

/// Connected daemon client.
pub struct DaemonClient {
    writer_tx: mpsc::UnboundedSender<Request>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>>,
    notifications: mpsc::UnboundedReceiver<Response>,
    next_id: AtomicU64,
}

impl DaemonClient {
    /// Connect to a photon's daemon socket.
    pub async fn connect(photon: &str) -> Result<Self, ClientError> {
        let path = socket_path(photon);
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|_| ClientError::DaemonNotRunning(photon.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wire the reader/writer tasks around an established stream.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<Mutex<HashMap<String, oneshot::Sender<Response>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Request>();
        let (notify_tx, notifications) = mpsc::unbounded_channel::<Response>();

        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(request) = writer_rx.recv().await {
                if protocol::write_frame(&mut writer, &request).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            let mut reader = BufReader::new(read_half);
            loop {
                let line = match protocol::read_frame(&mut reader).await {
                    Ok(Some(line)) => line,
                    _ => break,
                };
                let Ok(frame) = serde_json::from_str::<Response>(&line) else {
                    continue;
                };
                let waiter = reader_pending
                    .lock()
                    .ok()
                    .and_then(|mut map| map.remove(frame.id()));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        let _ = notify_tx.send(frame);
                    }
                }
            }
        });

        Self {
            writer_tx,
            pending,
            notifications,
            next_id: AtomicU64::new(1),
        }
    }

    /// Fresh request id, unique within this connection.
    pub fn next_id(&self) -> String {
        format!("cli-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Send a request and register it for correlation.
    pub fn send(&self, request: Request) -> Result<oneshot::Receiver<Response>, ClientError> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut map) = self.pending.lock() {
            map.insert(request.id().to_string(), tx);
        }
        self.writer_tx
            .send(request)
            .map_err(|_| ClientError::ConnectionClosed)?;
        Ok(rx)
    }

    /// Send a request that expects no reply (`prompt_response`).
    pub fn send_nowait(&self, request: Request) -> Result<(), ClientError> {
        self.writer_tx
            .send(request)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Round-trip a request with the standard 30 s deadline.
    pub async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let id = request.id().to_string();
        let rx = self.send(request)?;
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::ConnectionClosed),
            Err(_) => {
                if let Ok(mut map) = self.pending.lock() {
                    map.remove(&id);
                }
                Err(ClientError::Timeout)
            }
        }
    }

    /// Next unsolicited frame (`channel_message` or `prompt`).
    pub async fn next_notification(&mut self) -> Option<Response> {
        self.notifications.recv().await
    }
}

/// Connect, spawning `photond` first if no daemon answers.
pub async fn ensure_running(
    photon: &str,
    source: Option<&Path>,
) -> Result<DaemonClient, ClientError> {
    if let Ok(client) = DaemonClient::connect(photon).await {
        return Ok(client);
    }
    spawn_daemon(photon, source)?;

    let give_up = tokio::time::Instant::now() + SPAWN_TIMEOUT;
    loop {
        tokio::time::sleep(SPAWN_POLL).await;
        if let Ok(client) = DaemonClient::connect(photon).await {
            return Ok(client);
        }
        if tokio::time::Instant::now() >= give_up {
            return Err(ClientError::DaemonStartFailed(format!(
                "photond for {:?} did not come up within {:?}",
                photon, SPAWN_TIMEOUT
            )));
        }
    }
}

/// Spawn `photond` detached; it daemonizes itself behind the PID lock.
fn spawn_daemon(photon: &str, source: Option<&Path>) -> Result<(), ClientError> {
    let mut command = std::process::Command::new("photond");
    command
        .arg(photon)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(source) = source {
        command.arg(source);
    }
    command
        .spawn()
        .map_err(|e| ClientError::DaemonStartFailed(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
