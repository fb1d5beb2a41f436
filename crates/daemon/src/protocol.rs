// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! IPC protocol for daemon communication.
//!
//! Wire format: one JSON object per line, UTF-8, terminated by `\n`.
//! Every request carries a `type` and `id`; every reply echoes the `id`.
//! `channel_message` and `prompt` frames are daemon-originated and carry
//! generated ids.

use std::path::PathBuf;
use std::time::Duration;

use photon_core::{ErrorKind, JobId, SessionId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timeout")]
    Timeout,
}

/// Maximum frame size (10 MB per line)
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Default client-side IPC timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Protocol version (from Cargo.toml)
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Request from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Health check ping
    Ping { id: String },

    /// Request daemon shutdown
    Shutdown { id: String },

    /// Invoke a photon method
    Command {
        id: String,
        method: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        /// Call deadline in milliseconds (default 30 000)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
    },

    /// Subscribe this connection to a channel
    Subscribe {
        id: String,
        channel: String,
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Unsubscribe this connection from a channel
    Unsubscribe { id: String, channel: String },

    /// Publish a message to a channel (fire-and-forget delivery)
    Publish {
        id: String,
        channel: String,
        message: Value,
    },

    /// Acquire a named lock lease
    Lock {
        id: String,
        #[serde(rename = "lockName")]
        lock_name: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// Lease duration in milliseconds, `[1, 86_400_000]`
        #[serde(rename = "lockTimeout", default, skip_serializing_if = "Option::is_none")]
        lock_timeout: Option<u64>,
        /// Queue on the lock's wait list instead of failing fast
        #[serde(default)]
        wait: bool,
    },

    /// Release a named lock lease
    Unlock {
        id: String,
        #[serde(rename = "lockName")]
        lock_name: String,
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },

    /// List live locks
    ListLocks { id: String },

    /// Register a cron job
    Schedule {
        id: String,
        #[serde(rename = "jobId")]
        job_id: JobId,
        method: String,
        cron: String,
        #[serde(default)]
        args: Map<String, Value>,
    },

    /// Remove a cron job
    Unschedule {
        id: String,
        #[serde(rename = "jobId")]
        job_id: JobId,
    },

    /// List scheduled jobs
    ListJobs { id: String },

    /// Hot-reload the photon source
    Reload {
        id: String,
        #[serde(rename = "photonPath")]
        photon_path: PathBuf,
    },

    /// Resume a suspended call; `id` echoes the prompt frame's id
    PromptResponse {
        id: String,
        #[serde(rename = "promptValue")]
        prompt_value: Value,
    },
}

impl Request {
    /// The request's correlation id.
    pub fn id(&self) -> &str {
        match self {
            Request::Ping { id }
            | Request::Shutdown { id }
            | Request::Command { id, .. }
            | Request::Subscribe { id, .. }
            | Request::Unsubscribe { id, .. }
            | Request::Publish { id, .. }
            | Request::Lock { id, .. }
            | Request::Unlock { id, .. }
            | Request::ListLocks { id }
            | Request::Schedule { id, .. }
            | Request::Unschedule { id, .. }
            | Request::ListJobs { id }
            | Request::Reload { id, .. }
            | Request::PromptResponse { id, .. } => id,
        }
    }

    /// Session label this request carries, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Request::Command { session_id, .. } | Request::Subscribe { session_id, .. } => {
                session_id.as_ref()
            }
            Request::Lock { session_id, .. } | Request::Unlock { session_id, .. } => {
                Some(session_id)
            }
            _ => None,
        }
    }
}

/// Response from the daemon to a client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Successful operation; payload shape depends on the request type
    Result { id: String, data: Value },

    /// Failed operation
    Error {
        id: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
    },

    /// Health check response
    Pong { id: String },

    /// Unsolicited channel delivery; `id` is daemon-generated
    ChannelMessage {
        id: String,
        channel: String,
        message: Value,
    },

    /// Daemon-originated input request during a suspended call
    Prompt { id: String, prompt: String },
}

impl Response {
    pub fn result(id: impl Into<String>, data: Value) -> Self {
        Response::Result {
            id: id.into(),
            data,
        }
    }

    pub fn error(id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            id: id.into(),
            error: message.into(),
            kind: Some(kind),
        }
    }

    pub fn invalid(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::error(id, ErrorKind::InvalidRequest, message)
    }

    /// The frame's correlation id.
    pub fn id(&self) -> &str {
        match self {
            Response::Result { id, .. }
            | Response::Error { id, .. }
            | Response::Pong { id }
            | Response::ChannelMessage { id, .. }
            | Response::Prompt { id, .. } => id,
        }
    }
}

/// A frame that failed to decode, with whatever id could be recovered.
#[derive(Debug)]
pub struct DecodeError {
    /// The offender's id, or `"unknown"` when unrecoverable.
    pub id: String,
    pub message: String,
}

/// Decode a request line, recovering the offender's id on failure.
pub fn decode_request(line: &str) -> Result<Request, DecodeError> {
    match serde_json::from_str::<Request>(line) {
        Ok(request) => Ok(request),
        Err(e) => {
            let id = serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| "unknown".to_string());
            Err(DecodeError {
                id,
                message: e.to_string(),
            })
        }
    }
}

/// Read one newline-terminated frame. Returns `None` on clean EOF.
pub async fn read_frame<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<String>, ProtocolError> {
    let mut buf = Vec::new();
    let mut limited = reader.take((MAX_FRAME_SIZE + 1) as u64);
    let n = limited.read_until(b'\n', &mut buf).await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: buf.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.last() != Some(&b'\n') {
        // Partial line at EOF
        return Err(ProtocolError::ConnectionClosed);
    }

    let line = String::from_utf8(buf)
        .map_err(|e| ProtocolError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
    Ok(Some(line.trim_end().to_string()))
}

/// Write one frame as a JSON line.
pub async fn write_frame<W: AsyncWriteExt + Unpin, T: Serialize>(
    writer: &mut W,
    frame: &T,
) -> Result<(), ProtocolError> {
    let mut data = serde_json::to_vec(frame)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: data.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    data.push(b'\n');
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
