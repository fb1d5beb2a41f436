// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance state persistence.
//!
//! One JSON file per `(photon, instance)` under the state directory.
//! Writes are atomic: temp file, fsync, rename. A corrupt file is moved
//! aside to `.bak` on load so the photon can start from its defaults.
//!
//! The [`StateWriter`] is a background task that debounces snapshots
//! (default 500 ms): rapid state changes collapse into one write, and a
//! final `flush` forces the pending snapshot out during shutdown.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Errors from state file operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Debounce window between the last state change and the write.
const DEBOUNCE: Duration = Duration::from_millis(500);

/// Path of the state file for one named instance of a photon.
pub fn instance_state_path(state_dir: &Path, instance: &str) -> PathBuf {
    state_dir.join(format!("{}.json", instance))
}

/// Save a snapshot atomically (write to .tmp, fsync, then rename).
pub fn save_atomic(path: &Path, value: &Value) -> Result<(), StateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Load a snapshot if it exists.
///
/// Returns `Ok(None)` if the file is missing or corrupt. A corrupt file is
/// moved to `<path>.bak` so the next save starts clean.
pub fn load(path: &Path) -> Result<Option<Value>, StateError> {
    if !path.exists() {
        return Ok(None);
    }

    let file = File::open(path)?;
    let reader = BufReader::new(file);
    match serde_json::from_reader(reader) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            let bak = path.with_extension("json.bak");
            warn!(
                path = %path.display(),
                error = %e,
                "corrupt state file, moving aside"
            );
            let _ = fs::rename(path, &bak);
            Ok(None)
        }
    }
}

enum WriterMsg {
    Update(Value),
    Flush(oneshot::Sender<()>),
}

/// Handle to the debounced background state writer.
#[derive(Clone)]
pub struct StateWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl StateWriter {
    /// Spawn the writer task for one state file.
    pub fn spawn(path: PathBuf) -> Self {
        Self::spawn_with_debounce(path, DEBOUNCE)
    }

    /// Spawn with a custom debounce window (tests use a short one).
    pub fn spawn_with_debounce(path: PathBuf, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(path, debounce, rx));
        Self { tx }
    }

    /// Queue a new snapshot. Collapses with other updates inside the
    /// debounce window; the latest value wins.
    pub fn update(&self, snapshot: Value) {
        let _ = self.tx.send(WriterMsg::Update(snapshot));
    }

    /// Write any pending snapshot now and wait for it to land.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }
}

async fn writer_task(
    path: PathBuf,
    debounce: Duration,
    mut rx: mpsc::UnboundedReceiver<WriterMsg>,
) {
    let mut pending: Option<Value> = None;

    loop {
        let msg = if pending.is_some() {
            // A snapshot is queued: wait for more updates until the
            // debounce window closes, then write.
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    write_pending(&path, &mut pending);
                    continue;
                }
            }
        } else {
            rx.recv().await
        };

        match msg {
            Some(WriterMsg::Update(value)) => pending = Some(value),
            Some(WriterMsg::Flush(ack)) => {
                write_pending(&path, &mut pending);
                let _ = ack.send(());
            }
            None => {
                // All handles dropped: final write, then exit.
                write_pending(&path, &mut pending);
                return;
            }
        }
    }
}

fn write_pending(path: &Path, pending: &mut Option<Value>) {
    if let Some(value) = pending.take() {
        if let Err(e) = save_atomic(path, &value) {
            warn!(path = %path.display(), error = %e, "state write failed");
        }
    }
}

#[cfg(test)]
#[path = "state_tests.rs"]
mod tests;
