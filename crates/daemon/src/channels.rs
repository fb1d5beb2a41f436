// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process pub/sub with per-channel subscriber sets.
//!
//! Best-effort, at-most-once-per-subscriber delivery; no persistence, no
//! replay. The subscription map is mutex-guarded; each publish takes a
//! copy-on-write snapshot of the target set so delivery happens outside
//! the lock. Publishers are never blocked: a full writer queue drops that
//! subscriber's frame and bumps a counter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use photon_core::{IdGen, UuidIdGen};
use serde_json::Value;
use tracing::{debug, warn};

use crate::listener::{ConnId, ConnRegistry};
use crate::protocol::Response;

/// In-process pub/sub fan-out.
pub struct ChannelBus {
    conns: Arc<ConnRegistry>,
    subs: Mutex<HashMap<String, HashSet<ConnId>>>,
    ids: UuidIdGen,
    dropped: AtomicU64,
}

impl ChannelBus {
    pub fn new(conns: Arc<ConnRegistry>) -> Self {
        Self {
            conns,
            subs: Mutex::new(HashMap::new()),
            ids: UuidIdGen,
            dropped: AtomicU64::new(0),
        }
    }

    /// Idempotent insert. Returns the channel's subscriber count.
    pub fn subscribe(&self, conn: ConnId, channel: &str) -> usize {
        let mut subs = self.subs.lock();
        let set = subs.entry(channel.to_string()).or_default();
        set.insert(conn);
        set.len()
    }

    /// Idempotent remove. The last unsubscribe deletes the channel entry.
    pub fn unsubscribe(&self, conn: ConnId, channel: &str) -> bool {
        let mut subs = self.subs.lock();
        let Some(set) = subs.get_mut(channel) else {
            return false;
        };
        let removed = set.remove(&conn);
        if set.is_empty() {
            subs.remove(channel);
        }
        removed
    }

    /// Deliver `message` to every open subscriber except the sender.
    ///
    /// Returns the number of frames actually queued; frames for
    /// subscribers with full outboxes are dropped and counted.
    pub fn publish(&self, sender: ConnId, channel: &str, message: &Value) -> usize {
        // Snapshot under the lock, deliver outside it.
        let targets: Vec<ConnId> = {
            let subs = self.subs.lock();
            match subs.get(channel) {
                Some(set) => set.iter().filter(|id| **id != sender).copied().collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for id in targets {
            let Some(conn) = self.conns.get(id) else {
                continue;
            };
            if conn.is_closed() {
                continue;
            }
            let frame = Response::ChannelMessage {
                id: self.ids.next(),
                channel: channel.to_string(),
                message: message.clone(),
            };
            if conn.try_send(frame) {
                delivered += 1;
            } else {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(conn = id.0, channel, total_dropped = total, "subscriber queue full, frame dropped");
            }
        }

        debug!(channel, delivered, "published");
        delivered
    }

    /// Remove a closed connection from every channel before any further
    /// delivery attempt.
    pub fn drop_connection(&self, conn: ConnId) {
        let mut subs = self.subs.lock();
        subs.retain(|_, set| {
            set.remove(&conn);
            !set.is_empty()
        });
    }

    /// Total live subscriptions across all channels.
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().values().map(HashSet::len).sum()
    }

    /// Frames dropped on full writer queues since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[path = "channels_tests.rs"]
mod tests;
