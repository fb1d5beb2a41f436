// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Named lock leases with timeouts and owner identity.
//!
//! A single mutex-guarded table; hot paths are O(1). Expiry is checked
//! lazily on every operation; a background sweeper only bounds the wakeup
//! latency of waiters whose target lease expired. Waiters are granted in
//! FIFO order as leases are released or expire.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use photon_core::{Clock, SessionId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Inclusive bounds for `lockTimeout`, in milliseconds.
pub const MIN_LOCK_TIMEOUT_MS: u64 = 1;
pub const MAX_LOCK_TIMEOUT_MS: u64 = 86_400_000;

/// Lease duration when the request does not supply one.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 30_000;

/// A live lease, as reported by `list_locks`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub name: String,
    pub holder: SessionId,
    pub acquired_at: u64,
    pub expires_at: u64,
}

/// Grant delivered to a queued waiter.
#[derive(Debug)]
pub struct Granted {
    pub expires_at: u64,
}

/// Outcome of an acquire attempt.
pub enum AcquireOutcome {
    /// Lease granted (or renewed for the same holder).
    Acquired { expires_at: u64, renewed: bool },
    /// Held by someone else and `wait` was false.
    Busy { holder: SessionId },
    /// Queued on the wait list; resolves when granted. A dropped receiver
    /// forfeits the waiter's place.
    Queued(oneshot::Receiver<Granted>),
}

/// Outcome of a release attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The requester does not hold this lock (including: nobody does).
    NotHolder,
}

struct LockRecord {
    holder: SessionId,
    acquired_at: u64,
    expires_at: u64,
}

struct Waiter {
    holder: SessionId,
    timeout_ms: u64,
    tx: oneshot::Sender<Granted>,
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<String, LockRecord>,
    waiters: HashMap<String, VecDeque<Waiter>>,
}

impl LockTable {
    /// Hand an available lock to the next live waiter, if any.
    fn grant_next(&mut self, name: &str, now: u64) {
        let Some(queue) = self.waiters.get_mut(name) else {
            return;
        };
        while let Some(waiter) = queue.pop_front() {
            if waiter.tx.is_closed() {
                continue; // waiter gave up (deadline elapsed client-side)
            }
            let expires_at = now + waiter.timeout_ms;
            let record = LockRecord {
                holder: waiter.holder,
                acquired_at: now,
                expires_at,
            };
            if waiter.tx.send(Granted { expires_at }).is_ok() {
                self.locks.insert(name.to_string(), record);
                break;
            }
            // Send raced with receiver drop; try the next waiter.
        }
        if queue.is_empty() {
            self.waiters.remove(name);
        }
    }

    /// Drop expired records and wake their waiters.
    fn expire(&mut self, now: u64) {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, rec)| rec.expires_at <= now)
            .map(|(name, _)| name.clone())
            .collect();
        for name in expired {
            self.locks.remove(&name);
            self.grant_next(&name, now);
        }

        // Prune abandoned waiters so queues don't grow unbounded.
        self.waiters.retain(|_, queue| {
            queue.retain(|w| !w.tx.is_closed());
            !queue.is_empty()
        });
    }
}

/// Named leases with timeouts and owner identity.
pub struct LockManager<C: Clock> {
    clock: C,
    inner: Mutex<LockTable>,
}

impl<C: Clock + 'static> LockManager<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            inner: Mutex::new(LockTable::default()),
        }
    }

    /// Acquire or renew the lease `name` for `holder`.
    pub fn acquire(
        &self,
        name: &str,
        holder: &SessionId,
        timeout_ms: u64,
        wait: bool,
    ) -> AcquireOutcome {
        let now = self.clock.epoch_ms();
        let mut table = self.inner.lock();

        // Lazy expiry: an expired record is treated as absent, but queued
        // waiters keep their FIFO priority over this caller.
        if table
            .locks
            .get(name)
            .is_some_and(|rec| rec.expires_at <= now)
        {
            table.locks.remove(name);
            table.grant_next(name, now);
        }

        match table.locks.get_mut(name) {
            Some(rec) if rec.holder == *holder => {
                rec.expires_at = now + timeout_ms;
                AcquireOutcome::Acquired {
                    expires_at: rec.expires_at,
                    renewed: true,
                }
            }
            Some(rec) if !wait => AcquireOutcome::Busy {
                holder: rec.holder.clone(),
            },
            Some(_) => {
                let (tx, rx) = oneshot::channel();
                table.waiters.entry(name.to_string()).or_default().push_back(Waiter {
                    holder: holder.clone(),
                    timeout_ms,
                    tx,
                });
                AcquireOutcome::Queued(rx)
            }
            None => {
                let expires_at = now + timeout_ms;
                table.locks.insert(
                    name.to_string(),
                    LockRecord {
                        holder: holder.clone(),
                        acquired_at: now,
                        expires_at,
                    },
                );
                AcquireOutcome::Acquired {
                    expires_at,
                    renewed: false,
                }
            }
        }
    }

    /// Release `name` if `holder` holds it; never silently succeeds.
    pub fn release(&self, name: &str, holder: &SessionId) -> ReleaseOutcome {
        let now = self.clock.epoch_ms();
        let mut table = self.inner.lock();

        match table.locks.get(name) {
            Some(rec) if rec.holder == *holder => {
                table.locks.remove(name);
                table.grant_next(name, now);
                ReleaseOutcome::Released
            }
            _ => ReleaseOutcome::NotHolder,
        }
    }

    /// Release every lease held by `holder`. Returns the release count.
    pub fn release_all(&self, holder: &SessionId) -> usize {
        let now = self.clock.epoch_ms();
        let mut table = self.inner.lock();

        let names: Vec<String> = table
            .locks
            .iter()
            .filter(|(_, rec)| rec.holder == *holder)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            table.locks.remove(name);
            table.grant_next(name, now);
        }
        names.len()
    }

    /// Live leases; expired records are treated as absent.
    pub fn list(&self) -> Vec<LockInfo> {
        let now = self.clock.epoch_ms();
        let table = self.inner.lock();
        let mut out: Vec<LockInfo> = table
            .locks
            .iter()
            .filter(|(_, rec)| rec.expires_at > now)
            .map(|(name, rec)| LockInfo {
                name: name.clone(),
                holder: rec.holder.clone(),
                acquired_at: rec.acquired_at,
                expires_at: rec.expires_at,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Expire stale leases and wake their waiters.
    pub fn sweep(&self) {
        let now = self.clock.epoch_ms();
        self.inner.lock().expire(now);
    }

    /// Background sweeper bounding waiter wakeup latency.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                manager.sweep();
            }
        })
    }
}

/// Range check for wire-supplied lease durations.
pub fn valid_timeout_ms(ms: u64) -> bool {
    (MIN_LOCK_TIMEOUT_MS..=MAX_LOCK_TIMEOUT_MS).contains(&ms)
}

#[cfg(test)]
#[path = "locks_tests.rs"]
mod tests;
