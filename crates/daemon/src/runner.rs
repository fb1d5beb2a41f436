// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Method runner: the only component that calls user code.
//!
//! Enforces the serialization invariant: a photon instance executes at
//! most one method body at a time per lock domain. The default domain is
//! the whole instance; a `locked` annotation moves the method into a named
//! domain and additionally holds a lease in the lock manager so the lock
//! is visible via `list_locks`.
//!
//! Each domain is a queue drained by one task, so execution order is FIFO
//! by arrival at the runner and disjoint domains interleave freely. Calls
//! may suspend on a `prompt()` to the originating client; the suspension
//! keeps the domain held but no worker thread: the call is a parked
//! future in the prompt table until `prompt_response` arrives or the
//! connection dies. Deadlines cover queue wait, lock acquisition, and
//! user-code execution combined.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use photon_core::{Clock, ErrorKind, IdGen, SessionId, UuidIdGen};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::debug;

use crate::channels::ChannelBus;
use crate::host::{Generation, InstanceHost};
use crate::listener::{ConnId, Connection};
use crate::loader::InvokeError;
use crate::locks::{AcquireOutcome, LockManager};
use crate::protocol::Response;

/// Deadline applied when a `command` supplies no `timeout`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Cooperative cancellation flag shared with user code.
#[derive(Clone, Default)]
pub struct Cancellation {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl Cancellation {
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once cancelled; usable as a `select!` branch in user code.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// One invocation submitted to the runner.
pub struct CallRequest {
    pub conn: Arc<Connection>,
    pub request_id: String,
    pub method: String,
    pub args: Map<String, Value>,
    pub session: SessionId,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LockDomain {
    Instance,
    Named(String),
}

struct QueuedCall {
    call: CallRequest,
    generation: Arc<Generation>,
    lock_name: Option<String>,
    enqueued_at: tokio::time::Instant,
}

struct PendingPrompt {
    tx: oneshot::Sender<Value>,
    conn: ConnId,
}

/// Prompt-id → suspended call correlation.
struct PromptTable {
    map: Mutex<HashMap<String, PendingPrompt>>,
    ids: UuidIdGen,
}

/// Runtime services handed to user code for the duration of one call.
pub struct CallContext {
    conn: Arc<Connection>,
    channels: Arc<ChannelBus>,
    prompts: Arc<PromptTable>,
    cancel: Cancellation,
    session: SessionId,
    issued: Mutex<Vec<String>>,
}

impl CallContext {
    /// Publish on a channel as "this instance": every subscribed
    /// connection receives it, including the caller's.
    pub fn emit(&self, channel: &str, message: Value) -> usize {
        self.channels.publish(ConnId::INSTANCE, channel, &message)
    }

    /// Ask the originating client for input and suspend until it answers.
    /// The method's lock domain stays held across the suspension.
    pub async fn prompt(&self, text: &str) -> Result<Value, InvokeError> {
        let id = self.prompts.ids.next();
        let (tx, rx) = oneshot::channel();
        self.prompts.map.lock().insert(
            id.clone(),
            PendingPrompt {
                tx,
                conn: self.conn.id,
            },
        );
        self.issued.lock().push(id.clone());

        let frame = Response::Prompt {
            id: id.clone(),
            prompt: text.to_string(),
        };
        if !self.conn.send(frame).await {
            self.prompts.map.lock().remove(&id);
            return Err(InvokeError::ClientGone);
        }

        tokio::select! {
            value = rx => value.map_err(|_| InvokeError::ClientGone),
            _ = self.cancel.cancelled() => {
                self.prompts.map.lock().remove(&id);
                Err(InvokeError::Cancelled)
            }
        }
    }

    /// The caller's session label.
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the call should stop (deadline or shutdown).
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        // Clear any prompt this call issued but never consumed.
        let issued = std::mem::take(&mut *self.issued.lock());
        if !issued.is_empty() {
            let mut map = self.prompts.map.lock();
            for id in issued {
                map.remove(&id);
            }
        }
    }
}

enum Exec {
    Done(Result<Value, InvokeError>),
    TimedOut,
    ShutDown,
}

/// Serializes method invocations and delivers their results.
pub struct MethodRunner<C: Clock> {
    host: Arc<InstanceHost>,
    locks: Arc<LockManager<C>>,
    channels: Arc<ChannelBus>,
    domains: Mutex<HashMap<LockDomain, mpsc::UnboundedSender<QueuedCall>>>,
    prompts: Arc<PromptTable>,
    active: AtomicUsize,
    drained: Notify,
    shutdown: Cancellation,
}

impl<C: Clock + 'static> MethodRunner<C> {
    pub fn new(
        host: Arc<InstanceHost>,
        locks: Arc<LockManager<C>>,
        channels: Arc<ChannelBus>,
    ) -> Arc<Self> {
        Arc::new(Self {
            host,
            locks,
            channels,
            domains: Mutex::new(HashMap::new()),
            prompts: Arc::new(PromptTable {
                map: Mutex::new(HashMap::new()),
                ids: UuidIdGen,
            }),
            active: AtomicUsize::new(0),
            drained: Notify::new(),
            shutdown: Cancellation::default(),
        })
    }

    /// Submit a call. Resolution is asynchronous: the response frame goes
    /// to the call's connection when the invocation settles. FIFO order
    /// within a lock domain is fixed here, at arrival.
    pub fn submit(self: &Arc<Self>, call: CallRequest) {
        // Snapshot the generation now: in-flight calls keep running
        // against it across reloads.
        let generation = self.host.current();

        let Some(descriptor) = generation.descriptor.method(&call.method) else {
            let kind = if call.session == "scheduler" {
                ErrorKind::MethodMissing
            } else {
                ErrorKind::UnknownMethod
            };
            let frame = Response::error(
                call.request_id,
                kind,
                format!("method {:?} not found", call.method),
            );
            let conn = call.conn;
            tokio::spawn(async move {
                conn.send(frame).await;
            });
            return;
        };

        let lock_name = descriptor.lock_name().map(str::to_string);
        let domain = match &lock_name {
            Some(name) => LockDomain::Named(name.clone()),
            None => LockDomain::Instance,
        };

        self.active.fetch_add(1, Ordering::SeqCst);
        let queued = QueuedCall {
            call,
            generation,
            lock_name,
            enqueued_at: tokio::time::Instant::now(),
        };
        if let Err(mpsc::error::SendError(queued)) = self.domain_sender(&domain).send(queued) {
            // Domain task is gone; can only happen mid-teardown.
            self.settle();
            let frame = Response::error(
                queued.call.request_id,
                ErrorKind::ShuttingDown,
                "daemon is shutting down",
            );
            let conn = queued.call.conn;
            tokio::spawn(async move {
                conn.send(frame).await;
            });
        }
    }

    /// Resume a suspended call. False when the prompt id is unknown.
    pub fn resume_prompt(&self, prompt_id: &str, value: Value) -> bool {
        let pending = self.prompts.map.lock().remove(prompt_id);
        match pending {
            Some(p) => p.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Cancel every prompt whose originating connection closed. Dropping
    /// the sender resolves the suspended call with `client-gone`.
    pub fn cancel_prompts_for_conn(&self, conn: ConnId) {
        self.prompts.map.lock().retain(|_, p| p.conn != conn);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Broadcast cancellation and wait for in-flight calls, bounded by
    /// the drain deadline.
    pub async fn drain(&self, deadline: Duration) {
        self.shutdown.cancel();
        let drain_until = tokio::time::Instant::now() + deadline;
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(drain_until) => return,
            }
        }
    }

    fn settle(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Get or spawn the drain task for a domain. One task per domain
    /// executes its queue sequentially, which *is* the implicit lock.
    fn domain_sender(self: &Arc<Self>, domain: &LockDomain) -> mpsc::UnboundedSender<QueuedCall> {
        let mut domains = self.domains.lock();
        if let Some(tx) = domains.get(domain) {
            return tx.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedCall>();
        let runner: Weak<Self> = Arc::downgrade(self);
        let name = domain.clone();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let Some(runner) = runner.upgrade() else { return };
                debug!(domain = ?name, method = %queued.call.method, "dequeued");
                runner.run_call(queued).await;
                runner.settle();
            }
        });
        domains.insert(domain.clone(), tx.clone());
        tx
    }

    async fn run_call(&self, queued: QueuedCall) {
        let QueuedCall {
            call,
            generation,
            lock_name,
            enqueued_at,
        } = queued;
        let CallRequest {
            conn,
            request_id,
            method,
            args,
            session,
            timeout,
        } = call;
        let timeout = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        // Queue wait counts against the deadline: it is the implicit lock.
        let deadline = enqueued_at + timeout;

        if self.shutdown.is_cancelled() {
            conn.send(Response::error(
                request_id,
                ErrorKind::ShuttingDown,
                "daemon is shutting down",
            ))
            .await;
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            conn.send(Response::error(
                request_id,
                ErrorKind::LockTimeout,
                format!("timed out waiting for {:?}", method),
            ))
            .await;
            return;
        }

        // Explicit lease, visible via list_locks.
        if let Some(name) = &lock_name {
            let lease_ms = timeout.as_millis() as u64;
            let granted = match self.locks.acquire(name, &session, lease_ms, true) {
                AcquireOutcome::Acquired { .. } => true,
                AcquireOutcome::Busy { .. } => false,
                AcquireOutcome::Queued(rx) => {
                    tokio::select! {
                        result = rx => result.is_ok(),
                        _ = tokio::time::sleep_until(deadline) => false,
                        _ = self.shutdown.cancelled() => {
                            conn.send(Response::error(
                                request_id,
                                ErrorKind::ShuttingDown,
                                "daemon is shutting down",
                            ))
                            .await;
                            return;
                        }
                    }
                }
            };
            if !granted {
                conn.send(Response::error(
                    request_id,
                    ErrorKind::LockTimeout,
                    format!("could not acquire lock {:?}", name),
                ))
                .await;
                return;
            }
        }

        let cancel = Cancellation::default();
        let ctx = CallContext {
            conn: Arc::clone(&conn),
            channels: Arc::clone(&self.channels),
            prompts: Arc::clone(&self.prompts),
            cancel: cancel.clone(),
            session: session.clone(),
            issued: Mutex::new(Vec::new()),
        };

        debug!(method = %method, session = %session, "invoking");
        let exec = tokio::select! {
            result = generation.instance.invoke(&method, args, &ctx) => Exec::Done(result),
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                Exec::TimedOut
            }
            _ = self.shutdown.cancelled() => {
                cancel.cancel();
                Exec::ShutDown
            }
        };
        drop(ctx);

        if let Some(name) = &lock_name {
            let _ = self.locks.release(name, &session);
        }

        // Persist whatever the call did to tracked state, success or not.
        if matches!(exec, Exec::Done(_)) {
            self.host.persist_state();
        }

        let frame = match exec {
            Exec::Done(Ok(value)) => Response::result(request_id, value),
            Exec::Done(Err(InvokeError::User(message))) => {
                Response::error(request_id, ErrorKind::UserError, message)
            }
            Exec::Done(Err(InvokeError::NoSuchMethod(name))) => Response::error(
                request_id,
                ErrorKind::UnknownMethod,
                format!("method {:?} not found", name),
            ),
            Exec::Done(Err(InvokeError::ClientGone)) => Response::error(
                request_id,
                ErrorKind::ClientGone,
                "client disconnected during prompt",
            ),
            Exec::Done(Err(InvokeError::Cancelled)) => {
                if self.shutdown.is_cancelled() {
                    Response::error(request_id, ErrorKind::ShuttingDown, "daemon is shutting down")
                } else {
                    Response::error(request_id, ErrorKind::Timeout, "call cancelled")
                }
            }
            Exec::TimedOut => {
                Response::error(request_id, ErrorKind::Timeout, "call deadline exceeded")
            }
            Exec::ShutDown => {
                Response::error(request_id, ErrorKind::ShuttingDown, "daemon is shutting down")
            }
        };
        conn.send(frame).await;
    }
}

#[cfg(test)]
#[path = "runner_tests.rs"]
mod tests;
