// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dispatcher: the single consumer point for inbound requests.
//!
//! All frames from every connection land on one shared queue; a fixed
//! pool of workers (CPU count) pops them and routes to the owning
//! subsystem. User-code execution never blocks a worker: `command`
//! requests hand off to the method runner, and waiting lock acquisitions
//! move to their own task. A panicked worker is logged and respawned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use photon_core::{Clock, CronExpr, ErrorKind, SessionId};
use serde_json::json;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channels::ChannelBus;
use crate::host::InstanceHost;
use crate::lifecycle::Activity;
use crate::listener::{ConnRegistry, Connection};
use crate::locks::{
    valid_timeout_ms, AcquireOutcome, LockManager, ReleaseOutcome, DEFAULT_LOCK_TIMEOUT_MS,
};
use crate::protocol::{Request, Response};
use crate::runner::{CallRequest, MethodRunner};
use crate::scheduler::Scheduler;

/// One queued request with its originating connection.
pub struct Inbound {
    pub conn: Arc<Connection>,
    pub request: Request,
}

/// Shared daemon context for the listener, dispatcher, and scheduler.
pub struct DaemonCtx<C: Clock> {
    pub inbound_tx: mpsc::UnboundedSender<Inbound>,
    pub conns: Arc<ConnRegistry>,
    pub channels: Arc<ChannelBus>,
    pub locks: Arc<LockManager<C>>,
    pub scheduler: Arc<Scheduler<C>>,
    pub runner: Arc<MethodRunner<C>>,
    pub host: Arc<InstanceHost>,
    pub shutdown: Arc<Notify>,
    pub activity: Arc<Activity>,
    pub release_locks_on_disconnect: bool,
    shutting_down: AtomicBool,
}

impl<C: Clock + 'static> DaemonCtx<C> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inbound_tx: mpsc::UnboundedSender<Inbound>,
        conns: Arc<ConnRegistry>,
        channels: Arc<ChannelBus>,
        locks: Arc<LockManager<C>>,
        scheduler: Arc<Scheduler<C>>,
        runner: Arc<MethodRunner<C>>,
        host: Arc<InstanceHost>,
        activity: Arc<Activity>,
        release_locks_on_disconnect: bool,
    ) -> Self {
        Self {
            inbound_tx,
            conns,
            channels,
            locks,
            scheduler,
            runner,
            host,
            shutdown: Arc::new(Notify::new()),
            activity,
            release_locks_on_disconnect,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Flip the shutdown flag and wake the supervisor loop.
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

/// Spawn the worker pool over the shared inbound queue. Each slot is
/// supervised: a panic restarts the worker, the daemon continues.
pub fn spawn_workers<C: Clock + 'static>(
    count: usize,
    rx: mpsc::UnboundedReceiver<Inbound>,
    ctx: Arc<DaemonCtx<C>>,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count)
        .map(|slot| {
            let rx = Arc::clone(&rx);
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                loop {
                    let worker = tokio::spawn(worker_loop(Arc::clone(&rx), Arc::clone(&ctx)));
                    match worker.await {
                        Ok(()) => return, // queue closed
                        Err(e) if e.is_panic() => {
                            error!(slot, "dispatcher worker panicked, restarting");
                        }
                        Err(_) => return, // cancelled
                    }
                }
            })
        })
        .collect()
}

async fn worker_loop<C: Clock + 'static>(
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    ctx: Arc<DaemonCtx<C>>,
) {
    loop {
        let inbound = { rx.lock().await.recv().await };
        let Some(inbound) = inbound else { return };

        // Isolate each request so a crash becomes an `internal` error
        // frame instead of taking the worker down with it.
        let conn = Arc::clone(&inbound.conn);
        let request_id = inbound.request.id().to_string();
        let handler_ctx = Arc::clone(&ctx);
        let handler = tokio::spawn(async move { handle_inbound(inbound, &handler_ctx).await });
        if let Err(e) = handler.await {
            if e.is_panic() {
                error!(request = %request_id, "request handler panicked");
                conn.send(Response::error(
                    request_id,
                    ErrorKind::Internal,
                    "internal error",
                ))
                .await;
            }
        }
    }
}

/// Route one request to its subsystem and deliver the reply.
pub async fn handle_inbound<C: Clock + 'static>(inbound: Inbound, ctx: &Arc<DaemonCtx<C>>) {
    let Inbound { conn, request } = inbound;

    if ctx.is_shutting_down() && !matches!(request, Request::Ping { .. }) {
        conn.send(Response::error(
            request.id().to_string(),
            ErrorKind::ShuttingDown,
            "daemon is shutting down",
        ))
        .await;
        return;
    }

    match request {
        Request::Ping { id } => {
            conn.send(Response::Pong { id }).await;
        }

        Request::Shutdown { id } => {
            info!("shutdown requested");
            conn.send(Response::result(id, json!({ "shutting_down": true })))
                .await;
            ctx.begin_shutdown();
        }

        Request::Command {
            id,
            method,
            args,
            session_id,
            timeout,
        } => {
            ctx.runner.submit(CallRequest {
                conn,
                request_id: id,
                method,
                args,
                session: session_id.unwrap_or_else(SessionId::anonymous),
                timeout: timeout.map(Duration::from_millis),
            });
        }

        Request::Subscribe { id, channel, .. } => {
            let count = ctx.channels.subscribe(conn.id, &channel);
            conn.send(Response::result(
                id,
                json!({ "subscribed": true, "channel": channel, "subscriberCount": count }),
            ))
            .await;
        }

        Request::Unsubscribe { id, channel } => {
            let removed = ctx.channels.unsubscribe(conn.id, &channel);
            conn.send(Response::result(
                id,
                json!({ "unsubscribed": removed, "channel": channel }),
            ))
            .await;
        }

        Request::Publish { id, channel, message } => {
            let delivered = ctx.channels.publish(conn.id, &channel, &message);
            conn.send(Response::result(
                id,
                json!({ "published": true, "delivered": delivered }),
            ))
            .await;
        }

        Request::Lock {
            id,
            lock_name,
            session_id,
            lock_timeout,
            wait,
        } => {
            handle_lock(ctx, conn, id, lock_name, session_id, lock_timeout, wait).await;
        }

        Request::Unlock {
            id,
            lock_name,
            session_id,
        } => {
            let frame = match ctx.locks.release(&lock_name, &session_id) {
                ReleaseOutcome::Released => Response::result(id, json!({ "released": true })),
                ReleaseOutcome::NotHolder => Response::result(
                    id,
                    json!({ "released": false, "reason": "not-holder" }),
                ),
            };
            conn.send(frame).await;
        }

        Request::ListLocks { id } => {
            let locks = ctx.locks.list();
            conn.send(Response::result(id, json!({ "locks": locks })))
                .await;
        }

        Request::Schedule {
            id,
            job_id,
            method,
            cron,
            args,
        } => {
            let frame = match CronExpr::parse(&cron) {
                Err(e) => Response::invalid(id, e.to_string()),
                Ok(cron) => match ctx.scheduler.schedule(job_id.clone(), method, cron, args) {
                    Ok(ack) => Response::result(
                        id,
                        json!({
                            "scheduled": true,
                            "jobId": job_id,
                            "nextRun": ack.next_run,
                            "replaced": ack.replaced,
                        }),
                    ),
                    Err(e) => Response::invalid(id, e.to_string()),
                },
            };
            conn.send(frame).await;
        }

        Request::Unschedule { id, job_id } => {
            let removed = ctx.scheduler.unschedule(&job_id);
            conn.send(Response::result(
                id,
                json!({ "unscheduled": removed, "jobId": job_id }),
            ))
            .await;
        }

        Request::ListJobs { id } => {
            let jobs = ctx.scheduler.list();
            conn.send(Response::result(id, json!({ "jobs": jobs }))).await;
        }

        Request::Reload { id, photon_path } => {
            let frame = match ctx.host.reload(photon_path).await {
                Ok(generation) => {
                    ctx.scheduler.ensure_annotated(&generation.descriptor);
                    let methods: Vec<&str> = generation
                        .descriptor
                        .methods
                        .iter()
                        .map(|m| m.name.as_str())
                        .collect();
                    Response::result(
                        id,
                        json!({
                            "reloaded": true,
                            "generation": generation.number,
                            "methods": methods,
                        }),
                    )
                }
                Err(e) => Response::error(id, ErrorKind::UserError, e.to_string()),
            };
            conn.send(frame).await;
        }

        Request::PromptResponse { id, prompt_value } => {
            if !ctx.runner.resume_prompt(&id, prompt_value) {
                conn.send(Response::invalid(id, "unknown prompt id")).await;
            }
        }
    }
}

/// Lock acquisition; waiting acquires park in their own task so a
/// dispatcher worker is never held across a lock queue.
async fn handle_lock<C: Clock + 'static>(
    ctx: &Arc<DaemonCtx<C>>,
    conn: Arc<Connection>,
    id: String,
    lock_name: String,
    session_id: SessionId,
    lock_timeout: Option<u64>,
    wait: bool,
) {
    let timeout_ms = lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT_MS);
    if !valid_timeout_ms(timeout_ms) {
        conn.send(Response::invalid(
            id,
            format!("lockTimeout {} out of range [1, 86400000]", timeout_ms),
        ))
        .await;
        return;
    }

    match ctx.locks.acquire(&lock_name, &session_id, timeout_ms, wait) {
        AcquireOutcome::Acquired { expires_at, .. } => {
            conn.send(Response::result(
                id,
                json!({ "acquired": true, "expiresAt": expires_at }),
            ))
            .await;
        }
        AcquireOutcome::Busy { holder } => {
            conn.send(Response::result(
                id,
                json!({ "acquired": false, "holder": holder }),
            ))
            .await;
        }
        AcquireOutcome::Queued(rx) => {
            tokio::spawn(async move {
                let frame =
                    match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
                        Ok(Ok(granted)) => Response::result(
                            id,
                            json!({ "acquired": true, "expiresAt": granted.expires_at }),
                        ),
                        _ => Response::result(
                            id,
                            json!({ "acquired": false, "reason": "deadline" }),
                        ),
                    };
                conn.send(frame).await;
            });
        }
    }
}

#[cfg(test)]
#[path = "dispatcher_tests.rs"]
mod tests;
