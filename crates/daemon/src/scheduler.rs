// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cron scheduler: a min-heap of next fires drained by a single task.
//!
//! The task sleeps until the heap head is due or a control event (add,
//! remove, reload) wakes it. Each fire synthesizes an internal `command`
//! request with session `"scheduler"` and enqueues it on the dispatcher,
//! so scheduled invocations take the same path as client calls, and the
//! method's lock domain is the only overlap control. Missed fires are not
//! replayed: the next fire is computed strictly after now.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use photon_core::{Clock, CronError, CronExpr, IdGen, JobId, PhotonDescriptor, SessionId, UuidIdGen};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::Inbound;
use crate::host::InstanceHost;
use crate::listener::Connection;
use crate::protocol::Request;

/// Sleep cap when the heap is empty.
const IDLE_WAIT: Duration = Duration::from_secs(3600);

/// Scheduling errors, reported as `invalid-request` on the wire.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    Cron(#[from] CronError),

    #[error("cron expression never fires")]
    Unsatisfiable,
}

/// One scheduled job, as reported by `list_jobs`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub method: String,
    pub cron: CronExpr,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub next_run: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
    pub created_at: DateTime<Utc>,
    /// Set when the job's method vanished after a reload. The job is
    /// retained; fires yield `method-missing` results until it returns.
    #[serde(default)]
    pub degraded: bool,
}

/// Acknowledgement for a `schedule` request.
pub struct ScheduleAck {
    pub next_run: DateTime<Utc>,
    pub replaced: bool,
}

/// A due invocation popped from the heap.
#[derive(Debug, PartialEq)]
pub struct Fire {
    pub job_id: JobId,
    pub method: String,
    pub args: Map<String, Value>,
}

/// Heap-and-table scheduler state. Pure logic, clock-injected; the
/// surrounding task owns the waiting.
pub struct SchedCore<C: Clock> {
    clock: C,
    jobs: HashMap<JobId, JobInfo>,
    heap: BinaryHeap<Reverse<(i64, JobId)>>,
}

impl<C: Clock> SchedCore<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            jobs: HashMap::new(),
            heap: BinaryHeap::new(),
        }
    }

    /// Register a job. An existing id is replaced wholesale.
    pub fn schedule(
        &mut self,
        id: JobId,
        method: String,
        cron: CronExpr,
        args: Map<String, Value>,
    ) -> Result<ScheduleAck, ScheduleError> {
        let now = self.clock.now_utc();
        let next_run = cron.next_after(now).ok_or(ScheduleError::Unsatisfiable)?;
        let replaced = self.jobs.contains_key(&id);

        let job = JobInfo {
            id: id.clone(),
            method,
            cron,
            args,
            next_run,
            last_run: None,
            run_count: 0,
            created_at: now,
            degraded: false,
        };
        self.heap
            .push(Reverse((next_run.timestamp_millis(), id.clone())));
        self.jobs.insert(id, job);

        Ok(ScheduleAck { next_run, replaced })
    }

    /// Insert only if absent; used for `scheduled` method annotations so a
    /// reload does not reset a live job.
    pub fn ensure(
        &mut self,
        id: JobId,
        method: String,
        cron: CronExpr,
    ) -> Result<bool, ScheduleError> {
        if self.jobs.contains_key(&id) {
            return Ok(false);
        }
        self.schedule(id, method, cron, Map::new())?;
        Ok(true)
    }

    /// Remove a job. False when the id is unknown.
    pub fn unschedule(&mut self, id: &JobId) -> bool {
        self.jobs.remove(id).is_some()
        // Heap entries for the removed job become stale and are skipped
        // during pops.
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        jobs
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn set_degraded(&mut self, id: &JobId, degraded: bool) {
        if let Some(job) = self.jobs.get_mut(id) {
            job.degraded = degraded;
        }
    }

    /// Next live fire time; stale heap entries are discarded on the way.
    pub fn next_wakeup(&mut self) -> Option<DateTime<Utc>> {
        loop {
            let Reverse((ts, id)) = self.heap.peek()?.clone();
            match self.jobs.get(&id) {
                Some(job) if job.next_run.timestamp_millis() == ts => {
                    return Some(job.next_run);
                }
                _ => {
                    self.heap.pop();
                }
            }
        }
    }

    /// Pop every due job, advancing `lastRun`/`runCount`/`nextRun`.
    pub fn due(&mut self) -> Vec<Fire> {
        let now = self.clock.now_utc();
        let now_ms = now.timestamp_millis();
        let mut fires = Vec::new();

        while let Some(Reverse((ts, _))) = self.heap.peek() {
            if *ts > now_ms {
                break;
            }
            let Some(Reverse((ts, id))) = self.heap.pop() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&id) else {
                continue; // unscheduled while queued
            };
            if job.next_run.timestamp_millis() != ts {
                continue; // superseded by a replace
            }

            job.last_run = Some(now);
            job.run_count += 1;
            match job.cron.next_after(now) {
                Some(next) => {
                    job.next_run = next;
                    self.heap.push(Reverse((next.timestamp_millis(), id.clone())));
                }
                None => {
                    warn!(job = %id, "cron has no further fire times");
                }
            }

            fires.push(Fire {
                job_id: id,
                method: job.method.clone(),
                args: job.args.clone(),
            });
        }
        fires
    }
}

/// Scheduler handle: mutations wake the timer task.
pub struct Scheduler<C: Clock> {
    core: Mutex<SchedCore<C>>,
    clock: C,
    wake: Notify,
    ids: UuidIdGen,
}

impl<C: Clock + 'static> Scheduler<C> {
    pub fn new(clock: C) -> Arc<Self> {
        Arc::new(Self {
            core: Mutex::new(SchedCore::new(clock.clone())),
            clock,
            wake: Notify::new(),
            ids: UuidIdGen,
        })
    }

    pub fn schedule(
        &self,
        id: JobId,
        method: String,
        cron: CronExpr,
        args: Map<String, Value>,
    ) -> Result<ScheduleAck, ScheduleError> {
        let ack = self.core.lock().schedule(id, method, cron, args)?;
        self.wake.notify_one();
        Ok(ack)
    }

    pub fn unschedule(&self, id: &JobId) -> bool {
        let removed = self.core.lock().unschedule(id);
        self.wake.notify_one();
        removed
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.core.lock().list()
    }

    pub fn job_count(&self) -> usize {
        self.core.lock().job_count()
    }

    /// Register jobs for every `scheduled` method annotation, keyed by
    /// method name. Live jobs keep their run history across reloads.
    pub fn ensure_annotated(&self, descriptor: &PhotonDescriptor) {
        let mut core = self.core.lock();
        for method in &descriptor.methods {
            let Some(cron) = &method.scheduled else { continue };
            match core.ensure(JobId::new(&method.name), method.name.clone(), cron.clone()) {
                Ok(true) => info!(method = %method.name, cron = %cron, "scheduled annotated method"),
                Ok(false) => {}
                Err(e) => warn!(method = %method.name, error = %e, "could not schedule annotation"),
            }
        }
        self.wake.notify_one();
    }

    /// Run the timer task: sleep until the head fires or a control event
    /// arrives, then enqueue due invocations on the dispatcher.
    pub fn spawn(
        self: &Arc<Self>,
        fire_tx: mpsc::UnboundedSender<Inbound>,
        fire_conn: Arc<Connection>,
        host: Arc<InstanceHost>,
    ) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = {
                    let mut core = scheduler.core.lock();
                    core.next_wakeup()
                };
                let sleep_for = match wait {
                    Some(at) => (at - scheduler.clock.now_utc())
                        .to_std()
                        .unwrap_or(Duration::ZERO),
                    None => IDLE_WAIT,
                };

                tokio::select! {
                    _ = scheduler.wake.notified() => continue,
                    _ = tokio::time::sleep(sleep_for) => {}
                }

                let fires = { scheduler.core.lock().due() };
                for fire in fires {
                    let degraded = !host.has_method(&fire.method);
                    scheduler.core.lock().set_degraded(&fire.job_id, degraded);
                    if degraded {
                        warn!(job = %fire.job_id, method = %fire.method, "scheduled method missing after reload");
                    }

                    debug!(job = %fire.job_id, method = %fire.method, "cron fire");
                    let request = Request::Command {
                        id: format!("sched-{}", scheduler.ids.next()),
                        method: fire.method,
                        args: fire.args,
                        session_id: Some(SessionId::scheduler()),
                        timeout: None,
                    };
                    if fire_tx
                        .send(Inbound {
                            conn: Arc::clone(&fire_conn),
                            request,
                        })
                        .is_err()
                    {
                        return; // dispatcher gone: shutting down
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
