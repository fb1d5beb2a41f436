// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared fixtures for daemon unit tests: a scripted "notes" photon and a
//! fully wired daemon context on a fake clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use photon_core::{
    CronExpr, FakeClock, LockSpec, MethodDescriptor, ParamDescriptor, ParamType, PhotonDescriptor,
};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Notify};

use crate::channels::ChannelBus;
use crate::dispatcher::{self, DaemonCtx, Inbound};
use crate::host::InstanceHost;
use crate::lifecycle::Activity;
use crate::listener::ConnRegistry;
use crate::loader::{InvokeError, LoadContext, LoadError, LoadedPhoton, PhotonInstance, PhotonLoader};
use crate::locks::LockManager;
use crate::runner::{CallContext, MethodRunner};
use crate::scheduler::Scheduler;

/// Loader for the scripted test photon.
pub(crate) struct TestLoader {
    pub gate: Arc<Notify>,
    pub markers: Arc<Mutex<Vec<String>>>,
    /// When set, every load after the first fails (reload-failure tests).
    pub fail_reloads: bool,
    loads: AtomicU64,
}

impl TestLoader {
    pub fn new(fail_reloads: bool) -> Self {
        Self {
            gate: Arc::new(Notify::new()),
            markers: Arc::new(Mutex::new(Vec::new())),
            fail_reloads,
            loads: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl PhotonLoader for TestLoader {
    async fn load(&self, ctx: &LoadContext) -> Result<LoadedPhoton, LoadError> {
        let load_number = self.loads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_reloads && load_number > 1 {
            return Err(LoadError::Constructor("reload refused".to_string()));
        }

        let mut descriptor = PhotonDescriptor::new("notes", ctx.photon_path.clone());
        descriptor.stateful = true;

        let mut add_note = MethodDescriptor::new("addNote");
        add_note.params = vec![ParamDescriptor {
            name: "text".to_string(),
            ty: ParamType::String,
            required: true,
            default: None,
        }];

        let mut gated_locked = MethodDescriptor::new("gatedLocked");
        gated_locked.locked = Some(LockSpec::Named("r".to_string()));

        let mut locked_mark = MethodDescriptor::new("lockedMark");
        locked_mark.locked = Some(LockSpec::Named("r".to_string()));

        let handle_push = MethodDescriptor::new("handleGithubPush");

        let mut tick = MethodDescriptor::new("tick");
        tick.scheduled = Some(CronExpr::parse("* * * * *").map_err(|e| {
            LoadError::Constructor(e.to_string())
        })?);

        descriptor.methods = vec![
            add_note,
            MethodDescriptor::new("list"),
            MethodDescriptor::new("fail"),
            MethodDescriptor::new("gated"),
            gated_locked,
            MethodDescriptor::new("mark"),
            locked_mark,
            MethodDescriptor::new("askColor"),
            MethodDescriptor::new("emitEvent"),
            handle_push,
            tick,
        ];
        // The second generation grows one method, for reload assertions.
        if load_number > 1 {
            descriptor.methods.push(MethodDescriptor::new("added"));
        }

        let notes = ctx
            .restored_state
            .as_ref()
            .and_then(|s| s.get("notes"))
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        Ok(LoadedPhoton {
            descriptor,
            instance: Arc::new(NotesPhoton {
                generation: load_number,
                notes: Mutex::new(notes),
                gate: Arc::clone(&self.gate),
                markers: Arc::clone(&self.markers),
            }),
        })
    }
}

pub(crate) struct NotesPhoton {
    generation: u64,
    notes: Mutex<Vec<String>>,
    gate: Arc<Notify>,
    markers: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PhotonInstance for NotesPhoton {
    async fn invoke(
        &self,
        method: &str,
        args: Map<String, Value>,
        ctx: &CallContext,
    ) -> Result<Value, InvokeError> {
        match method {
            "addNote" => {
                let text = args
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| InvokeError::User("text is required".to_string()))?;
                let mut notes = self.notes.lock();
                notes.push(text.to_string());
                Ok(json!({ "count": notes.len() }))
            }
            "list" => Ok(json!({ "notes": *self.notes.lock() })),
            "fail" => Err(InvokeError::User("boom".to_string())),
            "gated" | "gatedLocked" => {
                self.gate.notified().await;
                Ok(json!({ "gated": true, "generation": self.generation }))
            }
            "mark" | "lockedMark" => {
                let marker = args
                    .get("marker")
                    .and_then(Value::as_str)
                    .unwrap_or("m")
                    .to_string();
                self.markers.lock().push(format!("{}:start", marker));
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.markers.lock().push(format!("{}:end", marker));
                Ok(json!({ "marker": marker }))
            }
            "askColor" => {
                let color = ctx.prompt("color?").await?;
                Ok(json!({ "color": color }))
            }
            "emitEvent" => {
                let channel = args
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or("events");
                let message = args.get("message").cloned().unwrap_or(Value::Null);
                let delivered = ctx.emit(channel, message);
                Ok(json!({ "delivered": delivered }))
            }
            "handleGithubPush" => Ok(Value::Object(args)),
            "tick" | "added" => Ok(json!({ "ok": true })),
            other => Err(InvokeError::NoSuchMethod(other.to_string())),
        }
    }

    fn state_snapshot(&self) -> Option<Value> {
        Some(json!({ "notes": *self.notes.lock() }))
    }
}

/// A wired daemon context on a fake clock, with dispatcher workers live.
pub(crate) struct Harness {
    pub ctx: Arc<DaemonCtx<FakeClock>>,
    pub gate: Arc<Notify>,
    pub markers: Arc<Mutex<Vec<String>>>,
    pub host: Arc<InstanceHost>,
    pub dir: tempfile::TempDir,
}

pub(crate) async fn harness() -> Harness {
    harness_opts(false, false).await
}

pub(crate) async fn harness_opts(release_locks_on_disconnect: bool, fail_reloads: bool) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = FakeClock::new();
    clock.set_epoch_ms(1_700_000_000_000);

    let loader = Arc::new(TestLoader::new(fail_reloads));
    let gate = Arc::clone(&loader.gate);
    let markers = Arc::clone(&loader.markers);

    let host = InstanceHost::initialize(
        "notes".to_string(),
        dir.path().join("notes.ts"),
        loader,
        dir.path().join("state"),
        dir.path().join("env.json"),
    )
    .await
    .expect("initialize");

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Inbound>();
    let conns = Arc::new(ConnRegistry::new());
    let channels = Arc::new(ChannelBus::new(Arc::clone(&conns)));
    let locks = Arc::new(LockManager::new(clock.clone()));
    let runner = MethodRunner::new(Arc::clone(&host), Arc::clone(&locks), Arc::clone(&channels));
    let scheduler = Scheduler::new(clock.clone());

    let ctx = Arc::new(DaemonCtx::new(
        inbound_tx,
        conns,
        channels,
        locks,
        scheduler,
        runner,
        Arc::clone(&host),
        Arc::new(Activity::new()),
        release_locks_on_disconnect,
    ));
    dispatcher::spawn_workers(2, inbound_rx, Arc::clone(&ctx));

    Harness {
        ctx,
        gate,
        markers,
        host,
        dir,
    }
}

/// Await the next frame on a connection's outbox, with a test deadline.
pub(crate) async fn next_frame(
    rx: &mut mpsc::Receiver<crate::protocol::Response>,
) -> crate::protocol::Response {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("connection closed")
}
