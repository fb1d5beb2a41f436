// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Photon loading contract.
//!
//! The daemon does not parse photon sources itself: an external extractor
//! produces the method descriptors, and a [`PhotonLoader`] yields the
//! descriptor set plus a constructed instance. Method dispatch goes
//! through a registration table rather than reflection, so a "photon" here
//! is anything implementing [`PhotonInstance`]; the `photond` binary
//! resolves loaders from a name-keyed [`Registry`], and embedding hosts
//! register their own.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use photon_core::{
    CronExpr, DescriptorError, LockSpec, MethodDescriptor, PhotonDescriptor, WebhookSpec,
};
use photon_storage::{EnvStore, StateError};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::runner::CallContext;
use crate::webhook::WebhookError;

/// Errors surfaced while loading a generation.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown photon {0:?}")]
    UnknownPhoton(String),

    #[error("missing required parameter {param:?} for photon {photon:?}")]
    MissingParam { photon: String, param: String },

    #[error(transparent)]
    Descriptor(#[from] DescriptorError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("constructor failed: {0}")]
    Constructor(String),
}

/// Errors surfaced from user code during an invocation.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// User code failed; reported verbatim as `user-error`.
    #[error("{0}")]
    User(String),

    /// The instance has no such method.
    #[error("no such method: {0}")]
    NoSuchMethod(String),

    /// A pending prompt's connection closed.
    #[error("client disconnected during prompt")]
    ClientGone,

    /// The call observed its cancellation signal and stopped.
    #[error("cancelled")]
    Cancelled,
}

/// A constructed photon instance: user state plus method dispatch.
///
/// One instance lives per generation and is never shared across
/// generations. The method runner is the only caller of `invoke`.
#[async_trait]
pub trait PhotonInstance: Send + Sync {
    /// Invoke a method with a name→value argument map.
    async fn invoke(
        &self,
        method: &str,
        args: Map<String, Value>,
        ctx: &CallContext,
    ) -> Result<Value, InvokeError>;

    /// Tracked state for persistence; `None` for stateless photons.
    fn state_snapshot(&self) -> Option<Value> {
        None
    }

    /// Invoked when the instance's generation is replaced or the daemon
    /// shuts down.
    async fn on_shutdown(&self) {}
}

/// Everything a loader gets to construct an instance.
pub struct LoadContext {
    pub photon_name: String,
    pub photon_path: PathBuf,
    pub generation: u64,
    /// Env store for primitive constructor parameters.
    pub env: EnvStore,
    /// Persisted state for stateful photons, if a snapshot exists.
    pub restored_state: Option<Value>,
}

impl LoadContext {
    /// Resolve an optional parameter.
    pub fn get(&self, param: &str) -> Option<String> {
        self.env.resolve(param)
    }

    /// Resolve a required parameter; an unresolvable one rejects the load.
    pub fn require(&self, param: &str) -> Result<String, LoadError> {
        self.env.resolve(param).ok_or_else(|| LoadError::MissingParam {
            photon: self.photon_name.clone(),
            param: param.to_string(),
        })
    }
}

/// A loaded generation: descriptors plus the constructed instance.
pub struct LoadedPhoton {
    pub descriptor: PhotonDescriptor,
    pub instance: Arc<dyn PhotonInstance>,
}

/// Constructs a photon from its source path and load context.
#[async_trait]
pub trait PhotonLoader: Send + Sync {
    async fn load(&self, ctx: &LoadContext) -> Result<LoadedPhoton, LoadError>;
}

/// Name-keyed loader registry for the `photond` binary and tests.
#[derive(Default)]
pub struct Registry {
    loaders: HashMap<String, Arc<dyn PhotonLoader>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, loader: Arc<dyn PhotonLoader>) {
        self.loaders.insert(name.into(), loader);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn PhotonLoader>, LoadError> {
        self.loaders
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::UnknownPhoton(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.loaders.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Registry with the photons compiled into this binary.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("heartbeat", Arc::new(HeartbeatLoader));
        registry
    }
}

/// Built-in demo photon: a stateful beat counter.
///
/// Exercises every annotation the framework supports, so a bare
/// `photond heartbeat.ts` daemon is a working end-to-end fixture.
pub struct HeartbeatLoader;

struct Heartbeat {
    count: AtomicU64,
}

#[async_trait]
impl PhotonLoader for HeartbeatLoader {
    async fn load(&self, ctx: &LoadContext) -> Result<LoadedPhoton, LoadError> {
        let count = ctx
            .restored_state
            .as_ref()
            .and_then(|s| s.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0);

        let mut descriptor = PhotonDescriptor::new("heartbeat", ctx.photon_path.clone());
        descriptor.stateful = true;

        let mut beat = MethodDescriptor::new("beat");
        beat.locked = Some(LockSpec::Flag(true));

        let mut tick = MethodDescriptor::new("tick");
        tick.scheduled = Some(
            CronExpr::parse("* * * * *")
                .map_err(|e| LoadError::Constructor(e.to_string()))?,
        );

        let mut handle_ping = MethodDescriptor::new("handlePing");
        handle_ping.webhook = Some(WebhookSpec::Flag(true));

        descriptor.methods = vec![
            beat,
            tick,
            handle_ping,
            MethodDescriptor::new("status"),
            MethodDescriptor::new("ask"),
        ];

        Ok(LoadedPhoton {
            descriptor,
            instance: Arc::new(Heartbeat {
                count: AtomicU64::new(count),
            }),
        })
    }
}

#[async_trait]
impl PhotonInstance for Heartbeat {
    async fn invoke(
        &self,
        method: &str,
        args: Map<String, Value>,
        ctx: &CallContext,
    ) -> Result<Value, InvokeError> {
        match method {
            "beat" | "tick" => {
                let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                ctx.emit("heartbeat", json!({ "count": count }));
                Ok(json!({ "count": count }))
            }
            "status" => Ok(json!({
                "photon": "heartbeat",
                "count": self.count.load(Ordering::SeqCst),
            })),
            "handlePing" => Ok(Value::Object(args)),
            "ask" => {
                let answer = ctx.prompt("beat again?").await?;
                if answer == json!("yes") {
                    let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!({ "count": count, "answer": answer }))
                } else {
                    Ok(json!({ "answer": answer }))
                }
            }
            other => Err(InvokeError::NoSuchMethod(other.to_string())),
        }
    }

    fn state_snapshot(&self) -> Option<Value> {
        Some(json!({ "count": self.count.load(Ordering::SeqCst) }))
    }
}
