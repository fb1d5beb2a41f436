// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance host: generations, construction, state persistence, reload.
//!
//! One live instance per generation. A reload constructs the next
//! generation first and swaps the pointer only on success, so in-flight
//! invocations finish against the generation they started on and no call
//! ever observes a partially-constructed instance.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use photon_core::PhotonDescriptor;
use photon_storage::{instance_state_path, state, EnvStore, StateWriter};
use tracing::info;

use crate::loader::{LoadContext, LoadError, PhotonInstance, PhotonLoader};
use crate::webhook::WebhookRouter;

/// Default instance name for single-instance photons.
const INSTANCE_NAME: &str = "default";

/// One load of the photon source: immutable for its lifetime.
pub struct Generation {
    pub number: u64,
    pub descriptor: PhotonDescriptor,
    pub instance: Arc<dyn PhotonInstance>,
    pub webhooks: WebhookRouter,
}

impl std::fmt::Debug for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generation")
            .field("number", &self.number)
            .field("descriptor", &self.descriptor)
            .field("webhooks", &self.webhooks)
            .finish_non_exhaustive()
    }
}

/// Owns the generation pointer and the persistence plumbing.
pub struct InstanceHost {
    loader: Arc<dyn PhotonLoader>,
    photon_name: String,
    state_dir: PathBuf,
    env_path: PathBuf,
    current: RwLock<Arc<Generation>>,
    next_generation: AtomicU64,
    state_writer: Mutex<Option<StateWriter>>,
}

impl InstanceHost {
    /// Load generation 1 and return the host. Construction failure here is
    /// fatal to daemon startup.
    pub async fn initialize(
        photon_name: String,
        photon_path: PathBuf,
        loader: Arc<dyn PhotonLoader>,
        state_dir: PathBuf,
        env_path: PathBuf,
    ) -> Result<Arc<Self>, LoadError> {
        let generation =
            load_generation(&loader, &photon_name, &state_dir, &env_path, 1, photon_path).await?;
        info!(
            photon = %photon_name,
            methods = generation.descriptor.methods.len(),
            "photon loaded"
        );

        Ok(Arc::new(Self {
            loader,
            photon_name,
            state_dir,
            env_path,
            current: RwLock::new(Arc::new(generation)),
            next_generation: AtomicU64::new(2),
            state_writer: Mutex::new(None),
        }))
    }

    /// Snapshot of the live generation.
    pub fn current(&self) -> Arc<Generation> {
        Arc::clone(&self.current.read())
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.current.read().descriptor.method(name).is_some()
    }

    /// Hot reload: construct the next generation, swap on success, then
    /// shut the old instance down. On failure the old generation stays
    /// live and the error is returned to the caller.
    pub async fn reload(&self, photon_path: PathBuf) -> Result<Arc<Generation>, LoadError> {
        let number = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let generation = Arc::new(
            load_generation(
                &self.loader,
                &self.photon_name,
                &self.state_dir,
                &self.env_path,
                number,
                photon_path,
            )
            .await?,
        );

        let old = {
            let mut current = self.current.write();
            std::mem::replace(&mut *current, Arc::clone(&generation))
        };
        info!(
            photon = %self.photon_name,
            generation = number,
            "reload complete"
        );

        old.instance.on_shutdown().await;
        Ok(generation)
    }

    /// Queue a debounced snapshot of the instance's tracked state.
    /// No-op for stateless photons.
    pub fn persist_state(&self) {
        let generation = self.current();
        if !generation.descriptor.stateful {
            return;
        }
        let Some(snapshot) = generation.instance.state_snapshot() else {
            return;
        };
        self.writer().update(snapshot);
    }

    /// Force any pending snapshot to disk.
    pub async fn flush_state(&self) {
        let writer = self.state_writer.lock().clone();
        if let Some(writer) = writer {
            writer.flush().await;
        }
    }

    /// Shutdown hook: final state snapshot, then the instance's own hook.
    pub async fn shutdown(&self) {
        self.persist_state();
        self.flush_state().await;
        self.current().instance.on_shutdown().await;
    }

    fn writer(&self) -> StateWriter {
        let mut guard = self.state_writer.lock();
        guard
            .get_or_insert_with(|| {
                StateWriter::spawn(instance_state_path(&self.state_dir, INSTANCE_NAME))
            })
            .clone()
    }
}

/// Construct one generation: resolve the env store, hand over any restored
/// state, run the loader, and validate what came back.
async fn load_generation(
    loader: &Arc<dyn PhotonLoader>,
    photon_name: &str,
    state_dir: &Path,
    env_path: &Path,
    number: u64,
    photon_path: PathBuf,
) -> Result<Generation, LoadError> {
    let env = EnvStore::load(env_path)?;
    let restored_state = state::load(&instance_state_path(state_dir, INSTANCE_NAME))?;

    let ctx = LoadContext {
        photon_name: photon_name.to_string(),
        photon_path,
        generation: number,
        env,
        restored_state,
    };

    let loaded = loader.load(&ctx).await?;
    loaded.descriptor.validate()?;
    let webhooks = WebhookRouter::build(&loaded.descriptor.methods)?;

    Ok(Generation {
        number,
        descriptor: loaded.descriptor,
        instance: loaded.instance,
        webhooks,
    })
}

#[cfg(test)]
#[path = "host_tests.rs"]
mod tests;
