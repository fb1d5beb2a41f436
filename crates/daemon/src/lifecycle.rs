// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: paths, startup, shutdown, idle exit.
//!
//! At most one daemon per photon per machine, enforced by an exclusive
//! file lock on the PID file. Clients discover the daemon through the
//! well-known socket path derived from the photon name.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use parking_lot::Mutex;
use photon_core::{Clock, SystemClock};
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channels::ChannelBus;
use crate::dispatcher::{self, DaemonCtx};
use crate::env;
use crate::host::InstanceHost;
use crate::listener::ConnRegistry;
use crate::loader::{LoadError, PhotonLoader};
use crate::locks::LockManager;
use crate::runner::MethodRunner;
use crate::scheduler::Scheduler;

/// Wall-clock activity tracker feeding the idle-exit check.
pub struct Activity {
    last: Mutex<Instant>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Daemon configuration: the discovery contract plus tunables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Photon name (lowercase kebab, unique per machine).
    pub photon_name: String,
    /// Photon source file, handed to the loader.
    pub photon_path: PathBuf,
    /// Unix socket clients connect to.
    pub socket_path: PathBuf,
    /// PID file held under an exclusive lock for the daemon's lifetime.
    pub pid_path: PathBuf,
    /// Version marker so clients can report a stale daemon.
    pub version_path: PathBuf,
    /// Daemon log file.
    pub log_path: PathBuf,
    /// Per-photon state directory (instance snapshots).
    pub state_dir: PathBuf,
    /// Env store file for constructor parameters.
    pub env_path: PathBuf,
    /// Exit after this long with no connections, subscriptions, jobs, or
    /// in-flight calls. `None` disables idle exit.
    pub idle_timeout: Option<Duration>,
    /// Bounded wait for in-flight invocations at shutdown.
    pub drain_deadline: Duration,
    /// Lock expiry sweeper interval.
    pub sweep_interval: Duration,
    /// Dispatcher worker pool size.
    pub dispatch_workers: usize,
    /// Whether connection close releases that session's locks.
    pub release_locks_on_disconnect: bool,
}

impl Config {
    /// Resolve configuration for one photon from the environment.
    pub fn load(photon_name: &str, photon_path: PathBuf) -> Result<Self, LifecycleError> {
        let runtime_dir = env::runtime_dir();
        let home = env::home_dir().ok_or(LifecycleError::NoHomeDir)?;
        let state_dir = home.join(".photon").join("state").join(photon_name);

        Ok(Self {
            photon_name: photon_name.to_string(),
            photon_path,
            socket_path: runtime_dir.join(format!("{}.sock", photon_name)),
            pid_path: runtime_dir.join(format!("{}.pid", photon_name)),
            version_path: runtime_dir.join(format!("{}.version", photon_name)),
            log_path: state_dir.join("daemon.log"),
            env_path: home
                .join(".photon")
                .join("env")
                .join(format!("{}.json", photon_name)),
            state_dir,
            idle_timeout: env::idle_timeout(),
            drain_deadline: env::drain_deadline(),
            sweep_interval: env::sweep_interval(),
            dispatch_workers: env::dispatch_workers(),
            release_locks_on_disconnect: env::release_locks_on_disconnect(),
        })
    }
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("could not determine home directory")]
    NoHomeDir,

    #[error("failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error("failed to load photon: {0}")]
    Load(#[from] LoadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon state during operation.
pub struct DaemonState<C: Clock> {
    pub config: Config,
    // NOTE(lifetime): Held to maintain exclusive file lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
    pub ctx: Arc<DaemonCtx<C>>,
    scheduler_task: JoinHandle<()>,
    sweeper_task: JoinHandle<()>,
    worker_tasks: Vec<JoinHandle<()>>,
    idle_task: Option<JoinHandle<()>>,
}

/// Concrete daemon type used by the binary.
pub type Daemon = DaemonState<SystemClock>;

/// Result of daemon startup: the state plus the bound listener socket,
/// returned separately so the caller spawns the accept loop.
pub struct StartupResult<C: Clock> {
    pub daemon: DaemonState<C>,
    pub listener: UnixListener,
}

/// Start the daemon with the system clock.
pub async fn startup(
    config: &Config,
    loader: Arc<dyn PhotonLoader>,
) -> Result<StartupResult<SystemClock>, LifecycleError> {
    startup_with_clock(config, loader, SystemClock).await
}

/// Start the daemon with an injected clock (tests use a fake one).
pub async fn startup_with_clock<C: Clock + 'static>(
    config: &Config,
    loader: Arc<dyn PhotonLoader>,
    clock: C,
) -> Result<StartupResult<C>, LifecycleError> {
    match startup_inner(config, loader, clock).await {
        Ok(result) => Ok(result),
        Err(e) => {
            // Do not clean up if we failed to acquire the lock:
            // those files belong to the already-running daemon.
            if !matches!(e, LifecycleError::LockFailed(_)) {
                cleanup_on_failure(config);
            }
            Err(e)
        }
    }
}

async fn startup_inner<C: Clock + 'static>(
    config: &Config,
    loader: Arc<dyn PhotonLoader>,
    clock: C,
) -> Result<StartupResult<C>, LifecycleError> {
    // 1. Create directories (socket dir, state dir, env store parent)
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&config.state_dir)?;
    if let Some(parent) = config.env_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // 2. Acquire the PID lock FIRST - prevents races.
    // Open without truncating so a failed attempt can't wipe the running
    // daemon's PID; truncate only once we hold the lock.
    let lock_file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&config.pid_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;

    use std::io::Write;
    let mut lock_file = lock_file;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;
    let lock_file = lock_file;

    // 3. Version marker
    std::fs::write(&config.version_path, env!("CARGO_PKG_VERSION"))?;

    // 4. Construct the instance. Failure here is fatal to startup.
    let host = InstanceHost::initialize(
        config.photon_name.clone(),
        config.photon_path.clone(),
        Arc::clone(&loader),
        config.state_dir.clone(),
        config.env_path.clone(),
    )
    .await?;

    // 5. Wire up the components around the shared inbound queue.
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let conns = Arc::new(ConnRegistry::new());
    let channels = Arc::new(ChannelBus::new(Arc::clone(&conns)));
    let locks = Arc::new(LockManager::new(clock.clone()));
    let sweeper_task = locks.spawn_sweeper(config.sweep_interval);
    let runner = MethodRunner::new(Arc::clone(&host), Arc::clone(&locks), Arc::clone(&channels));
    let scheduler = Scheduler::new(clock);
    let activity = Arc::new(Activity::new());

    let ctx = Arc::new(DaemonCtx::new(
        inbound_tx.clone(),
        Arc::clone(&conns),
        channels,
        locks,
        Arc::clone(&scheduler),
        runner,
        Arc::clone(&host),
        Arc::clone(&activity),
        config.release_locks_on_disconnect,
    ));

    let worker_tasks = dispatcher::spawn_workers(config.dispatch_workers, inbound_rx, Arc::clone(&ctx));

    // 6. Jobs for `scheduled` method annotations, then the timer task.
    scheduler.ensure_annotated(&host.current().descriptor);
    let fire_conn = conns.internal("scheduler");
    let scheduler_task = scheduler.spawn(inbound_tx, fire_conn, Arc::clone(&host));

    // 7. Remove stale socket and bind LAST, after all validation passed.
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .map_err(|e| LifecycleError::BindFailed(config.socket_path.clone(), e))?;

    // 8. Idle monitor, when configured.
    let idle_task = config
        .idle_timeout
        .map(|threshold| spawn_idle_monitor(Arc::clone(&ctx), threshold));

    info!(photon = %config.photon_name, "daemon started");

    Ok(StartupResult {
        daemon: DaemonState {
            config: config.clone(),
            lock_file,
            ctx,
            scheduler_task,
            sweeper_task,
            worker_tasks,
            idle_task,
        },
        listener,
    })
}

impl<C: Clock + 'static> DaemonState<C> {
    /// Ordered shutdown: stop the scheduler, drain in-flight invocations,
    /// close connections, run the instance hook, release the files.
    ///
    /// The accept loop is the caller's task and must already be stopped
    /// (aborted or dropped) before this runs.
    pub async fn shutdown(&mut self) {
        info!("shutting down daemon...");
        self.ctx.begin_shutdown();

        // 1. No more fires
        self.scheduler_task.abort();

        // 2. Drain in-flight invocations, bounded
        self.ctx.runner.drain(self.config.drain_deadline).await;

        // 3. Close connections; pending requests were answered by the
        // runner's shutdown branch, late arrivals get `shutting-down`
        // from the dispatcher.
        self.ctx.conns.close_all();

        // 4. Instance hook + final state flush
        self.ctx.host.shutdown().await;

        // 5. Stop background tasks
        self.sweeper_task.abort();
        for task in &self.worker_tasks {
            task.abort();
        }
        if let Some(task) = &self.idle_task {
            task.abort();
        }

        // 6. Release discovery files; the PID lock drops with the file.
        for path in [
            &self.config.socket_path,
            &self.config.pid_path,
            &self.config.version_path,
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!(path = %path.display(), "failed to remove: {}", e);
                }
            }
        }

        info!("daemon shutdown complete");
    }
}

/// Exit when nothing has happened for the threshold and nothing is live:
/// no connections, no subscriptions, no scheduled jobs, no in-flight
/// invocations.
fn spawn_idle_monitor<C: Clock + 'static>(
    ctx: Arc<DaemonCtx<C>>,
    threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let interval = (threshold / 4).max(Duration::from_millis(250));
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            let idle = ctx.conns.active_count() == 0
                && ctx.channels.subscription_count() == 0
                && ctx.scheduler.job_count() == 0
                && ctx.runner.active_count() == 0
                && ctx.activity.idle_for() >= threshold;
            if idle {
                info!("idle timeout reached, shutting down");
                ctx.begin_shutdown();
                return;
            }
        }
    })
}

/// Clean up resources on startup failure
fn cleanup_on_failure(config: &Config) {
    for path in [&config.socket_path, &config.version_path, &config.pid_path] {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
