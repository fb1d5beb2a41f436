// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::listener::Listener;
use crate::loader::{LoadContext, LoadError, LoadedPhoton};
use crate::protocol::{self, Request};
use crate::test_support::TestLoader;
use async_trait::async_trait;
use photon_core::JobId;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::BufReader;
use tokio::net::UnixStream;

fn test_config(dir: &std::path::Path) -> Config {
    Config {
        photon_name: "notes".to_string(),
        photon_path: dir.join("notes.ts"),
        socket_path: dir.join("notes.sock"),
        pid_path: dir.join("notes.pid"),
        version_path: dir.join("notes.version"),
        log_path: dir.join("state").join("daemon.log"),
        state_dir: dir.join("state"),
        env_path: dir.join("env").join("notes.json"),
        idle_timeout: None,
        drain_deadline: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(100),
        dispatch_workers: 2,
        release_locks_on_disconnect: false,
    }
}

struct FailingLoader;

#[async_trait]
impl crate::loader::PhotonLoader for FailingLoader {
    async fn load(&self, _ctx: &LoadContext) -> Result<LoadedPhoton, LoadError> {
        Err(LoadError::Constructor("no such class".to_string()))
    }
}

#[tokio::test]
async fn startup_claims_pid_and_socket() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();

    assert!(config.pid_path.exists());
    assert!(config.version_path.exists());
    assert!(config.socket_path.exists());

    let pid: u32 = std::fs::read_to_string(&config.pid_path)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(pid, std::process::id());

    drop(listener);
    daemon.shutdown().await;
    assert!(!config.pid_path.exists());
    assert!(!config.socket_path.exists());
    assert!(!config.version_path.exists());
}

#[tokio::test]
async fn second_daemon_fails_with_lock_error() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();

    let second = startup(&config, Arc::new(TestLoader::new(false))).await;
    assert!(matches!(second, Err(LifecycleError::LockFailed(_))));

    // The loser must not have wiped the winner's files.
    assert!(config.pid_path.exists());
    assert!(config.socket_path.exists());

    drop(listener);
    daemon.shutdown().await;
}

#[tokio::test]
async fn failed_instance_construction_is_fatal_and_cleans_up() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let result = startup(&config, Arc::new(FailingLoader)).await;
    assert!(matches!(result, Err(LifecycleError::Load(_))));
    assert!(!config.pid_path.exists());
    assert!(!config.socket_path.exists());
}

#[tokio::test]
async fn stale_socket_is_replaced_on_startup() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    // A crashed daemon left its socket behind.
    std::fs::create_dir_all(dir.path()).unwrap();
    let stale = tokio::net::UnixListener::bind(&config.socket_path).unwrap();
    drop(stale);
    assert!(config.socket_path.exists());

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();
    drop(listener);
    daemon.shutdown().await;
}

#[tokio::test]
async fn annotated_methods_are_scheduled_at_startup() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();

    let jobs = daemon.ctx.scheduler.list();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, JobId::new("tick"));
    assert_eq!(jobs[0].method, "tick");

    drop(listener);
    daemon.shutdown().await;
}

#[tokio::test]
async fn end_to_end_ping_over_started_daemon() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();
    let accept = tokio::spawn(Listener::new(listener, Arc::clone(&daemon.ctx)).run());

    let stream = UnixStream::connect(&config.socket_path).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    protocol::write_frame(&mut write_half, &Request::Ping { id: "r1".into() })
        .await
        .unwrap();
    let line = tokio::time::timeout(Duration::from_secs(5), protocol::read_frame(&mut reader))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let response: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(response["type"], "pong");

    accept.abort();
    daemon.shutdown().await;
}

#[tokio::test]
async fn idle_monitor_requests_shutdown_when_nothing_is_live() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.idle_timeout = Some(Duration::from_millis(100));

    let StartupResult { mut daemon, listener } =
        startup(&config, Arc::new(TestLoader::new(false))).await.unwrap();

    // The auto-scheduled annotation counts as live work; remove it so the
    // daemon is truly idle.
    daemon.ctx.scheduler.unschedule(&JobId::new("tick"));

    tokio::time::timeout(Duration::from_secs(5), daemon.ctx.shutdown.notified())
        .await
        .expect("idle monitor should request shutdown");

    drop(listener);
    daemon.shutdown().await;
}

#[test]
fn activity_tracks_idleness() {
    let activity = Activity::new();
    assert!(activity.idle_for() < Duration::from_secs(1));
    std::thread::sleep(Duration::from_millis(20));
    assert!(activity.idle_for() >= Duration::from_millis(20));
    activity.touch();
    assert!(activity.idle_for() < Duration::from_millis(20));
}
