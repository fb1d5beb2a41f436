// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment variable access for the daemon crate.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime directory holding sockets and PID files:
/// `PHOTON_RUNTIME_DIR` > `$XDG_RUNTIME_DIR/photon` > `/tmp/photon`
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PHOTON_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(xdg).join("photon");
    }
    PathBuf::from("/tmp/photon")
}

/// Home directory for the state/env stores: `PHOTON_HOME` > `HOME`
pub fn home_dir() -> Option<PathBuf> {
    if let Ok(dir) = std::env::var("PHOTON_HOME") {
        return Some(PathBuf::from(dir));
    }
    std::env::var("HOME").ok().map(PathBuf::from)
}

fn parse_ms(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
}

/// Idle-exit threshold; idle exit is disabled when unset.
pub fn idle_timeout() -> Option<Duration> {
    parse_ms("PHOTON_IDLE_TIMEOUT_MS")
}

/// Bounded wait for in-flight invocations during shutdown (default: 5s)
pub fn drain_deadline() -> Duration {
    parse_ms("PHOTON_DRAIN_MS").unwrap_or(Duration::from_secs(5))
}

/// Lock expiry sweeper interval (default: 500ms)
pub fn sweep_interval() -> Duration {
    parse_ms("PHOTON_SWEEP_MS").unwrap_or(Duration::from_millis(500))
}

/// Dispatcher worker count (default: CPU count)
pub fn dispatch_workers() -> usize {
    std::env::var("PHOTON_DISPATCH_WORKERS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        })
}

/// Whether connection close releases locks held by that connection's
/// session. Off by default: locks outlive connections.
pub fn release_locks_on_disconnect() -> bool {
    matches!(
        std::env::var("PHOTON_RELEASE_LOCKS_ON_DISCONNECT").as_deref(),
        Ok("1") | Ok("true")
    )
}
