// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-visible error taxonomy.
//!
//! Every non-fatal failure the daemon reports carries one of these kinds
//! so clients can react programmatically without parsing messages.

use serde::{Deserialize, Serialize};

/// Kind tag attached to `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Protocol validation failed; connection stays open.
    InvalidRequest,
    /// Method not present in the current generation; call not attempted.
    UnknownMethod,
    /// Implicit or named lock could not be acquired before the deadline.
    LockTimeout,
    /// User code threw or returned an error; reported verbatim.
    UserError,
    /// Post-reload invocation of a method that no longer exists.
    MethodMissing,
    /// The connection awaiting a prompt closed; invocation cancelled.
    ClientGone,
    /// Call deadline exceeded; cancellation delivered to user code.
    Timeout,
    /// Daemon is terminating; frame sent before close.
    ShuttingDown,
    /// Crash inside a dispatcher/runner worker; worker restarted.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::UnknownMethod => "unknown-method",
            ErrorKind::LockTimeout => "lock-timeout",
            ErrorKind::UserError => "user-error",
            ErrorKind::MethodMissing => "method-missing",
            ErrorKind::ClientGone => "client-gone",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ShuttingDown => "shutting-down",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
