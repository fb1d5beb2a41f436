// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    invalid_request = { ErrorKind::InvalidRequest, "invalid-request" },
    unknown_method = { ErrorKind::UnknownMethod, "unknown-method" },
    lock_timeout = { ErrorKind::LockTimeout, "lock-timeout" },
    user_error = { ErrorKind::UserError, "user-error" },
    method_missing = { ErrorKind::MethodMissing, "method-missing" },
    client_gone = { ErrorKind::ClientGone, "client-gone" },
    timeout = { ErrorKind::Timeout, "timeout" },
    shutting_down = { ErrorKind::ShuttingDown, "shutting-down" },
    internal = { ErrorKind::Internal, "internal" },
)]
fn serializes_kebab_case(kind: ErrorKind, wire: &str) {
    assert_eq!(
        serde_json::to_string(&kind).unwrap(),
        format!("\"{}\"", wire)
    );
    assert_eq!(kind.to_string(), wire);
    let back: ErrorKind = serde_json::from_str(&format!("\"{}\"", wire)).unwrap();
    assert_eq!(back, kind);
}
