// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::protocol::Response;
use crate::test_support::{harness, next_frame};
use photon_core::ErrorKind;
use serde_json::json;
use std::time::Duration;

fn call(
    conn: &Arc<crate::listener::Connection>,
    id: &str,
    method: &str,
    args: Map<String, Value>,
) -> CallRequest {
    CallRequest {
        conn: Arc::clone(conn),
        request_id: id.to_string(),
        method: method.to_string(),
        args,
        session: SessionId::new("test"),
        timeout: None,
    }
}

fn args(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn calls_in_same_domain_run_fifo() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "c1", "mark", args(&[("marker", json!("a"))])));
    h.ctx.runner.submit(call(&conn, "c2", "mark", args(&[("marker", json!("b"))])));

    let first = next_frame(&mut rx).await;
    let second = next_frame(&mut rx).await;
    assert_eq!(first.id(), "c1");
    assert_eq!(second.id(), "c2");

    // Single writer per domain: a's body fully precedes b's.
    let markers = h.markers.lock().clone();
    assert_eq!(markers, vec!["a:start", "a:end", "b:start", "b:end"]);
}

#[tokio::test]
async fn disjoint_domains_interleave() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    // "gated" blocks the instance domain until the gate opens; the
    // locked method runs in domain "r" and must complete meanwhile.
    h.ctx.runner.submit(call(&conn, "blocked", "gated", Map::new()));
    h.ctx.runner.submit(call(&conn, "free", "lockedMark", Map::new()));

    let first = next_frame(&mut rx).await;
    assert_eq!(first.id(), "free");

    h.gate.notify_one();
    let second = next_frame(&mut rx).await;
    assert_eq!(second.id(), "blocked");
}

#[tokio::test]
async fn same_named_domain_serializes() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    // Both methods share lock domain "r": the second waits for the gate
    // even though it does not touch the gate itself.
    h.ctx.runner.submit(call(&conn, "g", "gatedLocked", Map::new()));
    h.ctx.runner.submit(call(&conn, "m", "lockedMark", Map::new()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.markers.lock().is_empty(), "lockedMark must wait for gatedLocked");

    h.gate.notify_one();
    assert_eq!(next_frame(&mut rx).await.id(), "g");
    assert_eq!(next_frame(&mut rx).await.id(), "m");
}

#[tokio::test]
async fn named_lease_is_visible_in_list_locks_while_running() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "g", "gatedLocked", Map::new()));
    tokio::time::sleep(Duration::from_millis(30)).await;

    let listed = h.ctx.locks.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "r");
    assert_eq!(listed[0].holder, "test");

    h.gate.notify_one();
    next_frame(&mut rx).await;
    assert!(h.ctx.locks.list().is_empty(), "lease released after the call");
}

#[tokio::test]
async fn unknown_method_is_rejected_without_invoking() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "c1", "nope", Map::new()));

    match next_frame(&mut rx).await {
        Response::Error { id, kind, .. } => {
            assert_eq!(id, "c1");
            assert_eq!(kind, Some(ErrorKind::UnknownMethod));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn scheduler_session_gets_method_missing() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    let mut request = call(&conn, "c1", "vanished", Map::new());
    request.session = SessionId::scheduler();
    h.ctx.runner.submit(request);

    match next_frame(&mut rx).await {
        Response::Error { kind, .. } => assert_eq!(kind, Some(ErrorKind::MethodMissing)),
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn user_errors_are_reported_verbatim() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "c1", "fail", Map::new()));

    match next_frame(&mut rx).await {
        Response::Error { error, kind, .. } => {
            assert_eq!(error, "boom");
            assert_eq!(kind, Some(ErrorKind::UserError));
        }
        other => panic!("expected error, got {:?}", other),
    }
}

#[tokio::test]
async fn deadline_exceeded_returns_timeout() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    let mut request = call(&conn, "c1", "gated", Map::new());
    request.timeout = Some(Duration::from_millis(50));
    h.ctx.runner.submit(request);

    match next_frame(&mut rx).await {
        Response::Error { kind, .. } => assert_eq!(kind, Some(ErrorKind::Timeout)),
        other => panic!("expected timeout, got {:?}", other),
    }

    // The settle races the reply by a whisker; give it a tick.
    for _ in 0..50 {
        if h.ctx.runner.active_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(h.ctx.runner.active_count(), 0);
}

#[tokio::test]
async fn prompt_suspends_and_resumes() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "outer", "askColor", Map::new()));

    // The prompt frame arrives while the outer command stays outstanding.
    let prompt_id = match next_frame(&mut rx).await {
        Response::Prompt { id, prompt } => {
            assert_eq!(prompt, "color?");
            id
        }
        other => panic!("expected prompt, got {:?}", other),
    };
    assert_eq!(h.ctx.runner.active_count(), 1);

    assert!(h.ctx.runner.resume_prompt(&prompt_id, json!("blue")));

    match next_frame(&mut rx).await {
        Response::Result { id, data } => {
            assert_eq!(id, "outer");
            assert_eq!(data, json!({ "color": "blue" }));
        }
        other => panic!("expected result, got {:?}", other),
    }
}

#[tokio::test]
async fn resume_with_unknown_prompt_id_is_rejected() {
    let h = harness().await;
    assert!(!h.ctx.runner.resume_prompt("nope", json!(1)));
}

#[tokio::test]
async fn connection_close_cancels_pending_prompt() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "outer", "askColor", Map::new()));
    let _prompt = next_frame(&mut rx).await;

    h.ctx.runner.cancel_prompts_for_conn(conn.id);

    match next_frame(&mut rx).await {
        Response::Error { id, kind, .. } => {
            assert_eq!(id, "outer");
            assert_eq!(kind, Some(ErrorKind::ClientGone));
        }
        other => panic!("expected client-gone, got {:?}", other),
    }
}

#[tokio::test]
async fn drain_cancels_in_flight_calls() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "c1", "gated", Map::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.ctx.runner.active_count(), 1);

    h.ctx.runner.drain(Duration::from_millis(500)).await;
    assert_eq!(h.ctx.runner.active_count(), 0);

    match next_frame(&mut rx).await {
        Response::Error { kind, .. } => assert_eq!(kind, Some(ErrorKind::ShuttingDown)),
        other => panic!("expected shutting-down, got {:?}", other),
    }
}

#[tokio::test]
async fn in_flight_calls_finish_on_old_generation_across_reload() {
    let h = harness().await;
    let (conn, mut rx) = h.ctx.conns.register();

    h.ctx.runner.submit(call(&conn, "old", "gated", Map::new()));
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.host
        .reload(h.dir.path().join("notes.ts"))
        .await
        .expect("reload");

    h.gate.notify_one();
    match next_frame(&mut rx).await {
        Response::Result { id, data } => {
            assert_eq!(id, "old");
            // Constructed by generation 1, completed after the swap.
            assert_eq!(data["generation"], json!(1));
        }
        other => panic!("expected result, got {:?}", other),
    }
}

#[tokio::test]
async fn cancellation_flag_observable_by_user_code() {
    let cancel = Cancellation::default();
    assert!(!cancel.is_cancelled());
    cancel.cancel();
    assert!(cancel.is_cancelled());
    // Resolves immediately once cancelled.
    tokio::time::timeout(Duration::from_millis(100), cancel.cancelled())
        .await
        .expect("cancelled() should resolve");
}
