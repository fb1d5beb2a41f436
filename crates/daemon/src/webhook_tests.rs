// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use photon_core::MethodDescriptor;
use yare::parameterized;

fn method(name: &str, webhook: Option<WebhookSpec>) -> MethodDescriptor {
    let mut m = MethodDescriptor::new(name);
    m.webhook = webhook;
    m
}

#[test]
fn handle_prefix_auto_binds_kebab_path() {
    let router = WebhookRouter::build(&[method("handleGithubPush", None)]).unwrap();
    assert_eq!(router.route("github-push"), Some("handleGithubPush"));
    assert_eq!(router.route("/github-push/"), Some("handleGithubPush"));
    assert_eq!(router.route("other"), None);
}

#[test]
fn explicit_path_binds_exactly() {
    let router = WebhookRouter::build(&[method(
        "onPayment",
        Some(WebhookSpec::Path("stripe/payments".to_string())),
    )])
    .unwrap();
    assert_eq!(router.route("stripe/payments"), Some("onPayment"));
}

#[test]
fn bare_flag_binds_method_name() {
    let router = WebhookRouter::build(&[method("notify", Some(WebhookSpec::Flag(true)))]).unwrap();
    assert_eq!(router.route("notify"), Some("notify"));
}

#[test]
fn false_flag_and_plain_methods_do_not_bind() {
    let router = WebhookRouter::build(&[
        method("notify", Some(WebhookSpec::Flag(false))),
        method("addNote", None),
        method("handle", None), // bare "handle" has no remainder
    ])
    .unwrap();
    assert!(router.routes().is_empty());
}

#[test]
fn explicit_annotation_overrides_auto_binding() {
    let router = WebhookRouter::build(&[method(
        "handleGithubPush",
        Some(WebhookSpec::Path("gh".to_string())),
    )])
    .unwrap();
    assert_eq!(router.route("gh"), Some("handleGithubPush"));
    assert_eq!(router.route("github-push"), None);
}

#[test]
fn collision_fails_load() {
    let err = WebhookRouter::build(&[
        method("handleGithubPush", None),
        method("other", Some(WebhookSpec::Path("github-push".to_string()))),
    ])
    .unwrap_err();

    match err {
        WebhookError::Collision { path, first, second } => {
            assert_eq!(path, "github-push");
            assert_eq!(first, "handleGithubPush");
            assert_eq!(second, "other");
        }
    }
}

#[parameterized(
    single_word = { "Push", "push" },
    two_words = { "GithubPush", "github-push" },
    three_words = { "NewUserSignup", "new-user-signup" },
    already_lower = { "push", "push" },
)]
fn kebab_casing(input: &str, expected: &str) {
    assert_eq!(kebab_case(input), expected);
}

#[test]
fn routes_lists_sorted_pairs() {
    let router = WebhookRouter::build(&[
        method("handleZebra", None),
        method("handleAlpha", None),
    ])
    .unwrap();
    assert_eq!(
        router.routes(),
        vec![("alpha", "handleAlpha"), ("zebra", "handleZebra")]
    );
}
