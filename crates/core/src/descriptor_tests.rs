// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn method(name: &str) -> MethodDescriptor {
    MethodDescriptor::new(name)
}

#[test]
fn extractor_json_deserializes() {
    let json = r#"{
        "name": "github-bot",
        "sourcePath": "/photons/github-bot.ts",
        "stateful": true,
        "methods": [
            {
                "name": "handlePush",
                "params": [{"name": "commits", "type": "array", "required": true}],
                "webhook": true
            },
            {
                "name": "nightly",
                "params": [],
                "scheduled": "0 3 * * *",
                "locked": "repo"
            }
        ]
    }"#;

    let desc: PhotonDescriptor = serde_json::from_str(json).unwrap();
    desc.validate().unwrap();

    assert_eq!(desc.name, "github-bot");
    assert!(desc.stateful);
    assert_eq!(desc.methods.len(), 2);

    let nightly = desc.method("nightly").unwrap();
    assert_eq!(nightly.lock_name(), Some("repo"));
    assert_eq!(
        nightly.scheduled.as_ref().map(|c| c.source()),
        Some("0 3 * * *")
    );

    let push = desc.method("handlePush").unwrap();
    assert_eq!(push.webhook, Some(WebhookSpec::Flag(true)));
    assert!(push.params[0].is_required());
}

#[test]
fn bare_locked_flag_uses_method_name() {
    let mut m = method("transfer");
    m.locked = Some(LockSpec::Flag(true));
    assert_eq!(m.lock_name(), Some("transfer"));

    m.locked = Some(LockSpec::Flag(false));
    assert_eq!(m.lock_name(), None);

    m.locked = None;
    assert_eq!(m.lock_name(), None);
}

#[test]
fn invalid_cron_in_extractor_json_is_rejected() {
    let json = r#"{"name": "m", "params": [], "scheduled": "not a cron"}"#;
    let result: Result<MethodDescriptor, _> = serde_json::from_str(json);
    assert!(result.is_err());
}

#[parameterized(
    simple = { "notes", true },
    kebab = { "github-bot", true },
    digits = { "photon2", true },
    uppercase = { "Notes", false },
    underscore = { "my_photon", false },
    leading_dash = { "-notes", false },
    trailing_dash = { "notes-", false },
    empty = { "", false },
)]
fn name_validation(name: &str, ok: bool) {
    let desc = PhotonDescriptor::new(name, "/p.ts");
    assert_eq!(desc.validate().is_ok(), ok);
}

#[test]
fn duplicate_methods_rejected() {
    let mut desc = PhotonDescriptor::new("notes", "/p.ts");
    desc.methods = vec![method("add"), method("add")];
    assert!(matches!(
        desc.validate(),
        Err(DescriptorError::DuplicateMethod(name)) if name == "add"
    ));
}

#[test]
fn scheduled_method_with_required_param_rejected() {
    let mut m = method("tick");
    m.scheduled = Some(CronExpr::parse("* * * * *").unwrap());
    m.params = vec![ParamDescriptor {
        name: "target".to_string(),
        ty: ParamType::String,
        required: true,
        default: None,
    }];

    let mut desc = PhotonDescriptor::new("notes", "/p.ts");
    desc.methods = vec![m];
    assert!(matches!(
        desc.validate(),
        Err(DescriptorError::ScheduledTakesArgs { method }) if method == "tick"
    ));
}

#[test]
fn scheduled_method_with_defaulted_param_is_fine() {
    let mut m = method("tick");
    m.scheduled = Some(CronExpr::parse("* * * * *").unwrap());
    m.params = vec![ParamDescriptor {
        name: "limit".to_string(),
        ty: ParamType::Number,
        required: true,
        default: Some(serde_json::json!(10)),
    }];

    let mut desc = PhotonDescriptor::new("notes", "/p.ts");
    desc.methods = vec![m];
    desc.validate().unwrap();
}

#[test]
fn param_type_primitiveness() {
    assert!(ParamType::String.is_primitive());
    assert!(ParamType::Number.is_primitive());
    assert!(ParamType::Boolean.is_primitive());
    assert!(!ParamType::Object.is_primitive());
    assert!(!ParamType::Array.is_primitive());
}
