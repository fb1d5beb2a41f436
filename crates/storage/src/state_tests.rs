// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serde_json::json;
use tempfile::tempdir;

#[test]
fn save_then_load_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes").join("default.json");

    save_atomic(&path, &json!({"count": 3, "items": ["a"]})).unwrap();

    let loaded = load(&path).unwrap().unwrap();
    assert_eq!(loaded, json!({"count": 3, "items": ["a"]}));
}

#[test]
fn load_missing_file_is_none() {
    let dir = tempdir().unwrap();
    assert!(load(&dir.path().join("absent.json")).unwrap().is_none());
}

#[test]
fn save_leaves_no_temp_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    save_atomic(&path, &json!({"x": 1})).unwrap();

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["default.json".to_string()]);
}

#[test]
fn corrupt_file_is_moved_aside() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    fs::write(&path, "{not json").unwrap();

    assert!(load(&path).unwrap().is_none());
    assert!(!path.exists());
    assert!(dir.path().join("default.json.bak").exists());
}

#[test]
fn overwrite_replaces_previous_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    save_atomic(&path, &json!({"v": 1})).unwrap();
    save_atomic(&path, &json!({"v": 2})).unwrap();
    assert_eq!(load(&path).unwrap().unwrap(), json!({"v": 2}));
}

#[test]
fn instance_state_path_shape() {
    let p = instance_state_path(Path::new("/home/u/.photon/state/notes"), "default");
    assert_eq!(
        p,
        PathBuf::from("/home/u/.photon/state/notes/default.json")
    );
}

#[tokio::test]
async fn writer_debounces_to_latest_value() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    let writer = StateWriter::spawn_with_debounce(path.clone(), Duration::from_millis(20));

    writer.update(json!({"v": 1}));
    writer.update(json!({"v": 2}));
    writer.update(json!({"v": 3}));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_eq!(load(&path).unwrap().unwrap(), json!({"v": 3}));
}

#[tokio::test]
async fn writer_flush_forces_pending_write() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    // Long debounce: only flush can get the value out in test time.
    let writer = StateWriter::spawn_with_debounce(path.clone(), Duration::from_secs(60));

    writer.update(json!({"v": "final"}));
    writer.flush().await;

    assert_eq!(load(&path).unwrap().unwrap(), json!({"v": "final"}));
}

#[tokio::test]
async fn writer_flush_without_pending_is_noop() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("default.json");
    let writer = StateWriter::spawn_with_debounce(path.clone(), Duration::from_millis(10));

    writer.flush().await;
    assert!(!path.exists());
}
