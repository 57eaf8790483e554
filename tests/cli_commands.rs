//! Integration tests for the history and folder subcommands
//!
//! Each test points the binary at a scratch database and a config path that
//! does not exist, so defaults apply and no user data is touched.

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

mod common;

use llamachat::storage::SqliteStorage;

fn llamachat(db: &Path) -> Command {
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.env_remove("LLAMACHAT_DB")
        .arg("--config")
        .arg(db.with_file_name("missing-config.yaml"))
        .arg("--db")
        .arg(db);
    cmd
}

fn scratch() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("chat.db");
    (dir, db)
}

fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("command output is JSON")
}

#[test]
fn test_version_flag() {
    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("llamachat"));
}

#[test]
fn test_history_list_empty_json() {
    let (_dir, db) = scratch();
    let value = json_output(llamachat(&db).args(["history", "list", "--json"]));
    assert_eq!(value, Value::Array(Vec::new()));
}

#[test]
fn test_folder_new_and_list_json() {
    let (_dir, db) = scratch();
    llamachat(&db)
        .args(["folder", "new", "Work"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created folder Work"));
    llamachat(&db).args(["folder", "new"]).assert().success();

    let value = json_output(llamachat(&db).args(["folder", "list", "--json"]));
    let names: Vec<&str> = value
        .as_array()
        .unwrap()
        .iter()
        .map(|node| node["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["New Folder", "Work"]);
}

#[test]
fn test_folder_move_into_descendant_fails() {
    let (_dir, db) = scratch();
    let store = SqliteStorage::new_with_path(&db).unwrap();
    let parent = store.create_folder("Parent", None).unwrap();
    let child = store.create_folder("Child", Some(parent.id)).unwrap();
    let parent_id = parent.id.to_string();
    let child_id = child.id.to_string();

    llamachat(&db)
        .args(["folder", "move", parent_id.as_str(), "--parent", child_id.as_str()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cycle"));
}

#[test]
fn test_history_title_and_move_by_prefix() {
    let (_dir, db) = scratch();
    let store = SqliteStorage::new_with_path(&db).unwrap();
    let folder = store.create_folder("Travel", None).unwrap();
    let conversation = store.create_conversation(None).unwrap();
    store
        .append_message(conversation.id, "user", "Where should I go in May?", None)
        .unwrap();
    let id = conversation.id.to_string();
    let prefix = &id[..8];
    let folder_id = folder.id.to_string();

    llamachat(&db)
        .args(["history", "title", prefix, "Trip ideas"])
        .assert()
        .success();
    llamachat(&db)
        .args(["history", "move", prefix, "--folder", &folder_id[..8]])
        .assert()
        .success()
        .stdout(predicate::str::contains("Travel"));

    let value = json_output(llamachat(&db).args(["history", "list", "--json"]));
    let entry = &value[0];
    assert_eq!(entry["title"], "Trip ideas");
    assert_eq!(entry["folder_name"], "Travel");
    assert_eq!(entry["message_count"], 1);
}

#[test]
fn test_history_delete_unknown_conversation_fails() {
    let (_dir, db) = scratch();
    llamachat(&db)
        .args(["history", "delete", "deadbeef"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_folder_prompt_set_and_show() {
    let (_dir, db) = scratch();
    let store = SqliteStorage::new_with_path(&db).unwrap();
    let folder = store.create_folder("Poems", None).unwrap();
    let id = folder.id.to_string();

    llamachat(&db)
        .args(["folder", "prompt", id.as_str(), "Answer in verse."])
        .assert()
        .success();
    llamachat(&db)
        .args(["folder", "prompt", id.as_str()])
        .assert()
        .success()
        .stdout(predicate::str::contains("Answer in verse."));
}

#[test]
fn test_invalid_config_is_rejected() {
    let (_dir, db) = scratch();
    let (_config_dir, config_path) = common::temp_config_file(
        r#"
backend:
  type: cloud
"#,
    );

    let mut cmd = Command::cargo_bin("llamachat").unwrap();
    cmd.env_remove("LLAMACHAT_DB")
        .arg("--config")
        .arg(config_path)
        .arg("--db")
        .arg(&db)
        .args(["history", "list"]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid backend type"));
}
