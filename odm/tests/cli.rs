use std::path::Path;
use std::process::{Command, Output};

use odm_core::QuickXorHash;
use tempfile::{TempDir, tempdir};

fn odm(cwd: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_odm"))
        .args(args)
        .current_dir(cwd)
        .env_remove("RUST_LOG")
        .env_remove("ODM_DOMAIN")
        .env_remove("ODM_GOOGLE_TOKEN")
        .env_remove("ODM_GRAPH_TOKEN")
        .output()
        .expect("failed to run odm")
}

/// root -> folderA -> file1, with file1 declared as the ten digits.
fn scenario() -> (TempDir, String) {
    let dir = tempdir().unwrap();
    let hash = QuickXorHash::digest(b"0123456789");
    let snapshot = serde_json::json!({
        "notebooks": [],
        "items": {
            "root": {"id": "root", "name": "root", "folder": {}},
            "a": {"id": "a", "name": "folderA", "folder": {},
                  "parentReference": {"id": "root", "driveId": "d1"}},
            "f1": {"id": "f1", "name": "file1", "size": 10,
                   "parentReference": {"id": "a", "driveId": "d1"},
                   "file": {"hashes": {"quickXorHash": hash}},
                   "permissions": [
                       {"roles": ["write"], "grantedTo": {"user": {"email": "user@old.com"}}},
                       {"roles": ["owner"], "grantedTo": {"user": {"email": "boss@old.com"}}},
                       {"roles": ["read"], "link": {"scope": "anonymous", "type": "view"}}
                   ]}
        }
    });
    let path = dir.path().join("snapshot.json");
    std::fs::write(&path, snapshot.to_string()).unwrap();
    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("folderA")).unwrap();
    std::fs::write(tree.join("folderA/file1"), b"0123456789").unwrap();
    (dir, path.to_string_lossy().into_owned())
}

#[test]
fn help_lists_actions() {
    let dir = tempdir().unwrap();
    let output = odm(dir.path(), &["--help"]);
    assert!(output.status.success());
    let help = String::from_utf8_lossy(&output.stdout);
    for action in ["download-estimate", "verify-upload", "clean-filetree", "list-filenames"] {
        assert!(help.contains(action), "missing {action} in:\n{help}");
    }
}

#[test]
fn list_filenames_prints_item_paths() {
    let (dir, snapshot) = scenario();
    let output = odm(dir.path(), &[&snapshot, "list-filenames"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "folderA/file1\n");
}

#[test]
fn verify_exit_code_tracks_local_tree() {
    let (dir, snapshot) = scenario();
    let tree = dir.path().join("tree");
    let tree_arg = tree.to_string_lossy().into_owned();

    let output = odm(dir.path(), &[&snapshot, "verify", "--filetree", &tree_arg]);
    assert_eq!(output.status.code(), Some(0));

    std::fs::write(tree.join("folderA/file1"), b"012345678").unwrap();
    let output = odm(dir.path(), &[&snapshot, "verify", "--filetree", &tree_arg]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn upload_requires_a_target() {
    let (dir, snapshot) = scenario();
    let output = odm(
        dir.path(),
        &[&snapshot, "upload", "--destination", "local", "--upload-root", "dest"],
    );
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no upload user or group"));
}

#[test]
fn convert_notebooks_is_unsupported() {
    let (dir, snapshot) = scenario();
    let output = odm(dir.path(), &[&snapshot, "convert-notebooks"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn clean_filetree_needs_an_explicit_tree() {
    let (dir, snapshot) = scenario();
    let stray = dir.path().join("tree/stray.txt");
    std::fs::write(&stray, b"x").unwrap();

    let output = odm(dir.path(), &[&snapshot, "clean-filetree"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--filetree"));

    let tree_arg = dir.path().join("tree").to_string_lossy().into_owned();
    let output = odm(dir.path(), &[&snapshot, "clean-filetree", "--filetree", &tree_arg]);
    assert_eq!(output.status.code(), Some(0));
    assert!(!stray.exists());
    assert!(dir.path().join("tree/folderA/file1").exists());
}

#[test]
fn missing_snapshot_is_fatal() {
    let dir = tempdir().unwrap();
    let output = odm(dir.path(), &["absent.json", "verify"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn local_upload_then_verify() {
    let (dir, snapshot) = scenario();
    let tree_arg = dir.path().join("tree").to_string_lossy().into_owned();
    let dest = dir.path().join("dest");
    let dest_arg = dest.to_string_lossy().into_owned();
    let common = [
        "--filetree",
        tree_arg.as_str(),
        "--destination",
        "local",
        "--upload-root",
        dest_arg.as_str(),
        "--upload-user",
        "alice",
        "--upload-path",
        "migrated/2024",
    ];

    let mut args = vec![snapshot.as_str(), "verify-upload"];
    args.extend(common);
    let output = odm(dir.path(), &args);
    assert_eq!(output.status.code(), Some(1), "destination does not exist yet");

    let mut args = vec![snapshot.as_str(), "upload", "--domain-map", "old.com:new.com"];
    args.extend(common);
    let output = odm(dir.path(), &args);
    assert_eq!(
        output.status.code(),
        Some(0),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let uploaded = dest.join("users/alice/migrated/2024/folderA/file1");
    assert_eq!(std::fs::read(&uploaded).unwrap(), b"0123456789");

    let shares = std::fs::read_to_string(dest.join(".odm-shares.jsonl")).unwrap();
    let shares: Vec<serde_json::Value> = shares
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(shares.len(), 1);
    assert_eq!(shares[0]["address"], "user@new.com");
    assert_eq!(shares[0]["roles"][0], "write");

    let mut args = vec![snapshot.as_str(), "verify-upload"];
    args.extend(common);
    let output = odm(dir.path(), &args);
    assert_eq!(output.status.code(), Some(0));
}
