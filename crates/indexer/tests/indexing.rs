//! End-to-end indexing scenarios driven through the controller

mod common;

use common::{collect_replies, Fixture};
use dao::{flags, groups, BackupRoot};
use indexer::{ControlRecord, Controller};
use std::fs;
use std::sync::atomic::Ordering;

fn root(tname: &str, path: &str, root_flags: u32) -> BackupRoot {
    BackupRoot {
        id: 0,
        tname: tname.to_string(),
        path: path.to_string(),
        group: groups::DEFAULT,
        flags: root_flags,
        symlinked: false,
        symlinked_confirmed: false,
        server_default: true,
        reset_keep: false,
    }
}

fn start_backup(full: bool) -> ControlRecord {
    ControlRecord::StartFileBackup {
        full,
        start_token: "srv1".to_string(),
        group: groups::DEFAULT,
        flags: 0,
        clientsubname: String::new(),
        sha_version: 528,
        running_jobs: 1,
        async_index: false,
        async_ticket: String::new(),
    }
}

async fn run_backup(handle: &indexer::ControllerHandle, full: bool) -> Vec<String> {
    collect_replies(handle.send(start_backup(full)).await).await
}

#[tokio::test]
async fn test_fresh_full_list_structure() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("x"), vec![1u8; 10]).unwrap();
    fs::write(docs.join("y"), vec![2u8; 20]).unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    let replies = run_backup(&handle, true).await;
    assert_eq!(replies, vec!["done".to_string()]);

    let list = fixture.filelist();
    let lines: Vec<&str> = list.lines().collect();
    assert_eq!(lines[0], "d\"docs\"");
    assert!(lines[1].starts_with("f\"x\" 10 "), "line: {}", lines[1]);
    assert!(lines[2].starts_with("f\"y\" 20 "), "line: {}", lines[2]);
    assert_eq!(lines[3], "u");
    assert_eq!(lines.len(), 4);

    // Client-side hashing puts a tree hash on every file entry.
    assert!(lines[1].contains("#thash="));
}

#[tokio::test]
async fn test_incremental_runs_are_byte_identical() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(docs.join("sub")).unwrap();
    fs::write(docs.join("a"), b"alpha").unwrap();
    fs::write(docs.join("sub").join("b"), b"beta").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);

    assert_eq!(run_backup(&handle, false).await, vec!["done".to_string()]);
    let first = fixture.filelist();

    assert_eq!(run_backup(&handle, false).await, vec!["done".to_string()]);
    let second = fixture.filelist();

    assert!(!first.is_empty());
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_incremental_picks_up_modification_and_bumps_generation() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("x"), vec![1u8; 10]).unwrap();
    fs::write(docs.join("y"), vec![2u8; 20]).unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);

    let row_key = format!("{}/", docs.to_str().unwrap());
    let (generation_before, _) = ctx.dao.get_files(&row_key, 1).unwrap().unwrap();

    fs::write(docs.join("y"), vec![3u8; 25]).unwrap();

    assert_eq!(run_backup(&handle, false).await, vec!["done".to_string()]);

    let list = fixture.filelist();
    assert!(
        list.lines().any(|l| l.starts_with("f\"y\" 25 ")),
        "list: {}",
        list
    );

    let (generation_after, files) = ctx.dao.get_files(&row_key, 1).unwrap().unwrap();
    assert!(generation_after > generation_before);
    let y = files.iter().find(|f| f.name == "y").unwrap();
    assert_eq!(y.size, 25);
    assert!(!y.hash.is_empty());
}

#[tokio::test]
async fn test_unchanged_files_keep_cached_hashes() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("x"), b"stable content").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);

    let row_key = format!("{}/", docs.to_str().unwrap());
    let (generation, files) = ctx.dao.get_files(&row_key, 1).unwrap().unwrap();
    let hash = files[0].hash.clone();
    assert!(!hash.is_empty());

    // Nothing changed: the next run serves the hash from the cache and the
    // row generation stays put.
    assert_eq!(run_backup(&handle, false).await, vec!["done".to_string()]);
    let (generation_after, files) = ctx.dao.get_files(&row_key, 1).unwrap().unwrap();
    assert_eq!(generation, generation_after);
    assert_eq!(files[0].hash, hash);
}

#[tokio::test]
async fn test_missing_optional_root_succeeds_with_empty_list() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let gone = fixture.fs_root.join("not-there");
    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("gone", gone.to_str().unwrap(), flags::OPTIONAL))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);
    assert_eq!(fixture.filelist(), "");
}

#[tokio::test]
async fn test_missing_required_root_fails() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let gone = fixture.fs_root.join("not-there");
    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("gone", gone.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(
        run_backup(&handle, true).await,
        vec!["error - index error".to_string()]
    );
}

#[tokio::test]
async fn test_snapshot_required_root_fails_without_provider() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("x"), b"x").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root(
            "docs",
            docs.to_str().unwrap(),
            flags::REQUIRE_SNAPSHOT,
        ))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(
        run_backup(&handle, true).await,
        vec!["error - index error".to_string()]
    );
}

#[tokio::test]
async fn test_keep_files_carries_deleted_entries_forward() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("a"), b"aaa").unwrap();
    fs::write(docs.join("b"), b"bbb").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), flags::KEEP_FILES))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);
    let first = fixture.filelist();
    assert!(first.lines().any(|l| l.starts_with("f\"b\" 3 ")));

    fs::remove_file(docs.join("b")).unwrap();

    assert_eq!(run_backup(&handle, false).await, vec!["done".to_string()]);
    let second = fixture.filelist();

    // b is gone from the filesystem but kept in the list, in order.
    let names: Vec<&str> = second
        .lines()
        .filter(|l| l.starts_with("f\""))
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names[0].starts_with("f\"a\""));
    assert!(names[1].starts_with("f\"b\" 3 "));
}

#[tokio::test]
async fn test_no_backup_dirs_reply() {
    let fixture = Fixture::new();
    let ctx = fixture.context();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(
        run_backup(&handle, false).await,
        vec!["no backup dirs".to_string()]
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_failing_prebackup_hook_aborts() {
    use std::os::unix::fs::PermissionsExt;

    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();

    let hooks = fixture.data_dir.join("hooks");
    fs::create_dir_all(&hooks).unwrap();
    let hook = hooks.join("prefilebackup");
    fs::write(&hook, "#!/bin/sh\nexit 3\n").unwrap();
    fs::set_permissions(&hook, fs::Permissions::from_mode(0o755)).unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(
        run_backup(&handle, true).await,
        vec!["error - prefilebackup script failed with error code 3".to_string()]
    );
}

#[tokio::test]
async fn test_unfinished_full_promotes_to_virtual_full() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(docs.join("x"), b"x").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    // Simulate a crash mid-full: the previous run recorded a full that
    // never finished, plus a cache row that a true full would clear.
    ctx.dao.misc_set("last_index", "full").unwrap();
    ctx.dao.misc_set("last_index_finished", "0").unwrap();
    ctx.dao
        .add_files("/marker/", 1, &[snapdex_core::FileAndHash::default()])
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    // Requested full runs as virtual-full incremental: cache untouched.
    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);
    assert!(ctx.dao.get_files("/marker/", 1).unwrap().is_some());

    // Now that the virtual full finished, the next full really resets.
    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);
    assert!(ctx.dao.get_files("/marker/", 1).unwrap().is_none());
}

#[tokio::test]
async fn test_get_log_returns_warnings() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    let gone = fixture.fs_root.join("not-there");
    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("gone", gone.to_str().unwrap(), flags::OPTIONAL))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    run_backup(&handle, true).await;

    let replies = collect_replies(handle.send(ControlRecord::GetLog).await).await;
    assert_eq!(replies.len(), 1);
    assert!(replies[0].contains("Not backing it up"), "log: {}", replies[0]);
}

#[tokio::test]
async fn test_excludes_prune_files_and_dirs() {
    let fixture = Fixture::new();
    fixture.snapshots.fail.store(true, Ordering::SeqCst);

    fs::write(
        fixture.data_dir.join("settings.toml"),
        "exclude_files = \"*.tmp;cache\"\n",
    )
    .unwrap();

    let docs = fixture.fs_root.join("docs");
    fs::create_dir_all(docs.join("cache")).unwrap();
    fs::write(docs.join("keep.txt"), b"keep").unwrap();
    fs::write(docs.join("drop.tmp"), b"drop").unwrap();
    fs::write(docs.join("cache").join("c"), b"c").unwrap();

    let ctx = fixture.context();
    ctx.dao
        .add_backup_dir(root("docs", docs.to_str().unwrap(), 0))
        .unwrap();

    let (handle, controller) = Controller::new(ctx.clone());
    tokio::spawn(controller.run());

    assert_eq!(run_backup(&handle, true).await, vec!["done".to_string()]);

    let list = fixture.filelist();
    assert!(list.contains("f\"keep.txt\""));
    assert!(!list.contains("drop.tmp"));
    assert!(!list.contains("d\"cache\""));
}
