//! End-to-end protocol scenarios against in-memory stores.

mod common;

use common::{token, Channel, DeleteGate, Harness, HarnessOptions, DIRECT_OWNER, DISPLAY_ID};
use core_sync::messages::OutboundMessage;
use core_sync::{FileEntry, FileStatus, InboundMessage, SyncError, WatchlistEntry};
use serde_json::json;

#[tokio::test]
async fn test_sweep_removes_only_expired_watched_entries() {
    let h = Harness::new().await;
    let stores = h.service.stores();

    stores
        .metadata
        .upsert(&FileEntry::new("bucket/a.txt", FileStatus::Stale, "v1"))
        .await
        .unwrap();
    for path in ["bucket/b.txt", "bucket/c.txt"] {
        stores
            .metadata
            .upsert(&FileEntry::new(path, FileStatus::Current, "v1"))
            .await
            .unwrap();
        stores.metadata.set_watch_sequence(path, 1).await.unwrap();
    }

    for _ in 0..5 {
        h.service.sweeper().advance_epoch().await.unwrap();
    }
    let report = h.service.sweeper().sweep().await.unwrap();

    let mut expired = report.expired.clone();
    expired.sort();
    assert_eq!(expired, vec!["bucket/b.txt", "bucket/c.txt"]);
    assert_eq!(report.failed, 0);
    assert!(stores.metadata.get("bucket/a.txt").await.unwrap().is_some());
    assert!(stores.metadata.get("bucket/b.txt").await.unwrap().is_none());
}

#[tokio::test]
async fn test_entry_survives_until_threshold() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    stores
        .metadata
        .upsert(&FileEntry::new("bucket/a.txt", FileStatus::Current, "1"))
        .await
        .unwrap();
    stores.metadata.set_watch_sequence("bucket/a.txt", 1).await.unwrap();

    for _ in 0..4 {
        h.service.sweeper().advance_epoch().await.unwrap();
    }
    assert!(h.service.sweeper().sweep().await.unwrap().expired.is_empty());

    h.service.sweeper().advance_epoch().await.unwrap();
    assert_eq!(
        h.service.sweeper().sweep().await.unwrap().expired,
        vec!["bucket/a.txt"]
    );
}

#[tokio::test]
async fn test_expired_folder_takes_children() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    stores.owners.add_owner("bucket/dir/", "widget").await.unwrap();
    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/dir/",
        "version": "1",
        "folderData": [{"filePath": "bucket/dir/a", "version": "1"}]
    }))
    .await;
    stores.metadata.set_watch_sequence("bucket/dir/", 1).await.unwrap();

    for _ in 0..5 {
        h.service.sweeper().advance_epoch().await.unwrap();
    }
    let report = h.service.sweeper().sweep().await.unwrap();

    assert_eq!(report.expired, vec!["bucket/dir/a", "bucket/dir/"]);
    assert!(stores.owners.get("bucket/dir/a").await.unwrap().is_none());
    assert!(stores.watchlist.get("bucket/dir/a").await.unwrap().is_none());
}

async fn watched_at_first_epoch(h: &Harness, paths: &[&str]) {
    let stores = h.service.stores();
    for path in paths {
        stores
            .metadata
            .upsert(&FileEntry::new(*path, FileStatus::Current, "1"))
            .await
            .unwrap();
        stores.metadata.set_watch_sequence(path, 1).await.unwrap();
    }
}

#[tokio::test]
async fn test_sweep_continues_past_failed_path() {
    let h = Harness::with_options(HarnessOptions {
        failing_delete: Some("bucket/b.txt"),
        ..HarnessOptions::default()
    })
    .await;
    watched_at_first_epoch(&h, &["bucket/a.txt", "bucket/b.txt", "bucket/c.txt"]).await;

    for _ in 0..5 {
        h.service.sweeper().advance_epoch().await.unwrap();
    }
    let report = h.service.sweeper().sweep().await.unwrap();

    assert_eq!(report.expired, vec!["bucket/a.txt", "bucket/c.txt"]);
    assert_eq!(report.failed, 1);
    assert!(!report.skipped);

    let stores = h.service.stores();
    assert!(stores.metadata.get("bucket/a.txt").await.unwrap().is_none());
    assert!(stores.metadata.get("bucket/c.txt").await.unwrap().is_none());
    // Kept for the next sweep.
    assert!(stores.metadata.get("bucket/b.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn test_overlapping_sweep_is_skipped() {
    let gate = DeleteGate::default();
    let h = Harness::with_options(HarnessOptions {
        delete_gate: Some(gate.clone()),
        ..HarnessOptions::default()
    })
    .await;
    watched_at_first_epoch(&h, &["bucket/a.txt"]).await;
    for _ in 0..5 {
        h.service.sweeper().advance_epoch().await.unwrap();
    }

    let sweeper = h.service.sweeper().clone();
    let first = tokio::spawn(async move { sweeper.sweep().await });
    gate.entered.notified().await;

    let overlapping = h.service.sweeper().sweep().await.unwrap();
    assert!(overlapping.skipped);
    assert!(overlapping.expired.is_empty());

    gate.release.notify_one();
    let first = first.await.unwrap().unwrap();
    assert!(!first.skipped);
    assert_eq!(first.expired, vec!["bucket/a.txt"]);

    let after = h.service.sweeper().sweep().await.unwrap();
    assert!(!after.skipped);
    assert!(after.expired.is_empty());
}

#[tokio::test]
async fn test_folder_watch_result_inherits_owners() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    stores.owners.add_owner("bucket/dir/", "licensing").await.unwrap();

    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/dir/",
        "folderData": [
            {"filePath": "bucket/dir/one.png", "version": "1"},
            {"filePath": "bucket/dir/two.png", "version": "1"}
        ],
        "watchlistLastChanged": "123456"
    }))
    .await;

    for path in ["bucket/dir/one.png", "bucket/dir/two.png"] {
        let entry = stores.metadata.get(path).await.unwrap().unwrap();
        assert_eq!(entry.status, FileStatus::Stale);
        assert_eq!(entry.version, "1");
        assert!(stores.owners.get(path).await.unwrap().unwrap().contains("licensing"));
    }
    assert_eq!(
        stores.watchlist.state().await.unwrap().last_changed.as_deref(),
        Some("123456")
    );

    let updates = h.transport.file_updates();
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|u| u.status == FileStatus::Stale));
}

#[tokio::test]
async fn test_update_marks_stale_and_broadcasts() {
    let h = Harness::new().await;
    let stores = h.service.stores();

    h.update("test-bucket/test-file1", "2.1.0").await;

    let entry = stores
        .metadata
        .get("test-bucket/test-file1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, FileStatus::Stale);
    assert_eq!(entry.version, "2.1.0");
    assert_eq!(
        stores.watchlist.get("test-bucket/test-file1").await.unwrap(),
        Some(WatchlistEntry::new("test-bucket/test-file1", "2.1.0"))
    );

    let updates = h.transport.file_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].file_path, "test-bucket/test-file1");
    assert_eq!(updates[0].status, FileStatus::Stale);
    assert_eq!(updates[0].version.as_deref(), Some("2.1.0"));
}

#[tokio::test]
async fn test_update_with_invalid_token_changes_nothing() {
    let h = Harness::new().await;
    let mut bad = token("bucket/a");
    bad.hash.clear();

    let message = InboundMessage::from_json(
        &json!({
            "topic": "MSFILEUPDATE",
            "type": "update",
            "filePath": "bucket/a",
            "version": "1",
            "token": bad
        })
        .to_string(),
    )
    .unwrap();
    let err = h.service.handle(message).await.unwrap_err();

    assert!(matches!(err, SyncError::Validation(_)));
    assert!(h.service.stores().metadata.get("bucket/a").await.unwrap().is_none());
    assert!(h.transport.sent().is_empty());
}

#[tokio::test]
async fn test_download_completion_detects_race() {
    let h = Harness::new().await;
    h.service
        .stores()
        .metadata
        .upsert(&FileEntry::new("bucket/fake-file-path", FileStatus::Stale, "1.0.0"))
        .await
        .unwrap();

    let status = h
        .service
        .state_machine()
        .complete_download("bucket/fake-file-path", "0.0.0")
        .await
        .unwrap();

    assert_eq!(status, Some(FileStatus::Stale));
}

#[tokio::test]
async fn test_delete_removes_every_record() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    h.send(json!({"topic": "WATCH", "filePath": "test-bucket/test-file1", "from": "widget"}))
        .await;
    h.update("test-bucket/test-file1", "1").await;
    h.transport.clear();

    h.send(json!({"topic": "MSFILEUPDATE", "type": "delete", "filePath": "test-bucket/test-file1"}))
        .await;

    assert!(stores.metadata.get("test-bucket/test-file1").await.unwrap().is_none());
    assert!(stores.owners.get("test-bucket/test-file1").await.unwrap().is_none());
    assert!(stores.watchlist.get("test-bucket/test-file1").await.unwrap().is_none());

    let updates = h.transport.file_updates();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].status, FileStatus::Deleted);
}

#[tokio::test]
async fn test_delete_twice_is_noop() {
    let h = Harness::new().await;
    h.update("bucket/a", "1").await;

    let delete = json!({"topic": "MSFILEUPDATE", "type": "delete", "filePath": "bucket/a"});
    h.send(delete.clone()).await;
    h.transport.clear();
    h.send(delete).await;

    assert!(h.transport.sent().is_empty());
    assert!(h.service.stores().metadata.get("bucket/a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_folder_delete_cascades() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    stores.owners.add_owner("bucket/dir/", "widget").await.unwrap();
    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/dir/",
        "folderData": [
            {"filePath": "bucket/dir/a", "version": "1"},
            {"filePath": "bucket/dir/sub/b", "version": "1"}
        ]
    }))
    .await;
    h.update("bucket/dir0", "1").await;
    h.transport.clear();

    h.send(json!({"topic": "MSFILEUPDATE", "type": "delete", "filePath": "bucket/dir/"}))
        .await;

    assert!(stores.metadata.find_by_prefix("bucket/dir/").await.unwrap().is_empty());
    assert!(stores.metadata.get("bucket/dir0").await.unwrap().is_some());

    // Owners were gone by the time of the broadcast; the snapshot still routes.
    let deleted: Vec<String> = h
        .transport
        .file_updates()
        .into_iter()
        .filter(|u| u.status == FileStatus::Deleted)
        .map(|u| u.file_path)
        .collect();
    assert_eq!(deleted, vec!["bucket/dir/", "bucket/dir/a", "bucket/dir/sub/b"]);
}

#[tokio::test]
async fn test_last_changed_ratchet() {
    let h = Harness::new().await;
    let stores = h.service.stores();

    for (path, marker) in [("bucket/a", "1000"), ("bucket/b", "100")] {
        h.send(json!({
            "topic": "MSFILEUPDATE",
            "type": "update",
            "filePath": path,
            "version": "1",
            "token": token(path),
            "watchlistLastChanged": marker
        }))
        .await;
    }

    assert_eq!(
        stores.watchlist.state().await.unwrap().last_changed.as_deref(),
        Some("1000")
    );
}

#[tokio::test]
async fn test_repeated_updates_keep_one_record() {
    let h = Harness::new().await;
    for version in ["1", "2", "3"] {
        h.update("bucket/a", version).await;
    }

    let stores = h.service.stores();
    assert_eq!(stores.metadata.find_by_prefix("bucket/").await.unwrap().len(), 1);
    assert_eq!(stores.watchlist.all().await.unwrap().len(), 1);
    assert_eq!(stores.metadata.get("bucket/a").await.unwrap().unwrap().version, "3");
}

#[tokio::test]
async fn test_first_watch_forwards_to_origin() {
    let h = Harness::new().await;
    h.send(json!({"topic": "WATCH", "filePath": "bucket/new.png", "from": "widget"}))
        .await;

    let entry = h
        .service
        .stores()
        .metadata
        .get("bucket/new.png")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.status, FileStatus::Unknown);
    assert_eq!(entry.watch_sequence, 1);

    let origin = h.transport.on(Channel::Origin);
    assert_eq!(origin.len(), 1);
    match &origin[0] {
        OutboundMessage::RemoteWatch(watch) => {
            assert_eq!(watch.file_path, "bucket/new.png");
            assert_eq!(watch.display_id, DISPLAY_ID);
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_known_watch_answers_locally() {
    let h = Harness::new().await;
    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/logo.png",
        "version": "4"
    }))
    .await;
    h.transport.clear();

    h.send(json!({"topic": "WATCH", "filePath": "bucket/logo.png", "from": DIRECT_OWNER}))
        .await;

    assert!(h.transport.on(Channel::Origin).is_empty());
    let direct = h.transport.on(Channel::Direct);
    assert_eq!(direct.len(), 1);
    assert!(h.transport.on(Channel::General).is_empty());
    match &direct[0] {
        OutboundMessage::FileUpdate(update) => {
            assert_eq!(update.status, FileStatus::Current);
            assert_eq!(update.version.as_deref(), Some("4"));
            assert!(update.ospath.is_some());
        }
        other => panic!("unexpected message {:?}", other),
    }
}

#[tokio::test]
async fn test_rewatch_of_known_folder_answers_children() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    stores.owners.add_owner("bucket/dir/", "widget").await.unwrap();
    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/dir/",
        "version": "9",
        "folderData": [
            {"filePath": "bucket/dir/one.png", "version": "1"},
            {"filePath": "bucket/dir/two.png", "version": "2"}
        ]
    }))
    .await;
    stores
        .metadata
        .upsert_status("bucket/dir/pending.png", FileStatus::Unknown)
        .await
        .unwrap();
    h.transport.clear();

    h.send(json!({"topic": "WATCH", "filePath": "bucket/dir/", "from": "screen"}))
        .await;

    let mut answered: Vec<(String, FileStatus)> = h
        .transport
        .file_updates()
        .into_iter()
        .map(|u| (u.file_path, u.status))
        .collect();
    answered.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        answered,
        vec![
            ("bucket/dir/one.png".to_string(), FileStatus::Stale),
            ("bucket/dir/pending.png".to_string(), FileStatus::Unknown),
            ("bucket/dir/two.png".to_string(), FileStatus::Stale),
        ]
    );

    let origin = h.transport.on(Channel::Origin);
    assert_eq!(origin.len(), 1);
    match &origin[0] {
        OutboundMessage::RemoteWatch(watch) => assert_eq!(watch.file_path, "bucket/dir/pending.png"),
        other => panic!("unexpected message {:?}", other),
    }

    let owners = stores.owners.get("bucket/dir/one.png").await.unwrap().unwrap();
    assert!(owners.contains("widget"));
    assert!(owners.contains("screen"));
    assert_eq!(
        stores.metadata.get("bucket/dir/").await.unwrap().unwrap().watch_sequence,
        1
    );
}

#[tokio::test]
async fn test_watch_result_error_code() {
    let h = Harness::new().await;
    h.send(json!({"topic": "WATCH", "filePath": "bucket/missing", "from": "widget"}))
        .await;
    h.send(json!({
        "topic": "WATCH-RESULT",
        "filePath": "bucket/missing",
        "errorMsg": "NOEXIST",
        "watchlistLastChanged": "99"
    }))
    .await;

    let stores = h.service.stores();
    let entry = stores.metadata.get("bucket/missing").await.unwrap().unwrap();
    assert_eq!(entry.status, FileStatus::NoExist);
    assert_eq!(entry.version, "0");
    assert!(stores.watchlist.get("bucket/missing").await.unwrap().is_none());
    assert_eq!(h.transport.file_updates().last().unwrap().status, FileStatus::NoExist);
}

#[tokio::test]
async fn test_add_requires_watched_parent() {
    let h = Harness::new().await;
    let stores = h.service.stores();
    let add = |path: &str| {
        json!({
            "topic": "MSFILEUPDATE",
            "type": "add",
            "filePath": path,
            "version": "1",
            "token": token(path)
        })
    };

    h.send(add("bucket/unwatched/a.png")).await;
    assert!(stores.metadata.get("bucket/unwatched/a.png").await.unwrap().is_none());

    stores.owners.add_owner("bucket/dir/", "widget").await.unwrap();
    h.send(add("bucket/dir/a.png")).await;
    assert_eq!(
        stores.metadata.get("bucket/dir/a.png").await.unwrap().unwrap().status,
        FileStatus::Stale
    );
    assert!(stores.owners.get("bucket/dir/a.png").await.unwrap().unwrap().contains("widget"));
}

#[tokio::test]
async fn test_start_sends_compare_once() {
    let h = Harness::new().await;
    h.update("bucket/a", "1").await;
    h.update("bucket/b", "2").await;
    h.transport.clear();

    h.service.start().await.unwrap();
    h.service.start().await.unwrap();
    h.service.shutdown().await;

    let compares: Vec<OutboundMessage> = h
        .transport
        .on(Channel::Origin)
        .into_iter()
        .filter(|m| matches!(m, OutboundMessage::WatchlistCompare(_)))
        .collect();
    assert_eq!(compares.len(), 1);
    match &compares[0] {
        OutboundMessage::WatchlistCompare(payload) => assert_eq!(payload.watchlist.len(), 2),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_dispatch_survives_bad_messages() {
    let h = Harness::new().await;

    assert!(h.service.dispatch("{not json").is_none());

    let task = h
        .service
        .dispatch(r#"{"topic":"MSFILEUPDATE","type":"update","filePath":"/abs"}"#)
        .unwrap();
    task.await.unwrap();

    let task = h
        .service
        .dispatch(r#"{"topic":"WATCH","filePath":"bucket/a","from":"widget"}"#)
        .unwrap();
    task.await.unwrap();
    assert!(h.service.stores().metadata.get("bucket/a").await.unwrap().is_some());
}
