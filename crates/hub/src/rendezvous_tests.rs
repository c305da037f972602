// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use brum_core::InstanceId;

fn record(id: &str, port: u16) -> InstanceRecord {
    InstanceRecord::new(InstanceId::new(id), id, Path::new("/tmp/project"), port)
}

fn fast_config() -> RendezvousConfig {
    RendezvousConfig {
        ping_interval: Duration::from_millis(50),
        rescan_interval: Duration::from_millis(50),
        stale_threshold: Duration::from_secs(300),
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::Receiver<RendezvousEvent>) -> RendezvousEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("watcher event within deadline")
        .expect("watcher channel open")
}

#[test]
fn record_wire_format() {
    let record = record("inst-a", 4444);
    let json = serde_json::to_value(&record).unwrap();
    assert_eq!(json["id"], "inst-a");
    assert_eq!(json["port"], 4444);
    assert!(json["startedAt"].is_string());
    assert!(json["lastPing"].is_string());
    assert_eq!(json["processInfo"]["pid"], std::process::id());
    let parsed: InstanceRecord = serde_json::from_value(json).unwrap();
    assert_eq!(parsed, record);
}

#[tokio::test]
async fn registration_writes_and_deregistration_removes() {
    let dir = tempfile::tempdir().unwrap();
    let registration =
        InstanceRegistration::register(dir.path(), record("inst-a", 4444), &fast_config())
            .unwrap();
    let path = dir.path().join("inst-a.json");
    assert!(path.exists());

    // No partially written temp files are left behind.
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["inst-a.json".to_string()]);

    registration.deregister();
    assert!(!path.exists());
}

#[tokio::test]
async fn ping_refresher_updates_last_ping() {
    let dir = tempfile::tempdir().unwrap();
    let registration =
        InstanceRegistration::register(dir.path(), record("inst-a", 4444), &fast_config())
            .unwrap();
    let path = dir.path().join("inst-a.json");
    let first: InstanceRecord =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let second: InstanceRecord =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert!(second.last_ping > first.last_ping);
    registration.deregister();
}

#[tokio::test]
async fn watcher_reports_added_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut rx) = RendezvousWatcher::spawn(dir.path(), fast_config()).unwrap();

    write_record(dir.path(), &record("inst-a", 4444)).unwrap();
    let added = next_event(&mut rx).await;
    match added {
        RendezvousEvent::Added(r) => assert_eq!(r.id, "inst-a"),
        other => panic!("expected Added, got {other:?}"),
    }

    std::fs::remove_file(dir.path().join("inst-a.json")).unwrap();
    loop {
        match next_event(&mut rx).await {
            RendezvousEvent::Removed(id) => {
                assert_eq!(id, "inst-a");
                break;
            }
            // Ping refreshes may interleave as Updated events.
            RendezvousEvent::Updated(_) => continue,
            other => panic!("expected Removed, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn dead_pid_records_are_culled() {
    let dir = tempfile::tempdir().unwrap();
    let mut dead = record("inst-dead", 4445);
    // A PID far above pid_max cannot be alive.
    dead.pid = i32::MAX as u32;
    dead.process_info.pid = dead.pid;
    write_record(dir.path(), &dead).unwrap();

    let (_watcher, mut rx) = RendezvousWatcher::spawn(dir.path(), fast_config()).unwrap();
    // The record never appears, and its file is removed from disk.
    let outcome = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(outcome.is_err(), "dead record must not be reported");
    assert!(!dir.path().join("inst-dead.json").exists());
}

#[tokio::test]
async fn stale_ping_records_are_culled() {
    let dir = tempfile::tempdir().unwrap();
    let mut stale = record("inst-stale", 4446);
    stale.last_ping = Utc::now() - chrono::Duration::minutes(10);
    write_record(dir.path(), &stale).unwrap();

    let (_watcher, mut rx) = RendezvousWatcher::spawn(dir.path(), fast_config()).unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(outcome.is_err(), "stale record must not be reported");
}

#[tokio::test]
async fn unparseable_files_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
    write_record(dir.path(), &record("inst-ok", 4447)).unwrap();

    let (_watcher, mut rx) = RendezvousWatcher::spawn(dir.path(), fast_config()).unwrap();
    match next_event(&mut rx).await {
        RendezvousEvent::Added(r) => assert_eq!(r.id, "inst-ok"),
        other => panic!("expected Added for the valid record, got {other:?}"),
    }
}
