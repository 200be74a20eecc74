//! Send path: snapshot under lock, transfer, completion marker.

mod common;

use common::{Fixture, StubDatabase, StubHypervisor, StubRemote};
use std::sync::{Arc, Mutex};
use twin_repl::{TransferStep, TwinError};

#[tokio::test]
async fn test_send_ships_payload_then_marker() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let database = Arc::new(StubDatabase {
        calls: log.clone(),
        ..Default::default()
    });
    let remote = Arc::new(StubRemote::default());
    let orchestrator = fixture.orchestrator(
        Arc::new(StubHypervisor::with_domains(&["web01"])),
        database,
        Arc::new(fixture.snapshotter(log.clone())),
        remote.clone(),
    );

    let report = orchestrator.send("web01").await.unwrap();

    assert_eq!(report.domain, "web01");
    assert_eq!(report.bytes, 4096);
    assert_eq!(*log.lock().unwrap(), vec!["lock", "snapshot", "unlock"]);

    let incoming = fixture.remote_incoming("web01");
    assert_eq!(std::fs::read(incoming.join("hda.raw")).unwrap(), vec![0xAB; 4096]);
    assert!(incoming.join("complete.txt").exists());

    let calls = remote.calls();
    assert!(calls[0].starts_with("rm -f -- "));
    assert!(calls.last().unwrap().starts_with("touch -- "));
}

#[tokio::test]
async fn test_partial_transfer_leaves_no_marker() {
    let fixture = Fixture::new();
    let incoming = fixture.remote_incoming("web01");
    std::fs::create_dir_all(&incoming).unwrap();
    // marker from the previous, successful cycle
    std::fs::write(incoming.join("complete.txt"), b"").unwrap();

    let log = Arc::new(Mutex::new(Vec::new()));
    let remote = Arc::new(StubRemote {
        partial_push: true,
        ..Default::default()
    });
    let orchestrator = fixture.orchestrator(
        Arc::new(StubHypervisor::with_domains(&["web01"])),
        Arc::new(StubDatabase {
            calls: log.clone(),
            ..Default::default()
        }),
        Arc::new(fixture.snapshotter(log.clone())),
        remote.clone(),
    );

    let err = orchestrator.send("web01").await.unwrap_err();

    assert!(matches!(
        err,
        TwinError::Transfer {
            step: TransferStep::CopyPayload,
            ..
        }
    ));
    assert_eq!(std::fs::read(incoming.join("hda.raw")).unwrap().len(), 2048);
    assert!(!incoming.join("complete.txt").exists());
    assert!(!remote.calls().iter().any(|c| c.starts_with("touch")));
}

#[tokio::test]
async fn test_snapshot_failure_still_unlocks() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut snapshotter = fixture.snapshotter(log.clone());
    snapshotter.fail = true;
    let remote = Arc::new(StubRemote::default());
    let orchestrator = fixture.orchestrator(
        Arc::new(StubHypervisor::with_domains(&["web01"])),
        Arc::new(StubDatabase {
            calls: log.clone(),
            ..Default::default()
        }),
        Arc::new(snapshotter),
        remote.clone(),
    );

    let err = orchestrator.send("web01").await.unwrap_err();

    assert!(matches!(err, TwinError::Snapshot { .. }));
    let calls = log.lock().unwrap().clone();
    assert_eq!(calls, vec!["lock", "snapshot", "unlock"]);
    assert_eq!(calls.iter().filter(|c| *c == "unlock").count(), 1);
    assert!(remote.calls().is_empty());
}

#[tokio::test]
async fn test_lock_failure_does_not_abort_send() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let orchestrator = fixture.orchestrator(
        Arc::new(StubHypervisor::with_domains(&["web01"])),
        Arc::new(StubDatabase {
            calls: log.clone(),
            fail_lock: true,
        }),
        Arc::new(fixture.snapshotter(log.clone())),
        Arc::new(StubRemote::default()),
    );

    orchestrator.send("web01").await.unwrap();

    assert_eq!(*log.lock().unwrap(), vec!["lock", "snapshot", "unlock"]);
    assert!(fixture.remote_incoming("web01").join("complete.txt").exists());
}

#[tokio::test]
async fn test_unknown_domain_fails_before_any_action() {
    let fixture = Fixture::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    let remote = Arc::new(StubRemote::default());
    let orchestrator = fixture.orchestrator(
        Arc::new(StubHypervisor::with_domains(&["web01"])),
        Arc::new(StubDatabase {
            calls: log.clone(),
            ..Default::default()
        }),
        Arc::new(fixture.snapshotter(log.clone())),
        remote.clone(),
    );

    let err = orchestrator.send("db99").await.unwrap_err();

    assert!(matches!(err, TwinError::DomainNotFound { ref name } if name == "db99"));
    assert!(log.lock().unwrap().is_empty());
    assert!(remote.calls().is_empty());
}
