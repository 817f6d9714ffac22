//! Multi-node scenarios: several engines embedded in one process over a
//! shared coordination handle, talking RPC over loopback.

use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::tempdir;
use trellis_core::{CommittedTx, DataSource};
use trellis_store::{encode_command, GraphCommand, NodeRecord};
use trellis_wal::pack_frames;
use trellisdb::{
    Config, CoordinationStore, Epoch, LocalCoordination, PropertyValue, Trellis, TrellisError,
    TxId,
};

fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    addr.to_string()
}

fn node_config(machine_id: u32, ha_server: &str) -> Config {
    Config {
        machine_id: Some(machine_id),
        ha_server: Some(ha_server.to_string()),
        cluster_name: "scenario".to_string(),
        pull_interval: None,
        allow_init_cluster: true,
        ..Config::default()
    }
}

fn wait_until(what: &str, deadline: Duration, mut check: impl FnMut() -> bool) {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn bootstrap_and_follower_copy() {
    let coordination = LocalCoordination::new();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    // Boot A against an empty directory: it mints the store and becomes
    // primary with epoch 1.
    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    assert!(a.is_primary());
    assert_eq!(a.supervisor().unwrap().current_epoch(), Epoch(1));

    let engine_a = a.engine();
    let mut tx = engine_a.begin().unwrap();
    let x = tx.create_node().unwrap();
    tx.set_node_property(x, "name", "X").unwrap();
    tx.commit().unwrap();

    // B points at the same coordination service with an empty directory:
    // it copies the store and follows.
    let b = Trellis::open_ha(
        dir_b.path(),
        node_config(2, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    assert!(!b.is_primary());

    let engine_b = b.engine();
    assert_eq!(engine_b.store_id(), engine_a.store_id());
    assert!(engine_b.node_exists(x).unwrap());
    assert_eq!(
        engine_b.node_property(x, "name").unwrap(),
        Some(PropertyValue::String("X".into()))
    );

    b.shutdown().unwrap();
    a.shutdown().unwrap();
}

#[test]
fn follower_write_round_trips_through_primary() {
    let coordination = LocalCoordination::new();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();

    let engine_a = a.engine();
    let mut tx = engine_a.begin().unwrap();
    tx.create_node().unwrap();
    tx.commit().unwrap();
    let before = engine_a.last_committed_tx();

    let b = Trellis::open_ha(
        dir_b.path(),
        node_config(2, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine_b = b.engine();

    // Write on the follower: ids come from the primary, the commit
    // round-trips, and both sides apply the same transaction.
    let mut tx = engine_b.begin().unwrap();
    let y = tx.create_node().unwrap();
    tx.set_node_property(y, "name", "Y").unwrap();
    let tx_id = tx.commit().unwrap().unwrap();
    assert_eq!(tx_id, before.next());

    assert_eq!(engine_b.last_committed_tx(), tx_id);
    assert_eq!(engine_a.last_committed_tx(), tx_id);
    assert!(engine_a.node_exists(y).unwrap());
    assert!(engine_b.node_exists(y).unwrap());
    assert_eq!(
        engine_a.node_property(y, "name").unwrap(),
        Some(PropertyValue::String("Y".into()))
    );

    b.shutdown().unwrap();
    a.shutdown().unwrap();
}

#[test]
fn primary_crash_promotes_follower() {
    let coordination = LocalCoordination::new();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();
    let addr_a = free_addr();
    let addr_b = free_addr();

    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &addr_a),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine_a = a.engine();
    let mut tx = engine_a.begin().unwrap();
    let y = tx.create_node().unwrap();
    tx.commit().unwrap();

    let b = Trellis::open_ha(
        dir_b.path(),
        node_config(2, &addr_b),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    assert!(b.engine().node_exists(y).unwrap());

    // Kill A: B is elected with epoch 2.
    a.shutdown().unwrap();
    wait_until("B to become primary", Duration::from_secs(10), || {
        b.is_primary()
    });
    assert_eq!(b.supervisor().unwrap().current_epoch(), Epoch(2));

    // A new client on B writes Z under the new reign.
    let engine_b = b.engine();
    let mut tx = engine_b.begin().unwrap();
    let z = tx.create_node().unwrap();
    tx.set_node_property(z, "name", "Z").unwrap();
    let z_tx = tx.commit().unwrap().unwrap();

    // Restart A: it comes back as a follower and fetches Z.
    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &addr_a),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    assert!(!a.is_primary());

    let engine_a = a.engine();
    assert!(engine_a.node_exists(z).unwrap());
    assert_eq!(
        engine_a.source().master_epoch_for(z_tx).unwrap(),
        Epoch(2)
    );

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

#[test]
fn branched_store_is_quarantined_and_refetched() {
    let coordination = LocalCoordination::new();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine = a.engine();
    let mut tx = engine.begin().unwrap();
    tx.create_node().unwrap();
    tx.commit().unwrap();

    let b = Trellis::open_ha(
        dir_b.path(),
        node_config(2, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();

    // Partition A: it leaves the view but keeps believing it is primary.
    a.supervisor().unwrap().detach().unwrap();
    wait_until("B to take over", Duration::from_secs(10), || {
        b.is_primary()
    });

    // Both sides now commit a conflicting tx 2 under different epochs.
    let engine_a = a.engine();
    let mut tx = engine_a.begin().unwrap();
    let w_a = tx.create_node().unwrap();
    tx.set_node_property(w_a, "side", "A").unwrap();
    tx.commit().unwrap();

    let engine_b = b.engine();
    let mut tx = engine_b.begin().unwrap();
    let w_b = tx.create_node().unwrap();
    tx.set_node_property(w_b, "side", "B").unwrap();
    tx.commit().unwrap();

    // Heal the partition: A lost the election, so its history is the
    // branched one. It must quarantine and refetch from B.
    a.supervisor().unwrap().reattach().unwrap();
    assert!(!a.is_primary());

    let engine_a = a.engine();
    assert_eq!(engine_a.last_committed_tx(), engine_b.last_committed_tx());
    assert_eq!(
        engine_a.node_property(w_b, "side").unwrap(),
        Some(PropertyValue::String("B".into()))
    );
    assert_eq!(
        engine_a.source().master_epoch_for(engine_a.last_committed_tx()).unwrap(),
        Epoch(2)
    );

    // The divergent store was moved aside, not destroyed.
    let quarantined = std::fs::read_dir(dir_a.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .any(|e| e.file_name().to_string_lossy().starts_with("broken-"));
    assert!(quarantined);

    a.shutdown().unwrap();
    b.shutdown().unwrap();
}

#[test]
fn gapped_stream_is_refused_then_recovered_by_pull() {
    let coordination = LocalCoordination::new();
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let a = Trellis::open_ha(
        dir_a.path(),
        node_config(1, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine_a = a.engine();
    let mut tx = engine_a.begin().unwrap();
    tx.create_node().unwrap();
    tx.commit().unwrap();

    let b = Trellis::open_ha(
        dir_b.path(),
        node_config(2, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine_b = b.engine();
    assert_eq!(engine_b.last_committed_tx(), TxId(1));

    // More history lands on the primary while B is not pulling.
    for _ in 0..2 {
        let mut tx = engine_a.begin().unwrap();
        tx.create_node().unwrap();
        tx.commit().unwrap();
    }

    // Inject a stream that skips tx 2: the follower must refuse it.
    let frame = encode_command(&GraphCommand::Node {
        id: 99,
        before: NodeRecord::EMPTY,
        after: NodeRecord::new(),
    })
    .unwrap();
    let gapped = CommittedTx {
        tx_id: TxId(3),
        epoch: Epoch(1),
        commands: pack_frames(&[frame]),
    };
    let err = engine_b.source().apply_committed(&gapped).unwrap_err();
    assert!(matches!(
        err,
        TrellisError::TxGap {
            expected: TxId(2),
            got: TxId(3),
            ..
        }
    ));
    assert_eq!(engine_b.last_committed_tx(), TxId(1));

    // A follower write re-requests from last+1 and catches up cleanly.
    let mut tx = engine_b.begin().unwrap();
    tx.create_node().unwrap();
    tx.commit().unwrap();
    assert_eq!(engine_b.last_committed_tx(), TxId(4));

    b.shutdown().unwrap();
    a.shutdown().unwrap();
}

#[test]
fn opposing_lock_orders_abort_the_younger() {
    let coordination = LocalCoordination::new();
    let dir = tempdir().unwrap();

    let a = Trellis::open_ha(
        dir.path(),
        node_config(1, &free_addr()),
        Arc::clone(&coordination) as Arc<dyn CoordinationStore>,
    )
    .unwrap();
    let engine = a.engine();

    let mut tx = engine.begin().unwrap();
    let n1 = tx.create_node().unwrap();
    let n2 = tx.create_node().unwrap();
    tx.commit().unwrap();

    let barrier = Arc::new(std::sync::Barrier::new(2));
    let results: Vec<_> = std::thread::scope(|scope| {
        let handles = vec![
            scope.spawn({
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                move || {
                    let mut tx = engine.begin().unwrap();
                    tx.set_node_property(n1, "t", 1i64)?;
                    barrier.wait();
                    tx.set_node_property(n2, "t", 1i64)?;
                    tx.commit()
                }
            }),
            scope.spawn({
                let engine = Arc::clone(&engine);
                let barrier = Arc::clone(&barrier);
                move || {
                    let mut tx = engine.begin().unwrap();
                    tx.set_node_property(n2, "t", 2i64)?;
                    barrier.wait();
                    tx.set_node_property(n1, "t", 2i64)?;
                    tx.commit()
                }
            }),
        ];
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let failures: Vec<_> = results.iter().filter(|r| r.is_err()).collect();
    assert_eq!(failures.len(), 1, "exactly one side is the victim");
    assert!(matches!(
        failures[0].as_ref().unwrap_err(),
        TrellisError::Deadlock { .. }
    ));
    // The survivor committed
    assert!(results.iter().any(|r| matches!(r, Ok(Some(_)))));

    a.shutdown().unwrap();
}
