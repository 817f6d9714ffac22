//! Standalone lifecycle: durability, recovery equivalence, identity.

use tempfile::tempdir;
use trellisdb::{PropertyValue, Trellis, TrellisError, TxId};

#[test]
fn open_write_reopen() {
    let dir = tempdir().unwrap();

    let (alice, rel) = {
        let db = Trellis::open(dir.path()).unwrap();
        let engine = db.engine();
        let mut tx = engine.begin().unwrap();
        let alice = tx.create_node().unwrap();
        let bob = tx.create_node().unwrap();
        let rel = tx.create_relationship("KNOWS", alice, bob).unwrap();
        tx.set_node_property(alice, "name", "Alice").unwrap();
        assert_eq!(tx.commit().unwrap(), Some(TxId(1)));
        db.shutdown().unwrap();
        (alice, rel)
    };

    let db = Trellis::open(dir.path()).unwrap();
    let engine = db.engine();
    assert!(engine.node_exists(alice).unwrap());
    assert_eq!(engine.relationship(rel).unwrap().2, "KNOWS");
    assert_eq!(
        engine.node_property(alice, "name").unwrap(),
        Some(PropertyValue::String("Alice".into()))
    );
    assert_eq!(engine.last_committed_tx(), TxId(1));
}

#[test]
fn messages_log_is_written() {
    let dir = tempdir().unwrap();
    let db = Trellis::open(dir.path()).unwrap();
    db.shutdown().unwrap();
    // The first database in the process owns the subscriber; either way
    // the human log file exists in the store directory.
    assert!(dir.path().join("messages.log").exists());
}

#[test]
fn recovery_equals_clean_shutdown() {
    // Same writes, one side crashes, one side closes cleanly: the
    // recovered store must read back identically.
    let crashed = tempdir().unwrap();
    let clean = tempdir().unwrap();

    let write = |dir: &std::path::Path, shutdown: bool| {
        let db = Trellis::open(dir).unwrap();
        let engine = db.engine();
        let mut tx = engine.begin().unwrap();
        let n = tx.create_node().unwrap();
        tx.set_node_property(n, "k", 7i64).unwrap();
        tx.commit().unwrap();

        let mut tx = engine.begin().unwrap();
        let m = tx.create_node().unwrap();
        tx.create_relationship("R", n, m).unwrap();
        tx.commit().unwrap();

        if shutdown {
            db.shutdown().unwrap();
        } else {
            // Simulated crash: drop without closing; store files are
            // never flushed, the logical log has everything.
            std::mem::forget(db);
        }
        (n, m)
    };

    let (n1, m1) = write(crashed.path(), false);
    let (n2, m2) = write(clean.path(), true);
    assert_eq!((n1, m1), (n2, m2));

    let a = Trellis::open(crashed.path()).unwrap();
    let b = Trellis::open(clean.path()).unwrap();
    let ea = a.engine();
    let eb = b.engine();

    assert_eq!(ea.last_committed_tx(), eb.last_committed_tx());
    assert_eq!(
        ea.node_property(n1, "k").unwrap(),
        eb.node_property(n2, "k").unwrap()
    );
    assert_eq!(
        ea.relationships(n1).unwrap().len(),
        eb.relationships(n2).unwrap().len()
    );
}

#[test]
fn uncommitted_transaction_is_discarded_on_recovery() {
    let dir = tempdir().unwrap();

    let node = {
        let db = Trellis::open(dir.path()).unwrap();
        let engine = db.engine();

        let mut tx = engine.begin().unwrap();
        let committed = tx.create_node().unwrap();
        tx.commit().unwrap();

        // Leave a transaction hanging and crash
        let mut tx = engine.begin().unwrap();
        let _uncommitted = tx.create_node().unwrap();
        std::mem::forget(tx);
        std::mem::forget(db);
        committed
    };

    let db = Trellis::open(dir.path()).unwrap();
    let engine = db.engine();
    assert!(engine.node_exists(node).unwrap());
    assert_eq!(engine.last_committed_tx(), TxId(1));
}

#[test]
fn config_file_is_honored() {
    let dir = tempdir().unwrap();
    std::fs::write(
        dir.path().join("trellis.toml"),
        "read_only = false\nkeep_logical_logs = true\n",
    )
    .unwrap();

    let db = Trellis::open(dir.path()).unwrap();
    let engine = db.engine();
    let mut tx = engine.begin().unwrap();
    tx.create_node().unwrap();
    tx.commit().unwrap();
    db.shutdown().unwrap();
}

#[test]
fn standalone_node_is_its_own_primary() {
    let dir = tempdir().unwrap();
    let db = Trellis::open(dir.path()).unwrap();
    assert!(db.is_primary());
}

#[test]
fn shutdown_poisons_the_handle() {
    let dir = tempdir().unwrap();
    let db = Trellis::open(dir.path()).unwrap();
    let engine = db.engine();
    db.shutdown().unwrap();

    assert!(matches!(
        engine.begin().unwrap_err(),
        TrellisError::Shutdown(_)
    ));
}
