//! The transaction coordinator: two-phase commit over enlisted sources.
//!
//! Commit sequence for one transaction:
//!
//! 1. `prepare()` every enlisted resource in commit order: each flushes
//!    its commands to its log and forces it. Any failure aborts all.
//! 2. `commit()` every resource in commit order, graph store first. The
//!    graph store's assigned transaction id is the transaction's id.
//! 3. Release the transaction's locks.
//!
//! A crash between the commit records of two resources is resolved by
//! recovery: the graph store committed first, and a secondary index whose
//! COMMIT is missing is rebuilt from the graph.

use crate::locks::LockManager;
use crate::registry::DataSourceRegistry;
use crate::transaction::Transaction;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::{ResourceTx, Result, TrellisError, TxId, RESOURCE_GRAPH};

/// Coordinates transactions over the registered data sources.
pub struct TransactionManager {
    next_serial: AtomicU64,
    locks: Arc<LockManager>,
    registry: Arc<DataSourceRegistry>,
}

impl TransactionManager {
    /// Create a manager over the given locks and registry.
    pub fn new(locks: Arc<LockManager>, registry: Arc<DataSourceRegistry>) -> TransactionManager {
        TransactionManager {
            next_serial: AtomicU64::new(1),
            locks,
            registry,
        }
    }

    /// The lock manager transactions acquire through.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The registry this manager commits across.
    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    /// Begin a transaction bound to the calling thread.
    pub fn begin(&self) -> Transaction {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        debug!(serial, "transaction begun");
        Transaction::new(serial)
    }

    /// Two-phase commit. Returns the graph store's assigned transaction
    /// id, or `None` for a read-only transaction.
    pub fn commit(&self, tx: &mut Transaction) -> Result<Option<TxId>> {
        tx.check_usable()?;
        let mut enlisted = self.in_commit_order(tx.take_enlisted());
        let serial = tx.serial();

        if enlisted.iter().all(|(_, r)| r.is_read_only()) {
            for (_, resource) in enlisted.iter_mut() {
                resource.rollback()?;
            }
            self.finish(tx);
            return Ok(None);
        }

        // Phase one: prepare everything; any failure aborts all.
        for idx in 0..enlisted.len() {
            if enlisted[idx].1.is_read_only() {
                continue;
            }
            if let Err(e) = enlisted[idx].1.prepare() {
                let name = enlisted[idx].0.clone();
                warn!(serial, resource = %name, error = %e, "prepare failed, rolling back");
                for (_, r) in enlisted.iter_mut() {
                    let _ = r.rollback();
                }
                self.finish(tx);
                return Err(TrellisError::TxFailure(format!(
                    "prepare failed on '{}': {}",
                    name, e
                )));
            }
        }

        // Phase two: commit in order, graph store first.
        let mut graph_tx_id = None;
        for idx in 0..enlisted.len() {
            let name = enlisted[idx].0.clone();
            if enlisted[idx].1.is_read_only() {
                let _ = enlisted[idx].1.rollback();
                continue;
            }
            match enlisted[idx].1.commit() {
                Ok(tx_id) => {
                    if name == RESOURCE_GRAPH {
                        graph_tx_id = Some(tx_id);
                    }
                }
                Err(e) if graph_tx_id.is_none() => {
                    // The graph store itself failed: nothing durable
                    // happened yet, abort the rest.
                    warn!(serial, resource = %name, error = %e, "commit failed before graph store");
                    for (_, r) in enlisted.iter_mut() {
                        let _ = r.rollback();
                    }
                    self.finish(tx);
                    return Err(TrellisError::TxFailure(format!(
                        "commit failed on '{}': {}",
                        name, e
                    )));
                }
                Err(e) => {
                    // Graph store already committed; the lagging index is
                    // rebuilt from the graph at recovery.
                    warn!(
                        serial,
                        resource = %name,
                        error = %e,
                        "secondary-index commit failed after graph commit"
                    );
                }
            }
        }

        self.finish(tx);
        debug!(serial, tx_id = ?graph_tx_id, "transaction committed");
        Ok(graph_tx_id)
    }

    /// Discard the transaction. Prepared resources write their rollback
    /// record; everything else just drops its buffers.
    pub fn rollback(&self, tx: &mut Transaction) -> Result<()> {
        tx.check_usable()?;
        let mut first_error = None;
        for (name, resource) in tx.take_enlisted().iter_mut() {
            if let Err(e) = resource.rollback() {
                warn!(resource = %name, error = %e, "rollback failed");
                first_error.get_or_insert(e);
            }
        }
        self.finish(tx);
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn finish(&self, tx: &mut Transaction) {
        self.locks.release_all(tx.serial());
        tx.finish();
    }

    /// Order enlisted resources for commit: graph first, then the
    /// registry's registration order.
    fn in_commit_order(
        &self,
        enlisted: Vec<(String, Box<dyn ResourceTx>)>,
    ) -> Vec<(String, Box<dyn ResourceTx>)> {
        let order = self.registry.names();
        let rank = |name: &str| {
            order
                .iter()
                .position(|n| n == name)
                .unwrap_or(usize::MAX)
        };
        let mut enlisted = enlisted;
        enlisted.sort_by_key(|(name, _)| rank(name));
        enlisted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use trellis_core::{CommittedTx, DataSource, Epoch};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Prepare(&'static str),
        Commit(&'static str),
        Rollback(&'static str),
    }

    struct ScriptedTx {
        name: &'static str,
        events: Arc<Mutex<Vec<Event>>>,
        fail_prepare: bool,
        fail_commit: bool,
        read_only: bool,
        tx_id: TxId,
    }

    impl ResourceTx for ScriptedTx {
        fn prepare(&mut self) -> Result<()> {
            self.events.lock().push(Event::Prepare(self.name));
            if self.fail_prepare {
                return Err(TrellisError::TxFailure("scripted prepare failure".into()));
            }
            Ok(())
        }
        fn commit(&mut self) -> Result<TxId> {
            self.events.lock().push(Event::Commit(self.name));
            if self.fail_commit {
                return Err(TrellisError::TxFailure("scripted commit failure".into()));
            }
            Ok(self.tx_id)
        }
        fn rollback(&mut self) -> Result<()> {
            self.events.lock().push(Event::Rollback(self.name));
            Ok(())
        }
        fn is_read_only(&self) -> bool {
            self.read_only
        }
    }

    struct NamedSource(&'static str);

    impl DataSource for NamedSource {
        fn name(&self) -> &str {
            self.0
        }
        fn last_committed_tx_id(&self) -> TxId {
            TxId::ZERO
        }
        fn apply_committed(&self, _tx: &CommittedTx) -> Result<()> {
            Ok(())
        }
        fn extract(&self, _from: TxId) -> Result<Vec<CommittedTx>> {
            Ok(Vec::new())
        }
        fn master_epoch_for(&self, _tx_id: TxId) -> Result<Epoch> {
            Ok(Epoch::NONE)
        }
        fn set_last_committed(&self, _tx_id: TxId) -> Result<()> {
            Ok(())
        }
    }

    fn manager_with(names: &[&'static str]) -> TransactionManager {
        let registry = Arc::new(DataSourceRegistry::new());
        for name in names {
            registry.register(Arc::new(NamedSource(name))).unwrap();
        }
        TransactionManager::new(Arc::new(LockManager::new()), registry)
    }

    fn scripted(
        events: &Arc<Mutex<Vec<Event>>>,
        name: &'static str,
        tx_id: u64,
    ) -> Box<ScriptedTx> {
        Box::new(ScriptedTx {
            name,
            events: Arc::clone(events),
            fail_prepare: false,
            fail_commit: false,
            read_only: false,
            tx_id: TxId(tx_id),
        })
    }

    #[test]
    fn commit_orders_graph_store_first() {
        let manager = manager_with(&["lucene", RESOURCE_GRAPH]);
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut tx = manager.begin();
        // Enlist in the "wrong" order on purpose
        tx.enlist("lucene", scripted(&events, "lucene", 9)).unwrap();
        tx.enlist(RESOURCE_GRAPH, scripted(&events, "graph", 9))
            .unwrap();

        let tx_id = manager.commit(&mut tx).unwrap();
        assert_eq!(tx_id, Some(TxId(9)));

        let log = events.lock().clone();
        assert_eq!(
            log,
            vec![
                Event::Prepare("graph"),
                Event::Prepare("lucene"),
                Event::Commit("graph"),
                Event::Commit("lucene"),
            ]
        );
    }

    #[test]
    fn prepare_failure_aborts_everything() {
        let manager = manager_with(&[RESOURCE_GRAPH, "lucene"]);
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut tx = manager.begin();
        tx.enlist(RESOURCE_GRAPH, scripted(&events, "graph", 1))
            .unwrap();
        let mut failing = scripted(&events, "lucene", 1);
        failing.fail_prepare = true;
        tx.enlist("lucene", failing).unwrap();

        let result = manager.commit(&mut tx);
        assert!(matches!(result, Err(TrellisError::TxFailure(_))));

        let log = events.lock().clone();
        assert!(log.contains(&Event::Rollback("graph")));
        assert!(!log.contains(&Event::Commit("graph")));
    }

    #[test]
    fn index_commit_failure_does_not_undo_graph_commit() {
        let manager = manager_with(&[RESOURCE_GRAPH, "lucene"]);
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut tx = manager.begin();
        tx.enlist(RESOURCE_GRAPH, scripted(&events, "graph", 5))
            .unwrap();
        let mut failing = scripted(&events, "lucene", 5);
        failing.fail_commit = true;
        tx.enlist("lucene", failing).unwrap();

        // The transaction reports success with the graph's id; the index
        // catches up from the graph at recovery.
        let tx_id = manager.commit(&mut tx).unwrap();
        assert_eq!(tx_id, Some(TxId(5)));
    }

    #[test]
    fn read_only_transaction_commits_to_nothing() {
        let manager = manager_with(&[RESOURCE_GRAPH]);
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut tx = manager.begin();
        let mut read_only = scripted(&events, "graph", 0);
        read_only.read_only = true;
        tx.enlist(RESOURCE_GRAPH, read_only).unwrap();

        assert_eq!(manager.commit(&mut tx).unwrap(), None);
        assert_eq!(events.lock().clone(), vec![Event::Rollback("graph")]);
    }

    #[test]
    fn rollback_discards_all() {
        let manager = manager_with(&[RESOURCE_GRAPH, "lucene"]);
        let events = Arc::new(Mutex::new(Vec::new()));

        let mut tx = manager.begin();
        tx.enlist(RESOURCE_GRAPH, scripted(&events, "graph", 1))
            .unwrap();
        tx.enlist("lucene", scripted(&events, "lucene", 1)).unwrap();
        manager.rollback(&mut tx).unwrap();

        let log = events.lock().clone();
        assert_eq!(
            log,
            vec![Event::Rollback("graph"), Event::Rollback("lucene")]
        );
        // Finished transactions refuse further use
        assert!(manager.commit(&mut tx).is_err());
    }

    #[test]
    fn serials_increase() {
        let manager = manager_with(&[]);
        let a = manager.begin();
        let b = manager.begin();
        assert!(b.serial() > a.serial());
    }
}
