//! The data-source registry.
//!
//! Built explicitly at start-up from a configured list of factories;
//! there is no runtime discovery. The graph store registers under
//! [`RESOURCE_GRAPH`] and is always first in commit order; secondary
//! indexes follow in registration order.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use trellis_core::{DataSource, Result, TrellisError, RESOURCE_GRAPH};

/// Constructor for one data source, run once at registry build time.
pub type DataSourceFactory = Box<dyn FnOnce() -> Result<Arc<dyn DataSource>> + Send>;

/// Named set of data sources participating in transactions.
pub struct DataSourceRegistry {
    by_name: RwLock<HashMap<String, Arc<dyn DataSource>>>,
    /// Names in commit order: graph first, then registration order.
    order: RwLock<Vec<String>>,
}

impl Default for DataSourceRegistry {
    fn default() -> Self {
        DataSourceRegistry::new()
    }
}

impl DataSourceRegistry {
    /// Create an empty registry.
    pub fn new() -> DataSourceRegistry {
        DataSourceRegistry {
            by_name: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Build a registry by running each factory in order.
    pub fn build(factories: Vec<DataSourceFactory>) -> Result<DataSourceRegistry> {
        let registry = DataSourceRegistry::new();
        for factory in factories {
            registry.register(factory()?)?;
        }
        Ok(registry)
    }

    /// Register a source. Rejects duplicate names.
    pub fn register(&self, source: Arc<dyn DataSource>) -> Result<()> {
        let name = source.name().to_string();
        let mut by_name = self.by_name.write();
        if by_name.contains_key(&name) {
            return Err(TrellisError::InvalidOperation(format!(
                "data source '{}' already registered",
                name
            )));
        }
        info!(resource = %name, "registered data source");
        by_name.insert(name.clone(), source);

        let mut order = self.order.write();
        if name == RESOURCE_GRAPH {
            order.insert(0, name);
        } else {
            order.push(name);
        }
        Ok(())
    }

    /// Look up a source by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn DataSource>> {
        self.by_name.read().get(name).cloned()
    }

    /// Every source in commit order (graph store first).
    pub fn in_commit_order(&self) -> Vec<Arc<dyn DataSource>> {
        let by_name = self.by_name.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| by_name.get(name).cloned())
            .collect()
    }

    /// Registered names in commit order.
    pub fn names(&self) -> Vec<String> {
        self.order.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use trellis_core::{CommittedTx, Epoch, TxId};

    struct StubSource {
        name: String,
        last: AtomicU64,
    }

    impl StubSource {
        fn new(name: &str) -> Arc<StubSource> {
            Arc::new(StubSource {
                name: name.to_string(),
                last: AtomicU64::new(0),
            })
        }
    }

    impl DataSource for StubSource {
        fn name(&self) -> &str {
            &self.name
        }
        fn last_committed_tx_id(&self) -> TxId {
            TxId(self.last.load(Ordering::SeqCst))
        }
        fn apply_committed(&self, tx: &CommittedTx) -> Result<()> {
            self.last.store(tx.tx_id.0, Ordering::SeqCst);
            Ok(())
        }
        fn extract(&self, _from: TxId) -> Result<Vec<CommittedTx>> {
            Ok(Vec::new())
        }
        fn master_epoch_for(&self, _tx_id: TxId) -> Result<Epoch> {
            Ok(Epoch::NONE)
        }
        fn set_last_committed(&self, tx_id: TxId) -> Result<()> {
            self.last.store(tx_id.0, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn graph_store_is_always_first() {
        let registry = DataSourceRegistry::new();
        registry.register(StubSource::new("lucene")).unwrap();
        registry.register(StubSource::new(RESOURCE_GRAPH)).unwrap();
        registry.register(StubSource::new("lucene-fulltext")).unwrap();

        assert_eq!(
            registry.names(),
            vec![RESOURCE_GRAPH, "lucene", "lucene-fulltext"]
        );
    }

    #[test]
    fn duplicate_registration_rejected() {
        let registry = DataSourceRegistry::new();
        registry.register(StubSource::new("lucene")).unwrap();
        assert!(registry.register(StubSource::new("lucene")).is_err());
    }

    #[test]
    fn build_from_factories() {
        let registry = DataSourceRegistry::build(vec![
            Box::new(|| Ok(StubSource::new(RESOURCE_GRAPH) as Arc<dyn DataSource>)),
            Box::new(|| Ok(StubSource::new("lucene") as Arc<dyn DataSource>)),
        ])
        .unwrap();

        assert!(registry.get(RESOURCE_GRAPH).is_some());
        assert!(registry.get("lucene").is_some());
        assert!(registry.get("missing").is_none());
    }
}
