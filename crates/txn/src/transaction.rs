//! The transaction handle.
//!
//! A transaction is created by [`TransactionManager::begin`]
//! (crate::manager::TransactionManager::begin), is bound to the thread
//! that began it, and accumulates one enlisted [`ResourceTx`] per data
//! source it touches. The handle owns nothing durable: everything up to
//! PREPARE lives in the enlisted resources' buffers.

use std::thread::{self, ThreadId};
use trellis_core::{ResourceTx, Result, TrellisError};

/// Lifecycle states of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations.
    Active,
    /// Commit or rollback completed.
    Finished,
}

/// One in-flight transaction.
pub struct Transaction {
    serial: u64,
    owner: ThreadId,
    state: TxState,
    enlisted: Vec<(String, Box<dyn ResourceTx>)>,
}

impl Transaction {
    pub(crate) fn new(serial: u64) -> Transaction {
        Transaction {
            serial,
            owner: thread::current().id(),
            state: TxState::Active,
            enlisted: Vec::new(),
        }
    }

    /// Serial number; also the lock owner id and deadlock age (higher =
    /// younger).
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.state
    }

    /// Enlist a resource's per-transaction participant. Each source joins
    /// at most once.
    pub fn enlist(&mut self, resource: &str, tx: Box<dyn ResourceTx>) -> Result<()> {
        self.check_usable()?;
        if self.enlisted.iter().any(|(name, _)| name == resource) {
            return Err(TrellisError::InvalidOperation(format!(
                "resource '{}' already enlisted",
                resource
            )));
        }
        self.enlisted.push((resource.to_string(), tx));
        Ok(())
    }

    /// The enlisted participant for `resource`, if joined.
    pub fn enlisted_mut(&mut self, resource: &str) -> Option<&mut Box<dyn ResourceTx>> {
        self.enlisted
            .iter_mut()
            .find(|(name, _)| name == resource)
            .map(|(_, tx)| tx)
    }

    /// Whether `resource` has joined this transaction.
    pub fn is_enlisted(&self, resource: &str) -> bool {
        self.enlisted.iter().any(|(name, _)| name == resource)
    }

    pub(crate) fn take_enlisted(&mut self) -> Vec<(String, Box<dyn ResourceTx>)> {
        std::mem::take(&mut self.enlisted)
    }

    pub(crate) fn finish(&mut self) {
        self.state = TxState::Finished;
    }

    /// Fail unless the transaction is active and on its owning thread.
    pub fn check_usable(&self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(TrellisError::InvalidOperation(
                "transaction already finished".to_string(),
            ));
        }
        if thread::current().id() != self.owner {
            return Err(TrellisError::InvalidOperation(
                "transaction used from a foreign thread".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::TxId;

    struct NoopTx;

    impl ResourceTx for NoopTx {
        fn prepare(&mut self) -> Result<()> {
            Ok(())
        }
        fn commit(&mut self) -> Result<TxId> {
            Ok(TxId(1))
        }
        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_read_only(&self) -> bool {
            true
        }
    }

    #[test]
    fn enlist_once_per_resource() {
        let mut tx = Transaction::new(1);
        tx.enlist("graph", Box::new(NoopTx)).unwrap();
        assert!(tx.is_enlisted("graph"));
        assert!(tx.enlist("graph", Box::new(NoopTx)).is_err());
        assert!(tx.enlisted_mut("graph").is_some());
        assert!(tx.enlisted_mut("other").is_none());
    }

    #[test]
    fn finished_transaction_rejects_use() {
        let mut tx = Transaction::new(1);
        tx.finish();
        assert!(tx.check_usable().is_err());
        assert!(tx.enlist("graph", Box::new(NoopTx)).is_err());
    }

    #[test]
    fn foreign_thread_rejected() {
        let tx = Transaction::new(1);
        let result = std::thread::spawn(move || tx.check_usable())
            .join()
            .unwrap();
        assert!(result.is_err());
    }
}
