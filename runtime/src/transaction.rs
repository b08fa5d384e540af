//! Local transactions over a journaling resource.
//!
//! A [`ResourceManager`] knows how to apply or discard a journal of pending
//! operations. A [`TransactionalSession`] owns one transaction at a time and
//! drives its state machine:
//!
//! ```text
//! NoTransaction ──begin──► Active ──prepare──► Prepared ──commit──► Committed
//!                            │                    │
//!                            └──────rollback──────┴───────────────► RolledBack
//! ```
//!
//! `commit` on an active transaction prepares it first. A finished session
//! can begin again. Sessions are independent of each other, so many may run
//! concurrently against the same manager.

use thiserror::Error;

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// No transaction was begun
    #[default]
    NoTransaction,
    /// Begun; operations are journaled
    Active,
    /// Validated and ready to commit
    Prepared,
    /// Applied
    Committed,
    /// Discarded
    RolledBack,
}

impl TransactionStatus {
    /// Whether a transaction is in progress.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::Prepared)
    }
}

/// Transaction state machine errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The operation is not allowed in the current state
    #[error("Cannot {operation} a transaction in state {status:?}")]
    IllegalState {
        /// Attempted operation
        operation: &'static str,
        /// State at the time
        status: TransactionStatus,
    },
}

/// A resource that applies journaled operations atomically.
pub trait ResourceManager: Send + Sync {
    /// Pending operations of one transaction.
    type Journal: Default + Send;

    /// Resource error type.
    type Error: From<TransactionError> + std::fmt::Display;

    /// Validate the journal before commit.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be applied; the transaction is
    /// then rolled back.
    fn prepare(&self, _journal: &Self::Journal) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Apply the journal.
    ///
    /// # Errors
    ///
    /// Returns an error if applying fails.
    fn commit(&self, journal: Self::Journal) -> Result<(), Self::Error>;

    /// Discard the journal, undoing any eager effects.
    ///
    /// # Errors
    ///
    /// Returns an error if undoing fails.
    fn rollback(&self, journal: Self::Journal) -> Result<(), Self::Error>;
}

/// One transaction at a time over a [`ResourceManager`].
#[derive(Debug)]
pub struct TransactionalSession<M: ResourceManager> {
    manager: M,
    status: TransactionStatus,
    journal: Option<M::Journal>,
}

impl<M: ResourceManager> TransactionalSession<M> {
    /// Create a session with no transaction.
    #[must_use]
    pub const fn new(manager: M) -> Self {
        Self {
            manager,
            status: TransactionStatus::NoTransaction,
            journal: None,
        }
    }

    /// The resource manager.
    #[must_use]
    pub const fn manager(&self) -> &M {
        &self.manager
    }

    /// Current state.
    #[must_use]
    pub const fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Whether a transaction is in progress.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Begin a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`TransactionError::IllegalState`] if one is already active.
    pub fn begin(&mut self) -> Result<(), TransactionError> {
        if self.status.is_active() {
            return Err(self.illegal("begin"));
        }
        self.journal = Some(M::Journal::default());
        self.status = TransactionStatus::Active;
        Ok(())
    }

    /// Validate the journal. A failed prepare rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns the manager's error, or an illegal-state error if the
    /// transaction is not active.
    pub fn prepare(&mut self) -> Result<(), M::Error> {
        if self.status != TransactionStatus::Active {
            return Err(self.illegal("prepare").into());
        }
        let prepared = match &self.journal {
            Some(journal) => self.manager.prepare(journal),
            None => Ok(()),
        };
        match prepared {
            Ok(()) => {
                self.status = TransactionStatus::Prepared;
                Ok(())
            },
            Err(err) => {
                tracing::warn!(error = %err, "Prepare failed, rolling back transaction");
                // The prepare failure is what the caller sees
                if let Err(rollback) = self.rollback() {
                    tracing::warn!(error = %rollback, "Rollback after failed prepare also failed");
                }
                Err(err)
            },
        }
    }

    /// Apply the journal, preparing first if needed.
    ///
    /// # Errors
    ///
    /// Returns the manager's error (the transaction ends rolled back), or an
    /// illegal-state error if no transaction is in progress.
    pub fn commit(&mut self) -> Result<(), M::Error> {
        if self.status == TransactionStatus::Active {
            self.prepare()?;
        }
        if self.status != TransactionStatus::Prepared {
            return Err(self.illegal("commit").into());
        }
        let journal = self.journal.take().unwrap_or_default();
        match self.manager.commit(journal) {
            Ok(()) => {
                self.status = TransactionStatus::Committed;
                Ok(())
            },
            Err(err) => {
                self.status = TransactionStatus::RolledBack;
                Err(err)
            },
        }
    }

    /// Discard the journal.
    ///
    /// # Errors
    ///
    /// Returns the manager's error, or an illegal-state error if no
    /// transaction is in progress.
    pub fn rollback(&mut self) -> Result<(), M::Error> {
        if !self.status.is_active() {
            return Err(self.illegal("rollback").into());
        }
        let journal = self.journal.take().unwrap_or_default();
        self.status = TransactionStatus::RolledBack;
        self.manager.rollback(journal)
    }

    /// Run `f` on the journal of the active transaction.
    ///
    /// Returns `None` when no transaction is active.
    pub fn with_journal<R>(&mut self, f: impl FnOnce(&mut M::Journal) -> R) -> Option<R> {
        if self.status != TransactionStatus::Active {
            return None;
        }
        self.journal.as_mut().map(f)
    }

    const fn illegal(&self, operation: &'static str) -> TransactionError {
        TransactionError::IllegalState {
            operation,
            status: self.status,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    enum LedgerError {
        #[error(transparent)]
        Transaction(#[from] TransactionError),
        #[error("negative balance")]
        Negative,
        #[error("ledger cannot undo")]
        Stuck,
    }

    #[derive(Default)]
    struct Ledger {
        balance: Mutex<i64>,
        reject_rollback: bool,
    }

    impl ResourceManager for &Ledger {
        type Journal = Vec<i64>;
        type Error = LedgerError;

        fn prepare(&self, journal: &Vec<i64>) -> Result<(), LedgerError> {
            let balance = *self.balance.lock().unwrap();
            if balance + journal.iter().sum::<i64>() < 0 {
                return Err(LedgerError::Negative);
            }
            Ok(())
        }

        fn commit(&self, journal: Vec<i64>) -> Result<(), LedgerError> {
            *self.balance.lock().unwrap() += journal.iter().sum::<i64>();
            Ok(())
        }

        fn rollback(&self, _journal: Vec<i64>) -> Result<(), LedgerError> {
            if self.reject_rollback {
                return Err(LedgerError::Stuck);
            }
            Ok(())
        }
    }

    #[test]
    fn test_commit_applies_journal() {
        let ledger = Ledger::default();
        let mut session = TransactionalSession::new(&ledger);

        session.begin().unwrap();
        session.with_journal(|j| j.extend([10, 5]));
        assert_eq!(*ledger.balance.lock().unwrap(), 0);

        session.commit().unwrap();
        assert_eq!(session.status(), TransactionStatus::Committed);
        assert_eq!(*ledger.balance.lock().unwrap(), 15);
    }

    #[test]
    fn test_rollback_discards_journal() {
        let ledger = Ledger::default();
        let mut session = TransactionalSession::new(&ledger);

        session.begin().unwrap();
        session.with_journal(|j| j.push(7));
        session.rollback().unwrap();

        assert_eq!(session.status(), TransactionStatus::RolledBack);
        assert_eq!(*ledger.balance.lock().unwrap(), 0);
        assert!(session.with_journal(|j| j.len()).is_none());
    }

    #[test]
    fn test_failed_prepare_rolls_back() {
        let ledger = Ledger::default();
        let mut session = TransactionalSession::new(&ledger);

        session.begin().unwrap();
        session.with_journal(|j| j.push(-1));

        assert!(matches!(session.commit(), Err(LedgerError::Negative)));
        assert_eq!(session.status(), TransactionStatus::RolledBack);
    }

    #[test]
    fn test_failed_rollback_after_prepare_keeps_prepare_error() {
        let ledger = Ledger {
            reject_rollback: true,
            ..Ledger::default()
        };
        let mut session = TransactionalSession::new(&ledger);

        session.begin().unwrap();
        session.with_journal(|j| j.push(-3));

        assert!(matches!(session.prepare(), Err(LedgerError::Negative)));
        assert_eq!(session.status(), TransactionStatus::RolledBack);
        assert_eq!(*ledger.balance.lock().unwrap(), 0);
        // The session is reusable even though the undo failed
        session.begin().unwrap();
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        let ledger = Ledger::default();
        let mut session = TransactionalSession::new(&ledger);

        assert!(matches!(
            session.commit(),
            Err(LedgerError::Transaction(TransactionError::IllegalState {
                operation: "commit",
                ..
            }))
        ));
        assert!(session.rollback().is_err());

        session.begin().unwrap();
        assert!(session.begin().is_err());
        session.prepare().unwrap();
        assert!(session.prepare().is_err());
        session.commit().unwrap();

        // A finished session can start over
        session.begin().unwrap();
        assert!(session.is_active());
    }
}
