use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a distributed transaction (UUID v7 for time-ordering).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(uuid::Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Active,
    MarkedRollback,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl TxStatus {
    /// Resources may still be enlisted.
    pub fn accepts_enlistment(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// The transaction has reached a final outcome.
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// A resource's answer to the prepare phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vote {
    /// Ready to commit.
    Commit,
    /// Nothing to commit; the resource drops out of phase two.
    ReadOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn enlistment_states() {
        assert!(TxStatus::Active.accepts_enlistment());
        assert!(!TxStatus::MarkedRollback.accepts_enlistment());
        assert!(!TxStatus::Preparing.accepts_enlistment());
        assert!(!TxStatus::Committed.accepts_enlistment());
    }

    #[test]
    fn completion_states() {
        assert!(TxStatus::Committed.is_complete());
        assert!(TxStatus::RolledBack.is_complete());
        assert!(!TxStatus::Committing.is_complete());
        assert!(!TxStatus::Active.is_complete());
    }
}
