use std::sync::Arc;

use parking_lot::Mutex;
use rbs_types::{TransactionId, TxStatus, Vote};
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::traits::{same_resource, Synchronization, Transaction, TxResource};

struct TxState {
    status: TxStatus,
    resources: Vec<Arc<dyn TxResource>>,
    syncs: Vec<Arc<dyn Synchronization>>,
}

/// In-process two-phase commit coordinator.
///
/// Resources are prepared and committed in enlistment order. A transaction
/// with a single resource commits in one phase. Resource callbacks run without
/// the state lock held, so a resource may query the transaction re-entrantly.
pub struct LocalTransaction {
    id: TransactionId,
    state: Mutex<TxState>,
}

impl LocalTransaction {
    /// Begin a new active transaction.
    pub fn begin() -> Arc<Self> {
        Arc::new(Self {
            id: TransactionId::new(),
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                resources: Vec::new(),
                syncs: Vec::new(),
            }),
        })
    }

    /// Commit, or roll back if the transaction was marked rollback-only or a
    /// resource refused to prepare.
    pub fn commit(&self) -> StoreResult<()> {
        let resources = {
            let mut state = self.state.lock();
            let status = state.status;
            match status {
                TxStatus::Active => {}
                TxStatus::MarkedRollback => {
                    drop(state);
                    self.rollback()?;
                    return Err(StoreError::Transaction(format!(
                        "transaction {} was marked for rollback",
                        self.id
                    )));
                }
                other => {
                    return Err(StoreError::Transaction(format!(
                        "cannot commit transaction {} in state {other:?}",
                        self.id
                    )))
                }
            }
            state.status = TxStatus::Preparing;
            state.resources.clone()
        };

        if resources.len() == 1 {
            self.set_status(TxStatus::Committing);
            let result = resources[0].commit(self.id, true);
            self.finish(if result.is_ok() {
                TxStatus::Committed
            } else {
                TxStatus::RolledBack
            });
            return result;
        }

        let to_commit = match self.prepare_all(&resources) {
            Ok(voters) => voters,
            Err(e) => {
                warn!(txn = %self.id, error = %e, "prepare failed, rolling back");
                self.set_status(TxStatus::RollingBack);
                for resource in &resources {
                    if let Err(e) = resource.rollback(self.id) {
                        warn!(txn = %self.id, error = %e, "rollback after failed prepare");
                    }
                }
                self.finish(TxStatus::RolledBack);
                return Err(e);
            }
        };

        self.set_status(TxStatus::Committing);
        let mut first_error = None;
        for resource in &to_commit {
            if let Err(e) = resource.commit(self.id, false) {
                warn!(txn = %self.id, error = %e, "resource failed to commit after prepare");
                first_error.get_or_insert(e);
            }
        }
        self.finish(TxStatus::Committed);
        match first_error {
            Some(e) => Err(StoreError::Transaction(format!(
                "transaction {} committed with failures: {e}",
                self.id
            ))),
            None => Ok(()),
        }
    }

    /// Roll back every enlisted resource.
    pub fn rollback(&self) -> StoreResult<()> {
        let resources = {
            let mut state = self.state.lock();
            if !matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) {
                return Err(StoreError::Transaction(format!(
                    "cannot roll back transaction {} in state {:?}",
                    self.id, state.status
                )));
            }
            state.status = TxStatus::RollingBack;
            state.resources.clone()
        };

        let mut first_error = None;
        for resource in &resources {
            if let Err(e) = resource.rollback(self.id) {
                warn!(txn = %self.id, error = %e, "resource failed to roll back");
                first_error.get_or_insert(e);
            }
        }
        self.finish(TxStatus::RolledBack);
        first_error.map_or(Ok(()), Err)
    }

    fn prepare_all(&self, resources: &[Arc<dyn TxResource>]) -> StoreResult<Vec<Arc<dyn TxResource>>> {
        let mut voters = Vec::with_capacity(resources.len());
        for resource in resources {
            match resource.prepare(self.id)? {
                Vote::Commit => voters.push(Arc::clone(resource)),
                Vote::ReadOnly => {}
            }
        }
        Ok(voters)
    }

    fn set_status(&self, status: TxStatus) {
        self.state.lock().status = status;
    }

    fn finish(&self, status: TxStatus) {
        let syncs = {
            let mut state = self.state.lock();
            state.status = status;
            state.resources.clear();
            std::mem::take(&mut state.syncs)
        };
        debug!(txn = %self.id, ?status, "transaction completed");
        for sync in syncs {
            sync.after_completion(status);
        }
    }
}

impl Transaction for LocalTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> StoreResult<TxStatus> {
        Ok(self.state.lock().status)
    }

    fn enlist(&self, resource: Arc<dyn TxResource>) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if !state.status.accepts_enlistment() {
            return Err(StoreError::Transaction(format!(
                "transaction {} cannot enlist in state {:?}",
                self.id, state.status
            )));
        }
        if state.resources.iter().any(|r| same_resource(r, &resource)) {
            return Ok(false);
        }
        state.resources.push(resource);
        Ok(true)
    }

    fn delist(&self, resource: &Arc<dyn TxResource>) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let before = state.resources.len();
        state.resources.retain(|r| !same_resource(r, resource));
        Ok(state.resources.len() != before)
    }

    fn set_rollback_only(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        let status = state.status;
        match status {
            TxStatus::Active | TxStatus::MarkedRollback => {
                state.status = TxStatus::MarkedRollback;
                Ok(())
            }
            other => Err(StoreError::Transaction(format!(
                "cannot mark transaction {} rollback-only in state {other:?}",
                self.id
            ))),
        }
    }

    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.status.is_complete() {
            return Err(StoreError::Transaction(format!(
                "transaction {} already completed",
                self.id
            )));
        }
        state.syncs.push(sync);
        Ok(())
    }
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalTransaction")
            .field("id", &self.id)
            .field("status", &state.status)
            .field("resources", &state.resources.len())
            .finish()
    }
}
