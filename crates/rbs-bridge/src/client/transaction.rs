use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rbs_protocol::{Call, Fault, Reply, Value, WireTransaction};
use rbs_store::{StoreResult, Synchronization, Transaction, TxResource};
use rbs_types::{RemoteRef, TransactionId, TxStatus, Vote};
use tracing::{debug, warn};

use crate::exporter::{Exporter, Skeleton};
use crate::fault::reply_from;
use crate::remote::RemoteHandle;
use crate::transport::Transport;

/// Client-side publication of a local transaction.
///
/// The server calls back through it to enlist its resources, which are
/// wrapped as [`TxResource`] stubs and handed to the local transaction. The
/// publication is retracted once the transaction completes.
pub struct ClientTransaction {
    txn: Arc<dyn Transaction>,
    transport: Arc<dyn Transport>,
    enlisted: Mutex<HashMap<RemoteRef, Arc<dyn TxResource>>>,
}

impl ClientTransaction {
    /// Publish `txn` for the server. No transaction stays no transaction.
    pub fn wrap(
        txn: Option<&Arc<dyn Transaction>>,
        exporter: &Arc<Exporter>,
        transport: &Arc<dyn Transport>,
    ) -> StoreResult<Option<WireTransaction>> {
        let Some(txn) = txn else {
            return Ok(None);
        };
        let published = Arc::new(Self {
            txn: Arc::clone(txn),
            transport: Arc::clone(transport),
            enlisted: Mutex::new(HashMap::new()),
        });
        let callback = exporter.export(published);
        let retract = Arc::new(RetractOnCompletion {
            exporter: Arc::clone(exporter),
            callback: callback.clone(),
        });
        if let Err(e) = txn.register_synchronization(retract) {
            let _ = exporter.unexport(&callback, true);
            return Err(e);
        }
        debug!(txn = %txn.id(), %callback, "transaction published");
        Ok(Some(WireTransaction {
            id: txn.id(),
            callback,
        }))
    }

    /// The stub is reserved under the lock, so concurrent enlists of one
    /// resource hand the transaction a single stub.
    fn enlist(&self, resource: RemoteRef) -> StoreResult<bool> {
        let stub: Arc<dyn TxResource> = match self.enlisted.lock().entry(resource.clone()) {
            Entry::Occupied(_) => return Ok(false),
            Entry::Vacant(slot) => Arc::clone(slot.insert(Arc::new(RemoteResource {
                handle: RemoteHandle::new(resource.clone(), Arc::clone(&self.transport)),
            }))),
        };
        let added = self.txn.enlist(Arc::clone(&stub));
        if !matches!(added, Ok(true)) {
            let mut enlisted = self.enlisted.lock();
            if enlisted.get(&resource).is_some_and(|held| Arc::ptr_eq(held, &stub)) {
                enlisted.remove(&resource);
            }
        }
        added
    }

    fn delist(&self, resource: &RemoteRef) -> StoreResult<bool> {
        let Some(stub) = self.enlisted.lock().remove(resource) else {
            return Ok(false);
        };
        self.txn.delist(&stub)
    }

    fn register_synchronization(&self, sync: RemoteRef) -> StoreResult<()> {
        self.txn.register_synchronization(Arc::new(RemoteSynchronization {
            handle: RemoteHandle::new(sync, Arc::clone(&self.transport)),
        }))
    }
}

impl Skeleton for ClientTransaction {
    fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::Status => reply_from(self.txn.status().map(Value::Status)),
            Call::Enlist { resource } => reply_from(self.enlist(resource).map(Value::Bool)),
            Call::Delist { resource } => reply_from(self.delist(&resource).map(Value::Bool)),
            Call::SetRollbackOnly => reply_from(self.txn.set_rollback_only().map(|()| Value::Unit)),
            Call::RegisterSynchronization { sync } => {
                reply_from(self.register_synchronization(sync).map(|()| Value::Unit))
            }
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "transaction"
    }
}

struct RetractOnCompletion {
    exporter: Arc<Exporter>,
    callback: RemoteRef,
}

impl Synchronization for RetractOnCompletion {
    fn after_completion(&self, status: TxStatus) {
        debug!(callback = %self.callback, ?status, "retracting transaction");
        if let Err(e) = self.exporter.unexport(&self.callback, true) {
            warn!(callback = %self.callback, error = %e, "failed to retract transaction");
        }
    }
}

/// A server-side resource as seen by the local coordinator.
struct RemoteResource {
    handle: RemoteHandle,
}

impl TxResource for RemoteResource {
    fn prepare(&self, txn: TransactionId) -> StoreResult<Vote> {
        self.handle.call_as(Call::Prepare { txn }, Value::expect_vote)
    }

    fn commit(&self, txn: TransactionId, one_phase: bool) -> StoreResult<()> {
        self.handle
            .call_as(Call::Commit { txn, one_phase }, Value::expect_unit)
    }

    fn rollback(&self, txn: TransactionId) -> StoreResult<()> {
        self.handle.call_as(Call::Rollback { txn }, Value::expect_unit)
    }
}

/// A server-side completion hook as seen by the local coordinator.
struct RemoteSynchronization {
    handle: RemoteHandle,
}

impl Synchronization for RemoteSynchronization {
    fn after_completion(&self, status: TxStatus) {
        if let Err(e) = self
            .handle
            .call_as(Call::AfterCompletion { status }, Value::expect_unit)
        {
            warn!(sync = %self.handle.target(), ?status, error = %e, "remote completion hook failed");
        }
    }
}
