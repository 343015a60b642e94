use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rbs_protocol::{Call, Fault, Reply, Value, WireTransaction};
use rbs_store::{same_resource, StoreResult, Synchronization, Transaction, TxResource};
use rbs_types::{RemoteRef, TransactionId, TxStatus};
use tracing::{debug, warn};

use crate::exporter::{Exporter, Skeleton};
use crate::fault::reply_from;
use crate::remote::RemoteHandle;
use crate::transport::Transport;

/// Server-side stand-in for a transaction owned by the client.
///
/// Every [`Transaction`] method calls back through the client's callback
/// reference. Resources enlisted here are published so the client's
/// coordinator can drive them through two-phase commit; they are retracted
/// once the transaction completes.
pub struct ServerTransaction {
    id: TransactionId,
    callback: RemoteHandle,
    exporter: Arc<Exporter>,
    resources: Mutex<Vec<(Arc<dyn TxResource>, RemoteRef)>>,
    /// Serializes enlist and delist so one resource is published once.
    enlisting: Mutex<()>,
    cleanup_registered: Mutex<bool>,
    this: Weak<ServerTransaction>,
}

impl ServerTransaction {
    /// Rebuild the transaction carried by an incoming request. No
    /// transaction stays no transaction.
    pub fn unwrap(
        wire: Option<WireTransaction>,
        exporter: &Arc<Exporter>,
        transport: &Arc<dyn Transport>,
    ) -> Option<Arc<Self>> {
        let wire = wire?;
        Some(Arc::new_cyclic(|this| Self {
            id: wire.id,
            callback: RemoteHandle::new(wire.callback, Arc::clone(transport)),
            exporter: Arc::clone(exporter),
            resources: Mutex::new(Vec::new()),
            enlisting: Mutex::new(()),
            cleanup_registered: Mutex::new(false),
            this: this.clone(),
        }))
    }

    /// Reference the client gave for calling back into its transaction.
    pub fn callback(&self) -> &RemoteRef {
        self.callback.target()
    }

    /// Resources currently published for the client's coordinator.
    pub fn exported_resources(&self) -> usize {
        self.resources.lock().len()
    }

    fn resource_ref(&self, resource: &Arc<dyn TxResource>) -> Option<RemoteRef> {
        self.resources
            .lock()
            .iter()
            .find(|(r, _)| same_resource(r, resource))
            .map(|(_, reference)| reference.clone())
    }

    /// Retract published resources once the client reports an outcome.
    fn ensure_cleanup(&self) -> StoreResult<()> {
        let mut registered = self.cleanup_registered.lock();
        if *registered {
            return Ok(());
        }
        self.register_synchronization(Arc::new(ReleaseResources(self.this.clone())))?;
        *registered = true;
        Ok(())
    }

    fn release_resources(&self) {
        let resources = std::mem::take(&mut *self.resources.lock());
        for (_, reference) in resources {
            if let Err(e) = self.exporter.unexport(&reference, true) {
                warn!(txn = %self.id, %reference, error = %e, "failed to retract resource");
            }
        }
    }
}

impl Transaction for ServerTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> StoreResult<TxStatus> {
        self.callback.call_as(Call::Status, Value::expect_status)
    }

    fn enlist(&self, resource: Arc<dyn TxResource>) -> StoreResult<bool> {
        let _enlisting = self.enlisting.lock();
        if let Some(reference) = self.resource_ref(&resource) {
            return self
                .callback
                .call_as(Call::Enlist { resource: reference }, Value::expect_bool);
        }

        self.ensure_cleanup()?;
        let reference = self.exporter.export(Arc::new(ResourceSkeleton {
            resource: Arc::clone(&resource),
        }));
        match self.callback.call_as(
            Call::Enlist {
                resource: reference.clone(),
            },
            Value::expect_bool,
        ) {
            Ok(added) => {
                debug!(txn = %self.id, %reference, added, "enlisted resource");
                self.resources.lock().push((resource, reference));
                Ok(added)
            }
            Err(e) => {
                let _ = self.exporter.unexport(&reference, true);
                Err(e)
            }
        }
    }

    fn delist(&self, resource: &Arc<dyn TxResource>) -> StoreResult<bool> {
        let _enlisting = self.enlisting.lock();
        let Some(reference) = self.resource_ref(resource) else {
            return Ok(false);
        };
        let removed = self.callback.call_as(
            Call::Delist {
                resource: reference.clone(),
            },
            Value::expect_bool,
        )?;
        self.resources.lock().retain(|(r, _)| !same_resource(r, resource));
        let _ = self.exporter.unexport(&reference, true);
        Ok(removed)
    }

    fn set_rollback_only(&self) -> StoreResult<()> {
        self.callback.call_as(Call::SetRollbackOnly, Value::expect_unit)
    }

    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> StoreResult<()> {
        let skeleton = Arc::new(SyncSkeleton {
            sync,
            exporter: Arc::clone(&self.exporter),
            reference: Mutex::new(None),
        });
        let reference = self.exporter.export(skeleton.clone());
        *skeleton.reference.lock() = Some(reference.clone());
        let result = self.callback.call_as(
            Call::RegisterSynchronization {
                sync: reference.clone(),
            },
            Value::expect_unit,
        );
        if result.is_err() {
            let _ = self.exporter.unexport(&reference, true);
        }
        result
    }
}

impl std::fmt::Debug for ServerTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerTransaction")
            .field("id", &self.id)
            .field("callback", self.callback.target())
            .field("resources", &self.exported_resources())
            .finish()
    }
}

struct ReleaseResources(Weak<ServerTransaction>);

impl Synchronization for ReleaseResources {
    fn after_completion(&self, _status: TxStatus) {
        if let Some(txn) = self.0.upgrade() {
            txn.release_resources();
        }
    }
}

/// Published form of a local resource, driven by the client's coordinator.
struct ResourceSkeleton {
    resource: Arc<dyn TxResource>,
}

impl Skeleton for ResourceSkeleton {
    fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::Prepare { txn } => reply_from(self.resource.prepare(txn).map(Value::Vote)),
            Call::Commit { txn, one_phase } => {
                reply_from(self.resource.commit(txn, one_phase).map(|()| Value::Unit))
            }
            Call::Rollback { txn } => reply_from(self.resource.rollback(txn).map(|()| Value::Unit)),
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "tx-resource"
    }
}

/// Published form of a local completion hook. Retracts itself after it
/// runs; a transaction completes once.
struct SyncSkeleton {
    sync: Arc<dyn Synchronization>,
    exporter: Arc<Exporter>,
    reference: Mutex<Option<RemoteRef>>,
}

impl Skeleton for SyncSkeleton {
    fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::AfterCompletion { status } => {
                self.sync.after_completion(status);
                if let Some(reference) = self.reference.lock().take() {
                    let _ = self.exporter.unexport(&reference, true);
                }
                Reply::Ok(Value::Unit)
            }
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "tx-synchronization"
    }
}
