use std::fmt;
use std::sync::Arc;

use rbs_protocol::{Call, ProtocolResult, Reply, Value};
use rbs_store::StoreResult;
use rbs_types::RemoteRef;

use crate::fault::{from_fault, from_protocol, from_transport};
use crate::transport::Transport;

/// A reference plus the transport used to reach it.
///
/// Every failure comes back as a [`rbs_store::StoreError`] naming the
/// operation and the target.
#[derive(Clone)]
pub struct RemoteHandle {
    target: RemoteRef,
    transport: Arc<dyn Transport>,
}

impl RemoteHandle {
    pub fn new(target: RemoteRef, transport: Arc<dyn Transport>) -> Self {
        Self { target, transport }
    }

    pub fn target(&self) -> &RemoteRef {
        &self.target
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Handle to another reference over the same transport.
    pub fn sibling(&self, target: RemoteRef) -> Self {
        Self::new(target, Arc::clone(&self.transport))
    }

    pub fn call(&self, call: Call) -> StoreResult<Value> {
        let op = call.name();
        match self.transport.invoke(&self.target, call) {
            Ok(Reply::Ok(value)) => Ok(value),
            Ok(Reply::Fault(fault)) => Err(from_fault(op, &self.target, fault)),
            Err(e) => Err(from_transport(op, &self.target, e)),
        }
    }

    /// Call and extract the expected reply variant.
    pub fn call_as<T>(
        &self,
        call: Call,
        extract: fn(Value, &'static str) -> ProtocolResult<T>,
    ) -> StoreResult<T> {
        let op = call.name();
        let value = self.call(call)?;
        extract(value, op).map_err(|e| from_protocol(op, &self.target, e))
    }
}

impl fmt::Debug for RemoteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RemoteHandle").field(&self.target).finish()
    }
}
