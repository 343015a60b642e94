//! Conversions between local store errors and wire faults.
//!
//! The fault kind survives the boundary, so a caller on the far side can
//! still tell "unsupported" from "not found" from a plain I/O failure.

use rbs_protocol::{Fault, FaultKind, ProtocolError, Reply, Value};
use rbs_store::{StoreError, StoreResult};
use rbs_types::{BlobId, RemoteRef};

use crate::error::TransportError;

/// Describe a local failure for the caller on the other side.
pub fn to_fault(err: &StoreError) -> Fault {
    match err {
        StoreError::Unsupported(msg) => Fault::new(FaultKind::Unsupported, msg.clone()),
        StoreError::NotFound(id) => {
            Fault::new(FaultKind::NotFound, err.to_string()).with_subject(id.as_str())
        }
        StoreError::AlreadyExists(id) => {
            Fault::new(FaultKind::AlreadyExists, err.to_string()).with_subject(id.as_str())
        }
        StoreError::Closed => Fault::new(FaultKind::Closed, err.to_string()),
        StoreError::Quiescent => Fault::new(FaultKind::Quiescent, err.to_string()),
        StoreError::Transaction(msg) => Fault::new(FaultKind::Transaction, msg.clone()),
        // Stream ids are local to this side; only the summary travels.
        StoreError::PartialTeardown(_)
        | StoreError::Unreachable { .. }
        | StoreError::TimedOut { .. }
        | StoreError::Remote { .. }
        | StoreError::Io(_) => Fault::new(FaultKind::Io, err.to_string()),
    }
}

/// Wrap the outcome of a local operation as a reply.
pub fn reply_from(result: StoreResult<Value>) -> Reply {
    match result {
        Ok(value) => Reply::Ok(value),
        Err(e) => Reply::Fault(to_fault(&e)),
    }
}

/// Rebuild the local error a remote fault stands for.
pub fn from_fault(op: &'static str, target: &RemoteRef, fault: Fault) -> StoreError {
    let subject_id = || fault.subject.as_deref().and_then(|s| BlobId::parse(s).ok());
    match fault.kind {
        FaultKind::Unsupported => StoreError::Unsupported(fault.message),
        FaultKind::NotFound => match subject_id() {
            Some(id) => StoreError::NotFound(id),
            None => remote(op, target, fault.message),
        },
        FaultKind::AlreadyExists => match subject_id() {
            Some(id) => StoreError::AlreadyExists(id),
            None => remote(op, target, fault.message),
        },
        FaultKind::Closed => StoreError::Closed,
        FaultKind::Quiescent => StoreError::Quiescent,
        FaultKind::Transaction => StoreError::Transaction(fault.message),
        FaultKind::NoSuchObject | FaultKind::Io => remote(op, target, fault.message),
    }
}

/// Map a transport failure, keeping connectivity problems distinguishable.
pub fn from_transport(op: &'static str, target: &RemoteRef, err: TransportError) -> StoreError {
    match err {
        TransportError::Unreachable { reason, .. } => StoreError::Unreachable {
            op,
            target: target.to_string(),
            reason,
        },
        TransportError::UnknownExporter(_) | TransportError::NotHosted(_) => {
            StoreError::Unreachable {
                op,
                target: target.to_string(),
                reason: err.to_string(),
            }
        }
        TransportError::TimedOut(_) => StoreError::TimedOut {
            op,
            target: target.to_string(),
        },
        TransportError::Protocol(e) => from_protocol(op, target, e),
    }
}

pub fn from_protocol(op: &'static str, target: &RemoteRef, err: ProtocolError) -> StoreError {
    remote(op, target, format!("protocol error: {err}"))
}

fn remote(op: &'static str, target: &RemoteRef, message: String) -> StoreError {
    StoreError::Remote {
        op,
        target: target.to_string(),
        message,
    }
}
