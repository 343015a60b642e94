use std::time::Duration;

use rbs_protocol::ProtocolError;
use rbs_types::{ExporterId, ObjectNum};
use thiserror::Error;

/// Errors from retracting exported objects.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Calls are still executing on the object and the retraction was not
    /// forced.
    #[error("object {object} has {calls} call(s) in flight")]
    InFlight { object: ObjectNum, calls: usize },

    /// The reference was issued by a different exporter.
    #[error("reference belongs to exporter {owner}, not {exporter}")]
    ForeignReference {
        owner: ExporterId,
        exporter: ExporterId,
    },
}

/// Errors raised by a transport before a reply was obtained.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{endpoint} unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    #[error("no reply within {0:?}")]
    TimedOut(Duration),

    /// No attached exporter issued the target reference.
    #[error("exporter {0} is not reachable through this transport")]
    UnknownExporter(ExporterId),

    /// The exporter has no network endpoint, so peers cannot call it back.
    #[error("exporter {0} is not hosted on any endpoint")]
    NotHosted(ExporterId),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type ExportResult<T> = Result<T, ExportError>;
pub type TransportResult<T> = Result<T, TransportError>;
