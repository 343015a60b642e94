use serde::{Deserialize, Serialize};

use rbs_types::{
    BlobId, CapabilitySet, ExporterConfig, RemoteRef, SessionId, TransactionId, TxStatus, Vote,
};

use crate::error::{ProtocolError, ProtocolResult};

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// A transaction in transit: its identity plus the callback reference the
/// receiving side uses to enlist resources in it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireTransaction {
    pub id: TransactionId,
    pub callback: RemoteRef,
}

/// Every method that can be invoked on an exported object.
///
/// Which calls an object answers depends on what it is; an object answers
/// any other call with a [`FaultKind::Unsupported`] fault.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Call {
    // Store
    OpenConnection { txn: Option<WireTransaction> },
    GetCapabilities,
    SetQuiescent { quiescent: bool },
    GetExporter,

    // Connection
    Exists { id: BlobId },
    Size { id: BlobId },
    OpenReader { id: BlobId },
    Put { id: Option<BlobId>, data: Vec<u8>, overwrite: bool },
    Delete { id: BlobId },
    List { prefix: Option<String> },
    Sync,
    CloseConnection,

    // Stream
    Read { max: u32 },
    CloseStream,

    // Transaction callbacks, answered by the transaction's owner
    Status,
    Enlist { resource: RemoteRef },
    Delist { resource: RemoteRef },
    SetRollbackOnly,
    RegisterSynchronization { sync: RemoteRef },

    // Resource callbacks, answered by the enlisting side
    Prepare { txn: TransactionId },
    Commit { txn: TransactionId, one_phase: bool },
    Rollback { txn: TransactionId },
    AfterCompletion { status: TxStatus },
}

impl Call {
    /// Method name, for logs and error context.
    pub fn name(&self) -> &'static str {
        match self {
            Self::OpenConnection { .. } => "open_connection",
            Self::GetCapabilities => "get_capabilities",
            Self::SetQuiescent { .. } => "set_quiescent",
            Self::GetExporter => "get_exporter",
            Self::Exists { .. } => "exists",
            Self::Size { .. } => "size",
            Self::OpenReader { .. } => "open_reader",
            Self::Put { .. } => "put",
            Self::Delete { .. } => "delete",
            Self::List { .. } => "list",
            Self::Sync => "sync",
            Self::CloseConnection => "close_connection",
            Self::Read { .. } => "read",
            Self::CloseStream => "close_stream",
            Self::Status => "status",
            Self::Enlist { .. } => "enlist",
            Self::Delist { .. } => "delist",
            Self::SetRollbackOnly => "set_rollback_only",
            Self::RegisterSynchronization { .. } => "register_synchronization",
            Self::Prepare { .. } => "prepare",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
            Self::AfterCompletion { .. } => "after_completion",
        }
    }
}

/// Successful result of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Size(Option<u64>),
    Ref(RemoteRef),
    Capabilities(CapabilitySet),
    Exporter(ExporterConfig),
    Bytes(Vec<u8>),
    BlobId(BlobId),
    BlobIds(Vec<BlobId>),
    Status(TxStatus),
    Vote(Vote),
}

macro_rules! expect_value {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        pub fn $fn_name(self, call: &'static str) -> ProtocolResult<$ty> {
            match self {
                Self::$variant(v) => Ok(v),
                other => Err(ProtocolError::UnexpectedReply {
                    call,
                    detail: format!("expected {}, got {other:?}", stringify!($variant)),
                }),
            }
        }
    };
}

impl Value {
    pub fn expect_unit(self, call: &'static str) -> ProtocolResult<()> {
        match self {
            Self::Unit => Ok(()),
            other => Err(ProtocolError::UnexpectedReply {
                call,
                detail: format!("expected Unit, got {other:?}"),
            }),
        }
    }

    expect_value!(expect_bool, Bool, bool);
    expect_value!(expect_size, Size, Option<u64>);
    expect_value!(expect_ref, Ref, RemoteRef);
    expect_value!(expect_capabilities, Capabilities, CapabilitySet);
    expect_value!(expect_exporter, Exporter, ExporterConfig);
    expect_value!(expect_bytes, Bytes, Vec<u8>);
    expect_value!(expect_blob_id, BlobId, BlobId);
    expect_value!(expect_blob_ids, BlobIds, Vec<BlobId>);
    expect_value!(expect_status, Status, TxStatus);
    expect_value!(expect_vote, Vote, Vote);
}

/// Kind of a fault, preserved across the boundary so the caller can branch on
/// it without inspecting the message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// The target does not support the requested mode or method.
    Unsupported,
    NotFound,
    AlreadyExists,
    Closed,
    Quiescent,
    Transaction,
    /// The target reference is not (or no longer) exported.
    NoSuchObject,
    /// Any other failure in the target's own operation.
    Io,
}

/// A failure reported by the remote side.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub message: String,
    /// The object the fault concerns, e.g. the missing blob id.
    pub subject: Option<String>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn unsupported_call(call: &Call) -> Self {
        Self::new(
            FaultKind::Unsupported,
            format!("{} is not supported by this object", call.name()),
        )
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)?;
        if let Some(subject) = &self.subject {
            write!(f, " ({subject})")?;
        }
        Ok(())
    }
}

/// Outcome of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    Ok(Value),
    Fault(Fault),
}

impl Reply {
    pub fn into_result(self) -> Result<Value, Fault> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Fault(f) => Err(f),
        }
    }
}

impl From<Result<Value, Fault>> for Reply {
    fn from(r: Result<Value, Fault>) -> Self {
        match r {
            Ok(v) => Self::Ok(v),
            Err(f) => Self::Fault(f),
        }
    }
}

/// Unit of exchange on a byte stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Envelope {
    Request {
        seq: u64,
        target: RemoteRef,
        call: Call,
    },
    Response {
        seq: u64,
        reply: Reply,
    },
    /// First frame on a socket: which client session the socket belongs to.
    Hello { session: SessionId, version: u32 },
}

impl Envelope {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Request { .. } => 1,
            Self::Response { .. } => 2,
            Self::Hello { .. } => 3,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "Request",
            Self::Response { .. } => "Response",
            Self::Hello { .. } => "Hello",
        }
    }

    /// Sequence number; a hello is not part of any exchange and has none.
    pub fn seq(&self) -> u64 {
        match self {
            Self::Request { seq, .. } | Self::Response { seq, .. } => *seq,
            Self::Hello { .. } => 0,
        }
    }
}
