//! Wire protocol for the remote blob store bridge.
//!
//! Defines the remote-callable surface ([`Call`]), its results ([`Reply`],
//! [`Value`]), the typed [`Fault`] that carries an error's kind across the
//! boundary, and the framing used to put [`Envelope`]s on a byte stream.

pub mod codec;
pub mod error;
pub mod message;

pub use codec::{FrameCodec, HEADER_LEN};
pub use error::{ProtocolError, ProtocolResult};
pub use message::{
    Call, Envelope, Fault, FaultKind, Reply, Value, WireTransaction, MAX_MESSAGE_SIZE,
    PROTOCOL_VERSION,
};
