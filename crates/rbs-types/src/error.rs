use thiserror::Error;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("invalid URI {uri:?}: {reason}")]
    InvalidUri { uri: String, reason: &'static str },

    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("invalid ticket: {0}")]
    InvalidTicket(String),
}
