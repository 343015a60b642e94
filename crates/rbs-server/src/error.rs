use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid identifier: {0}")]
    Type(#[from] rbs_types::TypeError),

    #[error("protocol error: {0}")]
    Protocol(#[from] rbs_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] rbs_store::StoreError),

    #[error("export error: {0}")]
    Export(#[from] rbs_bridge::ExportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type ServerResult<T> = Result<T, ServerError>;
