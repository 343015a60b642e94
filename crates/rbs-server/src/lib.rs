//! TCP hosting for the remote blob store bridge.
//!
//! [`RpcServer`] answers framed calls for any exporter it hosts, and
//! [`TcpTransport`] is the blocking client side of the same protocol.
//! [`StoreHost`] ties them to a [`rbs_bridge::ServerStore`] so a store can
//! be published from a config file and reached through a ticket.

pub mod config;
pub mod error;
pub mod host;
pub mod server;
pub mod telemetry;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use host::StoreHost;
pub use server::{RpcServer, DEFAULT_SESSION_GRACE};
pub use telemetry::init_tracing;
pub use transport::TcpTransport;
