//! Server half of the bridge: publishes local objects for remote callers.

mod connection;
mod store;
mod stream;
mod transaction;

pub use connection::ServerConnection;
pub use store::ServerStore;
pub use stream::{ServerInputStream, MAX_READ_CHUNK};
pub use transaction::ServerTransaction;
