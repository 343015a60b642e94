//! Client half of the bridge: local proxies for a remote store.

mod connection;
mod store;
mod stream;
mod transaction;

pub use connection::ClientConnection;
pub use store::ClientStore;
pub use stream::ClientInputStream;
pub use transaction::ClientTransaction;
