//! Blob store contract shared by both sides of the bridge.
//!
//! The traits in [`traits`] are the operational contract a caller programs
//! against, whether the store lives in-process or behind a remote proxy. The
//! bridge implements them on the client side and consumes them on the server
//! side.
//!
//! # Contents
//!
//! - [`BlobStore`], [`BlobStoreConnection`], [`BlobReader`] -- blob access
//! - [`Transaction`], [`TxResource`], [`Synchronization`] -- transaction participation
//! - [`StreamManager`], [`ManagedStream`], [`CloseListener`] -- stream lifecycle tracking
//! - [`LocalTransaction`] -- in-process two-phase coordinator
//! - [`InMemoryBlobStore`] -- `BTreeMap`-backed store for tests and embedding
//!
//! # Design Rules
//!
//! 1. Unsupported modes fail with [`StoreError::Unsupported`], never a generic error.
//! 2. Every stream handed to a caller can be force-closed by its owner.
//! 3. Closing a managed stream notifies its listeners exactly once.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod memory;
pub mod stream;
pub mod traits;
pub mod txn;

pub use error::{StoreError, StoreResult, StreamCloseFailure};
pub use memory::{InMemoryBlobStore, InMemoryStoreConfig};
pub use stream::{CloseListener, ManagedStream, StreamId, StreamManager, StreamOwner};
pub use traits::{
    same_resource, BlobReader, BlobStore, BlobStoreConnection, Synchronization, Transaction,
    TxResource,
};
pub use txn::LocalTransaction;
