//! Remote access bridge for blob stores.
//!
//! A server publishes a local [`rbs_store::BlobStore`] through an
//! [`Exporter`] as a [`ServerStore`]; a client reaches it through a
//! [`Transport`] as a [`ClientStore`], which implements the same contract as
//! the local store.
//!
//! # Object model
//!
//! Every remotely callable object is a [`Skeleton`] published under a
//! [`rbs_types::RemoteRef`]. Connections, streams, transaction resources, and
//! completion hooks are published on demand and retracted when they close or
//! complete.
//!
//! # Transactions
//!
//! The client publishes its transaction as a [`ClientTransaction`]. The
//! server sees it as a [`ServerTransaction`] and enlists its resources by
//! publishing them back, so the client's coordinator drives the server's
//! resources through two-phase commit.
//!
//! # Failures
//!
//! Remote faults keep their kind across the boundary (see [`fault`]). A
//! store that cannot honour a mode still fails with
//! [`rbs_store::StoreError::Unsupported`] on the client; transport failures
//! surface as [`rbs_store::StoreError::Unreachable`] or
//! [`rbs_store::StoreError::TimedOut`].

pub mod client;
pub mod error;
pub mod exporter;
pub mod fault;
pub mod remote;
pub mod server;
pub mod transport;

pub use client::{ClientConnection, ClientInputStream, ClientStore, ClientTransaction};
pub use error::{ExportError, ExportResult, TransportError, TransportResult};
pub use exporter::{Exporter, Skeleton};
pub use remote::RemoteHandle;
pub use server::{ServerConnection, ServerInputStream, ServerStore, ServerTransaction};
pub use transport::{LoopbackTransport, Transport};
