//! Foundation types for the remote blob store bridge.
//!
//! Every other `rbs` crate depends on `rbs-types`. The types here cross the
//! process boundary, so all of them are `serde`-serializable.
//!
//! # Key Types
//!
//! - [`StoreId`] -- URI identifying a store instance
//! - [`BlobId`] -- URI identifying a blob within a store
//! - [`CapabilitySet`] -- set of capability URIs advertised by a store
//! - [`RemoteRef`] -- handle to an object published by an exporter
//! - [`ExporterConfig`] -- settings a peer can adopt to build its own exporter
//! - [`TransactionId`] -- UUID v7 identity of a distributed transaction

pub mod capability;
pub mod error;
pub mod id;
pub mod remote;
pub mod txn;

pub use capability::{capabilities, CapabilitySet};
pub use error::TypeError;
pub use id::{BlobId, StoreId};
pub use remote::{ExporterConfig, ExporterId, ObjectNum, RemoteRef, SessionId};
pub use txn::{TransactionId, TxStatus, Vote};
