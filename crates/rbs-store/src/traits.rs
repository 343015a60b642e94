use std::io::{self, Read};
use std::sync::Arc;

use rbs_types::{BlobId, CapabilitySet, StoreId, TransactionId, TxStatus, Vote};

use crate::error::StoreResult;

/// A readable blob stream with an explicit close.
///
/// Closing releases whatever the stream holds (a file handle, a remote
/// reference). Dropping without closing is allowed but leaves that to the
/// owner's bulk teardown.
pub trait BlobReader: Read + Send {
    fn close(&mut self) -> io::Result<()>;
}

/// Top-level blob store.
///
/// Implementations must satisfy these invariants:
/// - `id()` is fixed at construction.
/// - `open_connection(None)` means "no transaction", never "empty transaction".
/// - A mode the store cannot honour fails with `StoreError::Unsupported`.
pub trait BlobStore: Send + Sync {
    fn id(&self) -> &StoreId;

    /// Open a connection, optionally enlisted in `txn`.
    fn open_connection(
        &self,
        txn: Option<Arc<dyn Transaction>>,
    ) -> StoreResult<Arc<dyn BlobStoreConnection>>;

    /// Capability URIs this store advertises.
    fn capabilities(&self) -> CapabilitySet;

    /// Enter or leave quiescent mode. Returns the previous value.
    fn set_quiescent(&self, quiescent: bool) -> StoreResult<bool>;
}

/// A session against a blob store.
pub trait BlobStoreConnection: Send + Sync {
    fn store_id(&self) -> &StoreId;

    fn exists(&self, id: &BlobId) -> StoreResult<bool>;

    /// Size in bytes, or `None` if the blob does not exist.
    fn size(&self, id: &BlobId) -> StoreResult<Option<u64>>;

    /// Open a stream over the blob's content.
    fn open_reader(&self, id: &BlobId) -> StoreResult<Box<dyn BlobReader>>;

    /// Write a blob and return its id.
    ///
    /// With `id == None` the store generates one (see
    /// `capabilities::GENERATE_ID`). With `overwrite == false` an existing
    /// blob yields `StoreError::AlreadyExists`.
    fn put(&self, id: Option<&BlobId>, data: &[u8], overwrite: bool) -> StoreResult<BlobId>;

    /// Delete a blob. Returns `true` if it existed.
    fn delete(&self, id: &BlobId) -> StoreResult<bool>;

    /// List blob ids, optionally restricted to those starting with `prefix`.
    fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<BlobId>>;

    /// Flush buffered state to the backing store.
    fn sync(&self) -> StoreResult<()>;

    /// Close the connection. Further operations fail with `StoreError::Closed`.
    fn close(&self) -> StoreResult<()>;

    fn is_closed(&self) -> bool;
}

/// A transaction a connection can participate in.
pub trait Transaction: Send + Sync {
    fn id(&self) -> TransactionId;

    fn status(&self) -> StoreResult<TxStatus>;

    /// Add a resource to the transaction. Returns `false` if already enlisted.
    fn enlist(&self, resource: Arc<dyn TxResource>) -> StoreResult<bool>;

    /// Remove a resource. Returns `false` if it was not enlisted.
    fn delist(&self, resource: &Arc<dyn TxResource>) -> StoreResult<bool>;

    fn set_rollback_only(&self) -> StoreResult<()>;

    /// Register a hook run once the transaction reaches its outcome.
    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> StoreResult<()>;
}

/// A participant in two-phase commit.
pub trait TxResource: Send + Sync {
    fn prepare(&self, txn: TransactionId) -> StoreResult<Vote>;

    /// Make changes durable. `one_phase` is set when prepare was skipped.
    fn commit(&self, txn: TransactionId, one_phase: bool) -> StoreResult<()>;

    fn rollback(&self, txn: TransactionId) -> StoreResult<()>;
}

/// Completion hook.
pub trait Synchronization: Send + Sync {
    fn after_completion(&self, status: TxStatus);
}

/// Identity comparison for enlisted resources.
///
/// Compares data pointers only, so two `Arc`s to one object match even when
/// their vtable pointers differ.
pub fn same_resource(a: &Arc<dyn TxResource>, b: &Arc<dyn TxResource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
