use std::sync::atomic::{AtomicBool, Ordering};

use rbs_protocol::{Call, Value};
use rbs_store::{
    BlobReader, BlobStoreConnection, StoreError, StoreResult, StreamManager, StreamOwner,
};
use rbs_types::{BlobId, StoreId};
use tracing::debug;

use crate::client::stream::ClientInputStream;
use crate::remote::RemoteHandle;

/// Client-side proxy for a connection opened on the server.
///
/// Streams it opens are registered with the owning store's stream manager
/// and closed when the connection closes.
pub struct ClientConnection {
    store_id: StoreId,
    remote: RemoteHandle,
    streams: StreamManager,
    owner: StreamOwner,
    closed: AtomicBool,
}

impl ClientConnection {
    pub(crate) fn new(store_id: StoreId, remote: RemoteHandle, streams: StreamManager) -> Self {
        let owner = streams.new_owner();
        Self {
            store_id,
            remote,
            streams,
            owner,
            closed: AtomicBool::new(false),
        }
    }

    /// Streams opened through this connection that are still open.
    pub fn open_streams(&self) -> usize {
        self.streams.open_count_for(self.owner)
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl BlobStoreConnection for ClientConnection {
    fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    fn exists(&self, id: &BlobId) -> StoreResult<bool> {
        self.ensure_open()?;
        self.remote
            .call_as(Call::Exists { id: id.clone() }, Value::expect_bool)
    }

    fn size(&self, id: &BlobId) -> StoreResult<Option<u64>> {
        self.ensure_open()?;
        self.remote
            .call_as(Call::Size { id: id.clone() }, Value::expect_size)
    }

    fn open_reader(&self, id: &BlobId) -> StoreResult<Box<dyn BlobReader>> {
        self.ensure_open()?;
        let reference = self
            .remote
            .call_as(Call::OpenReader { id: id.clone() }, Value::expect_ref)?;
        let raw = ClientInputStream::new(self.remote.sibling(reference));
        let stream = self.streams.new_stream(self.owner, Box::new(raw));
        // A close that swept this owner before the stream was registered.
        if self.is_closed() {
            let _ = stream.close();
            return Err(StoreError::Closed);
        }
        debug!(stream = %stream.id(), blob = %id, "opened remote stream");
        Ok(Box::new(stream))
    }

    fn put(&self, id: Option<&BlobId>, data: &[u8], overwrite: bool) -> StoreResult<BlobId> {
        self.ensure_open()?;
        self.remote.call_as(
            Call::Put {
                id: id.cloned(),
                data: data.to_vec(),
                overwrite,
            },
            Value::expect_blob_id,
        )
    }

    fn delete(&self, id: &BlobId) -> StoreResult<bool> {
        self.ensure_open()?;
        self.remote
            .call_as(Call::Delete { id: id.clone() }, Value::expect_bool)
    }

    fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<BlobId>> {
        self.ensure_open()?;
        self.remote.call_as(
            Call::List {
                prefix: prefix.map(str::to_owned),
            },
            Value::expect_blob_ids,
        )
    }

    fn sync(&self) -> StoreResult<()> {
        self.ensure_open()?;
        self.remote.call_as(Call::Sync, Value::expect_unit)
    }

    /// Close this connection's streams, then the remote connection.
    ///
    /// Every stream is visited even if some fail; a remote close failure
    /// takes precedence over stream failures in the returned error.
    fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let streams = self.streams.close_owner(self.owner);
        self.remote
            .call_as(Call::CloseConnection, Value::expect_unit)?;
        streams
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("store", &self.store_id)
            .field("remote", self.remote.target())
            .field("open_streams", &self.open_streams())
            .finish()
    }
}
