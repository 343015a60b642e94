use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rbs_protocol::{Call, Fault, Reply, Value};
use rbs_store::{BlobStoreConnection, StoreError, StoreResult, StreamManager, StreamOwner};
use rbs_types::{BlobId, RemoteRef};
use tracing::{debug, warn};

use crate::exporter::{Exporter, Skeleton};
use crate::fault::reply_from;
use crate::server::stream::PublishedStreams;
use crate::server::transaction::ServerTransaction;

/// Published form of a local connection.
///
/// Streams opened through it are registered with the server's stream manager
/// under this connection's owner key, and are closed before the local
/// connection when the connection closes.
pub struct ServerConnection {
    connection: Arc<dyn BlobStoreConnection>,
    exporter: Arc<Exporter>,
    streams: StreamManager,
    owner: StreamOwner,
    published: Arc<PublishedStreams>,
    txn: Option<Arc<ServerTransaction>>,
    reference: Mutex<Option<RemoteRef>>,
    closed: AtomicBool,
}

impl ServerConnection {
    pub(crate) fn new(
        connection: Arc<dyn BlobStoreConnection>,
        exporter: Arc<Exporter>,
        streams: StreamManager,
        txn: Option<Arc<ServerTransaction>>,
    ) -> Arc<Self> {
        let owner = streams.new_owner();
        let published = PublishedStreams::new(Arc::clone(&exporter));
        Arc::new(Self {
            connection,
            exporter,
            streams,
            owner,
            published,
            txn,
            reference: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// The local connection being served.
    pub fn connection(&self) -> &Arc<dyn BlobStoreConnection> {
        &self.connection
    }

    /// Transaction the connection was opened in, if any.
    pub fn transaction(&self) -> Option<&Arc<ServerTransaction>> {
        self.txn.as_ref()
    }

    /// Publish this connection. Idempotent.
    pub fn publish(self: &Arc<Self>) -> RemoteRef {
        let reference = self.exporter.export(Arc::clone(self) as Arc<dyn Skeleton>);
        *self.reference.lock() = Some(reference.clone());
        reference
    }

    pub fn open_streams(&self) -> usize {
        self.streams.open_count_for(self.owner)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn open_reader(&self, id: &BlobId) -> StoreResult<RemoteRef> {
        let raw = self.connection.open_reader(id)?;
        let stream =
            self.streams
                .new_stream_with_listener(self.owner, raw, self.published.clone());
        let reference = self.published.publish(stream.clone());
        // A close that swept this owner before the stream was registered.
        if self.is_closed() {
            let _ = stream.close();
            return Err(StoreError::Closed);
        }
        debug!(stream = %stream.id(), blob = %id, "serving stream");
        Ok(reference)
    }

    /// Close this connection's streams, then the local connection, then
    /// retract the connection's reference. Repeated calls are no-ops.
    ///
    /// Stream close failures are logged; the connection still closes.
    pub fn close(&self) -> StoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.streams.close_owner(self.owner) {
            warn!(error = %e, "streams failed to close with their connection");
        }
        let result = self.connection.close();
        let reference = self.reference.lock().take();
        if let Some(reference) = reference {
            // May run inside this connection's own call.
            if let Err(e) = self.exporter.unexport(&reference, true) {
                warn!(%reference, error = %e, "failed to retract connection");
            }
        }
        result
    }
}

impl Skeleton for ServerConnection {
    fn dispatch(&self, call: Call) -> Reply {
        let conn = &self.connection;
        match call {
            Call::Exists { id } => reply_from(conn.exists(&id).map(Value::Bool)),
            Call::Size { id } => reply_from(conn.size(&id).map(Value::Size)),
            Call::OpenReader { id } => reply_from(self.open_reader(&id).map(Value::Ref)),
            Call::Put {
                id,
                data,
                overwrite,
            } => reply_from(conn.put(id.as_ref(), &data, overwrite).map(Value::BlobId)),
            Call::Delete { id } => reply_from(conn.delete(&id).map(Value::Bool)),
            Call::List { prefix } => {
                reply_from(conn.list(prefix.as_deref()).map(Value::BlobIds))
            }
            Call::Sync => reply_from(conn.sync().map(|()| Value::Unit)),
            Call::CloseConnection => reply_from(self.close().map(|()| Value::Unit)),
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "connection"
    }

    fn release(&self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "abandoned connection failed to close");
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("store", self.connection.store_id())
            .field("owner", &self.owner.0)
            .field("open_streams", &self.open_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbs_protocol::FaultKind;
    use rbs_store::{BlobReader, BlobStore, InMemoryBlobStore, InMemoryStoreConfig};
    use rbs_types::{ExporterConfig, StoreId};
    use std::sync::Weak;

    /// Delegates to an in-memory connection, but closes the serving
    /// connection while a reader is being opened.
    struct ClosesWhileOpening {
        inner: Arc<dyn BlobStoreConnection>,
        served: Mutex<Weak<ServerConnection>>,
    }

    impl BlobStoreConnection for ClosesWhileOpening {
        fn store_id(&self) -> &StoreId {
            self.inner.store_id()
        }
        fn exists(&self, id: &BlobId) -> StoreResult<bool> {
            self.inner.exists(id)
        }
        fn size(&self, id: &BlobId) -> StoreResult<Option<u64>> {
            self.inner.size(id)
        }
        fn open_reader(&self, id: &BlobId) -> StoreResult<Box<dyn BlobReader>> {
            let reader = self.inner.open_reader(id)?;
            let served = self.served.lock().upgrade();
            if let Some(served) = served {
                served.close()?;
            }
            Ok(reader)
        }
        fn put(&self, id: Option<&BlobId>, data: &[u8], overwrite: bool) -> StoreResult<BlobId> {
            self.inner.put(id, data, overwrite)
        }
        fn delete(&self, id: &BlobId) -> StoreResult<bool> {
            self.inner.delete(id)
        }
        fn list(&self, prefix: Option<&str>) -> StoreResult<Vec<BlobId>> {
            self.inner.list(prefix)
        }
        fn sync(&self) -> StoreResult<()> {
            self.inner.sync()
        }
        fn close(&self) -> StoreResult<()> {
            self.inner.close()
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    #[test]
    fn reader_opened_during_close_does_not_outlive_the_connection() {
        let store = InMemoryBlobStore::new(
            StoreId::parse("urn:store:racing").unwrap(),
            InMemoryStoreConfig::non_transactional(),
        );
        let inner = store.open_connection(None).unwrap();
        let id = inner.put(None, b"late", false).unwrap();
        let wrapper = Arc::new(ClosesWhileOpening {
            inner,
            served: Mutex::new(Weak::new()),
        });

        let exporter = Exporter::new(ExporterConfig::default());
        let streams = StreamManager::new();
        let served = ServerConnection::new(wrapper.clone(), exporter.clone(), streams.clone(), None);
        *wrapper.served.lock() = Arc::downgrade(&served);
        let reference = served.publish();

        match exporter.dispatch(reference.object, Call::OpenReader { id }) {
            Reply::Fault(fault) => assert_eq!(fault.kind, FaultKind::Closed),
            other => panic!("expected a closed fault, got {other:?}"),
        }
        assert!(served.is_closed());
        assert_eq!(streams.open_count(), 0);
        assert_eq!(exporter.exported_count(), 0);
    }
}
