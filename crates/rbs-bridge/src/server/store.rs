use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use rbs_protocol::{Call, Fault, Reply, Value, WireTransaction};
use rbs_store::{BlobStore, StoreResult, StreamManager, Transaction};
use rbs_types::{CapabilitySet, ExporterConfig, RemoteRef, StoreId};
use tracing::{debug, info, warn};

use crate::error::ExportResult;
use crate::exporter::{Exporter, Skeleton};
use crate::fault::reply_from;
use crate::server::connection::ServerConnection;
use crate::server::transaction::ServerTransaction;
use crate::transport::Transport;

/// Published form of a local blob store.
///
/// Incoming transactions are rebuilt as [`ServerTransaction`]s that call back
/// to the client. Each connection it opens is published through the same
/// exporter and tracked so [`unexport`](Self::unexport) can tear them down.
pub struct ServerStore {
    store: Arc<dyn BlobStore>,
    exporter: Arc<Exporter>,
    transport: Arc<dyn Transport>,
    streams: StreamManager,
    connections: Mutex<Vec<Weak<ServerConnection>>>,
    reference: Mutex<Option<RemoteRef>>,
}

impl ServerStore {
    /// Serve `store` through `exporter`. `transport` carries callbacks into
    /// clients' transactions.
    pub fn new(
        store: Arc<dyn BlobStore>,
        exporter: Arc<Exporter>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            exporter,
            transport,
            streams: StreamManager::new(),
            connections: Mutex::new(Vec::new()),
            reference: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &StoreId {
        self.store.id()
    }

    pub fn exporter(&self) -> &Arc<Exporter> {
        &self.exporter
    }

    /// Stream registry shared by all connections of this store.
    pub fn stream_manager(&self) -> &StreamManager {
        &self.streams
    }

    /// Reference clients use to reach this store. Publishes the store on
    /// first use; later calls return the same reference.
    pub fn exported(self: &Arc<Self>) -> RemoteRef {
        let reference = self.exporter.export(Arc::clone(self) as Arc<dyn Skeleton>);
        let mut slot = self.reference.lock();
        if slot.is_none() {
            info!(store = %self.id(), %reference, "store exported");
        }
        *slot = Some(reference.clone());
        reference
    }

    /// Open a local connection in the transaction described by `txn`.
    pub fn open_connection(
        &self,
        txn: Option<WireTransaction>,
    ) -> StoreResult<Arc<ServerConnection>> {
        let txn = ServerTransaction::unwrap(txn, &self.exporter, &self.transport);
        let local = self
            .store
            .open_connection(txn.clone().map(|t| t as Arc<dyn Transaction>))?;
        let conn = ServerConnection::new(
            local,
            Arc::clone(&self.exporter),
            self.streams.clone(),
            txn,
        );
        let mut connections = self.connections.lock();
        connections.retain(|c| c.upgrade().is_some_and(|c| !c.is_closed()));
        connections.push(Arc::downgrade(&conn));
        debug!(store = %self.id(), open = connections.len(), "connection opened");
        Ok(conn)
    }

    pub fn capabilities(&self) -> CapabilitySet {
        self.store.capabilities()
    }

    pub fn set_quiescent(&self, quiescent: bool) -> StoreResult<bool> {
        self.store.set_quiescent(quiescent)
    }

    /// Settings a client needs to build a compatible callback exporter.
    pub fn exporter_config(&self) -> ExporterConfig {
        self.exporter.config().clone()
    }

    /// Connections opened through this store that are still open.
    pub fn open_connections(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| !c.is_closed())
            .count()
    }

    /// Close every open connection and retract the store's reference.
    ///
    /// Without `force` the store is left exported if a call on it is still
    /// running.
    pub fn unexport(&self, force: bool) -> ExportResult<()> {
        let reference = self.reference.lock().take();
        if let Some(reference) = reference {
            if let Err(e) = self.exporter.unexport(&reference, force) {
                *self.reference.lock() = Some(reference);
                return Err(e);
            }
        }
        let connections = std::mem::take(&mut *self.connections.lock());
        for conn in connections.iter().filter_map(Weak::upgrade) {
            if let Err(e) = conn.close() {
                warn!(store = %self.id(), error = %e, "connection failed to close on unexport");
            }
        }
        info!(store = %self.id(), "store unexported");
        Ok(())
    }
}

impl Skeleton for ServerStore {
    fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::OpenConnection { txn } => {
                reply_from(self.open_connection(txn).map(|c| Value::Ref(c.publish())))
            }
            Call::GetCapabilities => Reply::Ok(Value::Capabilities(self.capabilities())),
            Call::SetQuiescent { quiescent } => {
                reply_from(self.set_quiescent(quiescent).map(Value::Bool))
            }
            Call::GetExporter => Reply::Ok(Value::Exporter(self.exporter_config())),
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "store"
    }
}

impl std::fmt::Debug for ServerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerStore")
            .field("id", self.id())
            .field("exporter", &self.exporter.id())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use rbs_store::{
        BlobReader, BlobStoreConnection, InMemoryBlobStore, InMemoryStoreConfig, StoreError,
    };
    use rbs_types::{capabilities, BlobId, TransactionId};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose connections are a fixed recording stub.
    struct StubStore {
        id: StoreId,
        conn: Arc<StubConnection>,
        quiescent: AtomicBool,
    }

    struct StubConnection {
        id: StoreId,
        closed: AtomicBool,
    }

    impl BlobStore for StubStore {
        fn id(&self) -> &StoreId {
            &self.id
        }

        fn open_connection(
            &self,
            txn: Option<Arc<dyn Transaction>>,
        ) -> StoreResult<Arc<dyn BlobStoreConnection>> {
            if txn.is_none() {
                return Err(StoreError::Unsupported("transaction required".into()));
            }
            Ok(self.conn.clone())
        }

        fn capabilities(&self) -> CapabilitySet {
            [capabilities::TXN].into_iter().collect()
        }

        fn set_quiescent(&self, quiescent: bool) -> StoreResult<bool> {
            Ok(self.quiescent.swap(quiescent, Ordering::AcqRel))
        }
    }

    impl BlobStoreConnection for StubConnection {
        fn store_id(&self) -> &StoreId {
            &self.id
        }
        fn exists(&self, _id: &BlobId) -> StoreResult<bool> {
            Ok(false)
        }
        fn size(&self, _id: &BlobId) -> StoreResult<Option<u64>> {
            Ok(None)
        }
        fn open_reader(&self, id: &BlobId) -> StoreResult<Box<dyn BlobReader>> {
            Err(StoreError::NotFound(id.clone()))
        }
        fn put(&self, _id: Option<&BlobId>, _data: &[u8], _overwrite: bool) -> StoreResult<BlobId> {
            Err(StoreError::Unsupported("read-only".into()))
        }
        fn delete(&self, _id: &BlobId) -> StoreResult<bool> {
            Ok(false)
        }
        fn list(&self, _prefix: Option<&str>) -> StoreResult<Vec<BlobId>> {
            Ok(Vec::new())
        }
        fn sync(&self) -> StoreResult<()> {
            Ok(())
        }
        fn close(&self) -> StoreResult<()> {
            self.closed.store(true, Ordering::Release);
            Ok(())
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    fn stub_server() -> (Arc<ServerStore>, Arc<StubConnection>, Arc<Exporter>) {
        let id = StoreId::parse("urn:store:stub").unwrap();
        let conn = Arc::new(StubConnection {
            id: id.clone(),
            closed: AtomicBool::new(false),
        });
        let store = Arc::new(StubStore {
            id,
            conn: conn.clone(),
            quiescent: AtomicBool::new(false),
        });
        let exporter = Exporter::new(ExporterConfig::default());
        let transport = LoopbackTransport::new();
        let server = ServerStore::new(store, exporter.clone(), transport);
        (server, conn, exporter)
    }

    fn wire_txn(exporter: &Exporter) -> WireTransaction {
        // The callback is never invoked by the stub store.
        WireTransaction {
            id: TransactionId::new(),
            callback: RemoteRef::new(exporter.id(), rbs_types::ObjectNum(u64::MAX), None),
        }
    }

    #[test]
    fn open_without_transaction_is_unsupported() {
        let (server, _conn, _exporter) = stub_server();
        let err = server.open_connection(None).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn open_with_transaction_wraps_the_local_connection() {
        let (server, conn, exporter) = stub_server();
        let served = server.open_connection(Some(wire_txn(&exporter))).unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(served.connection()) as *const (),
            Arc::as_ptr(&conn) as *const (),
        ));
        assert!(served.transaction().is_some());
        assert_eq!(server.open_connections(), 1);
    }

    #[test]
    fn capabilities_pass_through() {
        let (server, _conn, _exporter) = stub_server();
        assert!(server.capabilities().supports(capabilities::TXN));
    }

    #[test]
    fn set_quiescent_pass_through() {
        let (server, _conn, _exporter) = stub_server();
        assert!(!server.set_quiescent(true).unwrap());
        assert!(server.set_quiescent(false).unwrap());
    }

    #[test]
    fn exported_is_stable() {
        let (server, _conn, exporter) = stub_server();
        let a = server.exported();
        let b = server.exported();
        assert_eq!(a, b);
        assert!(exporter.is_exported(&a));
    }

    #[test]
    fn unsupported_fault_over_dispatch() {
        let (server, _conn, exporter) = stub_server();
        let r = server.exported();
        match exporter.dispatch(r.object, Call::OpenConnection { txn: None }) {
            Reply::Fault(f) => assert_eq!(f.kind, rbs_protocol::FaultKind::Unsupported),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn exporter_config_is_served() {
        let (server, _conn, exporter) = stub_server();
        let r = server.exported();
        assert_eq!(
            exporter.dispatch(r.object, Call::GetExporter),
            Reply::Ok(Value::Exporter(ExporterConfig::default()))
        );
    }

    #[test]
    fn unexport_closes_open_connections() {
        let (server, conn, exporter) = stub_server();
        let r = server.exported();
        let served = server.open_connection(Some(wire_txn(&exporter))).unwrap();
        let conn_ref = served.publish();
        server.unexport(false).unwrap();
        assert!(conn.is_closed());
        assert!(served.is_closed());
        assert!(!exporter.is_exported(&r));
        assert!(!exporter.is_exported(&conn_ref));
        assert_eq!(server.open_connections(), 0);
    }

    #[test]
    fn in_memory_store_without_transactions() {
        let store = Arc::new(InMemoryBlobStore::new(
            StoreId::parse("urn:store:mem").unwrap(),
            InMemoryStoreConfig::non_transactional(),
        ));
        let exporter = Exporter::new(ExporterConfig::default());
        let server = ServerStore::new(store, exporter.clone(), LoopbackTransport::new());
        let conn = server.open_connection(None).unwrap();
        let r = conn.publish();
        let reply = exporter.dispatch(
            r.object,
            Call::Put {
                id: None,
                data: b"abc".to_vec(),
                overwrite: false,
            },
        );
        let id = match reply {
            Reply::Ok(Value::BlobId(id)) => id,
            other => panic!("unexpected reply: {other:?}"),
        };
        assert_eq!(
            exporter.dispatch(r.object, Call::Size { id }),
            Reply::Ok(Value::Size(Some(3)))
        );
        assert_eq!(
            exporter.dispatch(r.object, Call::CloseConnection),
            Reply::Ok(Value::Unit)
        );
        assert!(!exporter.is_exported(&r));
    }
}
