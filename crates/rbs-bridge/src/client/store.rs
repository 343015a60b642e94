use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rbs_protocol::{Call, Value};
use rbs_store::{BlobStore, BlobStoreConnection, StoreResult, StreamManager, Transaction};
use rbs_types::{CapabilitySet, RemoteRef, StoreId};
use tracing::{debug, warn};

use crate::client::connection::ClientConnection;
use crate::client::transaction::ClientTransaction;
use crate::exporter::Exporter;
use crate::remote::RemoteHandle;
use crate::transport::Transport;

/// A [`BlobStore`] whose every operation runs on a remote server.
///
/// Capabilities are fetched at construction, and that fetch must succeed.
/// Later refreshes that fail fall back to the last set obtained, with a
/// warning.
///
/// Transactions passed to [`open_connection`](BlobStore::open_connection)
/// are published through the client's own exporter so the server can enlist
/// in them.
pub struct ClientStore {
    id: StoreId,
    server: RemoteHandle,
    exporter: Arc<Exporter>,
    owns_exporter: bool,
    streams: StreamManager,
    connections: Mutex<Vec<Weak<ClientConnection>>>,
    capabilities: RwLock<Arc<CapabilitySet>>,
}

impl ClientStore {
    /// Connect to the store published at `server`.
    ///
    /// Without an `exporter` the client asks the server for its exporter
    /// settings and builds one of its own, attached to `transport`.
    pub fn new(
        id: StoreId,
        server: RemoteRef,
        transport: Arc<dyn Transport>,
        exporter: Option<Arc<Exporter>>,
    ) -> StoreResult<Self> {
        let server = RemoteHandle::new(server, transport);
        let capabilities = server.call_as(Call::GetCapabilities, Value::expect_capabilities)?;

        let owns_exporter = exporter.is_none();
        let exporter = match exporter {
            Some(exporter) => exporter,
            None => {
                let config = server.call_as(Call::GetExporter, Value::expect_exporter)?;
                let exporter = Exporter::new(config);
                if let Err(e) = server.transport().attach(&exporter) {
                    // Non-transactional use still works without callbacks.
                    warn!(exporter = %exporter.id(), error = %e, "callback exporter not reachable by the server");
                }
                exporter
            }
        };

        debug!(store = %id, server = %server.target(), capabilities = capabilities.len(), "client store ready");
        Ok(Self {
            id,
            server,
            exporter,
            owns_exporter,
            streams: StreamManager::new(),
            connections: Mutex::new(Vec::new()),
            capabilities: RwLock::new(Arc::new(capabilities)),
        })
    }

    /// Exporter publishing this client's transaction callbacks.
    pub fn exporter(&self) -> &Arc<Exporter> {
        &self.exporter
    }

    /// Registry of every stream opened through this store's connections.
    pub fn stream_manager(&self) -> &StreamManager {
        &self.streams
    }

    /// Last capability set obtained from the server, without a round trip.
    pub fn cached_capabilities(&self) -> Arc<CapabilitySet> {
        Arc::clone(&self.capabilities.read())
    }

    /// Connections opened through this store and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.live_connections().len()
    }

    fn live_connections(&self) -> Vec<Arc<ClientConnection>> {
        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.upgrade().is_some_and(|c| !c.is_closed()));
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// End the session: close every connection still open, which closes
    /// it on the server too, then every stream. If this client built its
    /// own exporter, everything it published is retracted.
    ///
    /// Each step runs even if an earlier one failed; the first error is
    /// returned.
    pub fn shutdown(&self) -> StoreResult<()> {
        let mut first = None;
        let connections = self.live_connections();
        let closing = connections.len();
        for connection in connections {
            if let Err(e) = connection.close() {
                warn!(store = %self.id, error = %e, "closing connection at shutdown");
                first.get_or_insert(e);
            }
        }
        self.connections.lock().clear();
        if let Err(e) = self.streams.close_all() {
            first.get_or_insert(e);
        }
        if self.owns_exporter {
            let retracted = self.exporter.unexport_all(true).unwrap_or_default();
            debug!(store = %self.id, retracted, "client exporter cleared");
        }
        debug!(store = %self.id, connections = closing, "client store shut down");
        first.map_or(Ok(()), Err)
    }
}

impl BlobStore for ClientStore {
    fn id(&self) -> &StoreId {
        &self.id
    }

    fn open_connection(
        &self,
        txn: Option<Arc<dyn Transaction>>,
    ) -> StoreResult<Arc<dyn BlobStoreConnection>> {
        let wire = ClientTransaction::wrap(txn.as_ref(), &self.exporter, self.server.transport())?;
        let callback = wire.as_ref().map(|w| w.callback.clone());
        let reference = match self
            .server
            .call_as(Call::OpenConnection { txn: wire }, Value::expect_ref)
        {
            Ok(reference) => reference,
            Err(e) => {
                if let Some(callback) = callback {
                    let _ = self.exporter.unexport(&callback, true);
                }
                return Err(e);
            }
        };
        let connection = Arc::new(ClientConnection::new(
            self.id.clone(),
            self.server.sibling(reference),
            self.streams.clone(),
        ));
        let mut connections = self.connections.lock();
        connections.retain(|weak| weak.strong_count() > 0);
        connections.push(Arc::downgrade(&connection));
        drop(connections);
        Ok(connection)
    }

    fn capabilities(&self) -> CapabilitySet {
        match self
            .server
            .call_as(Call::GetCapabilities, Value::expect_capabilities)
        {
            Ok(fresh) => {
                *self.capabilities.write() = Arc::new(fresh.clone());
                fresh
            }
            Err(e) => {
                warn!(store = %self.id, error = %e, "capability refresh failed, using cached set");
                CapabilitySet::clone(&self.capabilities.read())
            }
        }
    }

    fn set_quiescent(&self, quiescent: bool) -> StoreResult<bool> {
        self.server
            .call_as(Call::SetQuiescent { quiescent }, Value::expect_bool)
    }
}

impl std::fmt::Debug for ClientStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientStore")
            .field("id", &self.id)
            .field("server", self.server.target())
            .field("exporter", &self.exporter.id())
            .field("tracked_connections", &self.connections.lock().len())
            .field("open_streams", &self.streams.open_count())
            .finish()
    }
}
