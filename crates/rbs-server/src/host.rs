use std::net::SocketAddr;
use std::sync::Arc;

use rbs_bridge::{Exporter, ServerStore, Transport};
use rbs_store::BlobStore;
use rbs_types::RemoteRef;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::server::RpcServer;
use crate::transport::TcpTransport;

/// A blob store published over TCP.
///
/// Owns the listener task, the server-side exporter and the exported store.
/// Clients reach the store through [`StoreHost::reference`] or its ticket.
pub struct StoreHost {
    store: Arc<ServerStore>,
    reference: RemoteRef,
    local_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<ServerResult<()>>,
}

impl StoreHost {
    /// Bind `config.bind_addr`, export `store` and start serving.
    pub async fn start(config: &ServerConfig, store: Arc<dyn BlobStore>) -> ServerResult<Self> {
        let server = RpcServer::bind(config.bind_addr)
            .await?
            .with_session_grace(config.session_grace());
        let local_addr = server.local_addr();

        let exporter = Exporter::new(config.exporter.clone());
        server.host(&exporter);
        let transport: Arc<dyn Transport> = TcpTransport::new(config.io_timeout());
        let store = ServerStore::new(store, exporter, transport);
        let reference = store.exported();

        if let Some(path) = &config.ticket_path {
            let ticket = reference.to_ticket()?;
            tokio::fs::write(path, format!("{ticket}\n")).await?;
            info!(path = %path.display(), "ticket written");
        }

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.serve_with_shutdown(async {
            let _ = stopped.await;
        }));
        info!(store = %store.id(), addr = %local_addr, "store published");
        Ok(Self {
            store,
            reference,
            local_addr,
            stop: Some(stop),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Reference to the exported store, carrying this host's address.
    pub fn reference(&self) -> &RemoteRef {
        &self.reference
    }

    pub fn ticket(&self) -> ServerResult<String> {
        Ok(self.reference.to_ticket()?)
    }

    pub fn store(&self) -> &Arc<ServerStore> {
        &self.store
    }

    /// Retract the store, close its connections and stop the listener.
    pub async fn shutdown(mut self) -> ServerResult<()> {
        self.store.unexport(true)?;
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        (&mut self.task)
            .await
            .map_err(|e| ServerError::Internal(format!("listener task failed: {e}")))?
    }
}

impl Drop for StoreHost {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for StoreHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHost")
            .field("store", self.store.id())
            .field("addr", &self.local_addr)
            .field("reference", &self.reference)
            .finish()
    }
}
