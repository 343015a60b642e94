use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rbs_store::InMemoryStoreConfig;
use rbs_types::{ExporterConfig, StoreId};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

/// Settings for a hosted store.
///
/// Every field has a default, so a config file only lists what it changes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the RPC listener binds to.
    pub bind_addr: SocketAddr,
    /// Identifier of the served store, a URI.
    pub store_id: String,
    /// Settings handed to clients that build their own callback exporter.
    pub exporter: ExporterConfig,
    pub supports_transactions: bool,
    pub require_transactions: bool,
    /// Read/write timeout for outbound calls, in milliseconds.
    pub io_timeout_ms: u64,
    /// How long a client session with no open sockets keeps its
    /// connections and streams, in milliseconds.
    pub session_grace_ms: u64,
    /// Default tracing filter; `RUST_LOG` takes precedence.
    pub log_level: String,
    /// Where to write the store's ticket, if anywhere.
    pub ticket_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 7400)),
            store_id: "urn:rbs:store:default".into(),
            exporter: ExporterConfig::default(),
            supports_transactions: true,
            require_transactions: false,
            io_timeout_ms: 30_000,
            session_grace_ms: 2_000,
            log_level: "info".into(),
            ticket_path: None,
        }
    }
}

impl ServerConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ServerResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        StoreId::parse(&self.store_id)?;
        if self.require_transactions && !self.supports_transactions {
            return Err(ServerError::Config(
                "require_transactions needs supports_transactions".into(),
            ));
        }
        if self.io_timeout_ms == 0 {
            return Err(ServerError::Config("io_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn store_id(&self) -> ServerResult<StoreId> {
        Ok(StoreId::parse(&self.store_id)?)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }

    pub fn store_config(&self) -> InMemoryStoreConfig {
        InMemoryStoreConfig {
            supports_transactions: self.supports_transactions,
            require_transactions: self.require_transactions,
        }
    }
}
