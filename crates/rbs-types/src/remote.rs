use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Prefix of the printable form of a [`RemoteRef`].
const TICKET_PREFIX: &str = "rbs1";

/// Identity of an exporter. Unique per exporter instance (UUID v7).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExporterId(uuid::Uuid);

impl ExporterId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Short representation (first 8 characters of UUID).
    pub fn short_id(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for ExporterId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExporterId({})", self.short_id())
    }
}

impl fmt::Display for ExporterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a client session. Every socket a client opens to a server
/// announces it, so the server can tell when the client is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object number assigned by an exporter. Never reused within one exporter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectNum(pub u64);

impl fmt::Display for ObjectNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle to an object published by an exporter.
///
/// Holders may invoke the object through a transport but only the issuing
/// exporter can retract it. `endpoint` is the network address hosting the
/// exporter, if it is reachable over the network at all.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteRef {
    pub exporter: ExporterId,
    pub object: ObjectNum,
    pub endpoint: Option<String>,
}

impl RemoteRef {
    pub fn new(exporter: ExporterId, object: ObjectNum, endpoint: Option<String>) -> Self {
        Self {
            exporter,
            object,
            endpoint,
        }
    }

    /// Printable form, for handing a reference to a peer out of band.
    pub fn to_ticket(&self) -> Result<String, TypeError> {
        let bytes =
            bincode::serialize(self).map_err(|e| TypeError::InvalidTicket(e.to_string()))?;
        Ok(format!("{TICKET_PREFIX}{}", hex::encode(bytes)))
    }

    /// Parse the output of [`to_ticket`](Self::to_ticket).
    pub fn from_ticket(ticket: &str) -> Result<Self, TypeError> {
        let body = ticket
            .trim()
            .strip_prefix(TICKET_PREFIX)
            .ok_or_else(|| TypeError::InvalidTicket(format!("missing {TICKET_PREFIX} prefix")))?;
        let bytes = hex::decode(body).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        bincode::deserialize(&bytes).map_err(|e| TypeError::InvalidTicket(e.to_string()))
    }
}

impl fmt::Display for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.exporter.short_id(), self.object)?;
        if let Some(endpoint) = &self.endpoint {
            write!(f, "@{endpoint}")?;
        }
        Ok(())
    }
}

/// Settings from which a peer can build an exporter of its own.
///
/// A server hands its configuration to clients that did not bring an
/// exporter, so callbacks are published the same way on both sides.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Host to publish callbacks on.
    pub host: String,
    /// Port to publish callbacks on; `0` picks an ephemeral port.
    pub port: u16,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
        }
    }
}
