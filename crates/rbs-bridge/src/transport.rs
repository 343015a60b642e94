use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use rbs_protocol::{Call, Envelope, FrameCodec, ProtocolError, Reply};
use rbs_types::{ExporterId, RemoteRef};
use tracing::trace;

use crate::error::{TransportError, TransportResult};
use crate::exporter::Exporter;

/// Carries calls to exported objects and their replies back.
///
/// A transport returns `Err` only when no reply was obtained. Failures of the
/// call itself come back as `Ok(Reply::Fault(..))`.
pub trait Transport: Send + Sync {
    /// Invoke `call` on the object behind `target` and wait for its reply.
    fn invoke(&self, target: &RemoteRef, call: Call) -> TransportResult<Reply>;

    /// Make the objects published by `exporter` callable by peers.
    fn attach(&self, exporter: &Arc<Exporter>) -> TransportResult<()>;
}

/// In-process transport.
///
/// Every request and reply is framed and parsed with [`FrameCodec`], so
/// anything that would not survive the wire fails here too. The transport
/// can be taken offline to simulate a lost peer.
pub struct LoopbackTransport {
    exporters: RwLock<HashMap<ExporterId, Weak<Exporter>>>,
    online: AtomicBool,
    next_seq: AtomicU64,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            exporters: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            next_seq: AtomicU64::new(1),
        })
    }

    /// Take the transport offline or bring it back. While offline every
    /// call fails with [`TransportError::Unreachable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    fn lookup(&self, id: ExporterId) -> Option<Arc<Exporter>> {
        self.exporters.read().get(&id).and_then(Weak::upgrade)
    }

    fn round_trip(envelope: &Envelope) -> TransportResult<Envelope> {
        let frame = FrameCodec::encode(envelope)?;
        let (decoded, _) = FrameCodec::decode(&frame)?;
        Ok(decoded)
    }
}

impl Transport for LoopbackTransport {
    fn invoke(&self, target: &RemoteRef, call: Call) -> TransportResult<Reply> {
        if !self.is_online() {
            return Err(TransportError::Unreachable {
                endpoint: "loopback".into(),
                reason: "transport is offline".into(),
            });
        }
        let exporter = self
            .lookup(target.exporter)
            .ok_or(TransportError::UnknownExporter(target.exporter))?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!(seq, %target, call = call.name(), "loopback request");
        let request = Self::round_trip(&Envelope::Request {
            seq,
            target: target.clone(),
            call,
        })?;
        let Envelope::Request { target, call, .. } = request else {
            return Err(ProtocolError::FramingError("request decoded as response".into()).into());
        };

        let reply = exporter.dispatch(target.object, call);
        match Self::round_trip(&Envelope::Response { seq, reply })? {
            Envelope::Response { reply, .. } => Ok(reply),
            other => Err(ProtocolError::FramingError(format!(
                "response decoded as {}",
                other.type_name()
            ))
            .into()),
        }
    }

    fn attach(&self, exporter: &Arc<Exporter>) -> TransportResult<()> {
        let mut exporters = self.exporters.write();
        exporters.retain(|_, weak| weak.strong_count() > 0);
        exporters.insert(exporter.id(), Arc::downgrade(exporter));
        Ok(())
    }
}
