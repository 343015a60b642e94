use std::collections::HashMap;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rbs_bridge::{Exporter, Transport, TransportError, TransportResult};
use rbs_protocol::{Call, Envelope, FrameCodec, ProtocolError, Reply, PROTOCOL_VERSION};
use rbs_types::{RemoteRef, SessionId};
use tracing::trace;

/// Blocking request/response transport over TCP.
///
/// Calls go to the endpoint carried by the target reference. Connections are
/// pooled per endpoint and reused after a clean exchange; a connection that
/// saw any error is dropped.
///
/// Every new socket opens with a hello naming this transport's session, so
/// the server can release what it handed out once all of them are gone.
pub struct TcpTransport {
    session: SessionId,
    timeout: Duration,
    idle: Mutex<HashMap<String, Vec<TcpStream>>>,
    next_seq: AtomicU64,
}

impl TcpTransport {
    /// `timeout` bounds connecting and each read or write.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            session: SessionId::new(),
            timeout,
            idle: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Pooled connections waiting for reuse.
    pub fn idle_connections(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    fn checkout(&self, endpoint: &str) -> TransportResult<TcpStream> {
        let pooled = self.idle.lock().get_mut(endpoint).and_then(Vec::pop);
        if let Some(stream) = pooled {
            return Ok(stream);
        }
        let mut stream = self
            .connect(endpoint)
            .map_err(|e| self.map_io(endpoint, e))?;
        let hello = Envelope::Hello {
            session: self.session,
            version: PROTOCOL_VERSION,
        };
        FrameCodec::write_to(&mut stream, &hello).map_err(|e| self.map_protocol(endpoint, e))?;
        trace!(session = %self.session, endpoint, "tcp session joined");
        Ok(stream)
    }

    fn connect(&self, endpoint: &str) -> io::Result<TcpStream> {
        let addr = endpoint.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "endpoint did not resolve")
        })?;
        let stream = TcpStream::connect_timeout(&addr, self.timeout)?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn checkin(&self, endpoint: &str, stream: TcpStream) {
        self.idle
            .lock()
            .entry(endpoint.to_string())
            .or_default()
            .push(stream);
    }

    fn map_io(&self, endpoint: &str, e: io::Error) -> TransportError {
        match e.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                TransportError::TimedOut(self.timeout)
            }
            _ => TransportError::Unreachable {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            },
        }
    }

    fn map_protocol(&self, endpoint: &str, e: ProtocolError) -> TransportError {
        match e {
            ProtocolError::Io(io) => self.map_io(endpoint, io),
            other => TransportError::Protocol(other),
        }
    }
}

impl Transport for TcpTransport {
    fn invoke(&self, target: &RemoteRef, call: Call) -> TransportResult<Reply> {
        let endpoint = target
            .endpoint
            .as_deref()
            .ok_or(TransportError::NotHosted(target.exporter))?;
        let mut stream = self.checkout(endpoint)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        trace!(seq, %target, call = call.name(), "tcp request");
        let request = Envelope::Request {
            seq,
            target: target.clone(),
            call,
        };
        FrameCodec::write_to(&mut stream, &request).map_err(|e| self.map_protocol(endpoint, e))?;
        match FrameCodec::read_from(&mut stream).map_err(|e| self.map_protocol(endpoint, e))? {
            Envelope::Response { seq: got, reply } if got == seq => {
                self.checkin(endpoint, stream);
                Ok(reply)
            }
            other => Err(ProtocolError::FramingError(format!(
                "expected response {seq}, got {} {}",
                other.type_name(),
                other.seq()
            ))
            .into()),
        }
    }

    /// TCP peers reach an exporter only once an [`crate::RpcServer`] hosts it.
    fn attach(&self, exporter: &Arc<Exporter>) -> TransportResult<()> {
        match exporter.endpoint() {
            Some(_) => Ok(()),
            None => Err(TransportError::NotHosted(exporter.id())),
        }
    }
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpTransport")
            .field("session", &self.session)
            .field("timeout", &self.timeout)
            .field("idle_connections", &self.idle_connections())
            .finish()
    }
}
