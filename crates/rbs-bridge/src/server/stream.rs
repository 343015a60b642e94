use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use parking_lot::Mutex;
use rbs_protocol::{Call, Fault, FaultKind, Reply, Value};
use rbs_store::{CloseListener, ManagedStream, StreamId};
use rbs_types::RemoteRef;
use tracing::warn;

use crate::exporter::{Exporter, Skeleton};

/// Largest chunk returned by one remote read.
pub const MAX_READ_CHUNK: usize = 1024 * 1024;

/// Published form of a server-side managed stream.
///
/// Closing it, from the client or from connection teardown, retracts its
/// reference through [`PublishedStreams`].
pub struct ServerInputStream {
    stream: ManagedStream,
}

impl ServerInputStream {
    pub fn new(stream: ManagedStream) -> Self {
        Self { stream }
    }

    pub fn stream(&self) -> &ManagedStream {
        &self.stream
    }

    fn read(&self, max: u32) -> Reply {
        let mut buf = vec![0u8; (max as usize).min(MAX_READ_CHUNK)];
        // ManagedStream clones share one underlying reader.
        let mut stream = self.stream.clone();
        match stream.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Reply::Ok(Value::Bytes(buf))
            }
            Err(e) => Reply::Fault(io_fault(&self.stream, e)),
        }
    }
}

fn io_fault(stream: &ManagedStream, e: std::io::Error) -> Fault {
    if stream.is_closed() {
        return Fault::new(FaultKind::Closed, format!("{} is closed", stream.id()));
    }
    Fault::new(FaultKind::Io, e.to_string())
}

impl Skeleton for ServerInputStream {
    fn dispatch(&self, call: Call) -> Reply {
        match call {
            Call::Read { max } => self.read(max),
            Call::CloseStream => match self.stream.close() {
                Ok(()) => Reply::Ok(Value::Unit),
                Err(e) => Reply::Fault(Fault::new(FaultKind::Io, e.to_string())),
            },
            other => Reply::Fault(Fault::unsupported_call(&other)),
        }
    }

    fn kind(&self) -> &'static str {
        "input-stream"
    }

    fn release(&self) {
        if let Err(e) = self.stream.close() {
            warn!(stream = %self.stream.id(), error = %e, "abandoned stream failed to close");
        }
    }
}

/// References of published streams, retracted as each stream closes.
pub(crate) struct PublishedStreams {
    exporter: Arc<Exporter>,
    refs: Mutex<HashMap<StreamId, RemoteRef>>,
}

impl PublishedStreams {
    pub(crate) fn new(exporter: Arc<Exporter>) -> Arc<Self> {
        Arc::new(Self {
            exporter,
            refs: Mutex::new(HashMap::new()),
        })
    }

    /// Publish `stream` and remember its reference until it closes.
    pub(crate) fn publish(&self, stream: ManagedStream) -> RemoteRef {
        let id = stream.id();
        let reference = self
            .exporter
            .export(Arc::new(ServerInputStream::new(stream.clone())));
        self.refs.lock().insert(id, reference.clone());
        // Closed by a concurrent teardown before the insert.
        if stream.is_closed() {
            self.notify_closed(id);
        }
        reference
    }

    pub(crate) fn len(&self) -> usize {
        self.refs.lock().len()
    }
}

impl CloseListener for PublishedStreams {
    fn notify_closed(&self, stream: StreamId) {
        let Some(reference) = self.refs.lock().remove(&stream) else {
            return;
        };
        // The close may be running inside the stream's own call.
        if let Err(e) = self.exporter.unexport(&reference, true) {
            warn!(%stream, %reference, error = %e, "failed to retract stream");
        }
    }
}
