//! Stream lifecycle tracking.
//!
//! Every stream handed out through a connection is wrapped in a
//! [`ManagedStream`] and registered with a [`StreamManager`]. Closing the
//! stream removes it from the registry; closing the owning connection closes
//! whatever is still registered.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult, StreamCloseFailure};
use crate::traits::BlobReader;

/// Identity of a managed stream within its manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Identity of the connection a stream belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamOwner(pub u64);

/// Notified once when a managed stream closes.
pub trait CloseListener: Send + Sync {
    fn notify_closed(&self, stream: StreamId);
}

struct StreamSlot {
    id: StreamId,
    owner: StreamOwner,
    closed: AtomicBool,
    raw: Mutex<Option<Box<dyn BlobReader>>>,
    listeners: Vec<Arc<dyn CloseListener>>,
}

/// A [`BlobReader`] that notifies its listeners when closed.
///
/// Handles are cheap clones sharing one underlying stream, so the owner's
/// registry and the caller can both close it. Only the first close does any
/// work.
#[derive(Clone)]
pub struct ManagedStream {
    slot: Arc<StreamSlot>,
}

impl ManagedStream {
    /// Wrap `raw`, notifying `listener` when the stream closes.
    pub fn new(
        id: StreamId,
        owner: StreamOwner,
        raw: Box<dyn BlobReader>,
        listener: Arc<dyn CloseListener>,
    ) -> Self {
        Self::with_listeners(id, owner, raw, vec![listener])
    }

    fn with_listeners(
        id: StreamId,
        owner: StreamOwner,
        raw: Box<dyn BlobReader>,
        listeners: Vec<Arc<dyn CloseListener>>,
    ) -> Self {
        Self {
            slot: Arc::new(StreamSlot {
                id,
                owner,
                closed: AtomicBool::new(false),
                raw: Mutex::new(Some(raw)),
                listeners,
            }),
        }
    }

    pub fn id(&self) -> StreamId {
        self.slot.id
    }

    pub fn owner(&self) -> StreamOwner {
        self.slot.owner
    }

    pub fn is_closed(&self) -> bool {
        self.slot.closed.load(Ordering::Acquire)
    }

    /// Close the underlying stream, then notify listeners.
    ///
    /// Listeners are notified even if the underlying close fails, so the
    /// registry never keeps a stream that cannot be reopened. The failure is
    /// still returned to the caller.
    pub fn close(&self) -> io::Result<()> {
        if self.slot.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let raw = self.slot.raw.lock().take();
        let result = match raw {
            Some(mut raw) => raw.close(),
            None => Ok(()),
        };
        for listener in &self.slot.listeners {
            listener.notify_closed(self.slot.id);
        }
        result
    }
}

fn closed_error() -> io::Error {
    io::Error::other("stream is closed")
}

impl Read for ManagedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        match self.slot.raw.lock().as_mut() {
            Some(raw) => raw.read(buf),
            None => Err(closed_error()),
        }
    }
}

impl BlobReader for ManagedStream {
    fn close(&mut self) -> io::Result<()> {
        ManagedStream::close(self)
    }
}

impl fmt::Debug for ManagedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedStream")
            .field("id", &self.slot.id)
            .field("owner", &self.slot.owner)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    next_stream: AtomicU64,
    next_owner: AtomicU64,
    open: Mutex<HashMap<StreamId, ManagedStream>>,
}

/// Removes a stream from the registry when it closes.
///
/// Holds the registry weakly: the registry owns the streams, and a stream
/// must not keep its registry alive.
struct RegistryListener(Weak<Registry>);

impl CloseListener for RegistryListener {
    fn notify_closed(&self, stream: StreamId) {
        if let Some(registry) = self.0.upgrade() {
            registry.open.lock().remove(&stream);
        }
    }
}

/// Registry of open managed streams.
///
/// Cloning yields another handle to the same registry, so a store and all of
/// its connections can share one manager.
#[derive(Clone, Default)]
pub struct StreamManager {
    registry: Arc<Registry>,
}

impl StreamManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an owner key for a new connection.
    pub fn new_owner(&self) -> StreamOwner {
        StreamOwner(self.registry.next_owner.fetch_add(1, Ordering::Relaxed))
    }

    /// Wrap and register `raw` on behalf of `owner`.
    pub fn new_stream(&self, owner: StreamOwner, raw: Box<dyn BlobReader>) -> ManagedStream {
        self.register(owner, raw, None)
    }

    /// Like [`new_stream`](Self::new_stream), also notifying `listener` on close.
    pub fn new_stream_with_listener(
        &self,
        owner: StreamOwner,
        raw: Box<dyn BlobReader>,
        listener: Arc<dyn CloseListener>,
    ) -> ManagedStream {
        self.register(owner, raw, Some(listener))
    }

    fn register(
        &self,
        owner: StreamOwner,
        raw: Box<dyn BlobReader>,
        extra: Option<Arc<dyn CloseListener>>,
    ) -> ManagedStream {
        let id = StreamId(self.registry.next_stream.fetch_add(1, Ordering::Relaxed));
        let mut listeners: Vec<Arc<dyn CloseListener>> =
            vec![Arc::new(RegistryListener(Arc::downgrade(&self.registry)))];
        listeners.extend(extra);

        let stream = ManagedStream::with_listeners(id, owner, raw, listeners);
        self.registry.open.lock().insert(id, stream.clone());
        debug!(stream = %id, owner = owner.0, "registered managed stream");
        stream
    }

    /// Number of streams still open.
    pub fn open_count(&self) -> usize {
        self.registry.open.lock().len()
    }

    /// Number of streams still open for `owner`.
    pub fn open_count_for(&self, owner: StreamOwner) -> usize {
        self.registry
            .open
            .lock()
            .values()
            .filter(|s| s.owner() == owner)
            .count()
    }

    pub fn is_registered(&self, stream: StreamId) -> bool {
        self.registry.open.lock().contains_key(&stream)
    }

    /// Close every stream belonging to `owner`.
    pub fn close_owner(&self, owner: StreamOwner) -> StoreResult<()> {
        let streams: Vec<ManagedStream> = {
            let mut open = self.registry.open.lock();
            let ids: Vec<StreamId> = open
                .values()
                .filter(|s| s.owner() == owner)
                .map(ManagedStream::id)
                .collect();
            ids.iter().filter_map(|id| open.remove(id)).collect()
        };
        sweep(streams)
    }

    /// Close every registered stream. The registry is empty afterwards.
    pub fn close_all(&self) -> StoreResult<()> {
        let streams: Vec<ManagedStream> = {
            let mut open = self.registry.open.lock();
            open.drain().map(|(_, s)| s).collect()
        };
        sweep(streams)
    }
}

impl fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamManager")
            .field("open_streams", &self.open_count())
            .finish()
    }
}

/// Close each stream, collecting failures instead of stopping at the first.
///
/// Streams are already out of the registry, so the listeners' removals are
/// no-ops and the lock is not held while closing.
fn sweep(streams: Vec<ManagedStream>) -> StoreResult<()> {
    let mut failures = Vec::new();
    for stream in streams {
        if let Err(e) = stream.close() {
            warn!(stream = %stream.id(), error = %e, "failed to close stream during teardown");
            failures.push(StreamCloseFailure {
                stream: stream.id(),
                reason: e.to_string(),
            });
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(StoreError::PartialTeardown(failures))
    }
}
