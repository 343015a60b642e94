use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rbs_bridge::Exporter;
use rbs_protocol::{
    Call, Envelope, Fault, FaultKind, FrameCodec, ProtocolError, Reply, Value, HEADER_LEN,
    PROTOCOL_VERSION,
};
use rbs_types::{ExporterId, RemoteRef, SessionId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};

/// How long a session with no open sockets keeps its objects by default.
pub const DEFAULT_SESSION_GRACE: Duration = Duration::from_secs(2);

/// Objects handed to one client session, and how many of its sockets are
/// still open.
#[derive(Default)]
struct Session {
    sockets: usize,
    /// Bumped each time the last socket closes; a pending reclaim only
    /// runs if no later departure superseded it.
    departures: u64,
    handed_out: Vec<RemoteRef>,
}

struct Shared {
    exporters: RwLock<HashMap<ExporterId, Arc<Exporter>>>,
    sessions: Mutex<HashMap<SessionId, Session>>,
    grace: Duration,
}

impl Shared {
    fn exporter(&self, id: &ExporterId) -> Option<Arc<Exporter>> {
        self.exporters.read().get(id).cloned()
    }

    fn is_live(&self, reference: &RemoteRef) -> bool {
        self.exporter(&reference.exporter)
            .is_some_and(|exporter| exporter.is_exported(reference))
    }

    fn join(&self, session: SessionId) {
        self.sessions.lock().entry(session).or_default().sockets += 1;
    }

    /// Remember that `reference` was handed to `session`.
    fn record(&self, session: SessionId, reference: RemoteRef) {
        let mut sessions = self.sessions.lock();
        if let Some(state) = sessions.get_mut(&session) {
            state.handed_out.retain(|held| self.is_live(held));
            state.handed_out.push(reference);
        }
    }

    /// One socket of `session` closed. Once none remain for the grace
    /// period, everything handed to the session is released.
    fn leave(self: &Arc<Self>, session: SessionId) {
        let departure = match self.sessions.lock().get_mut(&session) {
            Some(state) => {
                state.sockets = state.sockets.saturating_sub(1);
                if state.sockets > 0 {
                    return;
                }
                state.departures += 1;
                state.departures
            }
            None => return,
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(shared.grace).await;
            let abandoned = {
                let mut sessions = shared.sessions.lock();
                match sessions.get(&session) {
                    Some(state) if state.sockets == 0 && state.departures == departure => {
                        sessions.remove(&session)
                    }
                    _ => None,
                }
            };
            if let Some(abandoned) = abandoned {
                let reclaim = tokio::task::spawn_blocking(move || {
                    shared.reclaim(session, abandoned.handed_out)
                });
                if let Err(e) = reclaim.await {
                    warn!(%session, error = %e, "session reclaim failed");
                }
            }
        });
    }

    /// Release objects newest first, so streams go before their connections.
    fn reclaim(&self, session: SessionId, handed_out: Vec<RemoteRef>) {
        let mut released = 0usize;
        for reference in handed_out.iter().rev() {
            if let Some(exporter) = self.exporter(&reference.exporter) {
                if exporter.release(reference) {
                    released += 1;
                }
            }
        }
        info!(%session, released, "session ended");
    }
}

/// Serves calls to hosted exporters over TCP.
///
/// Each accepted connection carries a sequence of framed requests, answered
/// in order. Calls run on tokio's blocking pool since exported objects may
/// themselves make blocking calls back to the peer.
///
/// A socket may open with a hello naming its client session. References
/// returned to a session are released once all of its sockets have been
/// closed for the grace period.
pub struct RpcServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    shared: Arc<Shared>,
}

impl RpcServer {
    pub async fn bind(addr: SocketAddr) -> ServerResult<Self> {
        Self::from_listener(TcpListener::bind(addr).await?)
    }

    /// Bind the host and port named in `exporter`'s own config, and host it.
    pub async fn bind_exporter(exporter: &Arc<Exporter>) -> ServerResult<Self> {
        let config = exporter.config();
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let server = Self::from_listener(listener)?;
        server.host(exporter);
        Ok(server)
    }

    fn from_listener(listener: TcpListener) -> ServerResult<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            shared: Arc::new(Shared {
                exporters: RwLock::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                grace: DEFAULT_SESSION_GRACE,
            }),
        })
    }

    /// Set how long an abandoned session keeps its objects.
    pub fn with_session_grace(mut self, grace: Duration) -> Self {
        // Not yet shared: connection tasks only start in `serve`.
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.grace = grace;
        }
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Route calls for `exporter` to this server, and stamp its references
    /// with this server's address.
    pub fn host(&self, exporter: &Arc<Exporter>) {
        exporter.set_endpoint(Some(self.local_addr.to_string()));
        self.shared
            .exporters
            .write()
            .insert(exporter.id(), Arc::clone(exporter));
        debug!(exporter = %exporter.id(), addr = %self.local_addr, "hosting exporter");
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self) -> ServerResult<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> ServerResult<()> {
        info!(addr = %self.local_addr, "RPC server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(addr = %self.local_addr, "RPC server stopping");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let shared = Arc::clone(&self.shared);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, shared).await {
                            warn!(%peer, error = %e, "connection ended with error");
                        }
                    });
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
) -> ServerResult<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    debug!(%peer, "peer connected");
    let mut session = None;
    let result = serve_frames(&mut reader, &mut writer, peer, &shared, &mut session).await;
    if let Some(session) = session {
        shared.leave(session);
    }
    result
}

async fn serve_frames(
    reader: &mut OwnedReadHalf,
    writer: &mut OwnedWriteHalf,
    peer: SocketAddr,
    shared: &Shared,
    session: &mut Option<SessionId>,
) -> ServerResult<()> {
    loop {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(%peer, "peer disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        let (len, tag) = FrameCodec::parse_header(&header)?;
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;

        let (seq, target, call) = match FrameCodec::decode_tagged(tag, &payload)? {
            Envelope::Request { seq, target, call } => (seq, target, call),
            Envelope::Hello {
                session: announced,
                version,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(ProtocolError::FramingError(format!(
                        "{peer} speaks protocol {version}, expected {PROTOCOL_VERSION}"
                    ))
                    .into());
                }
                if session.is_some() {
                    return Err(ProtocolError::FramingError(format!(
                        "second hello from {peer}"
                    ))
                    .into());
                }
                shared.join(announced);
                *session = Some(announced);
                debug!(%peer, session = %announced, "session joined");
                continue;
            }
            Envelope::Response { seq, .. } => {
                return Err(ProtocolError::FramingError(format!(
                    "unexpected response {seq} from {peer}"
                ))
                .into())
            }
        };

        let reply = dispatch(shared, target, call).await?;
        if let (Some(session), Reply::Ok(Value::Ref(reference))) = (*session, &reply) {
            shared.record(session, reference.clone());
        }
        let frame = match FrameCodec::encode(&Envelope::Response { seq, reply }) {
            Ok(frame) => frame,
            Err(e) => FrameCodec::encode(&Envelope::Response {
                seq,
                reply: Reply::Fault(Fault::new(FaultKind::Io, e.to_string())),
            })?,
        };
        writer.write_all(&frame).await?;
    }
}

async fn dispatch(shared: &Shared, target: RemoteRef, call: Call) -> ServerResult<Reply> {
    let Some(exporter) = shared.exporter(&target.exporter) else {
        return Ok(Reply::Fault(
            Fault::new(
                FaultKind::NoSuchObject,
                format!("exporter {} is not hosted here", target.exporter),
            )
            .with_subject(target.to_string()),
        ));
    };
    tokio::task::spawn_blocking(move || exporter.dispatch(target.object, call))
        .await
        .map_err(|e| ServerError::Internal(format!("dispatch task failed: {e}")))
}
