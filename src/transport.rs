//! Router transport over TCP
//!
//! One listening socket serves many connections. Inbound requests from all
//! connections land in a single queue as `(identity, body)` pairs; replies
//! are routed back to whichever connection last spoke for that identity.
//!
//! Wire format, both directions:
//! ```text
//! [u32 BE part count] ([u32 BE part length] [part bytes])*
//! ```
//! Requests and replies carry three parts: identity, an empty delimiter and
//! the body. An empty request identity is replaced by the connection's
//! generated identity, `0x00` followed by a u32 BE counter.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TrisError};
use crate::protocol::ProtocolError;
use crate::session::SessionId;

/// Largest message accepted on a connection.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const MAX_PARTS: usize = 16;

const INBOUND_QUEUE_CAPACITY: usize = 4096;

/// Host and port of a `tcp://host:port` endpoint.
pub fn parse_endpoint(endpoint: &str) -> Result<String> {
    let (protocol, address) = endpoint
        .split_once("://")
        .ok_or_else(|| TrisError::Transport(format!("invalid endpoint '{}'", endpoint)))?;
    if protocol != "tcp" {
        return Err(TrisError::Transport(format!(
            "unsupported protocol '{}' in endpoint '{}'",
            protocol, endpoint
        )));
    }
    if address.is_empty() {
        return Err(TrisError::Transport(format!("missing address in endpoint '{}'", endpoint)));
    }
    Ok(address.to_string())
}

// ============================================================================
// Framing
// ============================================================================

pub fn encode_message(parts: &[&[u8]]) -> Vec<u8> {
    let size = 4 + parts.iter().map(|p| 4 + p.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(parts.len() as u32).to_be_bytes());
    for part in parts {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    buf
}

/// Read one multipart message. `Ok(None)` on a clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<Vec<u8>>>> {
    let mut word = [0u8; 4];
    match reader.read_exact(&mut word).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let count = u32::from_be_bytes(word) as usize;
    if count > MAX_PARTS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            ProtocolError::MalformedMessage(format!("{} parts in one message", count)),
        ));
    }

    let mut parts = Vec::with_capacity(count);
    let mut total = 0usize;
    for _ in 0..count {
        reader.read_exact(&mut word).await?;
        let len = u32::from_be_bytes(word) as usize;
        total += len;
        if total > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(io::ErrorKind::InvalidData, ProtocolError::FrameTooLarge(total)));
        }
        let mut part = vec![0u8; len];
        reader.read_exact(&mut part).await?;
        parts.push(part);
    }
    Ok(Some(parts))
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, parts: &[&[u8]]) -> io::Result<()> {
    writer.write_all(&encode_message(parts)).await?;
    writer.flush().await
}

/// Split a request into identity and body.
pub fn split_envelope(mut parts: Vec<Vec<u8>>) -> std::result::Result<(Vec<u8>, Vec<u8>), ProtocolError> {
    if parts.len() != 3 {
        return Err(ProtocolError::MalformedMessage(format!(
            "expected 3 parts, got {}",
            parts.len()
        )));
    }
    if !parts[1].is_empty() {
        return Err(ProtocolError::MalformedMessage("missing empty delimiter".to_string()));
    }
    let body = parts.pop().unwrap_or_default();
    parts.pop();
    let identity = parts.pop().unwrap_or_default();
    Ok((identity, body))
}

fn generated_identity(counter: u32) -> SessionId {
    let mut id = Vec::with_capacity(5);
    id.push(0x00);
    id.extend_from_slice(&counter.to_be_bytes());
    SessionId(id)
}

// ============================================================================
// Reply routing
// ============================================================================

struct Route {
    connection: u32,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Cloneable handle that sends replies to identities.
#[derive(Clone, Default)]
pub struct Replier {
    routes: Arc<RwLock<HashMap<SessionId, Route>>>,
}

impl Replier {
    /// Send `body` to `identity`. Returns false (and drops the reply) when no
    /// live connection speaks for the identity.
    pub fn send(&self, identity: &SessionId, body: &[u8]) -> bool {
        let routes = self.routes.read();
        let Some(route) = routes.get(identity) else {
            debug!(session = %identity, "no route for reply, dropping");
            return false;
        };
        let frame = encode_message(&[&identity.0, b"", body]);
        route.outbound.send(frame).is_ok()
    }

    fn register(&self, identity: SessionId, connection: u32, outbound: mpsc::UnboundedSender<Vec<u8>>) {
        self.routes.write().insert(identity, Route { connection, outbound });
    }

    /// Route `identity` to `connection` unless it already is.
    fn claim(&self, identity: &SessionId, connection: u32, outbound: &mpsc::UnboundedSender<Vec<u8>>) {
        if self.routes.read().get(identity).is_some_and(|r| r.connection == connection) {
            return;
        }
        debug!(session = %identity, connection, "identity routed to connection");
        self.register(identity.clone(), connection, outbound.clone());
    }

    /// Drop the route unless another connection took the identity over.
    fn unregister(&self, identity: &SessionId, connection: u32) {
        let mut routes = self.routes.write();
        if routes.get(identity).is_some_and(|r| r.connection == connection) {
            routes.remove(identity);
        }
    }

    pub fn route_count(&self) -> usize {
        self.routes.read().len()
    }
}

// ============================================================================
// Router
// ============================================================================

/// One inbound request.
#[derive(Debug)]
pub struct Inbound {
    pub identity: SessionId,
    pub body: Vec<u8>,
}

pub struct Router {
    local_addr: SocketAddr,
    inbound: mpsc::Receiver<Inbound>,
    replier: Replier,
    accept_task: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl Router {
    pub async fn bind(endpoint: &str) -> Result<Self> {
        let address = parse_endpoint(endpoint)?;
        let listener = TcpListener::bind(&address).await?;
        let local_addr = listener.local_addr()?;

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let replier = Replier::default();

        let accept_task = tokio::spawn(accept_loop(listener, inbound_tx, replier.clone(), shutdown_rx));
        info!(%local_addr, "router bound");

        Ok(Self {
            local_addr,
            inbound,
            replier,
            accept_task: Some(accept_task),
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn replier(&self) -> Replier {
        self.replier.clone()
    }

    /// Next inbound request; `None` once the queue is closed and empty.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.inbound.try_recv().ok()
    }

    /// Requests waiting in the inbound queue.
    pub fn pending(&self) -> usize {
        self.inbound.len()
    }

    /// Stop taking new connections and new requests. Replies still flow.
    pub fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.inbound.close();
    }

    /// Close every connection.
    pub fn close(mut self) {
        self.stop_accepting();
        let _ = self.shutdown.send(true);
        info!(local_addr = %self.local_addr, "router closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: mpsc::Sender<Inbound>,
    replier: Replier,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_connection: u32 = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let connection = next_connection;
                    next_connection = next_connection.wrapping_add(1);
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        connection,
                        inbound.clone(),
                        replier.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection: u32,
    inbound: mpsc::Sender<Inbound>,
    replier: Replier,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_loop(writer, outbound_rx, peer));

    let generated = generated_identity(connection);
    let mut routed: HashSet<SessionId> = HashSet::new();
    debug!(%peer, connection, "connection opened");

    loop {
        let message = tokio::select! {
            message = read_message(&mut reader) => message,
            _ = shutdown.changed() => break,
        };

        let parts = match message {
            Ok(Some(parts)) => parts,
            Ok(None) => break,
            Err(e) => {
                warn!(%peer, error = %e, "closing connection");
                break;
            }
        };

        let (identity, body) = match split_envelope(parts) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%peer, error = %e, "dropping malformed message");
                continue;
            }
        };

        let identity = if identity.is_empty() { generated.clone() } else { SessionId(identity) };
        replier.claim(&identity, connection, &outbound);
        routed.insert(identity.clone());

        if inbound.send(Inbound { identity, body }).await.is_err() {
            debug!(%peer, "server no longer accepting requests, dropping message");
        }
    }

    for identity in &routed {
        replier.unregister(identity, connection);
    }
    drop(outbound);
    let _ = writer_task.await;
    debug!(%peer, connection, "connection closed");
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>, peer: SocketAddr) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            warn!(%peer, error = %e, "write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
