//! Relay server.
//!
//! The relay accepts physical connections from clients, identified by the
//! key each proves during the hello, and keeps one [`ServerConn`] per key.
//! Its only per-circuit state is a pair of complementary *relations*:
//!
//! ```text
//!   A.relations[x] = (B, y)        B.relations[y] = (A, x)
//! ```
//!
//! where `x` is the even id A chose and `y` is an odd id the relay allocated
//! on B's connection. Both halves are created and deleted together while
//! holding both connections' relation locks (taken in connection-serial
//! order). Frames other than `REQUEST` are forwarded verbatim with the id
//! rewritten; the relay never inspects or buffers payload.

use crate::config::ServerConfig;
use crate::discovery::{Discovery, Entry};
use crate::error::{Error, FrameError, Result};
use crate::frame::{CloseReason, Frame, FrameType, read_frame};
use crate::handshake::{Verdict, server_hello};
use crate::ids::{IdSpace, Parity};
use crate::keys::{PubKey, SecretKey};
use crate::link::Link;
use crate::metrics::{Metrics, MetricsSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard, watch};

type Relations = HashMap<u16, Relation>;

async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// One half of a relayed circuit
#[derive(Debug, Clone)]
struct Relation {
    peer: Weak<ServerConn>,
    peer_id: u16,
    accepted: bool,
    nonce: u64,
}

impl Relation {
    fn points_to(&self, conn: &Arc<ServerConn>, id: u16) -> bool {
        self.peer_id == id && std::ptr::eq(self.peer.as_ptr(), Arc::as_ptr(conn))
    }
}

/// Public view of one relation half
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationInfo {
    /// Client owning this half
    pub client: PubKey,
    /// Circuit id on that client's connection
    pub id: u16,
    /// Client owning the other half
    pub peer: PubKey,
    /// Circuit id on the peer's connection
    pub peer_id: u16,
}

/// Relay-side state for one connected client
#[derive(Debug)]
pub struct ServerConn {
    serial: u64,
    remote: PubKey,
    link: Arc<Link>,
    ids: Mutex<IdSpace>,
    relations: RwLock<Relations>,
}

impl ServerConn {
    /// Key of the connected client
    #[must_use]
    pub fn remote_pk(&self) -> PubKey {
        self.remote
    }

    async fn relation(&self, id: u16) -> Option<Relation> {
        self.relations.read().await.get(&id).cloned()
    }

    async fn close_circuit(&self, id: u16, reason: CloseReason) {
        let _ = self.link.post_frame(&Frame::close(id, reason));
    }

    async fn release_id(&self, id: u16) {
        if Parity::of(id) == Parity::Odd {
            self.ids.lock().await.release(id);
        }
    }
}

/// Write guards over the relation tables of two (possibly identical) conns
enum PairGuard<'a> {
    Same(RwLockWriteGuard<'a, Relations>),
    Distinct(RwLockWriteGuard<'a, Relations>, RwLockWriteGuard<'a, Relations>),
}

/// Lock both relation tables in connection-serial order
async fn lock_pair<'a>(a: &'a ServerConn, b: &'a ServerConn) -> PairGuard<'a> {
    if a.serial == b.serial {
        PairGuard::Same(a.relations.write().await)
    } else if a.serial < b.serial {
        let ga = a.relations.write().await;
        let gb = b.relations.write().await;
        PairGuard::Distinct(ga, gb)
    } else {
        let gb = b.relations.write().await;
        let ga = a.relations.write().await;
        PairGuard::Distinct(ga, gb)
    }
}

impl PairGuard<'_> {
    fn first(&mut self) -> &mut Relations {
        match self {
            PairGuard::Same(g) | PairGuard::Distinct(g, _) => &mut **g,
        }
    }

    fn second(&mut self) -> &mut Relations {
        match self {
            PairGuard::Same(g) | PairGuard::Distinct(_, g) => &mut **g,
        }
    }
}

#[derive(Debug)]
struct ServerInner {
    secret: SecretKey,
    config: ServerConfig,
    conns: RwLock<HashMap<PubKey, Arc<ServerConn>>>,
    next_serial: AtomicU64,
    next_nonce: AtomicU64,
    entry_sequence: AtomicU64,
    metrics: Metrics,
    shutdown: watch::Sender<bool>,
}

/// dmsg relay server
#[derive(Debug, Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a relay identified by `secret`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(secret: SecretKey, config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ServerInner {
                secret,
                config,
                conns: RwLock::new(HashMap::new()),
                next_serial: AtomicU64::new(0),
                next_nonce: AtomicU64::new(0),
                entry_sequence: AtomicU64::new(0),
                metrics: Metrics::new(),
                shutdown,
            }),
        })
    }

    /// The relay's public key
    #[must_use]
    pub fn public_key(&self) -> PubKey {
        self.inner.secret.public_key()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Number of connected clients
    pub async fn session_count(&self) -> usize {
        self.inner.conns.read().await.len()
    }

    /// Connection state for a connected client, if any
    pub async fn conn(&self, pk: &PubKey) -> Option<Arc<ServerConn>> {
        self.inner.conns.read().await.get(pk).cloned()
    }

    /// Every relation half currently held
    pub async fn relations(&self) -> Vec<RelationInfo> {
        let conns: Vec<_> = self.inner.conns.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for conn in conns {
            for (&id, rel) in conn.relations.read().await.iter() {
                if let Some(peer) = rel.peer.upgrade() {
                    out.push(RelationInfo {
                        client: conn.remote,
                        id,
                        peer: peer.remote,
                        peer_id: rel.peer_id,
                    });
                }
            }
        }
        out
    }

    /// Accept connections until [`close`](Self::close) is called
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the listener's address cannot be read.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        tracing::info!(
            addr = %listener.local_addr()?,
            pk = %self.public_key().short(),
            "relay listening"
        );
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            tokio::select! {
                res = listener.accept() => match res {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_conn(stream).await {
                                tracing::debug!(%addr, "session ended: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                },
                () = stopped(&mut shutdown) => break,
            }
        }

        tracing::info!("relay stopped accepting");
        Ok(())
    }

    /// Run one client session over an established stream until it ends
    ///
    /// # Errors
    ///
    /// Fails if the hello does not complete or the relay is full.
    pub async fn serve_conn<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;
        if *inner.shutdown.borrow() {
            return Err(Error::ClosedPipe);
        }
        let remote = server_hello(
            &mut stream,
            &inner.secret,
            inner.config.transport.handshake_timeout,
        )
        .await?;

        let (reader, writer) = tokio::io::split(stream);
        let link = Link::spawn(writer, inner.config.link_queue);
        let conn = Arc::new(ServerConn {
            serial: inner.next_serial.fetch_add(1, Ordering::Relaxed),
            remote,
            link: Arc::clone(&link),
            ids: Mutex::new(IdSpace::new(Parity::Odd)),
            relations: RwLock::new(HashMap::new()),
        });

        let superseded = {
            let mut conns = inner.conns.write().await;
            if !conns.contains_key(&remote) && conns.len() >= inner.config.max_sessions {
                None
            } else {
                // The verdict precedes every frame forwarded onto this link
                let _ = link.post(vec![Verdict::Admitted as u8]);
                Some(conns.insert(remote, Arc::clone(&conn)))
            }
        };
        let Some(superseded) = superseded else {
            tracing::warn!(client = %remote.short(), "relay full, refusing session");
            let _ = link.post(vec![Verdict::ServerFull as u8]);
            link.shutdown();
            return Err(Error::ServerFull);
        };

        inner.metrics.connection_opened();
        tracing::info!(client = %remote.short(), "client session started");

        if let Some(old) = superseded {
            tracing::info!(client = %remote.short(), "superseding previous session");
            self.drop_conn(&old).await;
        }

        self.read_loop(&conn, reader).await;
        self.drop_conn(&conn).await;
        Ok(())
    }

    async fn read_loop<R>(&self, conn: &Arc<ServerConn>, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let frame = tokio::select! {
                res = read_frame(&mut reader) => res,
                () = conn.link.closed() => break,
            };
            match frame {
                Ok(frame) => self.handle_frame(conn, frame).await,
                Err(FrameError::InvalidFrameType(t)) => {
                    tracing::warn!(client = %conn.remote.short(), "skipping frame of unknown type 0x{:02X}", t);
                }
                Err(e) if e.is_eof() => break,
                Err(e) => {
                    tracing::debug!(client = %conn.remote.short(), "session read failed: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_frame(&self, src: &Arc<ServerConn>, frame: Frame) {
        let id = frame.circuit_id();
        match (src.relation(id).await, frame.frame_type()) {
            (None, FrameType::Request) => self.handle_request(src, &frame).await,
            (Some(_), FrameType::Request) => {
                tracing::warn!(client = %src.remote.short(), id, "REQUEST on a relayed id ignored");
            }
            (None, FrameType::Close) => {}
            (None, _) => src.close_circuit(id, CloseReason::Rejected).await,
            (Some(rel), frame_type) => self.forward(src, id, rel, frame, frame_type).await,
        }
    }

    async fn handle_request(&self, src: &Arc<ServerConn>, frame: &Frame) {
        let id = frame.circuit_id();
        if Parity::of(id) != Parity::Even {
            tracing::warn!(client = %src.remote.short(), id, "REQUEST with a relay-owned id");
            return src.close_circuit(id, CloseReason::Rejected).await;
        }
        let responder = match frame.handshake_keys() {
            Ok((initiator, responder)) if initiator == src.remote => responder,
            Ok(_) => {
                tracing::warn!(client = %src.remote.short(), id, "REQUEST names another initiator");
                return src.close_circuit(id, CloseReason::Rejected).await;
            }
            Err(e) => {
                tracing::warn!(client = %src.remote.short(), id, "malformed REQUEST: {}", e);
                return src.close_circuit(id, CloseReason::Rejected).await;
            }
        };

        let Some(dst) = self.conn(&responder).await else {
            tracing::debug!(id, responder = %responder.short(), "responder not connected");
            return src.close_circuit(id, CloseReason::Rejected).await;
        };
        let dst_id = match dst.ids.lock().await.allocate() {
            Ok(dst_id) => dst_id,
            Err(e) => {
                tracing::warn!(responder = %responder.short(), "cannot relay circuit: {}", e);
                return src.close_circuit(id, CloseReason::Rejected).await;
            }
        };

        let nonce = self.inner.next_nonce.fetch_add(1, Ordering::Relaxed);
        {
            let mut pair = lock_pair(src, &dst).await;
            pair.first().insert(
                id,
                Relation {
                    peer: Arc::downgrade(&dst),
                    peer_id: dst_id,
                    accepted: false,
                    nonce,
                },
            );
            pair.second().insert(
                dst_id,
                Relation {
                    peer: Arc::downgrade(src),
                    peer_id: id,
                    accepted: false,
                    nonce,
                },
            );
        }
        self.inner.metrics.circuit_opened();

        if dst
            .link
            .post_frame(&frame.clone().with_circuit_id(dst_id))
            .is_err()
        {
            self.unpair(src, id, |_| true).await;
            return src.close_circuit(id, CloseReason::Rejected).await;
        }
        tracing::debug!(
            initiator = %src.remote.short(),
            responder = %responder.short(),
            id,
            dst_id,
            "relayed REQUEST"
        );
        self.spawn_handshake_timeout(Arc::clone(src), id, nonce);
    }

    fn spawn_handshake_timeout(&self, src: Arc<ServerConn>, id: u16, nonce: u64) {
        let server = self.clone();
        let timeout = self.inner.config.transport.handshake_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let stale = |rel: &Relation| rel.nonce == nonce && !rel.accepted;
            if let Some((peer, peer_id)) = server.unpair(&src, id, stale).await {
                tracing::debug!(initiator = %src.remote.short(), id, "relayed handshake timed out");
                src.close_circuit(id, CloseReason::TimedOut).await;
                peer.close_circuit(peer_id, CloseReason::TimedOut).await;
            }
        });
    }

    async fn forward(&self, src: &Arc<ServerConn>, id: u16, rel: Relation, frame: Frame, frame_type: FrameType) {
        let Some(dst) = rel.peer.upgrade() else {
            self.unpair(src, id, |_| true).await;
            return src.close_circuit(id, CloseReason::Normal).await;
        };

        if frame_type == FrameType::Accept {
            let mut pair = lock_pair(src, &dst).await;
            if let Some(r) = pair.first().get_mut(&id) {
                r.accepted = true;
            }
            if let Some(r) = pair.second().get_mut(&rel.peer_id) {
                r.accepted = true;
            }
        }

        if dst
            .link
            .post_frame(&frame.with_circuit_id(rel.peer_id))
            .is_err()
        {
            tracing::debug!(id, peer = %dst.remote.short(), "forward failed, tearing down circuit");
            if self.unpair(src, id, |_| true).await.is_some() {
                src.close_circuit(id, CloseReason::Normal).await;
            }
            return;
        }
        self.inner.metrics.frame_forwarded();

        if frame_type == FrameType::Close {
            self.unpair(src, id, |_| true).await;
        }
    }

    /// Delete both halves of the relation at `(a, a_id)` if `cond` holds,
    /// returning the other half's connection and id
    async fn unpair<F>(&self, a: &Arc<ServerConn>, a_id: u16, cond: F) -> Option<(Arc<ServerConn>, u16)>
    where
        F: Fn(&Relation) -> bool,
    {
        let rel = a.relation(a_id).await?;
        let Some(b) = rel.peer.upgrade() else {
            let removed = a.relations.write().await.remove(&a_id);
            if removed.is_some() {
                a.release_id(a_id).await;
                self.inner.metrics.circuit_closed();
            }
            return None;
        };

        {
            let mut pair = lock_pair(a, &b).await;
            match pair.first().get(&a_id) {
                Some(current) if cond(current) && current.points_to(&b, rel.peer_id) => {}
                _ => return None,
            }
            pair.first().remove(&a_id);
            if pair
                .second()
                .get(&rel.peer_id)
                .is_some_and(|back| back.points_to(a, a_id))
            {
                pair.second().remove(&rel.peer_id);
            }
        }

        a.release_id(a_id).await;
        b.release_id(rel.peer_id).await;
        self.inner.metrics.circuit_closed();
        Some((b, rel.peer_id))
    }

    async fn drop_conn(&self, conn: &Arc<ServerConn>) {
        {
            let mut conns = self.inner.conns.write().await;
            if conns.get(&conn.remote).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                conns.remove(&conn.remote);
            }
        }
        let was_open = !conn.link.is_closed();
        conn.link.shutdown();

        let ids: Vec<u16> = conn.relations.read().await.keys().copied().collect();
        for id in ids {
            if let Some((peer, peer_id)) = self.unpair(conn, id, |_| true).await {
                peer.close_circuit(peer_id, CloseReason::Normal).await;
            }
        }
        // Relations whose peer already vanished
        conn.relations.write().await.clear();

        if was_open {
            self.inner.metrics.connection_closed();
            tracing::info!(client = %conn.remote.short(), "client session ended");
        }
    }

    /// Publish this relay's entry (address and spare sessions)
    ///
    /// # Errors
    ///
    /// Returns discovery errors unchanged.
    pub async fn publish_entry(&self, discovery: &dyn Discovery, address: &str) -> Result<()> {
        let used = self.session_count().await;
        let available = self.inner.config.max_sessions.saturating_sub(used) as u64;
        let published = discovery
            .resolve(&self.public_key())
            .await
            .map_or(0, |prev| prev.sequence + 1);
        let sequence = self
            .inner
            .entry_sequence
            .fetch_max(published, Ordering::Relaxed)
            .max(published);
        self.inner.entry_sequence.store(sequence + 1, Ordering::Relaxed);
        let mut entry = Entry::server(self.public_key(), address.to_string(), available, sequence);
        entry.sign(&self.inner.secret)?;
        discovery.publish(entry).await
    }

    /// Stop accepting and drop every client session
    pub async fn close(&self) {
        if self.inner.shutdown.send_replace(true) {
            return;
        }
        let conns: Vec<_> = self.inner.conns.read().await.values().cloned().collect();
        for conn in conns {
            self.drop_conn(&conn).await;
        }
        tracing::info!(pk = %self.public_key().short(), "relay closed");
    }
}
