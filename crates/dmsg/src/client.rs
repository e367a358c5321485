//! Endpoint client.
//!
//! A [`Client`] holds one [`ClientConn`] per relay server it is attached to
//! and publishes that relay set to discovery whenever it changes, so that
//! other endpoints can find it. [`Client::dial`] resolves the remote's
//! relays and opens a circuit through the first one that accepts;
//! [`Client::accept`] yields circuits opened towards this endpoint on any
//! of its relays.
//!
//! Lost relay connections are re-established after a fixed back-off until
//! the client is closed. Failed attempts are logged, not surfaced.

use crate::client_conn::ClientConn;
use crate::config::ClientConfig;
use crate::discovery::{Discovery, Entry};
use crate::error::{DiscoveryError, Error, Result};
use crate::keys::{PubKey, SecretKey};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::transport::Transport;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, mpsc, watch};

struct ClientInner {
    secret: SecretKey,
    config: ClientConfig,
    discovery: Arc<dyn Discovery>,
    conns: RwLock<HashMap<PubKey, ClientConn>>,
    connecting: DashMap<PubKey, Arc<Mutex<()>>>,
    accept_tx: mpsc::Sender<Transport>,
    accept_rx: Mutex<mpsc::Receiver<Transport>>,
    sequence: Mutex<Option<u64>>,
    closed: watch::Sender<bool>,
    metrics: Arc<Metrics>,
}

/// dmsg endpoint
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("pk", &self.public_key())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client identified by `secret`
    ///
    /// No connection is made until [`initiate_server_connections`] or
    /// [`dial`] is called.
    ///
    /// [`initiate_server_connections`]: Self::initiate_server_connections
    /// [`dial`]: Self::dial
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(secret: SecretKey, discovery: Arc<dyn Discovery>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_buffer);
        let (closed, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(ClientInner {
                secret,
                config,
                discovery,
                conns: RwLock::new(HashMap::new()),
                connecting: DashMap::new(),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                sequence: Mutex::new(None),
                closed,
                metrics: Arc::new(Metrics::new()),
            }),
        })
    }

    /// This endpoint's key
    #[must_use]
    pub fn public_key(&self) -> PubKey {
        self.inner.secret.public_key()
    }

    /// True once [`close`](Self::close) has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Relays this client currently holds a live connection to
    pub async fn connected_servers(&self) -> Vec<PubKey> {
        self.inner.live_servers().await
    }

    /// Connect to up to `min_sessions` relays advertised by discovery
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoRelayAvailable`] if no relay could be reached,
    /// [`Error::ClientClosed`] after [`close`](Self::close).
    pub async fn initiate_server_connections(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::ClientClosed);
        }

        let servers = inner.discovery.available_servers().await?;
        for entry in servers {
            if inner.live_servers().await.len() >= inner.config.min_sessions {
                break;
            }
            let Some(server) = entry.server.as_ref() else {
                continue;
            };
            if let Err(e) = inner.ensure_conn(entry.static_pk, &server.address).await {
                tracing::warn!(relay = %entry.static_pk.short(), addr = %server.address, "relay unreachable: {}", e);
            }
        }

        if inner.live_servers().await.is_empty() {
            return Err(Error::NoRelayAvailable);
        }
        Ok(())
    }

    /// Open a circuit to `remote`
    ///
    /// Tries each relay `remote` has delegated to, relays this client is
    /// already connected to first, and moves on when a relay cannot be
    /// reached or the circuit handshake fails.
    ///
    /// # Errors
    ///
    /// - [`Error::NoRelayAvailable`] if `remote` has no reachable relay
    /// - [`Error::Rejected`] / [`Error::HandshakeTimeout`] from the last
    ///   relay tried when every handshake failed
    /// - [`Error::ClientClosed`] after [`close`](Self::close)
    pub async fn dial(&self, remote: PubKey) -> Result<Transport> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(Error::ClientClosed);
        }

        let entry = match inner.discovery.resolve(&remote).await {
            Ok(entry) => entry,
            Err(Error::Discovery(DiscoveryError::EntryNotFound(_))) => {
                tracing::debug!(remote = %remote.short(), "remote has no discovery entry");
                return Err(Error::NoRelayAvailable);
            }
            Err(e) => return Err(e),
        };

        let connected = inner.live_servers().await;
        let mut candidates: Vec<PubKey> = entry.delegated_servers().to_vec();
        candidates.sort_by_key(|pk| !connected.contains(pk));

        let mut last_err = Error::NoRelayAvailable;
        for server in candidates {
            let conn = match inner.conn_for(server).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(relay = %server.short(), "relay unusable: {}", e);
                    continue;
                }
            };
            match conn.dial(remote).await {
                Ok(transport) => return Ok(transport),
                Err(e @ (Error::Rejected | Error::HandshakeTimeout)) => {
                    tracing::debug!(relay = %server.short(), remote = %remote.short(), "dial failed: {}", e);
                    last_err = e;
                }
                Err(e) if e.is_transient() => {
                    tracing::debug!(relay = %server.short(), remote = %remote.short(), "relay dropped out: {}", e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    /// Wait for the next circuit opened towards this endpoint
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] once the client is closed.
    pub async fn accept(&self) -> Result<Transport> {
        let inner = &self.inner;
        let mut closed = inner.closed.subscribe();
        let mut rx = inner.accept_rx.lock().await;
        tokio::select! {
            biased;
            () = wait_closed(&mut closed) => Err(Error::ClientClosed),
            transport = rx.recv() => transport.ok_or(Error::ClientClosed),
        }
    }

    /// Close every relay connection and circuit; idempotent
    pub async fn close(&self) {
        let inner = &self.inner;
        if inner.closed.send_replace(true) {
            return;
        }
        let conns: Vec<ClientConn> = inner.conns.write().await.drain().map(|(_, c)| c).collect();
        for conn in &conns {
            conn.close().await;
        }
        tracing::info!(pk = %self.public_key().short(), relays = conns.len(), "client closed");
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn live_servers(&self) -> Vec<PubKey> {
        self.conns
            .read()
            .await
            .iter()
            .filter(|(_, c)| !c.is_closed())
            .map(|(pk, _)| *pk)
            .collect()
    }

    /// Existing live connection to `server`, or a new one via its entry
    async fn conn_for(self: &Arc<Self>, server: PubKey) -> Result<ClientConn> {
        if let Some(conn) = self.live_conn(&server).await {
            return Ok(conn);
        }
        let entry = self.discovery.resolve(&server).await?;
        let address = entry
            .server
            .map(|s| s.address)
            .ok_or(Error::NoRelayAvailable)?;
        self.ensure_conn(server, &address).await
    }

    async fn live_conn(&self, server: &PubKey) -> Option<ClientConn> {
        self.conns
            .read()
            .await
            .get(server)
            .filter(|c| !c.is_closed())
            .cloned()
    }

    /// Gate serializing connection attempts to one relay
    ///
    /// A second session from this key would supersede the first at the relay.
    fn relay_gate(&self, server: PubKey) -> Arc<Mutex<()>> {
        Arc::clone(self.connecting.entry(server).or_default().value())
    }

    /// Connect to `server` unless already connected, and supervise the link
    async fn ensure_conn(self: &Arc<Self>, server: PubKey, address: &str) -> Result<ClientConn> {
        let conn = {
            let gate = self.relay_gate(server);
            let _connecting = gate.lock().await;
            if let Some(conn) = self.live_conn(&server).await {
                return Ok(conn);
            }
            let conn = self.establish(server, address).await?;
            self.spawn_supervisor(server, address.to_string(), conn.clone());
            conn
        };
        self.publish().await;
        Ok(conn)
    }

    async fn establish(&self, server: PubKey, address: &str) -> Result<ClientConn> {
        let timeout = self.config.transport.handshake_timeout;
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::HandshakeTimeout)??;
        stream.set_nodelay(true)?;

        let conn = ClientConn::connect(
            stream,
            &self.secret,
            server,
            &self.config,
            self.accept_tx.clone(),
            Arc::clone(&self.metrics),
        )
        .await?;

        let rejected = {
            let mut conns = self.conns.write().await;
            if self.is_closed() {
                true
            } else {
                conns.insert(server, conn.clone());
                false
            }
        };
        if rejected {
            conn.close().await;
            return Err(Error::ClientClosed);
        }
        Ok(conn)
    }

    fn spawn_supervisor(self: &Arc<Self>, server: PubKey, address: String, conn: ClientConn) {
        let weak = Arc::downgrade(self);
        tokio::spawn(supervise(weak, server, address, conn));
    }

    async fn forget(&self, server: &PubKey, conn: &ClientConn) {
        let mut conns = self.conns.write().await;
        if conns.get(server).is_some_and(|c| c.same(conn)) {
            conns.remove(server);
        }
    }

    /// Publish the current relay set as a signed client entry
    async fn publish(&self) {
        let mut sequence = self.sequence.lock().await;
        let pk = self.secret.public_key();
        let next = match *sequence {
            Some(seq) => seq + 1,
            None => self
                .discovery
                .resolve(&pk)
                .await
                .map_or(0, |prev| prev.sequence + 1),
        };
        *sequence = Some(next);

        let servers = self.live_servers().await;
        let mut entry = Entry::client(pk, servers, next);
        if let Err(e) = entry.sign(&self.secret) {
            tracing::warn!("cannot sign client entry: {}", e);
            return;
        }
        match self.discovery.publish(entry).await {
            Ok(()) => tracing::debug!(pk = %pk.short(), sequence = next, "client entry published"),
            Err(e) => tracing::warn!(pk = %pk.short(), "publishing client entry failed: {}", e),
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let conns: Vec<ClientConn> = self.conns.get_mut().drain().map(|(_, c)| c).collect();
        if conns.is_empty() {
            return;
        }
        // Read loops keep their connections alive; close them explicitly
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                for conn in conns {
                    conn.close().await;
                }
            });
        }
    }
}

/// Re-establish the connection to `server` whenever it drops, until the
/// client closes
async fn supervise(client: Weak<ClientInner>, server: PubKey, address: String, mut conn: ClientConn) {
    loop {
        conn.closed().await;

        {
            let Some(inner) = client.upgrade() else {
                return;
            };
            inner.forget(&server, &conn).await;
            if inner.is_closed() {
                return;
            }
            tracing::info!(relay = %server.short(), "relay connection lost");
            inner.publish().await;
        }

        loop {
            let backoff = match client.upgrade() {
                Some(inner) => inner.config.reconnect_backoff,
                None => return,
            };
            tokio::time::sleep(backoff).await;

            let Some(inner) = client.upgrade() else {
                return;
            };
            if inner.is_closed() {
                return;
            }
            let reconnected = {
                let gate = inner.relay_gate(server);
                let _connecting = gate.lock().await;
                if inner.live_conn(&server).await.is_some() {
                    // Reconnected elsewhere, which started its own supervisor
                    tracing::debug!(relay = %server.short(), "relay already reconnected");
                    return;
                }
                inner.establish(server, &address).await
            };
            match reconnected {
                Ok(fresh) => {
                    tracing::info!(relay = %server.short(), "relay connection re-established");
                    inner.publish().await;
                    conn = fresh;
                    break;
                }
                Err(e) => {
                    tracing::warn!(relay = %server.short(), addr = %address, "reconnect failed: {}", e);
                }
            }
        }
    }
}
