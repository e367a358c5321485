//! Relay test fixture
//!
//! Runs a real [`Server`] on a loopback TCP listener and hands out clients
//! that find it through a shared in-memory discovery.
//!
//! # Example
//!
//! ```no_run
//! use dmsg_integration_tests::fixtures::RelayFixture;
//!
//! # async fn demo() -> dmsg::Result<()> {
//! let relay = RelayFixture::start().await?;
//! let alice = relay.client().await?;
//! let bob = relay.client().await?;
//! let transport = alice.dial(bob.public_key()).await?;
//! # Ok(())
//! # }
//! ```

use dmsg::{
    Client, ClientConfig, Discovery, MemoryDiscovery, PubKey, Result, SecretKey, Server,
    ServerConfig, TransportConfig,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// Client settings with short timeouts so failure paths finish quickly
pub fn fast_client_config() -> ClientConfig {
    ClientConfig {
        transport: TransportConfig {
            handshake_timeout: Duration::from_secs(2),
            ..TransportConfig::default()
        },
        reconnect_backoff: Duration::from_millis(100),
        ..ClientConfig::default()
    }
}

/// Poll `check` until it returns true or `timeout` elapses
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(timeout, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

/// One relay plus the discovery its clients use
pub struct RelayFixture {
    /// The running relay
    pub server: Server,
    /// Loopback address it listens on
    pub addr: SocketAddr,
    /// Discovery shared by the relay and every fixture client
    pub discovery: Arc<MemoryDiscovery>,
    secret: SecretKey,
    config: ServerConfig,
    serving: Option<JoinHandle<Result<()>>>,
}

impl RelayFixture {
    /// Start a relay with default settings and a fresh discovery
    ///
    /// # Errors
    ///
    /// Fails if the loopback listener cannot be bound.
    pub async fn start() -> Result<Self> {
        Self::start_with(Arc::new(MemoryDiscovery::new()), ServerConfig::default()).await
    }

    /// Start a relay publishing into `discovery`
    ///
    /// # Errors
    ///
    /// Fails if the loopback listener cannot be bound or the entry is refused.
    pub async fn start_with(discovery: Arc<MemoryDiscovery>, config: ServerConfig) -> Result<Self> {
        let secret = SecretKey::generate();
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let server = Server::new(secret.clone(), config.clone())?;
        server
            .publish_entry(discovery.as_ref(), &addr.to_string())
            .await?;
        let serving = Some(spawn_serve(&server, listener));

        Ok(Self {
            server,
            addr,
            discovery,
            secret,
            config,
            serving,
        })
    }

    /// The relay's key
    pub fn public_key(&self) -> PubKey {
        self.server.public_key()
    }

    /// Discovery handle in the form clients take
    pub fn shared_discovery(&self) -> Arc<dyn Discovery> {
        self.discovery.clone()
    }

    /// A client with a fresh key, not yet connected
    ///
    /// # Errors
    ///
    /// Fails if the configuration does not validate.
    pub fn detached_client(&self) -> Result<Client> {
        Client::new(SecretKey::generate(), self.shared_discovery(), fast_client_config())
    }

    /// A client with a fresh key, connected to this relay
    ///
    /// # Errors
    ///
    /// Fails if the client cannot reach the relay.
    pub async fn client(&self) -> Result<Client> {
        let client = self.detached_client()?;
        client.initiate_server_connections().await?;
        Ok(client)
    }

    /// Wait until the relay holds exactly `sessions` client connections
    pub async fn wait_for_sessions(&self, sessions: usize) -> bool {
        let server = self.server.clone();
        eventually(Duration::from_secs(5), move || {
            let server = server.clone();
            async move { server.session_count().await == sessions }
        })
        .await
    }

    /// Close the relay and its listener
    pub async fn stop(&mut self) {
        self.server.close().await;
        if let Some(serving) = self.serving.take() {
            let _ = serving.await;
        }
    }

    /// Stop, then bring up a relay with the same key on the same address
    ///
    /// # Errors
    ///
    /// Fails if the address cannot be bound again.
    pub async fn restart(&mut self) -> Result<()> {
        self.stop().await;
        let listener = TcpListener::bind(self.addr).await?;
        self.server = Server::new(self.secret.clone(), self.config.clone())?;
        self.serving = Some(spawn_serve(&self.server, listener));
        tracing::debug!(addr = %self.addr, "relay restarted");
        Ok(())
    }
}

fn spawn_serve(server: &Server, listener: TcpListener) -> JoinHandle<Result<()>> {
    let server = server.clone();
    tokio::spawn(async move { server.serve(listener).await })
}
