//! Client-side multiplexer for one physical connection to one relay.
//!
//! A [`ClientConn`] owns the circuit table for its connection and a single
//! read loop that demultiplexes incoming frames:
//!
//! - frames for a known circuit id go to that circuit
//! - a `REQUEST` on an unknown odd id opens a remotely initiated circuit,
//!   which is handed to the owning client's accept queue
//! - anything else on an unknown id is answered with `CLOSE`
//!
//! Locally initiated circuits use even ids from the connection's
//! [`IdSpace`]. When the connection drops, every circuit on it is closed.

use crate::config::{ClientConfig, TransportConfig};
use crate::error::{Error, FrameError, Result};
use crate::frame::{CloseReason, Frame, FrameType, read_frame};
use crate::handshake::client_hello;
use crate::ids::{IdSpace, Parity};
use crate::keys::{PubKey, SecretKey};
use crate::link::Link;
use crate::metrics::Metrics;
use crate::transport::{Circuit, Transport, TransportState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock, mpsc, watch};

/// Shared state of one relay connection
#[derive(Debug)]
pub(crate) struct ConnInner {
    local: PubKey,
    relay: PubKey,
    config: TransportConfig,
    link: Arc<Link>,
    transports: RwLock<HashMap<u16, Arc<Circuit>>>,
    ids: Mutex<IdSpace>,
    accept_tx: mpsc::Sender<Transport>,
    metrics: Arc<Metrics>,
    done: watch::Sender<bool>,
}

/// Multiplexed connection to one relay server
#[derive(Debug, Clone)]
pub struct ClientConn {
    inner: Arc<ConnInner>,
}

impl ClientConn {
    /// Authenticate `relay` over `stream` and start serving it
    ///
    /// Remotely initiated circuits are delivered on `accept_tx`.
    pub(crate) async fn connect<S>(
        mut stream: S,
        secret: &SecretKey,
        relay: PubKey,
        config: &ClientConfig,
        accept_tx: mpsc::Sender<Transport>,
        metrics: Arc<Metrics>,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        client_hello(&mut stream, secret, &relay, config.transport.handshake_timeout).await?;

        let (reader, writer) = tokio::io::split(stream);
        let link = Link::spawn(writer, config.link_queue);
        let (done, _) = watch::channel(false);
        let inner = Arc::new(ConnInner {
            local: secret.public_key(),
            relay,
            config: config.transport.clone(),
            link,
            transports: RwLock::new(HashMap::new()),
            ids: Mutex::new(IdSpace::new(Parity::Even)),
            accept_tx,
            metrics,
            done,
        });
        inner.metrics.connection_opened();
        tracing::info!(relay = %relay.short(), "connected to relay");

        tokio::spawn(serve(Arc::clone(&inner), reader));
        Ok(Self { inner })
    }

    /// Key of the relay this connection is attached to
    #[must_use]
    pub fn relay_pk(&self) -> PubKey {
        self.inner.relay
    }

    /// Local endpoint key
    #[must_use]
    pub fn local_pk(&self) -> PubKey {
        self.inner.local
    }

    /// True once the connection has been torn down
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.inner.done.borrow()
    }

    /// Resolves when the connection is torn down
    pub async fn closed(&self) {
        let mut rx = self.inner.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Number of circuits currently open on this connection
    pub async fn transport_count(&self) -> usize {
        self.inner.transports.read().await.len()
    }

    pub(crate) fn same(&self, other: &ClientConn) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open a circuit to `remote` through this relay
    ///
    /// # Errors
    ///
    /// - [`Error::Rejected`] if the relay or the remote answered `CLOSE`
    /// - [`Error::HandshakeTimeout`] if neither `ACCEPT` nor `CLOSE` arrived
    /// - [`Error::IdsExhausted`] if every even id is in use
    /// - [`Error::ClosedPipe`] if the connection is closed
    pub async fn dial(&self, remote: PubKey) -> Result<Transport> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }

        let id = inner.ids.lock().await.allocate()?;
        let circuit = Circuit::new(
            id,
            inner.local,
            remote,
            &inner.config,
            Arc::clone(&inner.link),
            Arc::downgrade(inner),
            TransportState::Negotiating,
        );
        let handshake = circuit.begin_handshake();
        inner.insert_circuit(Arc::clone(&circuit)).await;

        // Dropping the handle on any early return closes the circuit
        let transport = Transport::new(circuit);
        inner
            .link
            .post_frame(&Frame::request(id, &inner.local, &remote))?;
        tracing::debug!(id, remote = %remote.short(), relay = %inner.relay.short(), "REQUEST sent");

        match tokio::time::timeout(inner.config.handshake_timeout, handshake).await {
            Ok(Ok(Ok(()))) => Ok(transport),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(Error::ClosedPipe),
            Err(_) => {
                tracing::debug!(id, remote = %remote.short(), "circuit handshake timed out");
                transport.circuit().close_with(CloseReason::TimedOut).await?;
                Err(Error::HandshakeTimeout)
            }
        }
    }

    /// Tear down the connection and every circuit on it
    pub async fn close(&self) {
        self.inner.teardown().await;
    }
}

impl ConnInner {
    async fn insert_circuit(&self, circuit: Arc<Circuit>) {
        self.transports.write().await.insert(circuit.id(), circuit);
        self.metrics.circuit_opened();
    }

    /// Forget a circuit and free its id (called by the circuit on close)
    pub(crate) async fn remove_circuit(&self, id: u16) {
        if self.transports.write().await.remove(&id).is_some() {
            self.metrics.circuit_closed();
        }
        if Parity::of(id) == Parity::Even {
            self.ids.lock().await.release(id);
        }
    }

    async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let id = frame.circuit_id();
        let circuit = self.transports.read().await.get(&id).cloned();

        match (circuit, frame.frame_type()) {
            (Some(circuit), _) => {
                self.metrics.frame_forwarded();
                circuit.handle_frame(frame).await;
            }
            (None, FrameType::Request) => self.handle_request(&frame).await,
            (None, FrameType::Close) => {
                tracing::trace!(id, "CLOSE for unknown circuit ignored");
            }
            (None, frame_type) => {
                tracing::debug!(id, frame = frame_type.name(), "frame for unknown circuit");
                self.reject(id).await;
            }
        }
    }

    async fn handle_request(self: &Arc<Self>, frame: &Frame) {
        let id = frame.circuit_id();
        if Parity::of(id) != Parity::Odd {
            tracing::warn!(id, "REQUEST with a locally owned id");
            return self.reject(id).await;
        }
        let (initiator, responder) = match frame.handshake_keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(id, "malformed REQUEST: {}", e);
                return self.reject(id).await;
            }
        };
        if responder != self.local {
            tracing::warn!(id, responder = %responder.short(), "REQUEST for another endpoint");
            return self.reject(id).await;
        }

        let Ok(slot) = self.accept_tx.try_reserve() else {
            tracing::debug!(id, "accept queue full, rejecting circuit");
            return self.reject(id).await;
        };

        let circuit = Circuit::new(
            id,
            self.local,
            initiator,
            &self.config,
            Arc::clone(&self.link),
            Arc::downgrade(self),
            TransportState::Serving,
        );
        self.insert_circuit(Arc::clone(&circuit)).await;

        if self
            .link
            .post_frame(&Frame::accept(id, &initiator, &self.local))
            .is_err()
        {
            circuit.link_lost();
            self.remove_circuit(id).await;
            return;
        }
        tracing::debug!(id, remote = %initiator.short(), "accepted circuit");
        slot.send(Transport::new(circuit));
    }

    async fn reject(&self, id: u16) {
        let _ = self.link.post_frame(&Frame::close(id, CloseReason::Rejected));
    }

    async fn teardown(&self) {
        if self.done.send_replace(true) {
            return;
        }
        self.link.shutdown();

        let circuits: Vec<_> = self.transports.write().await.drain().map(|(_, c)| c).collect();
        for circuit in &circuits {
            circuit.link_lost();
            self.metrics.circuit_closed();
        }
        self.metrics.connection_closed();
        tracing::info!(
            relay = %self.relay.short(),
            circuits = circuits.len(),
            "relay connection closed"
        );
    }
}

async fn serve<R>(inner: Arc<ConnInner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = tokio::select! {
            res = read_frame(&mut reader) => res,
            () = inner.link.closed() => break,
        };
        match frame {
            Ok(frame) => {
                tracing::trace!(
                    id = frame.circuit_id(),
                    frame = frame.frame_type().name(),
                    len = frame.payload().len(),
                    "frame received"
                );
                inner.dispatch(frame).await;
            }
            Err(FrameError::InvalidFrameType(t)) => {
                tracing::warn!("skipping frame of unknown type 0x{:02X}", t);
            }
            Err(e) if e.is_eof() => {
                tracing::debug!(relay = %inner.relay.short(), "relay closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(relay = %inner.relay.short(), "relay connection failed: {}", e);
                break;
            }
        }
    }
    inner.teardown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{HANDSHAKE_PAYLOAD_SIZE, write_frame};
    use crate::handshake::{Verdict, send_verdict, server_hello};
    use std::time::Duration;
    use tokio::io::DuplexStream;

    struct FakeRelay {
        conn: ClientConn,
        accepted: mpsc::Receiver<Transport>,
        wire: DuplexStream,
        client_pk: PubKey,
    }

    async fn fake_relay(config: ClientConfig, accept_buffer: usize) -> FakeRelay {
        let client_sk = SecretKey::generate();
        let relay_sk = SecretKey::generate();
        let relay_pk = relay_sk.public_key();
        let (c, mut s) = tokio::io::duplex(1 << 20);

        let relay = tokio::spawn(async move {
            server_hello(&mut s, &relay_sk, Duration::from_secs(2)).await.unwrap();
            send_verdict(&mut s, Verdict::Admitted).await.unwrap();
            s
        });

        let (tx, accepted) = mpsc::channel(accept_buffer);
        let conn = ClientConn::connect(c, &client_sk, relay_pk, &config, tx, Arc::new(Metrics::new()))
            .await
            .unwrap();
        FakeRelay {
            conn,
            accepted,
            wire: relay.await.unwrap(),
            client_pk: client_sk.public_key(),
        }
    }

    async fn expect_close(wire: &mut DuplexStream, id: u16) {
        let frame = read_frame(wire).await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Close);
        assert_eq!(frame.circuit_id(), id);
        assert_eq!(frame.close_reason(), CloseReason::Rejected);
    }

    #[tokio::test]
    async fn test_malformed_request_rejected() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;

        let bad = Frame::new(FrameType::Request, 1, vec![0u8; HANDSHAKE_PAYLOAD_SIZE - 3]).unwrap();
        write_frame(&mut relay.wire, &bad).await.unwrap();

        expect_close(&mut relay.wire, 1).await;
        assert_eq!(relay.conn.transport_count().await, 0);
        assert!(relay.accepted.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_misaddressed_request_rejected() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;
        let initiator = SecretKey::generate().public_key();
        let stranger = SecretKey::generate().public_key();

        write_frame(&mut relay.wire, &Frame::request(3, &initiator, &stranger))
            .await
            .unwrap();
        expect_close(&mut relay.wire, 3).await;

        // Even ids belong to the client
        write_frame(&mut relay.wire, &Frame::request(4, &initiator, &relay.client_pk))
            .await
            .unwrap();
        expect_close(&mut relay.wire, 4).await;

        assert_eq!(relay.conn.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_accepted() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;
        let initiator = SecretKey::generate().public_key();

        write_frame(&mut relay.wire, &Frame::request(5, &initiator, &relay.client_pk))
            .await
            .unwrap();

        let accept = read_frame(&mut relay.wire).await.unwrap();
        assert_eq!(accept.frame_type(), FrameType::Accept);
        assert_eq!(accept.circuit_id(), 5);
        assert_eq!(accept.handshake_keys().unwrap(), (initiator, relay.client_pk));

        let transport = relay.accepted.recv().await.unwrap();
        assert_eq!(transport.id(), 5);
        assert_eq!(transport.remote_pk(), initiator);
        assert_eq!(transport.state(), TransportState::Serving);
    }

    #[tokio::test]
    async fn test_full_accept_queue_rejects() {
        let mut relay = fake_relay(ClientConfig::default(), 1).await;
        let initiator = SecretKey::generate().public_key();

        write_frame(&mut relay.wire, &Frame::request(1, &initiator, &relay.client_pk))
            .await
            .unwrap();
        write_frame(&mut relay.wire, &Frame::request(3, &initiator, &relay.client_pk))
            .await
            .unwrap();

        assert_eq!(read_frame(&mut relay.wire).await.unwrap().frame_type(), FrameType::Accept);
        expect_close(&mut relay.wire, 3).await;
        assert_eq!(relay.conn.transport_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_id() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;

        // CLOSE on an unknown id is not answered
        write_frame(&mut relay.wire, &Frame::close(9, CloseReason::Normal))
            .await
            .unwrap();
        write_frame(&mut relay.wire, &Frame::fwd(7, 0, b"stale").unwrap())
            .await
            .unwrap();

        expect_close(&mut relay.wire, 7).await;
    }

    #[tokio::test]
    async fn test_dial_accepted() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;
        let remote = SecretKey::generate().public_key();

        let dial = {
            let conn = relay.conn.clone();
            tokio::spawn(async move { conn.dial(remote).await })
        };

        let request = read_frame(&mut relay.wire).await.unwrap();
        assert_eq!(request.frame_type(), FrameType::Request);
        assert_eq!(request.circuit_id() % 2, 0);
        let (initiator, responder) = request.handshake_keys().unwrap();
        assert_eq!((initiator, responder), (relay.client_pk, remote));
        write_frame(
            &mut relay.wire,
            &Frame::accept(request.circuit_id(), &initiator, &responder),
        )
        .await
        .unwrap();

        let transport = dial.await.unwrap().unwrap();
        assert_eq!(transport.state(), TransportState::Serving);
        assert_eq!(transport.remote_pk(), remote);
    }

    #[tokio::test]
    async fn test_dial_rejected() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;
        let remote = SecretKey::generate().public_key();

        let dial = {
            let conn = relay.conn.clone();
            tokio::spawn(async move { conn.dial(remote).await })
        };
        let request = read_frame(&mut relay.wire).await.unwrap();
        write_frame(&mut relay.wire, &Frame::close(request.circuit_id(), CloseReason::Rejected))
            .await
            .unwrap();

        assert!(matches!(dial.await.unwrap(), Err(Error::Rejected)));
        assert_eq!(relay.conn.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_dial_timeout_sends_close() {
        let mut config = ClientConfig::default();
        config.transport.handshake_timeout = Duration::from_millis(100);
        let mut relay = fake_relay(config, 4).await;
        let remote = SecretKey::generate().public_key();

        let result = relay.conn.dial(remote).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout)));

        let request = read_frame(&mut relay.wire).await.unwrap();
        let close = read_frame(&mut relay.wire).await.unwrap();
        assert_eq!(close.frame_type(), FrameType::Close);
        assert_eq!(close.circuit_id(), request.circuit_id());
        assert_eq!(close.close_reason(), CloseReason::TimedOut);
        assert_eq!(relay.conn.transport_count().await, 0);
    }

    #[tokio::test]
    async fn test_relay_loss_closes_circuits() {
        let mut relay = fake_relay(ClientConfig::default(), 4).await;
        let initiator = SecretKey::generate().public_key();

        write_frame(&mut relay.wire, &Frame::request(1, &initiator, &relay.client_pk))
            .await
            .unwrap();
        let transport = relay.accepted.recv().await.unwrap();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 8];
            transport.read(&mut buf).await
        });
        drop(relay.wire);

        assert!(matches!(reader.await.unwrap(), Err(Error::ClosedPipe)));
        relay.conn.closed().await;
        assert!(relay.conn.is_closed());
        assert!(matches!(relay.conn.dial(initiator).await, Err(Error::ClosedPipe)));
    }
}
