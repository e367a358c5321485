//! Flow-controlled virtual circuits.
//!
//! A [`Transport`] is one circuit between two endpoints, multiplexed over a
//! physical connection to a relay. Its lifecycle is one-way:
//!
//! ```text
//! Negotiating --ACCEPT--> Serving --CLOSE / link loss / close()--> Closed
//!      |                                                            ^
//!      +----------------- CLOSE / timeout --------------------------+
//! ```
//!
//! # Flow control
//!
//! Every `FWD` frame takes one permit from a window semaphore and returns it
//! when the peer's `ACK` for that sequence number arrives, so at most
//! `window` frames are ever unacknowledged. The receiver acknowledges
//! immediately while its read buffer is under capacity and defers the `ACK`
//! otherwise; deferred acknowledgements are flushed, coalesced into a single
//! link write, once [`Transport::read`] drains the buffer.

use crate::client_conn::ConnInner;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::frame::{CloseReason, Frame, FrameType, MAX_FWD_DATA};
use crate::keys::PubKey;
use crate::link::Link;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, oneshot, watch};

/// Circuit lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// `REQUEST` sent, waiting for `ACCEPT` or `CLOSE`
    Negotiating,
    /// Open for reads and writes
    Serving,
    /// Terminal
    Closed,
}

#[derive(Debug, Default)]
struct Outbound {
    next_seq: u16,
    awaiting: HashMap<u16, (oneshot::Sender<()>, OwnedSemaphorePermit)>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Inbound {
    chunks: VecDeque<Vec<u8>>,
    offset: usize,
    buffered: usize,
    pending_acks: Vec<u16>,
    closed: bool,
}

impl Inbound {
    fn drain_into(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let front_len = front.len();
            let take = (front_len - self.offset).min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&front[self.offset..self.offset + take]);
            n += take;
            self.offset += take;
            if self.offset == front_len {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }
        self.buffered -= n;
        n
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared circuit state, reachable from the owning connection's table and
/// from the [`Transport`] handle
#[derive(Debug)]
pub(crate) struct Circuit {
    id: u16,
    local: PubKey,
    remote: PubKey,
    read_buffer_capacity: usize,
    link: Arc<Link>,
    conn: Weak<ConnInner>,
    state: watch::Sender<TransportState>,
    closing: AtomicBool,
    window: Arc<Semaphore>,
    outbound: Mutex<Outbound>,
    inbound: Mutex<Inbound>,
    readable: Notify,
    handshake: Mutex<Option<oneshot::Sender<Result<()>>>>,
    write_lock: tokio::sync::Mutex<()>,
    read_lock: tokio::sync::Mutex<()>,
}

impl Circuit {
    pub(crate) fn new(
        id: u16,
        local: PubKey,
        remote: PubKey,
        config: &TransportConfig,
        link: Arc<Link>,
        conn: Weak<ConnInner>,
        state: TransportState,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self {
            id,
            local,
            remote,
            read_buffer_capacity: config.read_buffer_capacity,
            link,
            conn,
            state,
            closing: AtomicBool::new(false),
            window: Arc::new(Semaphore::new(config.window)),
            outbound: Mutex::new(Outbound::default()),
            inbound: Mutex::new(Inbound::default()),
            readable: Notify::new(),
            handshake: Mutex::new(None),
            write_lock: tokio::sync::Mutex::new(()),
            read_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Receiver resolved when the initiator handshake completes
    pub(crate) fn begin_handshake(&self) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        *lock(&self.handshake) = Some(tx);
        rx
    }

    fn finish_handshake(&self, outcome: Result<()>) {
        if let Some(tx) = lock(&self.handshake).take() {
            let _ = tx.send(outcome);
        }
    }

    /// Number of `FWD` frames sent and not yet acknowledged
    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        lock(&self.outbound).awaiting.len()
    }

    async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == TransportState::Closed).await;
    }

    /// Apply one frame addressed to this circuit (called by the read loop)
    pub(crate) async fn handle_frame(&self, frame: Frame) {
        match frame.frame_type() {
            FrameType::Accept => self.on_accept(&frame).await,
            FrameType::Close => self.on_remote_close(frame.close_reason()).await,
            FrameType::Fwd => self.on_fwd(&frame).await,
            FrameType::Ack => match frame.ack_seq() {
                Ok(seq) => self.on_ack(seq),
                Err(e) => tracing::warn!(id = self.id, "dropping bad ACK: {}", e),
            },
            FrameType::Request => {
                tracing::warn!(id = self.id, "REQUEST on an open circuit ignored");
            }
        }
    }

    async fn on_accept(&self, frame: &Frame) {
        if self.state() != TransportState::Negotiating {
            tracing::debug!(id = self.id, "unexpected ACCEPT ignored");
            return;
        }
        match frame.handshake_keys() {
            Ok((initiator, responder)) if initiator == self.local && responder == self.remote => {
                self.state.send_replace(TransportState::Serving);
                tracing::debug!(id = self.id, remote = %self.remote.short(), "circuit established");
                self.finish_handshake(Ok(()));
            }
            _ => {
                tracing::warn!(id = self.id, "ACCEPT does not match REQUEST");
                self.finish_handshake(Err(Error::Rejected));
                let _ = self.close_with(CloseReason::Rejected).await;
            }
        }
    }

    async fn on_fwd(&self, frame: &Frame) {
        let (seq, data) = match frame.fwd_parts() {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(id = self.id, "malformed FWD: {}", e);
                let _ = self.close_with(CloseReason::Rejected).await;
                return;
            }
        };

        let ack_now = {
            let mut inbound = lock(&self.inbound);
            if inbound.closed {
                return;
            }
            if !data.is_empty() {
                inbound.chunks.push_back(data.to_vec());
                inbound.buffered += data.len();
            }
            if inbound.buffered <= self.read_buffer_capacity {
                true
            } else {
                inbound.pending_acks.push(seq);
                false
            }
        };
        self.readable.notify_waiters();

        if ack_now {
            let _ = self.link.post_frame(&Frame::ack(self.id, seq));
        }
    }

    fn on_ack(&self, seq: u16) {
        let entry = lock(&self.outbound).awaiting.remove(&seq);
        match entry {
            Some((done, permit)) => {
                drop(permit);
                let _ = done.send(());
            }
            None => tracing::trace!(id = self.id, seq, "ACK for unknown sequence"),
        }
    }

    async fn on_remote_close(&self, reason: CloseReason) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(id = self.id, ?reason, "circuit closed by remote");
        self.finish_handshake(Err(match reason {
            CloseReason::TimedOut => Error::HandshakeTimeout,
            CloseReason::Normal | CloseReason::Rejected => Error::Rejected,
        }));
        self.shut(true);
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_circuit(self.id).await;
        }
    }

    /// The physical connection is gone: fail everything, send nothing
    pub(crate) fn link_lost(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finish_handshake(Err(Error::ClosedPipe));
        self.shut(true);
    }

    /// Close locally, sending `CLOSE` once
    pub(crate) async fn close_with(&self, reason: CloseReason) -> Result<()> {
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.finish_handshake(Err(Error::ClosedPipe));
        self.shut(false);

        // CLOSE goes out before the id is released for reuse
        if let Err(e) = self.link.post_frame(&Frame::close(self.id, reason)) {
            tracing::debug!(id = self.id, "CLOSE not sent: {}", e);
        }
        if let Some(conn) = self.conn.upgrade() {
            conn.remove_circuit(self.id).await;
        }
        tracing::debug!(id = self.id, ?reason, "circuit closed");
        Ok(())
    }

    fn shut(&self, keep_buffered: bool) {
        self.state.send_replace(TransportState::Closed);
        self.window.close();
        {
            let mut outbound = lock(&self.outbound);
            outbound.closed = true;
            outbound.awaiting.clear();
        }
        {
            let mut inbound = lock(&self.inbound);
            inbound.closed = true;
            inbound.pending_acks.clear();
            if !keep_buffered {
                inbound.chunks.clear();
                inbound.offset = 0;
                inbound.buffered = 0;
            }
        }
        self.readable.notify_waiters();
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        if self.state() != TransportState::Serving {
            return Err(Error::ClosedPipe);
        }
        if data.is_empty() {
            return Ok(0);
        }

        let _serial = self.write_lock.lock().await;
        let mut acks = Vec::with_capacity(data.len().div_ceil(MAX_FWD_DATA));

        for chunk in data.chunks(MAX_FWD_DATA) {
            let permit = Arc::clone(&self.window)
                .acquire_owned()
                .await
                .map_err(|_| Error::ClosedPipe)?;

            let (done, acked) = oneshot::channel();
            let seq = {
                let mut outbound = lock(&self.outbound);
                if outbound.closed {
                    return Err(Error::ClosedPipe);
                }
                let seq = outbound.next_seq;
                outbound.next_seq = seq.wrapping_add(1);
                outbound.awaiting.insert(seq, (done, permit));
                seq
            };

            let mut unsent = Unsent {
                circuit: self,
                seq,
                armed: true,
            };
            let frame = Frame::fwd(self.id, seq, chunk)?;
            tokio::select! {
                res = self.link.send_frame(&frame) => res?,
                () = self.wait_closed() => return Err(Error::ClosedPipe),
            }
            unsent.armed = false;
            tracing::trace!(id = self.id, seq, len = chunk.len(), "FWD sent");
            acks.push(acked);
        }

        for acked in acks {
            acked.await.map_err(|_| Error::ClosedPipe)?;
        }
        Ok(data.len())
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let _serial = self.read_lock.lock().await;
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (n, acks) = {
                let mut inbound = lock(&self.inbound);
                if inbound.buffered == 0 {
                    if inbound.closed {
                        return Err(Error::ClosedPipe);
                    }
                    (0, Vec::new())
                } else {
                    let n = inbound.drain_into(buf);
                    let acks = if inbound.buffered <= self.read_buffer_capacity {
                        std::mem::take(&mut inbound.pending_acks)
                    } else {
                        Vec::new()
                    };
                    (n, acks)
                }
            };

            if n > 0 {
                self.flush_acks(&acks);
                return Ok(n);
            }
            notified.await;
        }
    }

    /// Post deferred ACKs as a single link write without suspending the reader
    fn flush_acks(&self, seqs: &[u16]) {
        if seqs.is_empty() {
            return;
        }
        let mut bytes = Vec::with_capacity(seqs.len() * 7);
        for &seq in seqs {
            Frame::ack(self.id, seq).encode_into(&mut bytes);
        }
        let _ = self.link.post(bytes);
    }
}

/// Removes the awaiting-ack entry of a frame whose send was cancelled
struct Unsent<'a> {
    circuit: &'a Circuit,
    seq: u16,
    armed: bool,
}

impl Drop for Unsent<'_> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.circuit.outbound).awaiting.remove(&self.seq);
        }
    }
}

/// One end of a virtual circuit
///
/// Safe for one concurrent reader and one concurrent writer; additional
/// concurrent readers (or writers) are serialized internally. Dropping the
/// handle closes the circuit.
#[derive(Debug)]
pub struct Transport {
    inner: Arc<Circuit>,
}

impl Transport {
    pub(crate) fn new(inner: Arc<Circuit>) -> Self {
        Self { inner }
    }

    /// Circuit id on the local physical connection
    #[must_use]
    pub fn id(&self) -> u16 {
        self.inner.id
    }

    /// Local endpoint key
    #[must_use]
    pub fn local_pk(&self) -> PubKey {
        self.inner.local
    }

    /// Remote endpoint key
    #[must_use]
    pub fn remote_pk(&self) -> PubKey {
        self.inner.remote
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> TransportState {
        self.inner.state()
    }

    /// True once the circuit has closed for any reason
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state() == TransportState::Closed
    }

    /// Resolves when the circuit closes
    pub async fn closed(&self) {
        self.inner.wait_closed().await;
    }

    /// Write all of `data`, returning once every frame has been acknowledged
    ///
    /// Cancelling the returned future (for example with
    /// `tokio::time::timeout`) never leaves a partial frame on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClosedPipe`] if the circuit is or becomes closed.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.inner.write(data).await
    }

    /// Read at least one byte into `buf`
    ///
    /// Data buffered before the circuit closed is still returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClosedPipe`] once the circuit is closed and drained.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(buf).await
    }

    /// Close the circuit; idempotent
    ///
    /// # Errors
    ///
    /// Currently infallible; a `CLOSE` that cannot be sent because the link
    /// is gone is not an error.
    pub async fn close(&self) -> Result<()> {
        self.inner.close_with(CloseReason::Normal).await
    }

    pub(crate) fn circuit(&self) -> &Arc<Circuit> {
        &self.inner
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if self.inner.is_closing() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            handle.spawn(async move {
                let _ = inner.close_with(CloseReason::Normal).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;
    use crate::keys::SecretKey;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    fn keys() -> (PubKey, PubKey) {
        (
            SecretKey::generate().public_key(),
            SecretKey::generate().public_key(),
        )
    }

    async fn pump(mut reader: DuplexStream, circuit: Arc<Circuit>) {
        while let Ok(frame) = read_frame(&mut reader).await {
            circuit.handle_frame(frame).await;
        }
    }

    /// Two serving circuits wired back to back
    fn pair(config: &TransportConfig) -> (Transport, Transport) {
        let (a_pk, b_pk) = keys();
        let (a_out, a_wire) = tokio::io::duplex(1 << 20);
        let (b_out, b_wire) = tokio::io::duplex(1 << 20);
        let a = Circuit::new(
            2,
            a_pk,
            b_pk,
            config,
            Link::spawn(a_out, 64),
            Weak::new(),
            TransportState::Serving,
        );
        let b = Circuit::new(
            2,
            b_pk,
            a_pk,
            config,
            Link::spawn(b_out, 64),
            Weak::new(),
            TransportState::Serving,
        );
        tokio::spawn(pump(a_wire, Arc::clone(&b)));
        tokio::spawn(pump(b_wire, Arc::clone(&a)));
        (Transport::new(a), Transport::new(b))
    }

    /// A circuit whose peer is a raw stream the test reads from
    fn lone(config: &TransportConfig) -> (Transport, DuplexStream) {
        let (a_pk, b_pk) = keys();
        let (out, wire) = tokio::io::duplex(1 << 20);
        let circuit = Circuit::new(
            4,
            a_pk,
            b_pk,
            config,
            Link::spawn(out, 64),
            Weak::new(),
            TransportState::Serving,
        );
        (Transport::new(circuit), wire)
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let (a, b) = pair(&TransportConfig::default());

        assert_eq!(a.write(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        b.write(b"pong").await.unwrap();
        let n = a.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[tokio::test]
    async fn test_large_write_small_reads() {
        let (a, b) = pair(&TransportConfig::default());
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();

        let writer = tokio::spawn(async move {
            a.write(&data).await.unwrap();
            a
        });

        let mut got = Vec::new();
        let mut buf = [0u8; 1000];
        while got.len() < expected.len() {
            let n = b.read(&mut buf).await.unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, expected);
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn test_window_bounds_in_flight() {
        let config = TransportConfig {
            window: 2,
            read_buffer_capacity: MAX_FWD_DATA,
            ..Default::default()
        };
        let (a, b) = pair(&config);
        let a = Arc::new(a);

        let writer = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.write(&vec![7u8; MAX_FWD_DATA * 6]).await })
        };

        // Nobody reads: the first frame is acked, the next two are deferred
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.inner.in_flight(), 2);
        assert!(!writer.is_finished());

        let mut total = 0;
        let mut buf = vec![0u8; 4096];
        while total < MAX_FWD_DATA * 6 {
            total += b.read(&mut buf).await.unwrap();
            assert!(a.inner.in_flight() <= 2);
        }
        assert_eq!(writer.await.unwrap().unwrap(), MAX_FWD_DATA * 6);
    }

    #[tokio::test]
    async fn test_close_sends_single_close() {
        let (t, mut wire) = lone(&TransportConfig::default());

        t.close().await.unwrap();
        t.close().await.unwrap();
        assert!(t.is_closed());

        let frame = read_frame(&mut wire).await.unwrap();
        assert_eq!(frame.frame_type(), FrameType::Close);
        assert_eq!(frame.close_reason(), CloseReason::Normal);
        let next = tokio::time::timeout(Duration::from_millis(100), read_frame(&mut wire)).await;
        assert!(next.is_err(), "second CLOSE must not be sent");
    }

    #[tokio::test]
    async fn test_remote_close_keeps_buffered_data() {
        let (t, _wire) = lone(&TransportConfig::default());
        let circuit = Arc::clone(t.circuit());

        circuit.handle_frame(Frame::fwd(4, 0, b"tail").unwrap()).await;
        circuit.handle_frame(Frame::close(4, CloseReason::Normal)).await;
        assert!(t.is_closed());

        let mut buf = [0u8; 8];
        let n = t.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tail");
        assert!(matches!(t.read(&mut buf).await, Err(Error::ClosedPipe)));
        assert!(matches!(t.write(b"x").await, Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_close_unblocks_reader_and_writer() {
        let (t, _wire) = lone(&TransportConfig::default());
        let t = Arc::new(t);

        let reader = {
            let t = Arc::clone(&t);
            tokio::spawn(async move {
                let mut buf = [0u8; 8];
                t.read(&mut buf).await
            })
        };
        // Never acknowledged by the raw peer
        let writer = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.write(b"stuck").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        t.close().await.unwrap();
        assert!(matches!(reader.await.unwrap(), Err(Error::ClosedPipe)));
        assert!(matches!(writer.await.unwrap(), Err(Error::ClosedPipe)));
    }

    #[tokio::test]
    async fn test_deferred_acks_flushed_on_read() {
        let config = TransportConfig {
            read_buffer_capacity: MAX_FWD_DATA,
            ..Default::default()
        };
        let (t, mut wire) = lone(&config);
        let circuit = Arc::clone(t.circuit());
        let chunk = vec![1u8; MAX_FWD_DATA];

        circuit.handle_frame(Frame::fwd(4, 0, &chunk).unwrap()).await;
        circuit.handle_frame(Frame::fwd(4, 1, &chunk).unwrap()).await;

        // Only the first is acknowledged inline
        let ack = read_frame(&mut wire).await.unwrap();
        assert_eq!(ack.ack_seq().unwrap(), 0);
        let pending = tokio::time::timeout(Duration::from_millis(50), read_frame(&mut wire)).await;
        assert!(pending.is_err());

        let mut buf = vec![0u8; MAX_FWD_DATA];
        assert_eq!(t.read(&mut buf).await.unwrap(), MAX_FWD_DATA);
        let ack = read_frame(&mut wire).await.unwrap();
        assert_eq!(ack.ack_seq().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_write_waiting_for_window() {
        let config = TransportConfig {
            window: 2,
            ..Default::default()
        };
        let (t, mut wire) = lone(&config);
        let circuit = Arc::clone(t.circuit());

        let data = vec![3u8; MAX_FWD_DATA * 3];
        let res = tokio::time::timeout(Duration::from_millis(100), t.write(&data)).await;
        assert!(res.is_err(), "third frame has no window");

        for seq in 0..2 {
            let frame = read_frame(&mut wire).await.unwrap();
            assert_eq!(frame.frame_type(), FrameType::Fwd);
            assert_eq!(frame.fwd_parts().unwrap().0, seq);
        }
        let extra = tokio::time::timeout(Duration::from_millis(50), read_frame(&mut wire)).await;
        assert!(extra.is_err(), "nothing beyond the window reaches the wire");
        assert_eq!(circuit.in_flight(), 2);
        assert_eq!(circuit.window.available_permits(), 0);

        circuit.handle_frame(Frame::ack(4, 0)).await;
        circuit.handle_frame(Frame::ack(4, 1)).await;
        assert_eq!(circuit.in_flight(), 0);
        assert_eq!(circuit.window.available_permits(), 2);

        let t = Arc::new(t);
        let writer = {
            let t = Arc::clone(&t);
            tokio::spawn(async move { t.write(b"after").await })
        };
        let frame = read_frame(&mut wire).await.unwrap();
        let (seq, payload) = frame.fwd_parts().unwrap();
        assert_eq!(seq, 2);
        assert_eq!(payload, b"after");
        circuit.handle_frame(Frame::ack(4, seq)).await;
        assert_eq!(writer.await.unwrap().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_cancelled_write_on_full_link_releases_frame() {
        let (a_pk, b_pk) = keys();
        // Unread far end: one frame stuck in the writer, one queued
        let (out, mut wire) = tokio::io::duplex(64);
        let circuit = Circuit::new(
            6,
            a_pk,
            b_pk,
            &TransportConfig::default(),
            Link::spawn(out, 1),
            Weak::new(),
            TransportState::Serving,
        );
        let t = Transport::new(Arc::clone(&circuit));
        let permits = circuit.window.available_permits();

        let data = vec![5u8; MAX_FWD_DATA * 3];
        let res = tokio::time::timeout(Duration::from_millis(100), t.write(&data)).await;
        assert!(res.is_err(), "link queue should be full");
        assert_eq!(circuit.in_flight(), 2);
        assert_eq!(circuit.window.available_permits(), permits - 2);

        let mut seqs = Vec::new();
        while let Ok(Ok(frame)) =
            tokio::time::timeout(Duration::from_millis(100), read_frame(&mut wire)).await
        {
            assert_eq!(frame.fwd_parts().unwrap().1.len(), MAX_FWD_DATA);
            seqs.push(frame.fwd_parts().unwrap().0);
        }
        assert_eq!(seqs, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_empty_write() {
        let (t, _wire) = lone(&TransportConfig::default());
        assert_eq!(t.write(&[]).await.unwrap(), 0);
    }
}
