//! Physical connection writer.
//!
//! Each physical connection has exactly one writer task fed by two lanes.
//! `FWD` payload from transports goes through a bounded data lane so slow
//! peers push back on writers. Every other frame, and everything the relay
//! forwards, goes through an unbounded control lane that never suspends the
//! caller; per-circuit windows bound what can pile up there. The writer
//! always drains control before data.
//!
//! Frames are enqueued whole, so a caller cancelled after queueing never
//! leaves half a frame on the wire.

use crate::error::{Error, Result};
use crate::frame::Frame;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Handle to a physical connection's writer task
#[derive(Debug)]
pub(crate) struct Link {
    data: mpsc::Sender<Vec<u8>>,
    control: mpsc::UnboundedSender<Vec<u8>>,
    closed: watch::Sender<bool>,
}

impl Link {
    /// Spawn the writer task for `writer`
    pub(crate) fn spawn<W>(writer: W, queue: usize) -> Arc<Self>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (data, data_rx) = mpsc::channel(queue.max(1));
        let (control, control_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        let link = Arc::new(Self {
            data,
            control,
            closed,
        });
        tokio::spawn(write_loop(writer, control_rx, data_rx, Arc::clone(&link)));
        link
    }

    /// Queue one frame on the data lane
    pub(crate) async fn send_frame(&self, frame: &Frame) -> Result<()> {
        self.send(frame.encode()).await
    }

    /// Queue pre-encoded bytes on the data lane, waiting for room
    pub(crate) async fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }
        tokio::select! {
            res = self.data.send(bytes) => res.map_err(|_| Error::ClosedPipe),
            () = self.closed() => Err(Error::ClosedPipe),
        }
    }

    /// Queue one frame on the control lane
    pub(crate) fn post_frame(&self, frame: &Frame) -> Result<()> {
        self.post(frame.encode())
    }

    /// Queue pre-encoded bytes on the control lane without suspending
    pub(crate) fn post(&self, bytes: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ClosedPipe);
        }
        self.control.send(bytes).map_err(|_| Error::ClosedPipe)
    }

    /// Stop the writer; queued frames are flushed best-effort
    pub(crate) fn shutdown(&self) {
        self.closed.send_replace(true);
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the link is shut down
    pub(crate) async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn write_loop<W>(
    mut writer: W,
    mut control: mpsc::UnboundedReceiver<Vec<u8>>,
    mut data: mpsc::Receiver<Vec<u8>>,
    link: Arc<Link>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let bytes = tokio::select! {
            biased;
            () = link.closed() => break,
            Some(bytes) = control.recv() => bytes,
            Some(bytes) = data.recv() => bytes,
            else => break,
        };
        if let Err(e) = write_flush(&mut writer, &bytes).await {
            tracing::debug!("link write failed: {}", e);
            link.shutdown();
            return;
        }
    }

    link.shutdown();
    while let Ok(bytes) = control.try_recv().or_else(|_| data.try_recv()) {
        if write_flush(&mut writer, &bytes).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_flush<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> std::io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CloseReason, FrameType, read_frame};
    use std::time::Duration;

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (a, mut b) = tokio::io::duplex(4096);
        let link = Link::spawn(a, 8);

        link.send_frame(&Frame::ack(1, 1)).await.unwrap();
        link.send_frame(&Frame::ack(1, 2)).await.unwrap();

        assert_eq!(read_frame(&mut b).await.unwrap().ack_seq().unwrap(), 1);
        assert_eq!(read_frame(&mut b).await.unwrap().ack_seq().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_closes() {
        let (a, mut b) = tokio::io::duplex(4096);
        let link = Link::spawn(a, 8);

        link.send_frame(&Frame::close(3, CloseReason::Normal)).await.unwrap();
        link.shutdown();

        assert_eq!(read_frame(&mut b).await.unwrap().circuit_id(), 3);
        assert!(read_frame(&mut b).await.unwrap_err().is_eof());
        assert!(matches!(
            link.send_frame(&Frame::ack(1, 1)).await,
            Err(Error::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_post_never_waits_on_full_data_lane() {
        // Nobody reads the far end, so the writer stalls on the first frame
        let (a, mut b) = tokio::io::duplex(16);
        let link = Link::spawn(a, 1);
        let fwd = Frame::new(FrameType::Fwd, 2, vec![0u8; 64]).unwrap();

        link.send_frame(&fwd).await.unwrap();
        link.send_frame(&fwd).await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), link.send_frame(&fwd))
                .await
                .is_err(),
            "data lane should be full"
        );

        for seq in 0..1000 {
            link.post_frame(&Frame::ack(2, seq)).unwrap();
        }

        // The queued ACKs overtake the FWD still waiting in the data lane
        assert_eq!(read_frame(&mut b).await.unwrap().frame_type(), FrameType::Fwd);
        for seq in 0..1000 {
            assert_eq!(read_frame(&mut b).await.unwrap().ack_seq().unwrap(), seq);
        }
        assert_eq!(read_frame(&mut b).await.unwrap().frame_type(), FrameType::Fwd);
    }

    #[tokio::test]
    async fn test_post_after_shutdown_fails() {
        let (a, _b) = tokio::io::duplex(64);
        let link = Link::spawn(a, 8);
        link.shutdown();
        assert!(matches!(
            link.post_frame(&Frame::ack(1, 1)),
            Err(Error::ClosedPipe)
        ));
    }

    #[tokio::test]
    async fn test_peer_gone_closes_link() {
        let (a, b) = tokio::io::duplex(64);
        let link = Link::spawn(a, 8);
        drop(b);

        // The first write that hits the dropped peer shuts the link down
        let _ = link.send_frame(&Frame::ack(1, 1)).await;
        tokio::time::timeout(std::time::Duration::from_secs(1), link.closed())
            .await
            .expect("link should close");
        assert!(link.is_closed());
    }
}
