//! # transport
//!
//! Link abstraction between the protocol layer and the platform radio stack.
//!
//! The physical link is asymmetric: the host advertises a service with a TX
//! characteristic (notify + read) and an RX characteristic (write with or
//! without response); only one side hosts at a time. Platform adapters and
//! the simulator both reduce that to the same channel shape:
//!
//! - a single-consumer FIFO inbox of [`LinkEvent`]s (association, the CCC
//!   subscription signal, inbound frames, disconnect)
//! - an outbound channel of [`OutboundFrame`]s, each carrying a delivery
//!   confirmation the adapter fires when the write completes
//!
//! The radio permits only one in-flight write; [`WriteQueue`] enforces that
//! by releasing the next frame only after the previous confirmation.

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use timing_types::LINK_MAX_PAYLOAD;

use crate::error::TimingError;

// ── Link Events ──────────────────────────────────────────────────────────────

/// Everything the radio stack reports, funnelled into one FIFO inbox so the
/// protocol state machine never observes concurrent mutation.
#[derive(Debug)]
pub enum LinkEvent {
    /// Dual-mode resolved: a peer associated. `is_server` is true when the
    /// peer connected to *our* advertised service.
    Associated {
        peer_device_id: String,
        is_server: bool,
    },
    /// The peer enabled notifications on TX (CCC descriptor written).
    /// Some stacks never deliver this; see the host safety timeout.
    SubscriptionEnabled,
    /// One inbound frame, already reassembled below the MTU.
    Frame(Vec<u8>),
    Disconnected,
}

/// One outbound write. The adapter fires `delivered` when the radio confirms
/// the write (or drops the sender on failure).
#[derive(Debug)]
pub struct OutboundFrame {
    pub payload: Vec<u8>,
    pub delivered: oneshot::Sender<bool>,
}

/// The two channel ends a platform adapter (or the simulator) hands to the
/// protocol layer for one association.
pub struct LinkSession {
    pub events: mpsc::Receiver<LinkEvent>,
    pub frames: mpsc::Sender<OutboundFrame>,
}

// ── Single-Writer Queue ──────────────────────────────────────────────────────

/// Serialises outbound writes: one frame in flight, the next released only
/// on delivery confirmation. This mirrors a genuine contract of the radio
/// medium, not a convenience.
#[derive(Clone)]
pub struct WriteQueue {
    tx: mpsc::Sender<Vec<u8>>,
}

impl WriteQueue {
    /// Spawns the drain task for this link. The task ends when either the
    /// queue sender or the link goes away.
    pub fn spawn(frames: mpsc::Sender<OutboundFrame>) -> WriteQueue {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                if payload.len() > LINK_MAX_PAYLOAD {
                    // The framework segments below the preferred MTU, but a
                    // message this large means runaway payload growth.
                    warn!(
                        len = payload.len(),
                        "outbound frame exceeds preferred MTU, sending segmented"
                    );
                }
                let (delivered_tx, delivered_rx) = oneshot::channel();
                if frames
                    .send(OutboundFrame {
                        payload,
                        delivered: delivered_tx,
                    })
                    .await
                    .is_err()
                {
                    debug!("link gone, write queue draining stopped");
                    return;
                }
                match delivered_rx.await {
                    Ok(true) => {}
                    Ok(false) => warn!("link reported failed write"),
                    Err(_) => {
                        debug!("link dropped delivery confirmation, stopping");
                        return;
                    }
                }
            }
        });
        WriteQueue { tx }
    }

    pub async fn enqueue(&self, bytes: Vec<u8>) -> Result<(), TimingError> {
        self.tx
            .send(bytes)
            .await
            .map_err(|_| TimingError::LinkClosed)
    }

    /// Non-async variant for contexts that must not suspend. Fails when the
    /// queue is full rather than blocking.
    pub fn try_enqueue(&self, bytes: Vec<u8>) -> Result<(), TimingError> {
        self.tx.try_send(bytes).map_err(|_| TimingError::LinkClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_queue_releases_next_only_after_confirmation() {
        let (frames_tx, mut frames_rx) = mpsc::channel::<OutboundFrame>(8);
        let queue = WriteQueue::spawn(frames_tx);

        queue.enqueue(vec![1]).await.unwrap();
        queue.enqueue(vec![2]).await.unwrap();

        let first = frames_rx.recv().await.unwrap();
        assert_eq!(first.payload, vec![1]);

        // The second frame must not surface before the first is confirmed
        let early = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            frames_rx.recv(),
        )
        .await;
        assert!(early.is_err(), "second write released before confirmation");

        first.delivered.send(true).unwrap();
        let second = frames_rx.recv().await.unwrap();
        assert_eq!(second.payload, vec![2]);
        second.delivered.send(true).unwrap();
    }

    #[tokio::test]
    async fn enqueue_fails_once_the_link_is_gone() {
        let (frames_tx, frames_rx) = mpsc::channel::<OutboundFrame>(8);
        let queue = WriteQueue::spawn(frames_tx);
        drop(frames_rx);
        // First enqueue may still land in the internal buffer; the drain
        // task then stops and subsequent enqueues fail.
        let _ = queue.enqueue(vec![1]).await;
        tokio::task::yield_now().await;
        let mut failed = false;
        for _ in 0..80 {
            if queue.enqueue(vec![2]).await.is_err() {
                failed = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(failed, "write queue kept accepting after link closed");
    }
}
