use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::error::TransportError;

/// The message channel between the two peers.
///
/// pairsync does not implement a transport; the embedding application
/// supplies one (a socket, a platform session, a test double) and shares
/// it with the replica through an `Arc`.
///
/// No ordering or delivery guarantees are assumed. Loss, duplication and
/// reordering are all handled by the replica.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Whether the peer is currently reachable.
    ///
    /// Checked before every send attempt; an unreachable peer skips the
    /// attempt and leaves the payload for the next retry tick.
    fn is_reachable(&self) -> bool;

    /// Deliver one payload to the peer.
    ///
    /// Resolves once the transport knows whether delivery succeeded.
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Bytes delivered by the peer.
    ///
    /// Each call returns an independent receiver. A lagging receiver loses
    /// messages, which the replica treats like any other transport loss.
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;
}
