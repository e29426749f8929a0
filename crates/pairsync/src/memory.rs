use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::TransportError;
use crate::transport::Transport;

/// Depth of each end's inbound channel.
const INBOUND_CAPACITY: usize = 64;

/// In-process transport: one end of a linked pair.
///
/// Nothing leaves the process. Reachability, send failures and latency are
/// all switchable at runtime, which makes this the transport for tests and
/// demos.
///
/// # Example
///
/// ```
/// use pairsync::MemoryTransport;
///
/// let (a, b) = MemoryTransport::pair();
/// a.set_reachable(false);
/// assert!(b.sent().is_empty());
/// ```
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    inner: Arc<EndState>,
    peer_inbound: broadcast::Sender<Bytes>,
}

#[derive(Debug)]
struct EndState {
    reachable: AtomicBool,
    closed: AtomicBool,
    fail_next: AtomicU32,
    attempts: AtomicU64,
    latency: Mutex<Option<Duration>>,
    sent: Mutex<Vec<Bytes>>,
    inbound: broadcast::Sender<Bytes>,
}

impl EndState {
    fn new() -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            reachable: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            fail_next: AtomicU32::new(0),
            attempts: AtomicU64::new(0),
            latency: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            inbound,
        }
    }
}

impl MemoryTransport {
    /// Create two linked ends. Bytes sent on one arrive on the other.
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(EndState::new());
        let b = Arc::new(EndState::new());
        let a_end = Self {
            peer_inbound: b.inbound.clone(),
            inner: Arc::clone(&a),
        };
        let b_end = Self {
            peer_inbound: a.inbound.clone(),
            inner: b,
        };
        (a_end, b_end)
    }

    /// Switch whether this end can reach its peer.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Shut this end down for good. Later sends fail with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Make the next `n` sends fail even though the peer is reachable.
    pub fn fail_next_sends(&self, n: u32) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every send by `latency` before it completes.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /// Payloads this end delivered successfully, oldest first.
    pub fn sent(&self) -> Vec<Bytes> {
        self.inner.sent.lock().clone()
    }

    /// Number of send calls made on this end, successful or not.
    pub fn send_attempts(&self) -> u64 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Push raw bytes into this end as if the peer had sent them.
    ///
    /// Used to simulate duplicates, reordering and garbage.
    pub fn inject(&self, bytes: impl Into<Bytes>) {
        let _ = self.inner.inbound.send(bytes.into());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn is_reachable(&self) -> bool {
        self.inner.reachable.load(Ordering::SeqCst)
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        if !self.is_reachable() {
            return Err(TransportError::Unreachable);
        }

        let injected_failure = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(TransportError::SendFailed("injected failure".into()));
        }

        self.inner.sent.lock().push(payload.clone());
        // No subscriber on the far side means the message is simply lost.
        let _ = self.peer_inbound.send(payload);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.inbound.subscribe()
    }
}
