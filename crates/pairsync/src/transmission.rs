//! Delivery of local writes, with retry until the peer is reachable.
//!
//! ```text
//!            submit                 unreachable / send failed
//!   Idle ─────────────► Sending ──────────────────────────► AwaitingRetry
//!    ▲                     │                                   │   ▲
//!    │      delivered,     │                          tick     │   │ failed
//!    └─────────────────────┘                                   ▼   │
//!    ▲      nothing newer                                    Sending
//!    │                                                         │
//!    └─────────────────── delivered, nothing newer ────────────┘
//! ```
//!
//! The manager never owns the payload. It reads whatever is pending in the
//! replica at the moment of each attempt, so a retry always carries the
//! newest write (with that write's original timestamp) and a write made
//! while a send is in flight is picked up afterwards.
//!
//! Invariants:
//! - at most one send is in flight per replica;
//! - at most one retry schedule is armed per replica;
//! - send failures never reach the writer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::state::Payload;
use crate::transport::Transport;

/// Where the replica keeps its undelivered payload.
pub trait PendingSlot: Send + Sync + 'static {
    /// The newest undelivered payload, if any.
    fn pending(&self) -> Option<Payload>;

    /// Forget the pending payload if it is still the one with `seq`.
    fn clear_if(&self, seq: u64) -> bool;
}

/// Transmission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Nothing to deliver.
    Idle,
    /// A send attempt is in flight.
    Sending,
    /// Waiting for the next retry tick.
    AwaitingRetry,
}

/// Delivery counters since the replica was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionStats {
    /// Calls to [`Transport::send`].
    pub attempts: u64,
    /// Sends the transport reported as delivered.
    pub deliveries: u64,
    /// Sends the transport reported as failed.
    pub failures: u64,
    /// Attempts skipped because the peer was unreachable.
    pub skipped_unreachable: u64,
}

#[derive(Debug, Default)]
struct Counters {
    attempts: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    skipped_unreachable: AtomicU64,
}

enum Outcome {
    Delivered(u64),
    Unreachable,
    Failed,
    NothingPending,
}

struct Schedule {
    generation: u64,
    cancel: CancellationToken,
}

struct Machine {
    phase: Phase,
    schedule: Option<Schedule>,
    next_generation: u64,
}

struct Inner<Tr, S> {
    transport: Arc<Tr>,
    slot: Arc<S>,
    retry_interval: Duration,
    machine: Mutex<Machine>,
    counters: Counters,
    runtime: Handle,
    shutdown: CancellationToken,
}

/// Drives local writes to the peer.
pub struct TransmissionManager<Tr, S> {
    inner: Arc<Inner<Tr, S>>,
}

impl<Tr: Transport, S: PendingSlot> TransmissionManager<Tr, S> {
    /// Create a manager. Tasks are spawned on `runtime`; cancelling
    /// `shutdown` stops the retry schedule for good.
    pub fn new(
        transport: Arc<Tr>,
        slot: Arc<S>,
        retry_interval: Duration,
        runtime: Handle,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                slot,
                retry_interval,
                machine: Mutex::new(Machine {
                    phase: Phase::Idle,
                    schedule: None,
                    next_generation: 1,
                }),
                counters: Counters::default(),
                runtime,
                shutdown,
            }),
        }
    }

    /// A new payload is pending in the slot.
    ///
    /// Starts a send when idle. Otherwise the in-flight attempt or the armed
    /// schedule will pick the payload up.
    pub fn submit(&self) {
        if self.inner.shutdown.is_cancelled() {
            debug!("transmission shut down; payload stays local");
            return;
        }

        let mut machine = self.inner.machine.lock();
        if machine.phase != Phase::Idle {
            trace!(phase = ?machine.phase, "payload replaced; delivery already under way");
            return;
        }
        machine.phase = Phase::Sending;
        drop(machine);

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = inner.attempt().await;
            inner.finish_first_attempt(outcome);
        });
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.machine.lock().phase
    }

    /// Whether a retry schedule is armed.
    pub fn retry_armed(&self) -> bool {
        self.inner.machine.lock().schedule.is_some()
    }

    /// Snapshot of the delivery counters.
    pub fn stats(&self) -> TransmissionStats {
        let c = &self.inner.counters;
        TransmissionStats {
            attempts: c.attempts.load(Ordering::Relaxed),
            deliveries: c.deliveries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            skipped_unreachable: c.skipped_unreachable.load(Ordering::Relaxed),
        }
    }

    /// Stop retrying. Idempotent; a send already in flight completes but no
    /// further attempt is made, and the phase settles at `Idle`.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut machine = self.inner.machine.lock();
        if let Some(schedule) = machine.schedule.take() {
            schedule.cancel.cancel();
        }
        if machine.phase == Phase::AwaitingRetry {
            machine.phase = Phase::Idle;
        }
    }
}

impl<Tr: Transport, S: PendingSlot> Inner<Tr, S> {
    async fn attempt(&self) -> Outcome {
        let Some(payload) = self.slot.pending() else {
            return Outcome::NothingPending;
        };

        if !self.transport.is_reachable() {
            self.counters
                .skipped_unreachable
                .fetch_add(1, Ordering::Relaxed);
            debug!(seq = payload.seq, "peer unreachable; send skipped");
            return Outcome::Unreachable;
        }

        self.counters.attempts.fetch_add(1, Ordering::Relaxed);
        match self.transport.send(payload.bytes).await {
            Ok(()) => {
                self.counters.deliveries.fetch_add(1, Ordering::Relaxed);
                debug!(seq = payload.seq, "payload delivered");
                Outcome::Delivered(payload.seq)
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(seq = payload.seq, error = %e, "send failed; will retry");
                Outcome::Failed
            }
        }
    }

    fn finish_first_attempt(self: &Arc<Self>, outcome: Outcome) {
        let mut machine = self.machine.lock();
        match outcome {
            Outcome::Delivered(seq) => {
                self.slot.clear_if(seq);
                if self.slot.pending().is_some() {
                    self.arm(&mut machine);
                } else {
                    machine.phase = Phase::Idle;
                }
            }
            Outcome::NothingPending => machine.phase = Phase::Idle,
            Outcome::Unreachable | Outcome::Failed => self.arm(&mut machine),
        }
    }

    /// Enter AwaitingRetry, spawning the schedule unless one is armed.
    /// After shutdown there is nothing to wait for, so go Idle instead.
    fn arm(self: &Arc<Self>, machine: &mut Machine) {
        if self.shutdown.is_cancelled() {
            machine.phase = Phase::Idle;
            return;
        }
        machine.phase = Phase::AwaitingRetry;
        if machine.schedule.is_some() {
            return;
        }

        let generation = machine.next_generation;
        machine.next_generation += 1;
        let cancel = self.shutdown.child_token();
        machine.schedule = Some(Schedule {
            generation,
            cancel: cancel.clone(),
        });
        info!(
            generation,
            interval_ms = self.retry_interval.as_millis() as u64,
            "retry schedule armed"
        );

        let inner = Arc::clone(self);
        self.runtime
            .spawn(async move { inner.run_schedule(generation, cancel).await });
    }

    async fn run_schedule(self: Arc<Self>, generation: u64, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.retry_interval, self.retry_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tick += 1;

            {
                let mut machine = self.machine.lock();
                if cancel.is_cancelled() {
                    break;
                }
                machine.phase = Phase::Sending;
            }
            trace!(generation, tick, "retry tick");

            let outcome = self.attempt().await;

            let mut machine = self.machine.lock();
            if cancel.is_cancelled() {
                break;
            }
            let done = match outcome {
                Outcome::Delivered(seq) => {
                    self.slot.clear_if(seq);
                    self.slot.pending().is_none()
                }
                Outcome::NothingPending => true,
                Outcome::Unreachable | Outcome::Failed => false,
            };

            if done {
                machine.phase = Phase::Idle;
                if matches!(&machine.schedule, Some(s) if s.generation == generation) {
                    machine.schedule = None;
                }
                info!(generation, ticks = tick, "retry schedule disarmed");
                return;
            }
            machine.phase = Phase::AwaitingRetry;
        }

        // Cancelled, possibly mid-send: nothing will run again.
        let mut machine = self.machine.lock();
        machine.phase = Phase::Idle;
        if matches!(&machine.schedule, Some(s) if s.generation == generation) {
            machine.schedule = None;
        }
        debug!(generation, "retry schedule cancelled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use crate::state::ReplicaState;
    use bytes::Bytes;

    struct Slot(Mutex<ReplicaState<()>>);

    impl Slot {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(ReplicaState::new(()))))
        }

        fn push(&self, bytes: &'static [u8]) -> Payload {
            self.0.lock().set_pending(Bytes::from_static(bytes))
        }
    }

    impl PendingSlot for Slot {
        fn pending(&self) -> Option<Payload> {
            self.0.lock().pending().cloned()
        }

        fn clear_if(&self, seq: u64) -> bool {
            self.0.lock().clear_pending_if(seq)
        }
    }

    fn manager(
        transport: &MemoryTransport,
        slot: &Arc<Slot>,
    ) -> TransmissionManager<MemoryTransport, Slot> {
        TransmissionManager::new(
            Arc::new(transport.clone()),
            Arc::clone(slot),
            Duration::from_secs(2),
            Handle::current(),
            CancellationToken::new(),
        )
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reachable_peer_gets_payload_at_once() {
        let (a, _b) = MemoryTransport::pair();
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        settle().await;

        assert_eq!(a.sent(), vec![Bytes::from_static(b"one")]);
        assert_eq!(tx.phase(), Phase::Idle);
        assert!(!tx.retry_armed());
        assert!(slot.pending().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_peer_arms_retry_without_sending() {
        let (a, _b) = MemoryTransport::pair();
        a.set_reachable(false);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        settle().await;

        assert_eq!(a.send_attempts(), 0);
        assert_eq!(tx.phase(), Phase::AwaitingRetry);
        assert!(tx.retry_armed());
        assert_eq!(tx.stats().skipped_unreachable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_delivers_once_then_disarms() {
        let (a, _b) = MemoryTransport::pair();
        a.set_reachable(false);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        // First attempt plus ticks at 2s and 4s, all skipped
        slot.push(b"one");
        tx.submit();
        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert!(a.sent().is_empty());
        assert_eq!(tx.stats().skipped_unreachable, 3);

        // The 6s tick delivers and disarms
        a.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(a.sent(), vec![Bytes::from_static(b"one")]);
        assert!(!tx.retry_armed());
        assert_eq!(tx.phase(), Phase::Idle);

        // No stray ticks afterwards
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(a.send_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_send_is_retried_with_same_bytes() {
        let (a, _b) = MemoryTransport::pair();
        a.fail_next_sends(2);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        tokio::time::sleep(Duration::from_millis(4_500)).await;

        assert_eq!(a.send_attempts(), 3);
        assert_eq!(a.sent(), vec![Bytes::from_static(b"one")]);
        let stats = tx.stats();
        assert_eq!(stats.failures, 2);
        assert_eq!(stats.deliveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_counts_as_failure() {
        let (a, _b) = MemoryTransport::pair();
        a.close();
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        // Initial attempt and the 2s tick both hit the closed end
        assert_eq!(tx.stats().failures, 2);
        assert!(a.sent().is_empty());
        assert!(tx.retry_armed());
        assert!(slot.pending().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_payload_supersedes_while_waiting() {
        let (a, _b) = MemoryTransport::pair();
        a.set_reachable(false);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"v1");
        tx.submit();
        settle().await;

        // Second write while waiting only swaps the payload
        slot.push(b"v2");
        tx.submit();
        settle().await;
        assert!(tx.retry_armed());

        a.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert_eq!(a.sent(), vec![Bytes::from_static(b"v2")]);
        assert!(!tx.retry_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn write_during_slow_send_goes_out_on_next_tick() {
        let (a, _b) = MemoryTransport::pair();
        a.set_latency(Some(Duration::from_millis(500)));
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"v1");
        tx.submit();
        settle().await;
        assert_eq!(tx.phase(), Phase::Sending);

        // v1 is still in flight; v2 waits for the next tick
        slot.push(b"v2");
        tx.submit();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(a.sent(), vec![Bytes::from_static(b"v1")]);
        assert!(tx.retry_armed());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            a.sent(),
            vec![Bytes::from_static(b"v1"), Bytes::from_static(b"v2")]
        );
        assert_eq!(tx.phase(), Phase::Idle);
        assert_eq!(a.send_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_schedule() {
        let (a, _b) = MemoryTransport::pair();
        a.set_reachable(false);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        settle().await;
        tx.shutdown();
        tx.shutdown();
        assert_eq!(tx.phase(), Phase::Idle);

        a.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(a.sent().is_empty());
        assert!(!tx.retry_armed());

        // Submits after shutdown stay local
        slot.push(b"two");
        tx.submit();
        settle().await;
        assert!(a.sent().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_during_retry_send_lets_it_finish_once() {
        let (a, _b) = MemoryTransport::pair();
        a.set_reachable(false);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        settle().await;

        // The 2s tick starts a send that takes 500ms
        a.set_reachable(true);
        a.set_latency(Some(Duration::from_millis(500)));
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(tx.phase(), Phase::Sending);
        assert_eq!(a.send_attempts(), 1);

        tx.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(a.send_attempts(), 1);
        assert_eq!(a.sent(), vec![Bytes::from_static(b"one")]);
        assert_eq!(tx.phase(), Phase::Idle);
        assert!(!tx.retry_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_failing_after_shutdown_does_not_arm() {
        let (a, _b) = MemoryTransport::pair();
        a.set_latency(Some(Duration::from_millis(500)));
        a.fail_next_sends(1);
        let slot = Slot::new();
        let tx = manager(&a, &slot);

        slot.push(b"one");
        tx.submit();
        settle().await;
        assert_eq!(tx.phase(), Phase::Sending);

        tx.shutdown();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(tx.stats().failures, 1);
        assert_eq!(a.send_attempts(), 1);
        assert_eq!(tx.phase(), Phase::Idle);
        assert!(!tx.retry_armed());
    }
}
