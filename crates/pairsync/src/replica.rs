//! The public face of pairsync: one replicated value.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::clock::{Timestamp, WallClock};
use crate::config::ReplicaConfig;
use crate::envelope::{Codec, Envelope, JsonCodec};
use crate::error::{ReplicaError, Result};
use crate::notifier::{ChangeNotifier, ChangeSink};
use crate::resolver::{self, Origin, Resolution};
use crate::state::{Payload, ReplicaState};
use crate::transmission::{PendingSlot, Phase, TransmissionManager, TransmissionStats};
use crate::transport::Transport;

/// Bound for values a replica can carry.
pub trait Value: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Value for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// State and clock share one lock so timestamps are issued in apply order.
struct Core<T> {
    state: ReplicaState<T>,
    clock: WallClock,
}

/// Everything the local-write path, the inbound pump and the transmission
/// manager touch.
struct Shared<T, C> {
    core: Mutex<Core<T>>,
    notifier: ChangeNotifier<T>,
    codec: C,
}

impl<T: Value, C: Codec> Shared<T, C> {
    fn receive(&self, bytes: &[u8]) -> Result<Resolution> {
        let envelope: Envelope<T> = self.codec.decode(bytes).map_err(|e| {
            warn!(codec = C::NAME, len = bytes.len(), error = %e, "dropping undecodable message");
            ReplicaError::Decoding(e)
        })?;
        let modified_at = envelope.modified_at();

        let mut core = self.core.lock();
        let resolution = resolver::resolve_remote(&mut core.state, envelope);
        match resolution {
            Resolution::Accepted(origin) => {
                self.notifier.publish(core.state.current(), origin);
                debug!(%modified_at, "remote change accepted");
            }
            Resolution::Duplicate => trace!(%modified_at, "duplicate envelope dropped"),
            Resolution::Stale => debug!(
                %modified_at,
                last_accepted = ?core.state.last_accepted(),
                "stale envelope dropped"
            ),
        }
        Ok(resolution)
    }
}

impl<T: Value, C: Codec> PendingSlot for Shared<T, C> {
    fn pending(&self) -> Option<Payload> {
        self.core.lock().state.pending().cloned()
    }

    fn clear_if(&self, seq: u64) -> bool {
        self.core.lock().state.clear_pending_if(seq)
    }
}

/// A value replicated with one peer over a [`Transport`].
///
/// Writes apply locally at once and are delivered in the background,
/// retrying every [`ReplicaConfig::retry_interval`] until the peer takes
/// them. Inbound envelopes are merged last-writer-wins.
///
/// Must be built inside a tokio runtime. Dropping the replica stops its
/// background tasks.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use pairsync::{MemoryTransport, Replica};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), pairsync::ReplicaError> {
/// let (link_a, _link_b) = MemoryTransport::pair();
/// let replica = Replica::new(0_u32, Arc::new(link_a))?;
///
/// replica.write(5)?;
/// assert_eq!(replica.read(), 5);
/// # Ok(())
/// # }
/// ```
pub struct Replica<T, Tr, C = JsonCodec> {
    shared: Arc<Shared<T, C>>,
    transmission: TransmissionManager<Tr, Shared<T, C>>,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl<T: Value, Tr: Transport> Replica<T, Tr, JsonCodec> {
    /// Build a replica with default settings and the JSON codec.
    pub fn new(initial: T, transport: Arc<Tr>) -> Result<Self> {
        Self::builder(initial, transport).build()
    }

    /// Start configuring a replica.
    pub fn builder(initial: T, transport: Arc<Tr>) -> ReplicaBuilder<T, Tr, JsonCodec> {
        ReplicaBuilder {
            initial,
            transport,
            config: ReplicaConfig::default(),
            codec: JsonCodec,
            clock: WallClock::new(),
        }
    }
}

impl<T: Value, Tr: Transport, C: Codec> Replica<T, Tr, C> {
    /// Assign a new value.
    ///
    /// The value is visible to [`read`](Self::read) before this returns,
    /// whatever the state of the transport. Delivery happens in the
    /// background. Fails only if `value` cannot be encoded, in which case
    /// nothing is applied.
    pub fn write(&self, value: T) -> Result<()> {
        let seq = {
            let mut core = self.shared.core.lock();
            let at = core.clock.now();
            let envelope = Envelope::new(value, at);
            let bytes = self.shared.codec.encode(&envelope).map_err(|e| {
                error!(codec = C::NAME, error = %e, "local value cannot be encoded");
                ReplicaError::Encoding(e)
            })?;

            let (value, at) = envelope.into_parts();
            let origin = resolver::resolve_local(&mut core.state, value, at);
            let payload = core.state.set_pending(Bytes::from(bytes));
            self.shared.notifier.publish(core.state.current(), origin);
            debug!(seq = payload.seq, modified_at = %at, "local write applied");
            payload.seq
        };

        trace!(seq, "submitting payload");
        self.transmission.submit();
        Ok(())
    }

    /// The current value. Never blocks on delivery.
    pub fn read(&self) -> T {
        self.shared.notifier.current()
    }

    /// Offer raw bytes from the peer.
    ///
    /// The transport pump calls this for every inbound message; it is public
    /// for transports that push instead of being subscribed to.
    pub fn receive(&self, bytes: &[u8]) -> Result<Resolution> {
        self.shared.receive(bytes)
    }

    /// Timestamp of the newest accepted change, if any.
    pub fn last_accepted(&self) -> Option<Timestamp> {
        self.shared.core.lock().state.last_accepted()
    }

    /// Subscribe to values, starting with the current one.
    pub fn subscribe_to_value(&self) -> watch::Receiver<T> {
        self.shared.notifier.subscribe_value()
    }

    /// Subscribe to the origin of every change accepted from now on.
    pub fn subscribe_to_origin(&self) -> broadcast::Receiver<Origin> {
        self.shared.notifier.subscribe_origin()
    }

    /// [`subscribe_to_value`](Self::subscribe_to_value) as a `Stream`.
    pub fn value_stream(&self) -> WatchStream<T> {
        self.shared.notifier.value_stream()
    }

    /// [`subscribe_to_origin`](Self::subscribe_to_origin) as a `Stream`.
    pub fn origin_stream(&self) -> impl Stream<Item = Origin> + Send + 'static {
        self.shared.notifier.origin_stream()
    }

    /// Call `sink` after every accepted change, on its own task.
    pub fn add_sink(&self, sink: impl ChangeSink) -> JoinHandle<()> {
        self.shared
            .notifier
            .attach_sink(Arc::new(sink), &self.runtime, self.shutdown.child_token())
    }

    /// Where delivery of the latest write stands.
    pub fn transmission_phase(&self) -> Phase {
        self.transmission.phase()
    }

    /// Delivery counters.
    pub fn transmission_stats(&self) -> TransmissionStats {
        self.transmission.stats()
    }

    /// Stop all background work. Reads and writes keep working locally.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!("replica shutting down");
        }
        self.transmission.shutdown();
        self.shutdown.cancel();
    }
}

impl<T, Tr, C> Drop for Replica<T, Tr, C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<T: fmt::Debug, Tr, C: Codec> fmt::Debug for Replica<T, Tr, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("Replica")
            .field("value", core.state.current())
            .field("last_accepted", &core.state.last_accepted())
            .field("codec", &C::NAME)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Replica`].
pub struct ReplicaBuilder<T, Tr, C> {
    initial: T,
    transport: Arc<Tr>,
    config: ReplicaConfig,
    codec: C,
    clock: WallClock,
}

impl<T: Value, Tr: Transport, C: Codec> ReplicaBuilder<T, Tr, C> {
    /// Replace the whole configuration.
    pub fn config(mut self, config: ReplicaConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry period.
    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.config.retry_interval = interval;
        self
    }

    /// Use another wire encoding. Both peers must agree.
    pub fn codec<C2: Codec>(self, codec: C2) -> ReplicaBuilder<T, Tr, C2> {
        ReplicaBuilder {
            initial: self.initial,
            transport: self.transport,
            config: self.config,
            codec,
            clock: self.clock,
        }
    }

    /// Use a custom clock for local write timestamps.
    pub fn clock(mut self, clock: WallClock) -> Self {
        self.clock = clock;
        self
    }

    /// Build the replica and start its inbound pump.
    ///
    /// Fails with [`ReplicaError::NoRuntime`] outside a tokio runtime and
    /// with [`ReplicaError::Config`] on invalid settings.
    pub fn build(self) -> Result<Replica<T, Tr, C>> {
        self.config.validate()?;
        let runtime = Handle::try_current().map_err(|_| ReplicaError::NoRuntime)?;
        let shutdown = CancellationToken::new();

        let shared = Arc::new(Shared {
            notifier: ChangeNotifier::new(self.initial.clone(), self.config.notify_capacity),
            core: Mutex::new(Core {
                state: ReplicaState::new(self.initial),
                clock: self.clock,
            }),
            codec: self.codec,
        });

        let transmission = TransmissionManager::new(
            Arc::clone(&self.transport),
            Arc::clone(&shared),
            self.config.retry_interval,
            runtime.clone(),
            shutdown.child_token(),
        );

        spawn_pump(&runtime, &self.transport, Arc::clone(&shared), shutdown.child_token());
        debug!(
            codec = C::NAME,
            retry_interval_ms = self.config.retry_interval.as_millis() as u64,
            "replica started"
        );

        Ok(Replica {
            shared,
            transmission,
            runtime,
            shutdown,
        })
    }
}

fn spawn_pump<T: Value, Tr: Transport, C: Codec>(
    runtime: &Handle,
    transport: &Arc<Tr>,
    shared: Arc<Shared<T, C>>,
    cancel: CancellationToken,
) {
    // Subscribe before returning so nothing sent after build() is missed.
    let mut inbound = transport.subscribe();
    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                message = inbound.recv() => match message {
                    // Decode failures are logged inside receive and dropped.
                    Ok(bytes) => {
                        let _ = shared.receive(&bytes);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "inbound pump lagged; messages lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("transport closed inbound channel");
                        break;
                    }
                },
            }
        }
    });
}
