//! Change notification.
//!
//! Two observables per replica:
//!
//! - the current value, backed by a `watch` channel, so a new subscriber
//!   immediately sees the latest value and then every update;
//! - the origin of each accepted change, backed by a `broadcast` channel,
//!   so subscribers only see changes made after they subscribed.
//!
//! Publishing never waits on subscribers. [`ChangeSink`]s injected by the
//! embedding application each run on their own task.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::resolver::Origin;

/// Callback invoked after every accepted change.
///
/// Implemented for any `Fn(Origin)` closure.
pub trait ChangeSink: Send + Sync + 'static {
    /// A change from `origin` was accepted.
    fn on_change(&self, origin: Origin);
}

impl<F> ChangeSink for F
where
    F: Fn(Origin) + Send + Sync + 'static,
{
    fn on_change(&self, origin: Origin) {
        self(origin)
    }
}

/// Fan-out of accepted changes to subscribers.
#[derive(Debug)]
pub struct ChangeNotifier<T> {
    value_tx: watch::Sender<T>,
    origin_tx: broadcast::Sender<Origin>,
}

impl<T> ChangeNotifier<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a notifier seeded with `initial`. `capacity` bounds how many
    /// origin events a slow subscriber may fall behind before it lags.
    pub fn new(initial: T, capacity: usize) -> Self {
        let (value_tx, _) = watch::channel(initial);
        let (origin_tx, _) = broadcast::channel(capacity);
        Self {
            value_tx,
            origin_tx,
        }
    }

    /// Publish an accepted change. Must be called in acceptance order.
    pub fn publish(&self, value: &T, origin: Origin) {
        self.value_tx.send_replace(value.clone());
        // No origin subscribers is fine; the event is simply not observed.
        let _ = self.origin_tx.send(origin);
    }

    /// Latest published value.
    pub fn current(&self) -> T {
        self.value_tx.borrow().clone()
    }

    /// Subscribe to values. The receiver starts at the latest value.
    pub fn subscribe_value(&self) -> watch::Receiver<T> {
        let mut rx = self.value_tx.subscribe();
        rx.mark_changed();
        rx
    }

    /// Subscribe to origins of changes accepted from now on.
    pub fn subscribe_origin(&self) -> broadcast::Receiver<Origin> {
        self.origin_tx.subscribe()
    }

    /// Values as a `Stream`: the latest value first, then every update.
    pub fn value_stream(&self) -> WatchStream<T> {
        WatchStream::new(self.value_tx.subscribe())
    }

    /// Origins as a `Stream`. Events missed by lagging are skipped.
    pub fn origin_stream(&self) -> impl Stream<Item = Origin> + Send + 'static {
        BroadcastStream::new(self.origin_tx.subscribe()).filter_map(|event| event.ok())
    }

    /// Drive `sink` from the origin channel on `runtime` until `cancel` fires.
    pub fn attach_sink(
        &self,
        sink: Arc<dyn ChangeSink>,
        runtime: &Handle,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let mut rx = self.origin_tx.subscribe();
        runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(origin) => sink.on_change(origin),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change sink lagged behind; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("change sink detached");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn value_subscriber_sees_latest_immediately() {
        let notifier = ChangeNotifier::new(0, 8);
        notifier.publish(&3, Origin::Local);

        let mut rx = notifier.subscribe_value();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 3);

        notifier.publish(&4, Origin::Remote);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 4);
    }

    #[tokio::test]
    async fn origin_subscriber_gets_no_replay() {
        let notifier = ChangeNotifier::new(0, 8);
        notifier.publish(&1, Origin::Local);

        // Subscribed after the first publish: nothing replayed
        let mut rx = notifier.subscribe_origin();
        assert!(rx.try_recv().is_err());

        notifier.publish(&2, Origin::Remote);
        notifier.publish(&3, Origin::Local);
        assert_eq!(rx.recv().await.unwrap(), Origin::Remote);
        assert_eq!(rx.recv().await.unwrap(), Origin::Local);
    }

    #[tokio::test]
    async fn streams_yield_in_publish_order() {
        let notifier = ChangeNotifier::new("a", 8);
        let mut values = notifier.value_stream();
        let origins = notifier.origin_stream();
        tokio::pin!(origins);

        assert_eq!(values.next().await, Some("a"));

        notifier.publish(&"b", Origin::Remote);
        assert_eq!(values.next().await, Some("b"));
        assert_eq!(origins.next().await, Some(Origin::Remote));
    }

    #[tokio::test]
    async fn sink_runs_until_cancelled() {
        let notifier = ChangeNotifier::new(0, 8);
        let hits = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let counter = Arc::clone(&hits);
        let handle = notifier.attach_sink(
            Arc::new(move |_origin: Origin| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            &Handle::current(),
            cancel.clone(),
        );

        notifier.publish(&1, Origin::Local);
        notifier.publish(&2, Origin::Remote);
        while hits.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }

        // Task exits once cancelled
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
