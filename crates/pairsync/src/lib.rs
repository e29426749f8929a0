//! # pairsync
//!
//! One value, replicated between exactly two peers over a channel that may
//! drop, duplicate or reorder messages and may be unreachable for long
//! stretches.
//!
//! - Writes are applied locally at once and delivered in the background,
//!   retrying on a fixed interval until the peer is reachable.
//! - Inbound updates are merged last-writer-wins on their modification
//!   timestamp. Equal timestamps are duplicates; older ones are stale.
//! - Subscribers observe the current value and whether each change came from
//!   this side or the peer.
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use pairsync::{MemoryTransport, Origin, Replica};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), pairsync::ReplicaError> {
//! let (phone, watch) = MemoryTransport::pair();
//! let on_phone = Replica::new(String::from("idle"), Arc::new(phone))?;
//! let on_watch = Replica::new(String::from("idle"), Arc::new(watch))?;
//!
//! let mut origins = on_watch.subscribe_to_origin();
//! on_phone.write("running".into())?;
//!
//! assert_eq!(origins.recv().await.unwrap(), Origin::Remote);
//! assert_eq!(on_watch.read(), "running");
//! # Ok(())
//! # }
//! ```
//!
//! ## Clocks
//!
//! Ordering relies on wall-clock timestamps from both devices. If their
//! clocks drift apart, the "last" writer is the one with the later clock,
//! which may not match real-world order.
//!
//! ## Transports
//!
//! Implement [`Transport`] for your channel. [`MemoryTransport`] links two
//! replicas in-process and can simulate outages and failures.

mod config;
mod error;
mod memory;
mod replica;
mod state;

pub mod clock;
pub mod envelope;
pub mod notifier;
pub mod resolver;
pub mod transmission;
pub mod transport;

pub use clock::{Timestamp, WallClock};
pub use config::{ReplicaConfig, ENV_NOTIFY_CAPACITY, ENV_RETRY_INTERVAL_MS};
pub use envelope::{Codec, Envelope, JsonCodec, PostcardCodec};
pub use error::{CodecError, ReplicaError, Result, TransportError};
pub use memory::MemoryTransport;
pub use notifier::{ChangeNotifier, ChangeSink};
pub use replica::{Replica, ReplicaBuilder, Value};
pub use resolver::{Origin, Resolution};
pub use state::{Payload, ReplicaState};
pub use transmission::{Phase, TransmissionStats};
pub use transport::Transport;
