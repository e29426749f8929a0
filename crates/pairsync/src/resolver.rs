//! Last-writer-wins conflict resolution.
//!
//! Local writes always win on the local replica. Inbound envelopes win only
//! if they are strictly newer than everything accepted so far; an equal
//! timestamp is a re-delivery of something already seen and is dropped.
//!
//! | `last_accepted` | incoming `modifiedAt` | outcome |
//! |---|---|---|
//! | none | any | [`Resolution::Accepted`] (bootstrap) |
//! | `t` | `> t` | [`Resolution::Accepted`] |
//! | `t` | `== t` | [`Resolution::Duplicate`] |
//! | `t` | `< t` | [`Resolution::Stale`] |

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::envelope::Envelope;
use crate::state::ReplicaState;

/// Which side caused an accepted change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// A `write` on this replica.
    Local,
    /// An envelope delivered by the peer.
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// Outcome of offering an envelope to the resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The envelope replaced the current value.
    Accepted(Origin),
    /// Same timestamp as the newest accepted envelope.
    Duplicate,
    /// Older than the newest accepted envelope.
    Stale,
}

impl Resolution {
    /// `true` if state changed.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }
}

/// Apply a local write. Never consults prior state.
pub fn resolve_local<T: Clone>(state: &mut ReplicaState<T>, value: T, at: Timestamp) -> Origin {
    state.apply_local(value, at);
    Origin::Local
}

/// Decide whether an inbound envelope wins, applying it if so.
pub fn resolve_remote<T: Clone>(state: &mut ReplicaState<T>, envelope: Envelope<T>) -> Resolution {
    let resolution = judge(state.last_accepted(), envelope.modified_at());
    if resolution.is_accepted() {
        state.apply_remote(envelope);
    }
    resolution
}

fn judge(last_accepted: Option<Timestamp>, incoming: Timestamp) -> Resolution {
    match last_accepted {
        None => Resolution::Accepted(Origin::Remote),
        Some(last) if incoming > last => Resolution::Accepted(Origin::Remote),
        Some(last) if incoming == last => Resolution::Duplicate,
        Some(_) => Resolution::Stale,
    }
}
