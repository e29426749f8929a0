use bytes::Bytes;

use crate::clock::Timestamp;
use crate::envelope::Envelope;

/// An encoded local envelope waiting to be delivered.
///
/// `seq` increases with every local write on a replica, so the transmission
/// manager can tell whether the payload it just delivered is still the newest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Local write sequence number.
    pub seq: u64,
    /// Encoded envelope bytes, resent verbatim on every retry.
    pub bytes: Bytes,
}

/// The cached replica: current value, newest accepted timestamp, and the
/// last encoded local write.
///
/// Mutated only through the [`resolver`](crate::resolver) and always under
/// the replica's lock.
#[derive(Debug, Clone)]
pub struct ReplicaState<T> {
    current: T,
    last_accepted: Option<Timestamp>,
    pending: Option<Payload>,
    next_seq: u64,
}

impl<T> ReplicaState<T> {
    /// Seed a replica with its initial value. Nothing has been accepted yet.
    pub fn new(initial: T) -> Self {
        Self {
            current: initial,
            last_accepted: None,
            pending: None,
            next_seq: 1,
        }
    }

    /// Borrow the current value.
    pub fn current(&self) -> &T {
        &self.current
    }

    /// Timestamp of the newest accepted envelope, local or remote.
    pub fn last_accepted(&self) -> Option<Timestamp> {
        self.last_accepted
    }

    /// The payload most recently queued for delivery, if not yet delivered.
    pub fn pending(&self) -> Option<&Payload> {
        self.pending.as_ref()
    }

    /// Install a local write. The value always takes effect; the accepted
    /// timestamp only moves forward.
    pub fn apply_local(&mut self, value: T, at: Timestamp) {
        self.current = value;
        self.last_accepted = Some(self.last_accepted.map_or(at, |prev| prev.max(at)));
    }

    /// Install an inbound envelope the resolver has already accepted.
    pub fn apply_remote(&mut self, envelope: Envelope<T>) {
        let (value, at) = envelope.into_parts();
        self.current = value;
        self.last_accepted = Some(self.last_accepted.map_or(at, |prev| prev.max(at)));
    }

    /// Record freshly encoded bytes for a local write, replacing any older
    /// undelivered payload. Returns the stored payload.
    pub fn set_pending(&mut self, bytes: Bytes) -> Payload {
        let payload = Payload {
            seq: self.next_seq,
            bytes,
        };
        self.next_seq += 1;
        self.pending = Some(payload.clone());
        payload
    }

    /// Drop the pending payload if it is still the one with `seq`.
    ///
    /// Returns `false` when a newer write has replaced it in the meantime.
    pub fn clear_pending_if(&mut self, seq: u64) -> bool {
        match &self.pending {
            Some(p) if p.seq == seq => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }
}

impl<T: Clone> ReplicaState<T> {
    /// Clone of the current value.
    #[must_use]
    pub fn read(&self) -> T {
        self.current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: u64) -> Timestamp {
        Timestamp::from_millis(ms)
    }

    #[test]
    fn starts_without_timestamp() {
        let state = ReplicaState::new(0);
        assert_eq!(state.read(), 0);
        assert_eq!(state.last_accepted(), None);
        assert!(state.pending().is_none());
    }

    #[test]
    fn local_apply_sets_value_and_timestamp() {
        let mut state = ReplicaState::new(0);
        state.apply_local(5, ts(10));
        assert_eq!(state.read(), 5);
        assert_eq!(state.last_accepted(), Some(ts(10)));
    }

    #[test]
    fn local_apply_never_lowers_timestamp() {
        let mut state = ReplicaState::new("a");
        state.apply_remote(Envelope::new("b", ts(50)));
        state.apply_local("c", ts(20));

        assert_eq!(*state.current(), "c");
        assert_eq!(state.last_accepted(), Some(ts(50)));
    }

    #[test]
    fn accessors_need_no_clone() {
        // A value type without Clone can still be inspected in place.
        #[derive(Debug, PartialEq)]
        struct Opaque(u8);

        let mut state = ReplicaState::new(Opaque(1));
        state.apply_remote(Envelope::new(Opaque(2), ts(7)));

        assert_eq!(state.current(), &Opaque(2));
        assert_eq!(state.last_accepted(), Some(ts(7)));
        assert!(state.pending().is_none());
    }

    #[test]
    fn pending_is_replaced_by_newer_write() {
        let mut state = ReplicaState::new(0);
        let first = state.set_pending(Bytes::from_static(b"one"));
        let second = state.set_pending(Bytes::from_static(b"two"));

        // Delivery of the older payload must not clear the newer one
        assert!(second.seq > first.seq);
        assert!(!state.clear_pending_if(first.seq));
        assert_eq!(state.pending(), Some(&second));

        assert!(state.clear_pending_if(second.seq));
        assert!(state.pending().is_none());
    }
}
