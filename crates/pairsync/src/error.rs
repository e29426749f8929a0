use thiserror::Error;

/// Error turning an [`Envelope`](crate::Envelope) into bytes or back.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The local value could not be serialized. This indicates a broken
    /// `Serialize` impl and is never retried.
    #[error("failed to encode envelope: {0}")]
    Encode(String),
    /// Inbound bytes were malformed, truncated, or of an incompatible schema.
    #[error("failed to decode envelope: {0}")]
    Decode(String),
}

/// Error reported by a [`Transport`](crate::Transport) send attempt.
///
/// The transmission manager recovers from every variant by retrying; these
/// never reach the caller of [`Replica::write`](crate::Replica::write).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer cannot be reached right now.
    #[error("peer unreachable")]
    Unreachable,
    /// The transport tried and failed to deliver the payload.
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

/// Error surfaced by the public [`Replica`](crate::Replica) API.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// A local value could not be encoded. The write was not applied.
    #[error("encoding error: {0}")]
    Encoding(#[source] CodecError),
    /// Inbound bytes could not be decoded. The message was dropped.
    #[error("decoding error: {0}")]
    Decoding(#[source] CodecError),
    /// The replica was built outside of a tokio runtime.
    #[error("no tokio runtime available to drive transmission")]
    NoRuntime,
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for replica operations.
pub type Result<T, E = ReplicaError> = std::result::Result<T, E>;
