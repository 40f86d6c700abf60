//! The relay error taxonomy.
//!
//! Every failure is reported synchronously in the response envelope of the
//! request that caused it; the `Display` form is the exact string clients
//! see in the `error` field.

use thiserror::Error;

/// Errors surfaced to clients in response envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RelayError {
    /// The frame could not be decoded as JSON. The connection stays open.
    #[error("InvalidFormat")]
    InvalidFormat,

    /// A field required by the operation (`type`, `channel`, `token`) is
    /// missing.
    #[error("MissingField")]
    MissingField,

    /// The channel key is neither a string of at most 256 characters nor
    /// an integer.
    #[error("InvalidChannelKey")]
    InvalidChannelKey,

    /// Publish attempted on the reserved wildcard channel.
    #[error("WildcardReadOnly")]
    WildcardReadOnly,

    /// Unrecognized request `type`.
    #[error("InvalidRequestType")]
    InvalidRequestType,

    /// Polling-only: the session token is unknown or the session expired.
    #[error("InvalidOrExpiredPollingToken")]
    InvalidPollingToken,
}
