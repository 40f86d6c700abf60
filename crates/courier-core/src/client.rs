//! Client sessions and the deliver capability.

use courier_protocol::{ChannelKey, Outbound};
use std::fmt;

/// Opaque session identifier, unique for the lifetime of the process.
///
/// Internal key only; the public-facing name of a client is its identity
/// string, and multiple sessions may share one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One-way send capability bound to a client at creation time.
///
/// Persistent transports write the envelope to the socket; the polling
/// transport appends it to the session's outbound queue. Calling it on a
/// no-longer-deliverable transport must be a silent no-op, never an error.
pub type Deliver = Box<dyn Fn(Outbound) + Send + Sync>;

/// A live (or, for polling, recently-live) participant.
pub struct Client {
    pub(crate) identity: String,
    pub(crate) guest: bool,
    /// Channels this client belongs to; always mirrors, element for
    /// element, the channels whose member set contains this session.
    pub(crate) channels: Vec<ChannelKey>,
    pub(crate) deliver: Deliver,
    pub(crate) source_address: Option<String>,
}

impl Client {
    /// The client's current public identity.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether the client is unauthenticated.
    #[must_use]
    pub fn is_guest(&self) -> bool {
        self.guest
    }

    /// Channels this client is subscribed to.
    #[must_use]
    pub fn channels(&self) -> &[ChannelKey] {
        &self.channels
    }

    /// Remote address, when the transport knows it.
    #[must_use]
    pub fn source_address(&self) -> Option<&str> {
        self.source_address.as_deref()
    }

    pub(crate) fn deliver(&self, envelope: Outbound) {
        (self.deliver)(envelope);
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("guest", &self.guest)
            .field("channels", &self.channels)
            .field("source_address", &self.source_address)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a freshly created client, returned by the registry.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// The new session's internal key.
    pub session_id: SessionId,
    /// The session's public identity.
    pub identity: String,
    /// Whether the session is unauthenticated.
    pub guest: bool,
}
