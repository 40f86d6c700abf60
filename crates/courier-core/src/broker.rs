//! The transport-agnostic broker: client registry, channel index and
//! message router behind one single-writer lock.
//!
//! All registry and channel mutations, and every publish fan-out, are
//! serialized through one mutex so each request observes a consistent,
//! fully-settled state. Deliver capabilities are non-blocking (socket
//! queues or polling buffers), so fan-out happens under the lock.

use crate::channel::{channel_key_from_value, validate_channel_key};
use crate::client::{Client, ClientInfo, Deliver, SessionId};
use crate::identity::{derive_identity, generate_guest_identity};
use courier_protocol::{ChannelKey, Meta, Outbound, Push, RelayError, Request, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// The reserved broadcast-sink channel. Subscribable, never a publish
    /// target.
    pub wildcard_channel: ChannelKey,
    /// Greeting pushed to every new connection.
    pub motd: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            wildcard_channel: ChannelKey::from("*"),
            motd: "courier".to_string(),
        }
    }
}

/// Registry and channel-index statistics.
#[derive(Debug, Clone, Copy)]
pub struct BrokerStats {
    /// Number of registered sessions.
    pub client_count: usize,
    /// Number of open channels.
    pub channel_count: usize,
    /// Total channel memberships.
    pub total_subscriptions: usize,
}

struct State {
    clients: HashMap<SessionId, Client>,
    /// Member lists keep insertion order, which is the fan-out order.
    channels: HashMap<ChannelKey, Vec<SessionId>>,
    next_session: u64,
}

/// The central broker shared by all transport adapters.
pub struct Broker {
    state: Mutex<State>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a broker with the given configuration.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        debug!(wildcard = %config.wildcard_channel, "creating broker");
        Self {
            state: Mutex::new(State {
                clients: HashMap::new(),
                channels: HashMap::new(),
                next_session: 1,
            }),
            config,
        }
    }

    /// The broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session.
    ///
    /// With a token the identity is derived deterministically and the
    /// session starts authenticated; without one a fresh guest identity is
    /// generated, unique among currently registered clients.
    pub fn create_client(
        &self,
        deliver: Deliver,
        token: Option<&str>,
        source_address: Option<String>,
    ) -> ClientInfo {
        let mut state = self.state();
        let session_id = SessionId::new(state.next_session);
        state.next_session += 1;

        let (identity, guest) = match token {
            Some(token) => (derive_identity(token), false),
            None => {
                let identity = generate_guest_identity(|candidate| {
                    state.clients.values().any(|c| c.identity == candidate)
                });
                (identity, true)
            }
        };

        state.clients.insert(
            session_id,
            Client {
                identity: identity.clone(),
                guest,
                channels: Vec::new(),
                deliver,
                source_address,
            },
        );

        debug!(session = %session_id, identity = %identity, guest, "client registered");

        ClientInfo {
            session_id,
            identity,
            guest,
        }
    }

    /// Tear down a session: release every channel membership (deleting
    /// channels emptied by the removal), then drop the registry entry.
    ///
    /// Idempotent; returns `false` if the session was already gone.
    pub fn destroy_client(&self, session: SessionId) -> bool {
        self.state().destroy_client(session)
    }

    /// Subscribe a session to a channel. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidChannelKey`] for an over-length key.
    pub fn subscribe(&self, session: SessionId, key: ChannelKey) -> Result<(), RelayError> {
        self.state().subscribe(session, key)
    }

    /// Unsubscribe a session from a channel. Unknown channels and
    /// non-members are a tolerant no-op.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidChannelKey`] for an over-length key.
    pub fn unsubscribe(&self, session: SessionId, key: ChannelKey) -> Result<(), RelayError> {
        self.state().unsubscribe(session, key)
    }

    /// Publish a message to a channel, fanning out to every current member
    /// except the sender, then to every wildcard subscriber (sender
    /// included) with the channel rewritten to the wildcard key.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::InvalidChannelKey`] or
    /// [`RelayError::WildcardReadOnly`]. Delivery failures never fail the
    /// publish.
    pub fn publish(
        &self,
        sender: SessionId,
        key: ChannelKey,
        message: Value,
        extra_meta: Option<Value>,
    ) -> Result<(), RelayError> {
        self.state().publish(&self.config, sender, key, message, extra_meta)
    }

    /// Replace a session's identity with one derived from `token` and mark
    /// it authenticated.
    pub fn authenticate(&self, session: SessionId, token: &str) {
        self.state().authenticate(session, token);
    }

    /// Decode a raw text frame and run it through the router.
    ///
    /// An undecodable frame answers `InvalidFormat` through the session's
    /// own deliver capability; the connection is left alone.
    pub fn process_frame(&self, session: SessionId, raw: &str) {
        match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.process_request(session, request),
            Err(error) => {
                debug!(session = %session, %error, "undecodable frame");
                let state = self.state();
                if let Some(client) = state.clients.get(&session) {
                    client.deliver(Outbound::Response(Response::err(
                        1,
                        client.identity.clone(),
                        RelayError::InvalidFormat,
                    )));
                }
            }
        }
    }

    /// Dispatch a decoded request and deliver its response, all under one
    /// lock acquisition.
    pub fn process_request(&self, session: SessionId, request: Request) {
        self.state().process(&self.config, session, request);
    }

    /// Current identity of a session, if registered.
    #[must_use]
    pub fn identity_of(&self, session: SessionId) -> Option<String> {
        self.state().clients.get(&session).map(|c| c.identity.clone())
    }

    /// Whether a channel currently exists in the index.
    #[must_use]
    pub fn channel_exists(&self, key: &ChannelKey) -> bool {
        self.state().channels.contains_key(key)
    }

    /// Member count of a channel (0 if absent).
    #[must_use]
    pub fn subscriber_count(&self, key: &ChannelKey) -> usize {
        self.state().channels.get(key).map_or(0, Vec::len)
    }

    /// Channels a session belongs to.
    #[must_use]
    pub fn session_channels(&self, session: SessionId) -> Vec<ChannelKey> {
        self.state()
            .clients
            .get(&session)
            .map(|c| c.channels.clone())
            .unwrap_or_default()
    }

    /// Registry and index statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let state = self.state();
        BrokerStats {
            client_count: state.clients.len(),
            channel_count: state.channels.len(),
            total_subscriptions: state.channels.values().map(Vec::len).sum(),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl State {
    fn subscribe(&mut self, session: SessionId, key: ChannelKey) -> Result<(), RelayError> {
        validate_channel_key(&key)?;
        if !self.clients.contains_key(&session) {
            return Ok(());
        }

        let members = self.channels.entry(key.clone()).or_default();
        if members.contains(&session) {
            // Already a member: success, no duplicate.
            return Ok(());
        }
        members.push(session);

        if let Some(client) = self.clients.get_mut(&session) {
            client.channels.push(key.clone());
        }

        debug!(session = %session, channel = %key, "subscribed");
        Ok(())
    }

    fn unsubscribe(&mut self, session: SessionId, key: ChannelKey) -> Result<(), RelayError> {
        validate_channel_key(&key)?;

        let Some(members) = self.channels.get_mut(&key) else {
            return Ok(());
        };
        let Some(position) = members.iter().position(|m| *m == session) else {
            return Ok(());
        };
        members.remove(position);
        if members.is_empty() {
            self.channels.remove(&key);
            debug!(channel = %key, "deleted empty channel");
        }

        if let Some(client) = self.clients.get_mut(&session) {
            if let Some(position) = client.channels.iter().position(|c| *c == key) {
                client.channels.remove(position);
            }
        }

        debug!(session = %session, channel = %key, "unsubscribed");
        Ok(())
    }

    fn destroy_client(&mut self, session: SessionId) -> bool {
        let Some(client) = self.clients.get(&session) else {
            return false;
        };

        // Memberships must be released before the registry entry goes, so
        // emptied channels are deleted while the session is still known.
        let subscribed = client.channels.clone();
        for key in subscribed {
            let _ = self.unsubscribe(session, key);
        }

        self.clients.remove(&session);
        debug!(session = %session, "client destroyed");
        true
    }

    fn publish(
        &self,
        config: &BrokerConfig,
        sender: SessionId,
        key: ChannelKey,
        message: Value,
        extra_meta: Option<Value>,
    ) -> Result<(), RelayError> {
        validate_channel_key(&key)?;
        if key == config.wildcard_channel {
            return Err(RelayError::WildcardReadOnly);
        }

        let Some(sender_client) = self.clients.get(&sender) else {
            return Ok(());
        };

        // Meta is computed fresh from the sender's current state; caller
        // extras never shadow the reserved fields.
        let mut meta = match extra_meta {
            Some(Value::Object(map)) => map,
            _ => Meta::new(),
        };
        meta.insert("uuid".into(), Value::String(sender_client.identity.clone()));
        meta.insert("time".into(), Value::from(unix_millis()));
        meta.insert("channel".into(), key.to_value());
        meta.insert("guest".into(), Value::Bool(sender_client.guest));

        let mut delivered = 0usize;

        if let Some(members) = self.channels.get(&key) {
            for recipient in members {
                if *recipient == sender {
                    continue;
                }
                if let Some(client) = self.clients.get(recipient) {
                    client.deliver(Outbound::Push(Push::Message {
                        channel: key.clone(),
                        message: message.clone(),
                        meta: meta.clone(),
                    }));
                    delivered += 1;
                }
            }
        }

        // Wildcard fan-out: the sender is not excluded here, and the
        // envelope channel is rewritten (meta.channel keeps the origin).
        if let Some(members) = self.channels.get(&config.wildcard_channel) {
            for recipient in members {
                if let Some(client) = self.clients.get(recipient) {
                    client.deliver(Outbound::Push(Push::Message {
                        channel: config.wildcard_channel.clone(),
                        message: message.clone(),
                        meta: meta.clone(),
                    }));
                    delivered += 1;
                }
            }
        }

        trace!(channel = %key, recipients = delivered, "published");
        Ok(())
    }

    fn authenticate(&mut self, session: SessionId, token: &str) {
        if let Some(client) = self.clients.get_mut(&session) {
            let identity = derive_identity(token);
            debug!(session = %session, from = %client.identity, to = %identity, "authenticated");
            client.identity = identity;
            client.guest = false;
        }
    }

    fn process(&mut self, config: &BrokerConfig, session: SessionId, request: Request) {
        let id = request.request_id();

        let result = match request.kind.as_deref() {
            None => Err(RelayError::MissingField),
            Some("send") => require_channel(&request).and_then(|key| {
                let message = request.message.clone().unwrap_or(Value::Null);
                self.publish(config, session, key, message, request.meta.clone())
            }),
            Some("open") => {
                require_channel(&request).and_then(|key| self.subscribe(session, key))
            }
            Some("close") => {
                require_channel(&request).and_then(|key| self.unsubscribe(session, key))
            }
            Some("auth") => match request.token.as_ref().and_then(Value::as_str) {
                Some(token) => {
                    self.authenticate(session, token);
                    Ok(())
                }
                None => Err(RelayError::MissingField),
            },
            Some("ping") => Ok(()),
            Some(other) => {
                debug!(session = %session, kind = other, "unrecognized request type");
                Err(RelayError::InvalidRequestType)
            }
        };

        // The response carries the identity as it stands after the
        // operation, so an auth reply shows the new identity.
        let Some(client) = self.clients.get(&session) else {
            return;
        };
        let response = match result {
            Ok(()) => Response::ok(id, client.identity.clone()),
            Err(error) => Response::err(id, client.identity.clone(), error),
        };
        client.deliver(Outbound::Response(response));
    }
}

fn require_channel(request: &Request) -> Result<ChannelKey, RelayError> {
    match &request.channel {
        None | Some(Value::Null) => Err(RelayError::MissingField),
        Some(value) => channel_key_from_value(value),
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
