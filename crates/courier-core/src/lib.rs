//! # courier-core
//!
//! Transport-agnostic broker core for the Courier relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Identity** - deterministic token-to-identity derivation and guest
//!   identity generation
//! - **Client** - session model with a one-way deliver capability
//! - **Channel** - channel key validation
//! - **Broker** - client registry, channel index and message router behind
//!   a single-writer lock
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Transport  │────▶│   Broker    │────▶│   deliver   │
//! │   adapter   │     │ (registry + │     │ capability  │
//! └─────────────┘     │  channels)  │     └─────────────┘
//!                     └─────────────┘
//! ```
//!
//! Adapters register sessions and feed decoded frames in; everything the
//! server says back travels through each session's deliver capability, so
//! the polling transport's queue and a live socket look identical to the
//! router.

pub mod broker;
pub mod channel;
pub mod client;
pub mod identity;

pub use broker::{Broker, BrokerConfig, BrokerStats};
pub use channel::{channel_key_from_value, validate_channel_key, MAX_CHANNEL_KEY_LENGTH};
pub use client::{Client, ClientInfo, Deliver, SessionId};
pub use identity::{derive_identity, generate_guest_identity, generate_polling_token};
