//! # courier-protocol
//!
//! Wire envelope definitions for the Courier relay.
//!
//! Every transport (WebSocket, raw TCP, HTTP long-polling) speaks the same
//! JSON-shaped contract:
//!
//! - **Request** - `{type, id?, channel?, message?, meta?, token?}`
//! - **Response** - `{ok, id, uuid, error?, queue?}`
//! - **Push** - `{type:"message", ...}`, `{type:"ping", ...}`, `{type:"motd", ...}`
//!
//! Channel keys are either a string or an integer on the wire; validation
//! (length, reserved wildcard) is the broker's job, not the codec's.

pub mod envelope;
pub mod error;

pub use envelope::{ChannelKey, ConnectResponse, Meta, Outbound, Push, Request, Response};
pub use error::RelayError;
