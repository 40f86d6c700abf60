//! Channel key validation.
//!
//! A channel key is either a string of at most 256 characters or an
//! integer; two keys are equal only by exact value and type. Channels
//! themselves are pure membership sets owned by the broker: an entry
//! exists in the index iff its member set is non-empty.

use courier_protocol::{ChannelKey, RelayError};
use serde_json::Value;

/// Maximum length of a string channel key, in characters.
pub const MAX_CHANNEL_KEY_LENGTH: usize = 256;

/// Parse a raw request field into a channel key.
///
/// # Errors
///
/// Returns [`RelayError::InvalidChannelKey`] for anything other than a
/// string within the length limit or an integer.
pub fn channel_key_from_value(value: &Value) -> Result<ChannelKey, RelayError> {
    match value {
        Value::String(name) if name.chars().count() <= MAX_CHANNEL_KEY_LENGTH => {
            Ok(ChannelKey::Name(name.clone()))
        }
        Value::Number(n) => n.as_i64().map(ChannelKey::Num).ok_or(RelayError::InvalidChannelKey),
        _ => Err(RelayError::InvalidChannelKey),
    }
}

/// Validate an already-typed channel key (length rule for names).
///
/// # Errors
///
/// Returns [`RelayError::InvalidChannelKey`] if a string key exceeds the
/// length limit.
pub fn validate_channel_key(key: &ChannelKey) -> Result<(), RelayError> {
    match key {
        ChannelKey::Name(name) if name.chars().count() > MAX_CHANNEL_KEY_LENGTH => {
            Err(RelayError::InvalidChannelKey)
        }
        _ => Ok(()),
    }
}
