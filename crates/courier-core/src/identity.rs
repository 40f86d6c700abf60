//! Token-to-identity derivation and random identity generation.
//!
//! Authentication is capability-based: possession of a token is proof of
//! identity. [`derive_identity`] maps a token to a stable pseudo-random
//! identity with no server secret and no account database, so the same
//! token yields the same identity from any transport, forever.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Hash rounds used by [`derive_identity`].
const DERIVE_ROUNDS: usize = 32;

/// Random characters in a guest identity (after the prefix).
const GUEST_IDENTITY_LEN: usize = 16;

/// Random characters in a polling session token (after the prefix).
const POLLING_TOKEN_LEN: usize = 63;

/// Derived identities are prefixed with `a`, guests with `g`, polling
/// session tokens with `$`.
const DERIVED_PREFIX: char = 'a';
const GUEST_PREFIX: char = 'g';
const POLLING_PREFIX: char = '$';

/// Map a byte into the restricted alphanumeric identity alphabet.
///
/// Bytes compress into `0`-`9` below 70, `a`-`z` up to 251, and `e` above.
fn alphanumeric(byte: u8) -> char {
    let code = 48 + byte / 7;
    if code > 83 {
        'e'
    } else if code > 57 {
        (code + 39) as char
    } else {
        code as char
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Derive a stable identity from an authentication token.
///
/// Deterministic and collision-resistant: the token is hashed iteratively
/// with SHA-256, taking one byte of each round's digest through the
/// restricted alphabet. Output length is fixed at `1 + DERIVE_ROUNDS`
/// characters.
#[must_use]
pub fn derive_identity(token: &str) -> String {
    let mut digest = Sha256::digest(token.as_bytes());
    let mut identity = String::with_capacity(1 + DERIVE_ROUNDS);
    identity.push(DERIVED_PREFIX);

    for _ in 0..DERIVE_ROUNDS {
        digest = Sha256::digest(hex(&digest).as_bytes());
        identity.push(alphanumeric(digest[0]));
    }

    identity
}

/// A random identity-alphabet string with the given prefix.
fn random_identity(len: usize, prefix: char) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(1 + len);
    out.push(prefix);
    out.extend(bytes.iter().map(|b| alphanumeric(*b)));
    out
}

/// Generate a guest identity that does not collide with any currently
/// registered identity.
///
/// Collisions with identities of already-disconnected sessions are
/// acceptable; `taken` is only consulted for live clients.
#[must_use]
pub fn generate_guest_identity<F>(taken: F) -> String
where
    F: Fn(&str) -> bool,
{
    loop {
        let candidate = random_identity(GUEST_IDENTITY_LEN, GUEST_PREFIX);
        if !taken(&candidate) {
            return candidate;
        }
    }
}

/// Mint an opaque per-session polling credential.
#[must_use]
pub fn generate_polling_token() -> String {
    random_identity(POLLING_TOKEN_LEN, POLLING_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_derive_identity_deterministic() {
        assert_eq!(derive_identity("t1"), derive_identity("t1"));
        assert_eq!(derive_identity(""), derive_identity(""));
    }

    #[test]
    fn test_derive_identity_fixed_length_and_alphabet() {
        let identity = derive_identity("some token");
        assert_eq!(identity.len(), 1 + DERIVE_ROUNDS);
        assert!(identity.starts_with('a'));
        assert!(identity
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[test]
    fn test_derive_identity_distinct_tokens() {
        // Property check over random token pairs.
        let mut seen = HashSet::new();
        for i in 0..200 {
            let token = random_identity(24, 't');
            assert!(seen.insert(derive_identity(&token)), "collision at {i}");
        }
        assert_ne!(derive_identity("t1"), derive_identity("t2"));
    }

    #[test]
    fn test_guest_identity_shape() {
        let identity = generate_guest_identity(|_| false);
        assert_eq!(identity.len(), 1 + GUEST_IDENTITY_LEN);
        assert!(identity.starts_with('g'));
    }

    #[test]
    fn test_guest_identity_avoids_live_collisions() {
        let first = generate_guest_identity(|_| false);
        let second = generate_guest_identity(|candidate| candidate == first);
        assert_ne!(first, second);
    }

    #[test]
    fn test_polling_token_shape() {
        let token = generate_polling_token();
        assert_eq!(token.len(), 1 + POLLING_TOKEN_LEN);
        assert!(token.starts_with('$'));
    }

    #[test]
    fn test_alphanumeric_mapping_bounds() {
        assert_eq!(alphanumeric(0), '0');
        assert_eq!(alphanumeric(69), '9');
        assert_eq!(alphanumeric(70), 'a');
        assert_eq!(alphanumeric(251), 'z');
        assert_eq!(alphanumeric(252), 'e');
        assert_eq!(alphanumeric(255), 'e');
    }
}
