//! Session-secret validation and player-ID derivation
//!
//! Controllers generate a long random hex secret once and store it across
//! page loads; it is the anchor of player identity. The host never
//! broadcasts the secret. Instead it derives a short public player ID
//! from it, so the same device always maps to the same player.

use crate::protocol::PlayerId;

/// Minimum number of hex characters in a secret after dashes are removed.
const MIN_SECRET_HEX_CHARS: usize = 32;

/// Number of leading hex characters that form the public player ID.
const PLAYER_ID_HEX_CHARS: usize = 16;

/// Checks the session-secret format rule: at least 32 hex characters,
/// case-insensitive, with dashes ignored (UUID-style secrets pass).
pub fn validate_secret(secret: &str) -> bool {
    let mut hex_chars = 0usize;
    for c in secret.chars() {
        if c == '-' {
            continue;
        }
        if !c.is_ascii_hexdigit() {
            return false;
        }
        hex_chars += 1;
    }
    hex_chars >= MIN_SECRET_HEX_CHARS
}

/// Derives the stable public player ID: strip dashes, take the first 16
/// hex characters.
///
/// This is deliberately not a cryptographic hash. The point is only to
/// keep the raw secret out of broadcast state while staying deterministic
/// so reconnecting devices land on the same player record. Callers must
/// validate the secret first.
pub fn derive_player_id(secret: &str) -> PlayerId {
    secret
        .chars()
        .filter(|c| *c != '-')
        .take(PLAYER_ID_HEX_CHARS)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_hex_secret() {
        assert!(validate_secret("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(validate_secret("0123456789abcdef0123456789ABCDEF"));
    }

    #[test]
    fn test_accepts_uuid_style_secret() {
        assert!(validate_secret("550e8400-e29b-41d4-a716-446655440000"));
    }

    #[test]
    fn test_rejects_short_or_non_hex() {
        assert!(!validate_secret("abcdef"));
        assert!(!validate_secret(""));
        assert!(!validate_secret("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"));
        // 31 hex chars plus a dash: dashes do not count toward length
        assert!(!validate_secret("-aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let secret = "550e8400-e29b-41d4-a716-446655440000";
        assert_eq!(derive_player_id(secret), derive_player_id(secret));
        assert_eq!(derive_player_id(secret), "550e8400e29b41d4");
    }

    #[test]
    fn test_derivation_strips_dashes_before_truncating() {
        // Same hex with and without dashes must collapse to one identity.
        assert_eq!(
            derive_player_id("550e8400-e29b-41d4-a716-446655440000"),
            derive_player_id("550e8400e29b41d4a716446655440000")
        );
    }

    #[test]
    fn test_derived_id_is_16_chars() {
        let id = derive_player_id("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        assert_eq!(id.len(), 16);
        assert_eq!(id, "aaaaaaaaaaaaaaaa");
    }
}
