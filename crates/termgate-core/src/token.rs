//! One-time handoff tokens.
//!
//! A token is a bearer credential: whoever presents it (from the right host)
//! gets the parked backend session, so it must be unguessable.

use rand::RngCore;

/// Number of random bytes in a token (hex-encoded to twice as many chars).
const TOKEN_BYTES: usize = 16;

/// Generate a fresh random token (16 bytes = 32 hex chars).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// First 8 chars of a token, safe to put in logs.
pub fn short_token(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(8)
        .map(|(i, _)| i)
        .unwrap_or(token.len());
    &token[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_differ() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn short_token_truncates() {
        assert_eq!(short_token("0123456789abcdef"), "01234567");
        assert_eq!(short_token("abc"), "abc");
    }
}
