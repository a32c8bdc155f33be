//! Signed deep-link tokens for `t.me/<bot>?start=<token>`.
//!
//! A token carries a small JSON array (opcode first, arguments after) that
//! the web callback mints and the bot consumes. The payload is authenticated
//! with HMAC-SHA256 so a user cannot forge a link claiming someone else's
//! identity. Telegram restricts the start parameter to 64 characters from
//! `[A-Za-z0-9_-]`, so the token is base64url without padding, the tag is
//! truncated, and the two reserved characters are escaped (`_` as `_u`,
//! `.` as `_d`).

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Telegram's hard limit on the start parameter.
pub const MAX_TOKEN_CHARS: usize = 64;

/// Opcode for "link this verified identity to the sending account".
pub const OP_REGISTER: &str = "R";

/// Domain separator mixed into the tag, so tokens cannot be replayed
/// against a future signer that shares the key.
const NAMESPACE: &str = "t";

/// Tag length after truncation. 80 bits keeps the signed token inside
/// Telegram's 64-character payload limit while staying far beyond online
/// forgery reach.
const TAG_BYTES: usize = 10;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    /// The signed token would not fit in a deep link. Carries the
    /// character count it came out to.
    #[error("signed token is {0} characters, over the {MAX_TOKEN_CHARS}-character deep-link limit")]
    TooLarge(usize),
    /// Signature mismatch, malformed structure, or undecodable payload.
    /// One variant for all of them: the caller must not tell a forger
    /// which check failed.
    #[error("token failed verification")]
    Tampered,
}

/// Stateless signer/verifier for deep-link tokens. Both binaries construct
/// one from the shared `JANUS_SECRET_KEY`.
#[derive(Clone)]
pub struct TokenCodec {
    key: Vec<u8>,
}

impl TokenCodec {
    pub fn new(secret_key: &str) -> Self {
        Self {
            key: secret_key.as_bytes().to_vec(),
        }
    }

    /// Sign `parts` into a deep-link token.
    pub fn encode(&self, parts: &[&str]) -> Result<String, TokenError> {
        let payload = serde_json::to_vec(parts).expect("string arrays always serialize");
        let body = URL_SAFE_NO_PAD.encode(payload);
        let tag = URL_SAFE_NO_PAD.encode(&self.tag_for(&body)[..TAG_BYTES]);
        let token = format!("{body}.{tag}").replace('_', "_u").replace('.', "_d");
        if token.chars().count() > MAX_TOKEN_CHARS {
            return Err(TokenError::TooLarge(token.chars().count()));
        }
        Ok(token)
    }

    /// Verify a token and return its parts. Any deviation from a token this
    /// codec would have produced comes back as [`TokenError::Tampered`].
    pub fn decode(&self, token: &str) -> Result<Vec<String>, TokenError> {
        // Unescape in the reverse order of encode: dots first, then
        // underscores, so `_u` never exposes a fresh `_d` pair.
        let raw = token.replace("_d", ".").replace("_u", "_");
        let (body, tag) = raw.rsplit_once('.').ok_or(TokenError::Tampered)?;
        let tag = URL_SAFE_NO_PAD
            .decode(tag)
            .map_err(|_| TokenError::Tampered)?;
        // An exact-length check before the prefix comparison, otherwise a
        // one-byte tag would verify against its own prefix.
        if tag.len() != TAG_BYTES {
            return Err(TokenError::Tampered);
        }
        self.mac_over(body)
            .verify_truncated_left(&tag)
            .map_err(|_| TokenError::Tampered)?;
        let payload = URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| TokenError::Tampered)?;
        serde_json::from_slice(&payload).map_err(|_| TokenError::Tampered)
    }

    fn tag_for(&self, body: &str) -> Vec<u8> {
        self.mac_over(body).finalize().into_bytes().to_vec()
    }

    fn mac_over(&self, body: &str) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts keys of any length");
        mac.update(NAMESPACE.as_bytes());
        mac.update(b".");
        mac.update(body.as_bytes());
        mac
    }
}
