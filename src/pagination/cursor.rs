//! Opaque, tamper-evident pagination tokens.
//!
//! Layout before encoding: `version (1) | fingerprint (32) | sort values as
//! JSON | HMAC-SHA256 tag (32)`, the tag covering everything before it. The
//! token is URL-safe base64 without padding.

use crate::error::{Result, StacError};
use crate::query::builder::NormalizedSearch;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

pub const CURSOR_VERSION: u8 = 1;
const FINGERPRINT_LEN: usize = 32;
const TAG_LEN: usize = 32;

/// Sort values of the last hit on a page, in sortby order.
pub type SortKey = Vec<Value>;

/// SHA-256 of a normalized search request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn of(search: &NormalizedSearch) -> Result<Self> {
        let canonical = serde_json::to_vec(search)?;
        Ok(Fingerprint(Sha256::digest(&canonical).into()))
    }

    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

pub struct CursorCodec {
    secret: Vec<u8>,
}

impl CursorCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        CursorCodec {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| StacError::Config(format!("cursor secret rejected: {}", e)))
    }

    pub fn encode(&self, sort_key: &[Value], fingerprint: &Fingerprint) -> Result<String> {
        let payload = serde_json::to_vec(sort_key)?;
        let mut buf = Vec::with_capacity(1 + FINGERPRINT_LEN + payload.len() + TAG_LEN);
        buf.push(CURSOR_VERSION);
        buf.extend_from_slice(fingerprint.as_bytes());
        buf.extend_from_slice(&payload);

        let mut mac = self.mac()?;
        mac.update(&buf);
        buf.extend_from_slice(&mac.finalize().into_bytes());
        Ok(URL_SAFE_NO_PAD.encode(buf))
    }

    pub fn decode(&self, token: &str) -> Result<(SortKey, Fingerprint)> {
        let invalid = |why: &str| StacError::InvalidCursor(why.to_string());

        let buf = URL_SAFE_NO_PAD
            .decode(token.as_bytes())
            .map_err(|_| invalid("not valid base64"))?;
        if buf.len() < 1 + FINGERPRINT_LEN + TAG_LEN + 2 {
            return Err(invalid("truncated"));
        }
        let (body, tag) = buf.split_at(buf.len() - TAG_LEN);

        let mut mac = self.mac()?;
        mac.update(body);
        mac.verify_slice(tag)
            .map_err(|_| invalid("signature mismatch"))?;

        if body[0] != CURSOR_VERSION {
            return Err(invalid("unsupported version"));
        }
        let mut fp = [0u8; FINGERPRINT_LEN];
        fp.copy_from_slice(&body[1..1 + FINGERPRINT_LEN]);
        let sort_key: SortKey = serde_json::from_slice(&body[1 + FINGERPRINT_LEN..])
            .map_err(|_| invalid("malformed sort key"))?;
        Ok((sort_key, Fingerprint(fp)))
    }
}
