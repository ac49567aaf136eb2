//! TLV Message Codec
//!
//! The unit carried inside every data frame: a small ordered bag of string
//! options plus a binary body, serialized with a compact tag-length-value
//! layout.
//!
//! # Wire Format
//!
//! ```text
//! +------------+----------------------------------------------+-----------+
//! | count (1)  | count x option                               | body      |
//! |            |   key_len (1) | key | value_len (2, BE) | v  | len (2,   |
//! |            |                                              | BE) + data|
//! +------------+----------------------------------------------+-----------+
//! ```
//!
//! Encoding is deterministic: options are written in lexicographic key order,
//! so the same logical message always produces the same bytes.
//!
//! Decoding is best-effort and total: truncated or malformed input yields
//! whatever was successfully parsed up to the point of failure. It never
//! panics and never returns an error; callers treat the result as
//! best-effort, which is what the transport's silent-drop error policy
//! requires.

use std::collections::BTreeMap;

use thiserror::Error;

/// Reserved option: integrity probe carrying a payload digest.
pub const OPTION_DIGEST: &str = "digest";
/// Reserved option: peer relay target id.
pub const OPTION_TO: &str = "to";
/// Reserved option: route name for dispatch into the host router.
pub const OPTION_ROUTE: &str = "route";
/// Reserved option: response correlation token, assigned server-side.
pub const OPTION_TOKEN: &str = "token";

/// Maximum encodable option key length (1-byte length prefix).
pub const MAX_KEY_LEN: usize = u8::MAX as usize;
/// Maximum encodable option value length (2-byte length prefix).
pub const MAX_VALUE_LEN: usize = u16::MAX as usize;
/// Maximum encodable body length (2-byte length prefix).
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// Errors produced when a message cannot be encoded.
///
/// Only encoding is fallible; [`Message::decode`] is total.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// An option key exceeds the 1-byte length prefix.
    #[error("option key '{key}' is {len} bytes (max {MAX_KEY_LEN})")]
    KeyTooLong {
        /// The offending key (possibly truncated for display).
        key: String,
        /// Actual key length in bytes.
        len: usize,
    },

    /// An option value exceeds the 2-byte length prefix.
    #[error("value for option '{key}' is {len} bytes (max {MAX_VALUE_LEN})")]
    ValueTooLong {
        /// Key whose value overflows.
        key: String,
        /// Actual value length in bytes.
        len: usize,
    },

    /// Too many options for the 1-byte count prefix.
    #[error("{0} options exceed the encodable maximum of 255")]
    TooManyOptions(usize),

    /// The body exceeds the 2-byte length prefix.
    #[error("payload is {0} bytes (max {MAX_BODY_LEN})")]
    PayloadTooLong(usize),
}

/// A decoded transport message: string options plus a binary payload.
///
/// Reserved options (`digest`, `to`, `route`, `token`) have typed accessors
/// so routing decisions never depend on free-form string lookups; arbitrary
/// additional options pass through untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    options: BTreeMap<String, String>,
    payload: Vec<u8>,
}

impl Message {
    /// Create an empty message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a message from an option map and payload bytes.
    #[must_use]
    pub fn from_parts(options: BTreeMap<String, String>, payload: Vec<u8>) -> Self {
        Self { options, payload }
    }

    /// Get an option value, or the empty string when absent.
    #[must_use]
    pub fn get(&self, key: &str) -> &str {
        self.options.get(key).map_or("", String::as_str)
    }

    /// Whether an option is present.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// Insert or replace an option.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.options.insert(key.into(), value.into());
    }

    /// Remove an option and return its value.
    pub fn pluck(&mut self, key: &str) -> Option<String> {
        self.options.remove(key)
    }

    /// Read-only view of all options in lexicographic key order.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// The binary payload.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Replace the payload.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = payload;
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// True iff the message has no options and an empty payload.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.options.is_empty() && self.payload.is_empty()
    }

    /// The `digest` option, when present.
    #[must_use]
    pub fn digest(&self) -> Option<&str> {
        self.options.get(OPTION_DIGEST).map(String::as_str)
    }

    /// The `route` option, when present.
    #[must_use]
    pub fn route(&self) -> Option<&str> {
        self.options.get(OPTION_ROUTE).map(String::as_str)
    }

    /// The `token` option, when present.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.options.get(OPTION_TOKEN).map(String::as_str)
    }

    /// The `to` option parsed as a client id.
    ///
    /// Returns `None` both when the option is absent and when it is not a
    /// valid decimal id; an unparseable target is treated as no target.
    #[must_use]
    pub fn to_id(&self) -> Option<u64> {
        self.options.get(OPTION_TO)?.parse().ok()
    }

    /// Remove and return the `route` option.
    pub fn pluck_route(&mut self) -> Option<String> {
        self.pluck(OPTION_ROUTE)
    }

    /// Set the `digest` option.
    pub fn set_digest(&mut self, value: impl Into<String>) {
        self.options.insert(OPTION_DIGEST.into(), value.into());
    }

    /// Set the `token` option.
    pub fn set_token(&mut self, value: impl Into<String>) {
        self.options.insert(OPTION_TOKEN.into(), value.into());
    }

    /// Set the `to` option.
    pub fn set_to(&mut self, id: u64) {
        self.options.insert(OPTION_TO.into(), id.to_string());
    }

    /// Set the `route` option.
    pub fn set_route(&mut self, route: impl Into<String>) {
        self.options.insert(OPTION_ROUTE.into(), route.into());
    }

    /// Encode to the TLV wire format.
    ///
    /// Options are written in lexicographic key order, so encoding is
    /// deterministic.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError`] when a key, value, body, or the option count
    /// overflows its length prefix. Nothing is silently truncated.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        if self.options.len() > u8::MAX as usize {
            return Err(MessageError::TooManyOptions(self.options.len()));
        }
        if self.payload.len() > MAX_BODY_LEN {
            return Err(MessageError::PayloadTooLong(self.payload.len()));
        }

        let mut out = Vec::with_capacity(self.encoded_len_hint());
        out.push(self.options.len() as u8);

        // BTreeMap iterates in key order, which is the deterministic
        // ordering the format requires.
        for (key, value) in &self.options {
            if key.len() > MAX_KEY_LEN {
                return Err(MessageError::KeyTooLong {
                    key: key.clone(),
                    len: key.len(),
                });
            }
            if value.len() > MAX_VALUE_LEN {
                return Err(MessageError::ValueTooLong {
                    key: key.clone(),
                    len: value.len(),
                });
            }

            out.push(key.len() as u8);
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(value.len() as u16).to_be_bytes());
            out.extend_from_slice(value.as_bytes());
        }

        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    /// Decode from the TLV wire format.
    ///
    /// Best-effort: parsing stops at the first truncated field and whatever
    /// was recovered so far is returned. Never panics.
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        let mut message = Self::new();

        if data.is_empty() {
            return message;
        }

        let count = data[0];
        let mut offset = 1usize;

        for _ in 0..count {
            let Some(&key_len) = data.get(offset) else {
                return message;
            };
            offset += 1;

            let key_end = offset + key_len as usize;
            let Some(key_bytes) = data.get(offset..key_end) else {
                return message;
            };
            offset = key_end;

            let Some(len_bytes) = data.get(offset..offset + 2) else {
                return message;
            };
            let value_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            offset += 2;

            let value_end = offset + value_len;
            let Some(value_bytes) = data.get(offset..value_end) else {
                return message;
            };
            offset = value_end;

            message.options.insert(
                String::from_utf8_lossy(key_bytes).into_owned(),
                String::from_utf8_lossy(value_bytes).into_owned(),
            );
        }

        let Some(len_bytes) = data.get(offset..offset + 2) else {
            return message;
        };
        let body_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        offset += 2;

        if let Some(body) = data.get(offset..offset + body_len) {
            message.payload = body.to_vec();
        }

        message
    }

    fn encoded_len_hint(&self) -> usize {
        let options: usize = self
            .options
            .iter()
            .map(|(k, v)| 3 + k.len() + v.len())
            .sum();
        1 + options + 2 + self.payload.len()
    }
}
