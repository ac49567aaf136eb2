//! WebSocket Upgrade Handshake
//!
//! Parses the HTTP request that opens every conduit connection and builds the
//! responses that accept or reject it. The request carries three things:
//!
//! ```text
//! GET /{client-id}/{peer-id}?key={shared-key} HTTP/1.1
//! Sec-WebSocket-Key: {nonce}
//! ```
//!
//! - the path encodes the connecting client's identity and the peer it
//!   addresses,
//! - the `key` query parameter must equal the server's shared key,
//! - `Sec-WebSocket-Key` is echoed back hashed per RFC 6455 so WebSocket
//!   client libraries accept the upgrade.
//!
//! # Security Considerations
//!
//! The shared key is the only authentication gate. A request without a
//! `Sec-WebSocket-Key` header is rejected with `400` before the key is even
//! looked at; a wrong or missing `key` parameter is rejected with `403`. A
//! request that does not parse as HTTP at all gets no response, the
//! connection is simply closed.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// RFC 6455 magic GUID appended to the client nonce before hashing.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Why an upgrade request was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The bytes are not an HTTP request. No response is owed.
    #[error("malformed upgrade request")]
    Malformed,
    /// No `Sec-WebSocket-Key` header. Answered with `400 Bad Request`.
    #[error("missing Sec-WebSocket-Key header")]
    MissingWebSocketKey,
    /// The `key` query parameter is absent or does not match the shared
    /// key. Answered with `403 Forbidden`.
    #[error("shared key mismatch")]
    SharedKeyMismatch,
}

/// A parsed HTTP upgrade request.
#[derive(Debug)]
pub struct UpgradeRequest {
    path: String,
    query: Vec<(String, String)>,
    headers: HashMap<String, String>,
}

impl UpgradeRequest {
    /// Parse the first read of a new connection as an HTTP request.
    ///
    /// Only the request line is required to be well-formed; missing or
    /// truncated headers surface later as a missing `Sec-WebSocket-Key`.
    pub fn parse(data: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(data).map_err(|_| HandshakeError::Malformed)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(HandshakeError::Malformed)?;
        let mut parts = request_line.split_whitespace();
        let _method = parts.next().ok_or(HandshakeError::Malformed)?;
        let target = parts.next().ok_or(HandshakeError::Malformed)?;
        let version = parts.next().ok_or(HandshakeError::Malformed)?;
        if !version.starts_with("HTTP/") {
            return Err(HandshakeError::Malformed);
        }

        let (path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, query),
            None => (target, ""),
        };

        let query = raw_query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name.to_owned(), value.to_owned()),
                None => (pair.to_owned(), String::new()),
            })
            .collect();

        let mut headers = HashMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
            }
        }

        Ok(Self {
            path: path.to_owned(),
            query,
            headers,
        })
    }

    /// The request path without its query string.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// First query parameter with the given name.
    #[must_use]
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(param, _)| param == name)
            .map(|(_, value)| value.as_str())
    }

    /// The client's `Sec-WebSocket-Key` nonce.
    #[must_use]
    pub fn websocket_key(&self) -> Option<&str> {
        self.header("sec-websocket-key")
    }

    /// The client and peer identities from a `/{client-id}/{peer-id}` path.
    ///
    /// Both are `None` unless the path has at least two segments; a segment
    /// that is not a decimal integer yields `None` in its position. Callers
    /// fall back to `0`, so an anonymous connection occupies the zero slot.
    #[must_use]
    pub fn path_ids(&self) -> (Option<u64>, Option<u64>) {
        let segments: Vec<&str> = self.path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.len() < 2 {
            return (None, None);
        }
        (segments[0].parse().ok(), segments[1].parse().ok())
    }

    /// Gate the upgrade: the `Sec-WebSocket-Key` header must be present and
    /// the `key` query parameter must equal `shared_key`, checked in that
    /// order. Returns the nonce to hash into the accept key.
    pub fn validate(&self, shared_key: &str) -> Result<&str, HandshakeError> {
        let nonce = self
            .websocket_key()
            .filter(|key| !key.is_empty())
            .ok_or(HandshakeError::MissingWebSocketKey)?;
        if self.query_param("key") != Some(shared_key) {
            return Err(HandshakeError::SharedKeyMismatch);
        }
        Ok(nonce)
    }
}

/// Compute the `Sec-WebSocket-Accept` value for a client nonce:
/// `base64(sha1(nonce + GUID))` per RFC 6455.
#[must_use]
pub fn accept_key(nonce: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Build the `101 Switching Protocols` response that completes the upgrade.
#[must_use]
pub fn switching_protocols(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n\r\n"
    )
}

/// Build a headerless rejection response for the given status code.
#[must_use]
pub fn rejection(status: u16) -> String {
    let reason = match status {
        400 => "Bad Request",
        403 => "Forbidden",
        _ => "Internal Server Error",
    };
    format!("HTTP/1.1 {status} {reason}\r\n\r\n")
}
