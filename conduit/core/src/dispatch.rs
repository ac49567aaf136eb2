//! Dispatch Bridge
//!
//! The seam between the conduit server and the host application's RPC
//! router. A message bearing a `route` option crosses this boundary; the
//! host answers with a result the server encodes back to the sender.
//!
//! # Design Philosophy
//!
//! The [`Dispatcher`] trait keeps the server free of any knowledge about how
//! routes are handled. The server builds an [`InvokeRequest`] from the
//! decoded message and the sender's identity; implementations resolve it
//! however they like (an in-process route table, a bridge into another
//! process) and return an [`InvokeOutcome`]. Handlers are looked up by route
//! name, so a missing handler is a normal outcome, not an error.
//!
//! Requests also carry a synthetic `ipc://` URI rendering of themselves for
//! hosts whose routers key on URIs rather than structured fields.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

/// An RPC invocation crossing from the conduit into the host.
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    route: String,
    client_id: u64,
    peer_id: u64,
    options: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl InvokeRequest {
    /// Create a request for `route` from the given sender.
    ///
    /// `client_id` is the sender's registry identity; `peer_id` is the
    /// secondary identity from the second path segment of its connection
    /// URL, which hosts may use to pick a routing context.
    #[must_use]
    pub fn new(route: impl Into<String>, client_id: u64, peer_id: u64) -> Self {
        Self {
            route: route.into(),
            client_id,
            peer_id,
            options: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    /// Attach the message options remaining after the route was plucked.
    #[must_use]
    pub fn with_options(mut self, options: BTreeMap<String, String>) -> Self {
        self.options = options;
        self
    }

    /// Attach the concatenated payload bytes.
    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// The route name the sender addressed.
    #[must_use]
    pub fn route(&self) -> &str {
        &self.route
    }

    /// The sender's registry identity.
    #[must_use]
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The sender's secondary identity.
    #[must_use]
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    /// Message options that accompanied the invocation.
    #[must_use]
    pub fn options(&self) -> &BTreeMap<String, String> {
        &self.options
    }

    /// The request body.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Render the request as `ipc://<route>/?id=<client-id>&<options>`.
    ///
    /// The sender's id always leads; options follow in sorted key order,
    /// percent-encoded.
    #[must_use]
    pub fn uri(&self) -> String {
        let mut uri = format!("ipc://{}/?id={}", self.route, self.client_id);
        for (name, value) in &self.options {
            uri.push('&');
            uri.push_str(&urlencoded(name));
            uri.push('=');
            uri.push_str(&urlencoded(value));
        }
        uri
    }
}

/// URL-encode a string for use in query parameters.
fn urlencoded(s: &str) -> String {
    percent_encoding::utf8_percent_encode(s, percent_encoding::NON_ALPHANUMERIC).to_string()
}

/// What the host did with an invocation.
#[derive(Clone, Debug)]
pub enum InvokeOutcome {
    /// A handler ran and produced a result.
    Handled(InvokeResult),
    /// No handler is registered for the route. The server answers the
    /// sender with a `NotFoundError` body.
    NotFound,
}

/// The result a route handler produced.
#[derive(Clone, Debug, Default)]
pub struct InvokeResult {
    /// Correlation token echoed back in the reply's `token` option.
    pub token: Option<String>,
    /// Raw response bytes. When present they are the reply body verbatim
    /// and the JSON fields below are not serialized.
    pub body: Option<Vec<u8>>,
    /// Structured success payload, serialized under `"data"`.
    pub data: Option<Value>,
    /// Structured error payload, serialized under `"err"`. Takes precedence
    /// over `data`.
    pub err: Option<Value>,
}

impl InvokeResult {
    /// A successful result carrying structured data.
    #[must_use]
    pub fn data(token: Option<String>, data: Value) -> Self {
        Self {
            token,
            data: Some(data),
            ..Self::default()
        }
    }

    /// A failed result carrying a structured error.
    #[must_use]
    pub fn err(token: Option<String>, err: Value) -> Self {
        Self {
            token,
            err: Some(err),
            ..Self::default()
        }
    }

    /// A result whose reply body is raw bytes.
    #[must_use]
    pub fn raw(token: Option<String>, body: Vec<u8>) -> Self {
        Self {
            token,
            body: Some(body),
            ..Self::default()
        }
    }

    /// The bytes to send back to the invoking client: the raw body if one
    /// was produced, else the serialized result JSON
    /// `{"source": <route>, "token": <token|null>, "data"/"err": ...}`.
    #[must_use]
    pub fn wire_body(&self, source: &str) -> Vec<u8> {
        if let Some(ref body) = self.body {
            return body.clone();
        }

        let token = match self.token {
            Some(ref token) => Value::from(token.as_str()),
            None => Value::Null,
        };

        let mut object = serde_json::Map::new();
        object.insert("source".to_owned(), Value::from(source));
        object.insert("token".to_owned(), token);
        if let Some(ref err) = self.err {
            object.insert("err".to_owned(), err.clone());
        } else if let Some(ref data) = self.data {
            object.insert("data".to_owned(), data.clone());
        }

        Value::Object(object).to_string().into_bytes()
    }
}

/// The `NotFoundError` body sent when no handler exists for a route, when
/// the host declined the invocation, or when a reserved `internal.` route
/// is addressed from outside.
#[must_use]
pub fn not_found_body(source: &str) -> Vec<u8> {
    InvokeResult::err(
        None,
        serde_json::json!({
            "type": "NotFoundError",
            "message": "Not found",
        }),
    )
    .wire_body(source)
}

/// Host-side handler boundary.
///
/// Implement this trait to receive `route` invocations from connected
/// clients.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Handle one invocation. Returns [`InvokeOutcome::NotFound`] when no
    /// handler matches the request's route.
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome;
}

/// A dispatcher with no routes at all. Every invocation answers
/// `NotFoundError`; peer relay is unaffected. Suitable for servers that
/// only shuttle bytes between clients.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDispatcher;

#[async_trait]
impl Dispatcher for NullDispatcher {
    async fn invoke(&self, _request: InvokeRequest) -> InvokeOutcome {
        InvokeOutcome::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_invoke_request_uri() {
        let request = InvokeRequest::new("diagnostics.echo", 42, 7)
            .with_options(options(&[("token", "abc123"), ("seq", "9")]));

        // id leads, options follow in sorted key order.
        assert_eq!(
            request.uri(),
            "ipc://diagnostics.echo/?id=42&seq=9&token=abc123"
        );
    }

    #[test]
    fn test_invoke_request_uri_percent_encodes() {
        let request =
            InvokeRequest::new("ping", 1, 0).with_options(options(&[("q", "a b&c=d")]));

        assert_eq!(request.uri(), "ipc://ping/?id=1&q=a%20b%26c%3Dd");
    }

    #[test]
    fn test_invoke_request_accessors() {
        let request = InvokeRequest::new("ping", 42, 7)
            .with_options(options(&[("token", "t")]))
            .with_body(b"payload".to_vec());

        assert_eq!(request.route(), "ping");
        assert_eq!(request.client_id(), 42);
        assert_eq!(request.peer_id(), 7);
        assert_eq!(request.options().get("token").map(String::as_str), Some("t"));
        assert_eq!(request.body(), b"payload");
    }

    #[test]
    fn test_wire_body_prefers_raw_bytes() {
        let result = InvokeResult::raw(Some("tok".into()), vec![0xDE, 0xAD]);
        assert_eq!(result.wire_body("ping"), vec![0xDE, 0xAD]);
    }

    #[test]
    fn test_wire_body_data_json() {
        let result = InvokeResult::data(
            Some("tok".into()),
            serde_json::json!({"answer": 42}),
        );

        let parsed: Value = serde_json::from_slice(&result.wire_body("ping")).unwrap();
        assert_eq!(parsed["source"], "ping");
        assert_eq!(parsed["token"], "tok");
        assert_eq!(parsed["data"]["answer"], 42);
        assert!(parsed.get("err").is_none());
    }

    #[test]
    fn test_wire_body_err_takes_precedence() {
        let result = InvokeResult {
            token: None,
            body: None,
            data: Some(serde_json::json!({"ignored": true})),
            err: Some(serde_json::json!({"type": "TestError"})),
        };

        let parsed: Value = serde_json::from_slice(&result.wire_body("ping")).unwrap();
        assert_eq!(parsed["token"], Value::Null);
        assert_eq!(parsed["err"]["type"], "TestError");
        assert!(parsed.get("data").is_none());
    }

    #[test]
    fn test_not_found_body_shape() {
        let parsed: Value = serde_json::from_slice(&not_found_body("internal.secret")).unwrap();

        assert_eq!(parsed["source"], "internal.secret");
        assert_eq!(parsed["token"], Value::Null);
        assert_eq!(parsed["err"]["type"], "NotFoundError");
        assert_eq!(parsed["err"]["message"], "Not found");
    }

    #[tokio::test]
    async fn test_null_dispatcher_never_handles() {
        let dispatcher = NullDispatcher;
        let outcome = dispatcher.invoke(InvokeRequest::new("anything", 1, 1)).await;
        assert!(matches!(outcome, InvokeOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_dispatcher_as_trait_object() {
        let dispatcher: std::sync::Arc<dyn Dispatcher> = std::sync::Arc::new(NullDispatcher);
        let outcome = dispatcher.invoke(InvokeRequest::new("ping", 2, 2)).await;
        assert!(matches!(outcome, InvokeOutcome::NotFound));
    }
}
