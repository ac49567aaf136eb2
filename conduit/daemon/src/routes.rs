//! Built-in route table for the daemon.
//!
//! The daemon answers `route` invocations from a named handler map rather
//! than a fixed match statement, so deployments can register additional
//! routes before the server starts. Handlers are synchronous closures; the
//! server already runs each invocation on its own task, and none of the
//! built-ins block.
//!
//! Built-in routes:
//!
//! - `ping` - liveness probe, answers `{"message": "pong"}`
//! - `diagnostics.echo` - returns the request body verbatim as raw bytes
//! - `diagnostics.status` - daemon version, start time, and uptime

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use conduit_core::{Dispatcher, InvokeOutcome, InvokeRequest, InvokeResult, OPTION_TOKEN};

/// A registered route handler.
type Handler = Arc<dyn Fn(&InvokeRequest) -> InvokeResult + Send + Sync>;

/// Named route handlers backing the daemon's [`Dispatcher`].
pub struct RouteTable {
    routes: DashMap<String, Handler>,
}

impl RouteTable {
    /// An empty table. Every invocation answers `NotFoundError` until
    /// routes are registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
        }
    }

    /// A table preloaded with the daemon's built-in routes.
    #[must_use]
    pub fn with_builtin_routes() -> Self {
        let table = Self::new();
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();

        table.register("ping", |request| {
            InvokeResult::data(
                request_token(request),
                serde_json::json!({ "message": "pong" }),
            )
        });

        table.register("diagnostics.echo", |request| {
            InvokeResult::raw(request_token(request), request.body().to_vec())
        });

        table.register("diagnostics.status", move |request| {
            InvokeResult::data(
                request_token(request),
                serde_json::json!({
                    "version": env!("CARGO_PKG_VERSION"),
                    "pid": std::process::id(),
                    "started_at": started_at.as_str(),
                    "uptime_seconds": started.elapsed().as_secs(),
                }),
            )
        });

        table
    }

    /// Register `handler` under `route`, replacing any previous handler
    /// with the same name.
    pub fn register<F>(&self, route: &str, handler: F)
    where
        F: Fn(&InvokeRequest) -> InvokeResult + Send + Sync + 'static,
    {
        self.routes.insert(route.to_owned(), Arc::new(handler));
    }

    /// The registered route names, sorted.
    #[must_use]
    pub fn routes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for RouteTable {
    async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        // Clone the handler out so the map shard is not held across the call.
        let Some(handler) = self
            .routes
            .get(request.route())
            .map(|entry| Arc::clone(entry.value()))
        else {
            debug!(route = request.route(), "no handler registered");
            return InvokeOutcome::NotFound;
        };

        debug!(uri = %request.uri(), "invoking route handler");
        InvokeOutcome::Handled(handler(&request))
    }
}

/// The correlation token the sender attached, if any. Handlers echo it so
/// the client can match replies to requests.
fn request_token(request: &InvokeRequest) -> Option<String> {
    request.options().get(OPTION_TOKEN).cloned()
}
