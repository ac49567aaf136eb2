//! Conduit Server
//!
//! Owns the loopback listener and every connection's lifecycle:
//!
//! ```text
//!                    ┌──────────────┐
//!   start() ───────► │ accept loop  │──── spawn per connection ────┐
//!                    └──────────────┘                              ▼
//!                                                         ┌───────────────┐
//!   ┌──────────┐     handshake / frames / close           │   read task   │
//!   │ registry │ ◄───────────────────────────────────────►│  (per client) │
//!   └──────────┘                                          └───────┬───────┘
//!        ▲                                                        │
//!        │ relay lookup                     writer channel        ▼
//!        └──────────────────────────────── (per client)  ─► writer task
//! ```
//!
//! Each accepted connection gets one read task and one writer task. The
//! read task drives the upgrade handshake, then treats every read as one
//! frame; decoded messages branch into digest probes, peer relays, routed
//! invocations, or the pending queue. All replies and relayed bytes go
//! through the target client's writer channel, so socket writes stay
//! serialized without a lock.
//!
//! # Lifecycle
//!
//! `start` is idempotent and concurrent-safe: an active server returns its
//! port, racing starters coalesce on an atomic flag. `stop` unpublishes
//! the port first, then closes every registered client and only shuts the
//! listener down after all of them finished closing, so a stopping server
//! never strands a half-closed client.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::client::{ClientHandle, CloseMode, CloseState, FrameIngest};
use crate::config::{generate_shared_key, ConduitConfig, MIN_SHARED_KEY_LEN};
use crate::dispatch::{not_found_body, Dispatcher, InvokeOutcome, InvokeRequest};
use crate::message::Message;
use crate::registry::Registry;
use crate::transport::handshake::{
    accept_key, rejection, switching_protocols, HandshakeError, UpgradeRequest,
};

/// How long the accept loop waits on `accept` before re-checking the
/// shutdown flag.
const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Scratch buffer size for connection reads.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long `stop` waits for in-flight client closes to finish.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Routes under this prefix never reach the dispatcher.
const INTERNAL_ROUTE_PREFIX: &str = "internal.";

/// Errors starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding the listener failed.
    #[error("failed to bind {address}: {source}")]
    Bind {
        /// The `hostname:port` that could not be bound.
        address: String,
        /// The underlying bind error.
        #[source]
        source: std::io::Error,
    },

    /// The bound socket's local address could not be read back.
    #[error("failed to read bound address: {0}")]
    LocalAddr(#[source] std::io::Error),
}

struct ServerInner {
    hostname: String,
    configured_port: u16,
    max_payload_size: usize,
    shared_key: String,
    dispatcher: Arc<dyn Dispatcher>,
    registry: Registry,
    /// Bound port, published once listening. Zero means not listening.
    port: AtomicU16,
    is_starting: AtomicBool,
    /// Accept task liveness.
    listening: AtomicBool,
    /// Tells the accept task to exit.
    shutdown: AtomicBool,
    /// Guards against overlapping `stop` calls.
    stopping: AtomicBool,
    next_conn: AtomicU64,
    /// Read tasks by connection number, aborted at shutdown.
    tasks: DashMap<u64, AbortHandle>,
}

/// The conduit server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ConduitServer {
    inner: Arc<ServerInner>,
}

impl ConduitServer {
    /// Build a server from `config` with `dispatcher` handling routed
    /// messages.
    ///
    /// A configured shared key shorter than [`MIN_SHARED_KEY_LEN`]
    /// characters is replaced with a generated one; read the effective
    /// value back via [`shared_key`](Self::shared_key).
    #[must_use]
    pub fn new(config: &ConduitConfig, dispatcher: Arc<dyn Dispatcher>) -> Self {
        let shared_key = match config.shared_key.as_deref() {
            Some(key) if key.len() >= MIN_SHARED_KEY_LEN => key.to_string(),
            configured => {
                if configured.is_some() {
                    warn!(
                        "shared key shorter than {MIN_SHARED_KEY_LEN} characters, generating one"
                    );
                }
                generate_shared_key()
            }
        };

        Self {
            inner: Arc::new(ServerInner {
                hostname: config.hostname.clone(),
                configured_port: config.port,
                max_payload_size: config.max_payload_size,
                shared_key,
                dispatcher,
                registry: Registry::new(),
                port: AtomicU16::new(0),
                is_starting: AtomicBool::new(false),
                listening: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                next_conn: AtomicU64::new(0),
                tasks: DashMap::new(),
            }),
        }
    }

    /// The shared key clients must present in the `key` query parameter.
    #[must_use]
    pub fn shared_key(&self) -> &str {
        &self.inner.shared_key
    }

    /// The bound port, or zero when not listening.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.inner.port.load(Ordering::SeqCst)
    }

    /// Whether the server is listening and not shutting down.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.port() > 0
            && self.inner.listening.load(Ordering::SeqCst)
            && !self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Whether a client is registered under `id`.
    #[must_use]
    pub fn has(&self, id: u64) -> bool {
        self.inner.registry.contains(id)
    }

    /// The client registered under `id`, if any.
    #[must_use]
    pub fn client(&self, id: u64) -> Option<ClientHandle> {
        self.inner.registry.get(id)
    }

    /// Number of registered clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Bind the listener and spawn the accept loop, returning the bound
    /// port.
    ///
    /// Idempotent: an active server returns its current port. Concurrent
    /// callers coalesce; a caller racing an in-flight start may observe
    /// port zero until that start completes.
    ///
    /// `CONDUIT_HOSTNAME` and `CONDUIT_PORT` override the configured bind
    /// address at this point, re-read on every start.
    ///
    /// # Errors
    ///
    /// [`ServerError::Bind`] when the address cannot be bound,
    /// [`ServerError::LocalAddr`] when the bound port cannot be read back.
    pub async fn start(&self) -> Result<u16, ServerError> {
        if self.is_active() {
            return Ok(self.port());
        }
        if self
            .inner
            .is_starting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            // Another start is in flight.
            return Ok(self.port());
        }
        self.inner.shutdown.store(false, Ordering::SeqCst);

        let address = self.bind_address();
        let listener = match TcpListener::bind(&address).await {
            Ok(listener) => listener,
            Err(source) => {
                self.inner.is_starting.store(false, Ordering::SeqCst);
                return Err(ServerError::Bind { address, source });
            }
        };
        let port = match listener.local_addr() {
            Ok(local) => local.port(),
            Err(source) => {
                self.inner.is_starting.store(false, Ordering::SeqCst);
                return Err(ServerError::LocalAddr(source));
            }
        };

        self.inner.port.store(port, Ordering::SeqCst);
        self.inner.listening.store(true, Ordering::SeqCst);

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        self.inner.is_starting.store(false, Ordering::SeqCst);
        info!(port, "conduit listening");
        Ok(port)
    }

    /// Stop listening and close every client.
    ///
    /// The port is unpublished immediately so `is_active` turns false for
    /// the whole teardown. With clients registered, the listener is shut
    /// down only after each of them finished the close choreography;
    /// without any, it is shut down directly. Read tasks still parked on
    /// mute peers are aborted last.
    pub async fn stop(&self) {
        self.inner.port.store(0, Ordering::SeqCst);
        self.inner.is_starting.store(false, Ordering::SeqCst);

        // Gate on listener liveness, not the published port: the port was
        // just cleared.
        if !self.inner.listening.load(Ordering::SeqCst)
            || self.inner.stopping.swap(true, Ordering::SeqCst)
        {
            return;
        }
        info!("conduit stopping");

        // Drain the registry first so no relay can reach a closing client.
        let clients: Vec<ClientHandle> = self
            .inner
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| self.inner.registry.remove(id))
            .collect();

        if clients.is_empty() {
            self.inner.shutdown.store(true, Ordering::SeqCst);
        } else {
            for client in &clients {
                client.close(CloseMode::Graceful).await;
            }
            self.await_clients_closed(&clients).await;
            // Only now may the listener go down.
            self.inner.shutdown.store(true, Ordering::SeqCst);
        }

        self.await_listener_exit().await;

        for entry in self.inner.tasks.iter() {
            entry.value().abort();
        }
        self.inner.tasks.clear();

        self.inner.stopping.store(false, Ordering::SeqCst);
        info!("conduit stopped");
    }

    /// The `hostname:port` to bind, with environment overrides applied.
    fn bind_address(&self) -> String {
        let hostname = std::env::var("CONDUIT_HOSTNAME")
            .unwrap_or_else(|_| self.inner.hostname.clone());
        let port = std::env::var("CONDUIT_PORT")
            .ok()
            .and_then(|value| value.parse::<u16>().ok())
            .unwrap_or(self.inner.configured_port);
        format!("{hostname}:{port}")
    }

    async fn await_clients_closed(&self, clients: &[ClientHandle]) {
        let deadline = Instant::now() + CLOSE_GRACE;
        for client in clients {
            while client.close_state() != CloseState::Closed {
                if Instant::now() >= deadline {
                    warn!(id = client.id(), "client close incomplete at shutdown deadline");
                    return;
                }
                sleep(Duration::from_millis(5)).await;
            }
        }
    }

    async fn await_listener_exit(&self) {
        let deadline = Instant::now() + ACCEPT_POLL * 3;
        while self.inner.listening.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                warn!("listener did not exit before deadline");
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match timeout(ACCEPT_POLL, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let conn = self.inner.next_conn.fetch_add(1, Ordering::SeqCst) + 1;
                    debug!(conn, peer = %peer, "connection accepted");

                    let server = self.clone();
                    let task = tokio::spawn(
                        async move {
                            server.drive_connection(stream).await;
                            server.inner.tasks.remove(&conn);
                        }
                        .instrument(info_span!("connection", conn)),
                    );
                    self.inner.tasks.insert(conn, task.abort_handle());
                }
                Ok(Err(error)) => {
                    warn!(error = %error, "accept failed");
                }
                Err(_) => {
                    // Poll tick; loop back to re-check the shutdown flag.
                }
            }
        }
        self.inner.listening.store(false, Ordering::SeqCst);
        debug!("listener closed");
    }

    /// Read task body: one connection from accept to teardown.
    async fn drive_connection(&self, stream: TcpStream) {
        let (mut reader, writer) = stream.into_split();
        let client = ClientHandle::spawn(writer);
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buffer).await {
                Ok(0) => {
                    trace!("connection EOF");
                    self.close_client(&client, CloseMode::Graceful).await;
                    break;
                }
                Ok(n) => {
                    if !client.is_open() {
                        break;
                    }
                    let data = &buffer[..n];
                    if client.is_handshake_done() {
                        // A superseded connection stops processing as soon
                        // as it notices its registry entry is gone.
                        let registered = self.inner.registry.get(client.id());
                        if !registered.is_some_and(|current| current.same_connection(&client)) {
                            trace!(id = client.id(), "connection superseded, closing");
                            client.close(CloseMode::Graceful).await;
                            break;
                        }
                        if !self.process_read(&client, data).await {
                            break;
                        }
                    } else if !self.perform_handshake(&client, data).await {
                        break;
                    }
                }
                Err(error) => {
                    trace!(error = %error, "connection read failed");
                    self.close_client(&client, CloseMode::Graceful).await;
                    break;
                }
            }
        }
    }

    /// Drive the upgrade handshake from one read. Returns whether the
    /// connection should keep reading.
    async fn perform_handshake(&self, client: &ClientHandle, data: &[u8]) -> bool {
        let request = match UpgradeRequest::parse(data) {
            Ok(request) => request,
            Err(error) => {
                debug!(error = %error, "unparseable upgrade request");
                client.close(CloseMode::Immediate).await;
                return false;
            }
        };

        let nonce = match request.validate(&self.inner.shared_key) {
            Ok(nonce) => nonce,
            Err(error) => {
                let status = if error == HandshakeError::MissingWebSocketKey {
                    400
                } else {
                    403
                };
                debug!(error = %error, status, "upgrade rejected");
                let _ = client.send_raw(rejection(status).into_bytes()).await;
                client.close(CloseMode::Immediate).await;
                return false;
            }
        };

        let (id, peer_id) = request.path_ids();
        if id.is_none() || peer_id.is_none() {
            debug!(path = request.path(), "identity segments missing or unparseable");
        }
        let id = id.unwrap_or(0);
        client.set_identity(id, peer_id.unwrap_or(0));

        // The identity has a single occupant: a reconnect displaces and
        // closes the previous connection.
        if let Some(displaced) = self.inner.registry.insert(id, client.clone()) {
            debug!(id, "displacing previous connection");
            displaced.close(CloseMode::Graceful).await;
        }

        let response = switching_protocols(&accept_key(nonce));
        if client.send_raw(response.into_bytes()).await.is_err() {
            self.close_client(client, CloseMode::Immediate).await;
            return false;
        }
        client.set_handshake_done();
        debug!(id, peer_id = client.peer_id(), "handshake complete");
        true
    }

    /// Feed one post-handshake read to the client. Returns whether the
    /// connection should keep reading.
    async fn process_read(&self, client: &ClientHandle, data: &[u8]) -> bool {
        match client.ingest_frame(data, self.inner.max_payload_size) {
            FrameIngest::Message(message) => {
                self.process_message(client, message).await;
                true
            }
            FrameIngest::Close => {
                // The peer already sent its close frame; ours is not owed.
                trace!(id = client.id(), "peer sent close frame");
                self.close_client(client, CloseMode::Immediate).await;
                false
            }
            FrameIngest::Drop(reason) => {
                trace!(id = client.id(), %reason, "frame dropped");
                true
            }
        }
    }

    /// Branch one decoded message: digest probe, routed invocation, peer
    /// relay, or the pending queue. Presence of a reserved option selects
    /// the branch; its value never does.
    async fn process_message(&self, client: &ClientHandle, message: Message) {
        // Digest probes reply immediately and never touch the queue.
        if message.digest().is_some() {
            let mut reply = Message::new();
            reply.set_digest(hex::encode_upper(Sha1::digest(message.payload())));
            if let Err(error) = client.send(&reply).await {
                debug!(id = client.id(), error = %error, "digest reply failed");
            }
            return;
        }

        if message.route().is_some() {
            self.route_message(client, message).await;
            return;
        }

        if let Some(to) = message.to_id() {
            self.relay_message(client, to, message).await;
        } else {
            // Not routed and not addressed (an unparseable target id is
            // treated as no target): buffered until a terminal message
            // consumes the queue.
            client.push_pending(message);
        }
    }

    /// Forward a `to`-addressed message to its target client.
    async fn relay_message(&self, client: &ClientHandle, to: u64, message: Message) {
        if to == client.id() {
            trace!(id = client.id(), "self-addressed relay dropped");
            return;
        }

        let options = message.options().clone();
        let payload = client.take_coalesced_payload(&message);

        // Relay is best-effort: an absent target consumes the queue all
        // the same and drops the bytes.
        if let Some(recipient) = self.inner.registry.get(to) {
            trace!(from = client.id(), to, bytes = payload.len(), "relaying");
            if let Err(error) = recipient.send_parts(options, payload).await {
                debug!(from = client.id(), to, error = %error, "relay failed");
            }
        } else {
            trace!(from = client.id(), to, "relay target absent");
        }
    }

    /// Hand a routed message to the dispatcher and reply with its outcome.
    async fn route_message(&self, client: &ClientHandle, mut message: Message) {
        let Some(route) = message.pluck_route() else {
            return;
        };
        let payload = client.take_coalesced_payload(&message);

        // Reserved namespace: never reaches the dispatcher.
        if route.starts_with(INTERNAL_ROUTE_PREFIX) {
            debug!(id = client.id(), route, "reserved route rejected");
            if let Err(error) = client.send_parts(BTreeMap::new(), not_found_body(&route)).await {
                debug!(id = client.id(), error = %error, "rejection reply failed");
            }
            return;
        }

        let request = InvokeRequest::new(route, client.id(), client.peer_id())
            .with_options(message.options().clone())
            .with_body(payload);
        let source = request.route().to_string();
        trace!(id = client.id(), uri = %request.uri(), "invoking route");

        match self.inner.dispatcher.invoke(request).await {
            InvokeOutcome::Handled(result) => {
                let body = result.wire_body(&source);
                let mut reply = Message::new();
                reply.set_token(result.token.unwrap_or_default());
                reply.set_payload(body);
                if let Err(error) = client.send(&reply).await {
                    debug!(id = client.id(), error = %error, "route reply failed");
                }
            }
            InvokeOutcome::NotFound => {
                debug!(id = client.id(), route = source, "no handler for route");
                if let Err(error) =
                    client.send_parts(BTreeMap::new(), not_found_body(&source)).await
                {
                    debug!(id = client.id(), error = %error, "rejection reply failed");
                }
            }
        }
    }

    /// Unregister (when still the registered occupant) and close.
    async fn close_client(&self, client: &ClientHandle, mode: CloseMode) {
        self.inner.registry.remove_if_same(client.id(), client);
        client.close(mode).await;
    }
}

impl fmt::Debug for ConduitServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConduitServer")
            .field("port", &self.port())
            .field("active", &self.is_active())
            .field("clients", &self.client_count())
            .finish_non_exhaustive()
    }
}
