//! Conduit Core - Loopback Message Bridge
//!
//! This crate provides a loopback TCP server speaking a WebSocket-compatible
//! framing protocol with a compact TLV message codec on top. Connected peers
//! exchange tagged binary messages that the server relays between clients,
//! hands to a host dispatcher by route name, or buffers until a terminal
//! message arrives. It is completely independent of any host runtime: the
//! daemon in this workspace hosts it, and so can any process that implements
//! the [`Dispatcher`] trait.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Peers                               │
//! │   ┌──────────┐    ┌──────────┐    ┌──────────────────────┐   │
//! │   │ client A │    │ client B │    │  any WS-style client │   │
//! │   └────┬─────┘    └────┬─────┘    └──────────┬───────────┘   │
//! │        │ upgrade + masked frames             │               │
//! └────────┼───────────────┼─────────────────────┼───────────────┘
//!          │               │                     │
//! ┌────────┼───────────────┼─────────────────────┼───────────────┐
//! │        ▼               ▼      CONDUIT        ▼               │
//! │  ┌───────────────────────────────────────────────────────┐   │
//! │  │                   ConduitServer                       │   │
//! │  │  ┌──────────┐  ┌──────────┐  ┌─────────┐  ┌────────┐  │   │
//! │  │  │ Registry │  │  Client  │  │ Message │  │ Frame  │  │   │
//! │  │  │  (ids)   │  │ Handles  │  │  (TLV)  │  │ Codec  │  │   │
//! │  │  └──────────┘  └──────────┘  └─────────┘  └────────┘  │   │
//! │  └──────────────────────────┬────────────────────────────┘   │
//! │                             │ routed messages                │
//! │                             ▼                                │
//! │                  Dispatcher (host trait)                     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ConduitServer`]: the listener, connection lifecycle, and message loop
//! - [`Message`]: the TLV-encoded options-plus-payload unit on the wire
//! - [`ClientHandle`]: a connected peer, shared between tasks
//! - [`Dispatcher`]: the async trait the host implements for routed messages
//! - [`Registry`]: identity-to-connection map with single-occupant eviction
//! - [`ConduitConfig`]: file/env/CLI layered configuration
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use conduit_core::{ConduitServer, NullDispatcher, load_config};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config()?;
//!     let server = ConduitServer::new(&config, Arc::new(NullDispatcher));
//!
//!     let port = server.start().await?;
//!     println!("listening on {port} with key {}", server.shared_key());
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`client`]: connected-client handles, writer tasks, close choreography
//! - [`config`]: TOML file, environment, and override layering
//! - [`dispatch`]: the host-facing invocation boundary
//! - [`message`]: the TLV message codec
//! - [`registry`]: the identity-keyed connection map
//! - [`server`]: listener lifecycle and message processing
//! - [`transport`]: frame codec and upgrade handshake
//!
//! # Wire Compatibility
//!
//! Framing is wire-compatible with non-fragmented WebSocket binary frames
//! (RFC 6455 layout, opcodes `0x02` and `0x08`, masked inbound, unmasked
//! outbound), and the handshake derives `Sec-WebSocket-Accept` exactly as a
//! WebSocket server would, so off-the-shelf WebSocket clients can connect
//! with no protocol shims.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod message;
pub mod registry;
pub mod server;
pub mod transport;

// Client exports
pub use client::{ClientError, ClientHandle, CloseMode, CloseState, FrameIngest, WriteCommand};

// Config exports
pub use config::{
    default_config_path, generate_shared_key, load_config, load_config_from_path, ConduitConfig,
    ConduitToml, ConfigError, ConfigOverrides, ConfigSource, DEFAULT_MAX_PAYLOAD_SIZE,
    MIN_SHARED_KEY_LEN,
};

// Dispatch exports
pub use dispatch::{
    not_found_body, Dispatcher, InvokeOutcome, InvokeRequest, InvokeResult, NullDispatcher,
};

// Message exports
pub use message::{
    Message, MessageError, MAX_BODY_LEN, MAX_KEY_LEN, MAX_VALUE_LEN, OPTION_DIGEST, OPTION_ROUTE,
    OPTION_TO, OPTION_TOKEN,
};

// Registry exports
pub use registry::Registry;

// Server exports
pub use server::{ConduitServer, ServerError};

// Transport exports
pub use transport::{
    accept_key, encode_frame, parse_frame, rejection, switching_protocols, DropReason, FrameParse,
    HandshakeError, UpgradeRequest, CLOSE_PAYLOAD, OPCODE_BINARY, OPCODE_CLOSE,
};
