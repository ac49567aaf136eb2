//! Wire-Level Transport
//!
//! The two protocol layers every connection speaks, lowest first:
//! - [`frame`]: single WebSocket-style frames (mask, length, opcode) over raw
//!   bytes
//! - [`handshake`]: the HTTP upgrade that promotes a fresh TCP connection to
//!   framed traffic
//!
//! The TLV message codec carried inside data frames lives one layer up in
//! [`crate::message`].
//!
//! # Security
//!
//! - The server binds loopback only; the handshake gates connections on a
//!   shared key
//! - Inbound frames must be masked per the WebSocket wire protocol; unmasked
//!   frames are dropped
//! - Declared payload sizes are capped before any allocation happens

pub mod frame;
pub mod handshake;

pub use frame::{
    encode_frame, parse_frame, DropReason, FrameParse, CLOSE_PAYLOAD, OPCODE_BINARY, OPCODE_CLOSE,
};
pub use handshake::{
    accept_key, rejection, switching_protocols, HandshakeError, UpgradeRequest,
};
