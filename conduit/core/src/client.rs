//! Connected Client Handles
//!
//! A [`ClientHandle`] represents one accepted TCP connection for its whole
//! life: created on accept, assigned its identities during the upgrade
//! handshake, registered, and finally torn down through the close
//! choreography. Handles are cheap to clone; all clones share the same
//! connection state and writer channel.
//!
//! # Writer Task
//!
//! Every connection owns exactly one writer task draining a command channel.
//! All outbound traffic, including handshake responses and the close frame,
//! flows through it, so writes from any task are serialized in submission
//! order without holding locks across I/O.
//!
//! # Close Choreography
//!
//! Closing is a one-way trip through [`CloseState`]:
//!
//! ```text
//! Open ──begin_close()──► Closing ──writer shutdown──► Closed
//! ```
//!
//! A graceful close sends a close frame (opcode `0x08`, payload `[0x00]`),
//! flushes, then half-closes the write side; an immediate close skips the
//! frame. Either way the peer observing EOF is expected to drop the
//! connection, which ends the read side. Transport errors during teardown
//! are swallowed; the state machine advances regardless.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::message::{Message, MessageError};
use crate::transport::frame::{
    encode_frame, parse_frame, DropReason, FrameParse, CLOSE_PAYLOAD, OPCODE_BINARY, OPCODE_CLOSE,
};

/// Writer channel depth per connection.
const WRITE_QUEUE_DEPTH: usize = 64;

/// Errors surfaced when talking to a connected client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The outbound message could not be encoded.
    #[error("message encoding failed: {0}")]
    Encode(#[from] MessageError),

    /// The connection's writer task is gone.
    #[error("connection closed")]
    ConnectionClosed,
}

/// One instruction for a connection's writer task.
#[derive(Debug)]
pub enum WriteCommand {
    /// Bytes written verbatim (handshake responses).
    Raw(Vec<u8>),
    /// A pre-encoded frame.
    Frame(Vec<u8>),
    /// Terminate the connection: optionally send the close frame, flush,
    /// then shut the write side down. The writer task exits afterwards.
    Close {
        /// Whether to send the close frame first.
        graceful: bool,
    },
}

/// How a connection is torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// Full choreography including the close frame.
    Graceful,
    /// Skip the close frame. Used when the peer already sent its own close
    /// frame and for connections that never completed the handshake.
    Immediate,
}

/// Where a connection is in its close lifecycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CloseState {
    /// Traffic flows normally.
    #[default]
    Open,
    /// Teardown has begun; no new close may be initiated.
    Closing,
    /// The connection is fully shut.
    Closed,
}

/// Result of feeding one inbound read to a connection.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameIngest {
    /// A complete data frame, already unmasked and decoded.
    Message(Message),
    /// The peer sent a close frame.
    Close,
    /// The bytes were discarded.
    Drop(DropReason),
}

#[derive(Debug, Default)]
struct ClientState {
    /// Messages accumulated until a terminal message consumes them.
    pending: Vec<Message>,
    /// Unmasking scratch, grown on demand and reused across frames.
    reassembly: Vec<u8>,
    close: CloseState,
    handshake_done: bool,
}

#[derive(Debug)]
struct ClientInner {
    /// Registry identity, parsed from the first path segment at handshake.
    id: AtomicU64,
    /// Secondary identity from the second path segment.
    peer_id: AtomicU64,
    writer: mpsc::Sender<WriteCommand>,
    state: Mutex<ClientState>,
}

/// Shared handle to one connected client.
#[derive(Clone, Debug)]
pub struct ClientHandle {
    inner: Arc<ClientInner>,
}

impl ClientHandle {
    /// Create a handle for a freshly accepted connection and spawn its
    /// writer task over the connection's write half.
    ///
    /// Identities start at zero until [`set_identity`](Self::set_identity)
    /// is called during the handshake.
    #[must_use]
    pub fn spawn<W>(write_half: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer, commands) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let handle = Self {
            inner: Arc::new(ClientInner {
                id: AtomicU64::new(0),
                peer_id: AtomicU64::new(0),
                writer,
                state: Mutex::new(ClientState::default()),
            }),
        };

        // The task must hold the inner state weakly: a handle would keep
        // the command sender alive, and the loop could then never observe
        // the channel closing when the last real handle drops.
        let closer = Arc::downgrade(&handle.inner);
        tokio::spawn(async move {
            write_loop(write_half, commands).await;
            if let Some(inner) = closer.upgrade() {
                inner.state.lock().close = CloseState::Closed;
            }
        });

        handle
    }

    /// The client's registry identity.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id.load(Ordering::SeqCst)
    }

    /// The client's secondary identity.
    #[must_use]
    pub fn peer_id(&self) -> u64 {
        self.inner.peer_id.load(Ordering::SeqCst)
    }

    /// Assign both identities from the handshake path.
    pub fn set_identity(&self, id: u64, peer_id: u64) {
        self.inner.id.store(id, Ordering::SeqCst);
        self.inner.peer_id.store(peer_id, Ordering::SeqCst);
    }

    /// Whether `other` aliases this very connection. Two handles for the
    /// same identity are still distinct connections after an eviction.
    #[must_use]
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the upgrade handshake has completed.
    #[must_use]
    pub fn is_handshake_done(&self) -> bool {
        self.inner.state.lock().handshake_done
    }

    /// Mark the upgrade handshake as completed.
    pub fn set_handshake_done(&self) {
        self.inner.state.lock().handshake_done = true;
    }

    /// Encode `message` and queue it as a binary frame.
    pub async fn send(&self, message: &Message) -> Result<(), ClientError> {
        let encoded = message.encode()?;
        let frame = encode_frame(OPCODE_BINARY, &encoded);
        self.inner
            .writer
            .send(WriteCommand::Frame(frame))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Build a message from parts and queue it as a binary frame.
    pub async fn send_parts(
        &self,
        options: BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<(), ClientError> {
        self.send(&Message::from_parts(options, payload)).await
    }

    /// Queue raw bytes, bypassing framing. Used for handshake responses.
    pub async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ClientError> {
        self.inner
            .writer
            .send(WriteCommand::Raw(bytes))
            .await
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Begin closing the connection.
    ///
    /// Returns `false` when a close is already in progress or done; the
    /// first caller wins and every later call is a no-op, so the close
    /// frame is sent at most once.
    pub async fn close(&self, mode: CloseMode) -> bool {
        if !self.begin_close() {
            return false;
        }
        let graceful = matches!(mode, CloseMode::Graceful);
        // The writer may already be gone; the state still advances.
        let _ = self.inner.writer.send(WriteCommand::Close { graceful }).await;
        true
    }

    /// Transition `Open -> Closing`. Returns `false` if not `Open`.
    pub fn begin_close(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.close != CloseState::Open {
            return false;
        }
        state.close = CloseState::Closing;
        true
    }

    /// Current close lifecycle position.
    #[must_use]
    pub fn close_state(&self) -> CloseState {
        self.inner.state.lock().close
    }

    /// Whether the connection still accepts traffic.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.close_state() == CloseState::Open
    }

    /// Append a non-terminal message to the pending queue.
    pub fn push_pending(&self, message: Message) {
        self.inner.state.lock().pending.push(message);
    }

    /// Number of messages awaiting a terminal message.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Parse one inbound read as a frame against this connection's
    /// reassembly buffer, decoding the unmasked payload as a [`Message`]
    /// when a data frame completes.
    pub fn ingest_frame(&self, data: &[u8], max_payload: usize) -> FrameIngest {
        let mut state = self.inner.state.lock();
        let ClientState { reassembly, .. } = &mut *state;
        match parse_frame(data, max_payload, reassembly) {
            FrameParse::Frame { payload_len, .. } => {
                FrameIngest::Message(Message::decode(&reassembly[..payload_len]))
            }
            FrameParse::Close => FrameIngest::Close,
            FrameParse::Drop(reason) => FrameIngest::Drop(reason),
        }
    }

    /// Concatenate every pending payload plus `current`'s payload in
    /// arrival order, clearing the queue. This is the only way queued
    /// bytes are ever consumed.
    #[must_use]
    pub fn take_coalesced_payload(&self, current: &Message) -> Vec<u8> {
        let mut state = self.inner.state.lock();
        let total: usize = state
            .pending
            .iter()
            .map(|message| message.payload().len())
            .sum();

        let mut buffer = Vec::with_capacity(total + current.payload().len());
        for message in state.pending.drain(..) {
            buffer.extend_from_slice(message.payload());
        }
        buffer.extend_from_slice(current.payload());
        buffer
    }
}

/// Drain write commands into the connection until it closes.
async fn write_loop<W>(mut stream: W, mut commands: mpsc::Receiver<WriteCommand>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = commands.recv().await {
        match command {
            WriteCommand::Raw(bytes) | WriteCommand::Frame(bytes) => {
                if let Err(error) = stream.write_all(&bytes).await {
                    tracing::warn!(error = %error, "connection write failed");
                    break;
                }
            }
            WriteCommand::Close { graceful } => {
                if graceful {
                    let frame = encode_frame(OPCODE_CLOSE, &CLOSE_PAYLOAD);
                    let _ = stream.write_all(&frame).await;
                }
                let _ = stream.flush().await;
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
}
