//! WebSocket Frame Codec
//!
//! Parses and builds single, non-fragmented WebSocket-style frames. This is
//! the lowest protocol layer: one inbound TCP read is treated as one frame
//! attempt, and one outbound frame is written as one contiguous buffer.
//!
//! # Frame Format
//!
//! ```text
//! +---------------+---------------+----------------+----------+-----------+
//! | FIN + opcode  | MASK + len7   | extended len   | mask key | payload   |
//! | (1 byte)      | (1 byte)      | (0, 2, or 8 B) | (4 B, C→S| (masked   |
//! |               |               | big-endian     |  only)   |  C→S)     |
//! +---------------+---------------+----------------+----------+-----------+
//! ```
//!
//! A 7-bit length of 126 extends to a 2-byte big-endian length, 127 to an
//! 8-byte big-endian length. Client→server frames must be masked; the payload
//! is XORed byte-by-byte with `mask_key[i % 4]`. Server→client frames always
//! set FIN and are never masked.
//!
//! # Error Policy
//!
//! Malformed input is never an error here: a frame that is unmasked, shorter
//! than its declared length, or over the payload cap is reported as
//! [`FrameParse::Drop`] with a reason the caller logs at trace level. The
//! connection stays open.
//!
//! A frame split across two TCP reads is therefore dropped rather than
//! reassembled; the parser is a pure function over one read's bytes, so a
//! cross-read accumulator can be layered in front of it without changing the
//! codec.

/// Binary data frame opcode.
pub const OPCODE_BINARY: u8 = 0x02;

/// Connection close opcode.
pub const OPCODE_CLOSE: u8 = 0x08;

/// Payload of the close frame the server sends: a single zero byte.
pub const CLOSE_PAYLOAD: [u8; 1] = [0x00];

/// Outcome of parsing one read's worth of bytes as a frame.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameParse {
    /// A complete data frame; the unmasked payload occupies the first
    /// `payload_len` bytes of the reassembly buffer passed to
    /// [`parse_frame`].
    Frame {
        /// The frame's 4-bit opcode.
        opcode: u8,
        /// Unmasked payload length in the reassembly buffer.
        payload_len: usize,
    },
    /// The peer sent a close frame; the caller tears the connection down.
    Close,
    /// The frame was dropped. The connection stays open.
    Drop(DropReason),
}

/// Why a frame was dropped. Logged at trace level, never escalated.
#[derive(Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Fewer bytes than the header plus declared payload require.
    TooShort {
        /// Bytes the frame declared it needs.
        needed: usize,
        /// Bytes actually available.
        have: usize,
    },
    /// An inbound data frame without the mask bit set.
    Unmasked,
    /// Declared payload exceeds the configured cap.
    PayloadTooLarge {
        /// Length the frame header declared.
        declared: u64,
        /// The configured cap.
        max: usize,
    },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort { needed, have } => {
                write!(f, "frame too short: need {needed} bytes, have {have}")
            }
            Self::Unmasked => write!(f, "inbound frame not masked"),
            Self::PayloadTooLarge { declared, max } => {
                write!(f, "declared payload {declared} exceeds cap {max}")
            }
        }
    }
}

/// Parse a single client→server frame.
///
/// `reassembly` is the connection's scratch buffer: it grows to fit the
/// largest payload seen and is reused across frames. On
/// [`FrameParse::Frame`], the unmasked payload sits in
/// `reassembly[..payload_len]`.
///
/// A close opcode short-circuits before any mask or length validation, so
/// even a bare 2-byte close frame tears the connection down.
pub fn parse_frame(data: &[u8], max_payload: usize, reassembly: &mut Vec<u8>) -> FrameParse {
    if data.len() < 2 {
        return FrameParse::Drop(DropReason::TooShort {
            needed: 2,
            have: data.len(),
        });
    }

    let opcode = data[0] & 0x0F;
    if opcode == OPCODE_CLOSE {
        return FrameParse::Close;
    }

    let masked = data[1] & 0x80 != 0;
    let mut payload_len = u64::from(data[1] & 0x7F);
    let mut pos = 2usize;

    if payload_len == 126 {
        if data.len() < 4 {
            return FrameParse::Drop(DropReason::TooShort {
                needed: 4,
                have: data.len(),
            });
        }
        payload_len = u64::from(u16::from_be_bytes([data[2], data[3]]));
        pos = 4;
    } else if payload_len == 127 {
        if data.len() < 10 {
            return FrameParse::Drop(DropReason::TooShort {
                needed: 10,
                have: data.len(),
            });
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&data[2..10]);
        payload_len = u64::from_be_bytes(bytes);
        pos = 10;
    }

    if !masked {
        return FrameParse::Drop(DropReason::Unmasked);
    }

    if payload_len > max_payload as u64 {
        return FrameParse::Drop(DropReason::PayloadTooLarge {
            declared: payload_len,
            max: max_payload,
        });
    }
    let payload_len = payload_len as usize;

    let needed = pos + 4 + payload_len;
    if data.len() < needed {
        return FrameParse::Drop(DropReason::TooShort {
            needed,
            have: data.len(),
        });
    }

    let mask = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
    pos += 4;

    if reassembly.len() < payload_len {
        reassembly.resize(payload_len, 0);
    }
    for (i, byte) in data[pos..pos + payload_len].iter().enumerate() {
        reassembly[i] = byte ^ mask[i % 4];
    }

    FrameParse::Frame {
        opcode,
        payload_len,
    }
}

/// Build a server→client frame: FIN set, never masked.
///
/// The length is encoded with the 1/3/9-byte header scheme (7-bit up to 125,
/// 2-byte big-endian up to 65535, 8-byte big-endian above).
#[must_use]
pub fn encode_frame(opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut frame = Vec::with_capacity(10 + len);

    frame.push(0x80 | opcode);

    if len <= 125 {
        frame.push(len as u8);
    } else if len <= 65535 {
        frame.push(126);
        frame.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(len as u64).to_be_bytes());
    }

    frame.extend_from_slice(payload);
    frame
}
