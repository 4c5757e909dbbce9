//! Message framing on the TCP leg
//!
//! Every message starts with a 4 byte header:
//!
//! ```text
//! +---------+---------+-------------------+
//! | channel |  flags  | payload len (BE)  |
//! +---------+---------+-------------------+
//!     0         1            2..4
//! ```
//!
//! The low two bits of `flags` mark the fragment kind. A fragment that is
//! first but not last carries 4 extra bytes (the total message length) after
//! the payload; they belong to the frame and are forwarded with it.

use std::io::{self, Read};
use thiserror::Error;

use crate::error::AppError;

/// Header length in bytes
pub const HEADER_LEN: usize = 4;

/// Extra bytes following the payload of a first-but-not-last fragment
pub const CONTINUATION_LEN: usize = 4;

pub const FRAME_FIRST: u8 = 1 << 0;
pub const FRAME_LAST: u8 = 1 << 1;
pub const FRAME_MASK: u8 = FRAME_FIRST | FRAME_LAST;

/// Largest payload relayed in any fragment kind
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 - HEADER_LEN;

/// Relay buffer size per direction; no frame may exceed it
pub const RELAY_BUFFER_SIZE: usize = HEADER_LEN + MAX_PAYLOAD_LEN + CONTINUATION_LEN;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("{0}")]
    Io(#[from] io::Error),

    #[error("frame of {len} bytes exceeds the {capacity} byte buffer")]
    Oversized { len: usize, capacity: usize },

    #[error("stream ended after {got} of {expected} frame bytes")]
    Truncated { expected: usize, got: usize },
}

impl FrameError {
    /// Whether the error is the result of cancellation
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::ConnectionAborted)
    }
}

impl From<FrameError> for AppError {
    fn from(e: FrameError) -> Self {
        AppError::Proxy(e.to_string())
    }
}

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel: u8,
    pub flags: u8,
    pub payload_len: u16,
}

impl FrameHeader {
    pub fn new(channel: u8, flags: u8, payload_len: u16) -> Self {
        Self {
            channel,
            flags,
            payload_len,
        }
    }

    pub fn parse(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            channel: bytes[0],
            flags: bytes[1],
            payload_len: u16::from_be_bytes([bytes[2], bytes[3]]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let len = self.payload_len.to_be_bytes();
        [self.channel, self.flags, len[0], len[1]]
    }

    /// First fragment of a message split across several frames
    pub fn is_continued(&self) -> bool {
        self.flags & FRAME_MASK == FRAME_FIRST
    }

    /// Bytes following the header
    pub fn body_len(&self) -> usize {
        let len = self.payload_len as usize;
        if self.is_continued() {
            len + CONTINUATION_LEN
        } else {
            len
        }
    }

    /// Header plus body
    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len()
    }
}

/// Read until `buf` is full or the stream ends
///
/// Returns the number of bytes read, which is short only at end of stream.
pub fn read_fully<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Read one complete frame into the start of `buf`
///
/// Returns the frame length, or `Ok(0)` if the stream ended cleanly before a
/// new header. A frame larger than `buf` is rejected before its body is read.
pub fn read_message<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::Oversized {
            len: HEADER_LEN,
            capacity: buf.len(),
        });
    }

    let got = read_fully(reader, &mut buf[..HEADER_LEN])?;
    if got == 0 {
        return Ok(0);
    }
    if got < HEADER_LEN {
        return Err(FrameError::Truncated {
            expected: HEADER_LEN,
            got,
        });
    }

    let header = FrameHeader::parse([buf[0], buf[1], buf[2], buf[3]]);
    let frame_len = header.frame_len();
    if frame_len > buf.len() {
        return Err(FrameError::Oversized {
            len: frame_len,
            capacity: buf.len(),
        });
    }

    let got = read_fully(reader, &mut buf[HEADER_LEN..frame_len])?;
    if got < header.body_len() {
        return Err(FrameError::Truncated {
            expected: frame_len,
            got: HEADER_LEN + got,
        });
    }

    Ok(frame_len)
}
