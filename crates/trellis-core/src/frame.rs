//! Frame codec — the bit-exact unit carried over every connection.
//!
//! ```text
//! int32  header_length    big-endian
//! int32  payload_length   big-endian
//! byte[header_length]     header  (bincode envelope header)
//! byte[payload_length]    payload (opaque)
//! ```
//!
//! One frame is one request or one reply. Pairing is positional: a client
//! writes one frame and reads exactly one frame back on the same connection.
//!
//! `FrameParser` is the inbound side. It is a resumable four-state machine
//! that accepts bytes in whatever pieces the socket hands over and yields
//! each frame as soon as its last byte arrives.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{BigEndian, I32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Default ceiling on a single frame, prefix included.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

// ── Prefix ───────────────────────────────────────────────────────────────────

/// The fixed eight bytes in front of every frame.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct FramePrefix {
    pub header_length: I32<BigEndian>,
    pub payload_length: I32<BigEndian>,
}

assert_eq_size!(FramePrefix, [u8; 8]);

pub const PREFIX_LEN: usize = std::mem::size_of::<FramePrefix>();

// ── Frame ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub header: Bytes,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: impl Into<Bytes>, payload: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            payload: payload.into(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.header.len() + self.payload.len()
    }

    /// Serialize prefix, header and payload into one contiguous buffer.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out.freeze())
    }

    pub fn encode_into(&self, dst: &mut BytesMut) -> Result<(), FrameError> {
        let prefix = FramePrefix {
            header_length: I32::new(wire_length(self.header.len())?),
            payload_length: I32::new(wire_length(self.payload.len())?),
        };
        dst.reserve(self.encoded_len());
        dst.put_slice(prefix.as_bytes());
        dst.put_slice(&self.header);
        dst.put_slice(&self.payload);
        Ok(())
    }
}

fn wire_length(len: usize) -> Result<i32, FrameError> {
    i32::try_from(len).map_err(|_| FrameError::TooLarge {
        size: len,
        limit: i32::MAX as usize,
    })
}

// ── Parser ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    AwaitHeaderLen,
    AwaitPayloadLen,
    FillHeader,
    FillPayload,
}

/// Incremental frame assembler for one connection.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    max_frame: usize,
    length: [u8; 4],
    length_filled: usize,
    header_len: usize,
    payload_len: usize,
    header: BytesMut,
    payload: BytesMut,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameParser {
    pub fn new(max_frame: usize) -> Self {
        Self {
            state: ParseState::AwaitHeaderLen,
            max_frame,
            length: [0u8; 4],
            length_filled: 0,
            header_len: 0,
            payload_len: 0,
            header: BytesMut::new(),
            payload: BytesMut::new(),
        }
    }

    /// True when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::AwaitHeaderLen && self.length_filled == 0
    }

    /// Consume `input` and return every frame it completes.
    ///
    /// Leftover bytes are retained for the next call. After an error the
    /// parser is in an undefined position and the connection must be closed.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        loop {
            match self.state {
                ParseState::AwaitHeaderLen => {
                    if !self.fill_length(&mut input) {
                        break;
                    }
                    self.header_len = self.take_length()?;
                    self.state = ParseState::AwaitPayloadLen;
                }
                ParseState::AwaitPayloadLen => {
                    if !self.fill_length(&mut input) {
                        break;
                    }
                    self.payload_len = self.take_length()?;
                    let size = PREFIX_LEN
                        .saturating_add(self.header_len)
                        .saturating_add(self.payload_len);
                    if size > self.max_frame {
                        return Err(FrameError::TooLarge {
                            size,
                            limit: self.max_frame,
                        });
                    }
                    self.header = BytesMut::with_capacity(self.header_len);
                    self.state = ParseState::FillHeader;
                }
                ParseState::FillHeader => {
                    if !fill_body(&mut self.header, self.header_len, &mut input) {
                        break;
                    }
                    self.payload = BytesMut::with_capacity(self.payload_len);
                    self.state = ParseState::FillPayload;
                }
                ParseState::FillPayload => {
                    if !fill_body(&mut self.payload, self.payload_len, &mut input) {
                        break;
                    }
                    frames.push(Frame {
                        header: std::mem::take(&mut self.header).freeze(),
                        payload: std::mem::take(&mut self.payload).freeze(),
                    });
                    self.state = ParseState::AwaitHeaderLen;
                }
            }
        }
        Ok(frames)
    }

    fn fill_length(&mut self, input: &mut &[u8]) -> bool {
        let want = 4 - self.length_filled;
        let n = want.min(input.len());
        self.length[self.length_filled..self.length_filled + n].copy_from_slice(&input[..n]);
        self.length_filled += n;
        *input = &input[n..];
        self.length_filled == 4
    }

    fn take_length(&mut self) -> Result<usize, FrameError> {
        self.length_filled = 0;
        let value = i32::from_be_bytes(self.length);
        usize::try_from(value).map_err(|_| FrameError::NegativeLength(value))
    }
}

fn fill_body(buf: &mut BytesMut, target: usize, input: &mut &[u8]) -> bool {
    let n = (target - buf.len()).min(input.len());
    buf.put_slice(&input[..n]);
    *input = &input[n..];
    buf.len() == target
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("negative length field ({0})")]
    NegativeLength(i32),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },
}

// ── Tests ────────────────────────────────────────────────────────────────────
