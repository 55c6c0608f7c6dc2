//! WebSocket frame-header codec and incremental frame parser.
//!
//! Header layout, bit for bit:
//! `FIN(1) RSV(3) OPCODE(4) | MASK(1) LEN7(7) [LEN16(16) | LEN64(64)] [MASKKEY(32)]`
//! with big-endian multi-byte length fields.
//!
//! The parser has two states. In `InHeader`, bytes accumulate until enough
//! exist to know the full header length (which depends on the decoded
//! length-prefix size); in `InPayload`, the payload length drives a byte
//! countdown, payload slices are delivered incrementally (unmasked), and
//! frame-complete fires when the countdown reaches zero.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Error, Result};
use crate::ws::mask::apply_mask_offset;
use crate::{LEN16_MAX, LEN7_MAX, MAX_FRAME_HEADER_SIZE};

/// WebSocket opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame.
    Continuation = 0x0,
    /// Text frame.
    Text = 0x1,
    /// Binary frame.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl OpCode {
    /// Parse an opcode nibble. All other values are reserved.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Whether this is a control opcode.
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Whether this is a data opcode.
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// Decoded view over raw frame-header bytes.
///
/// Never constructed before all header bytes are available: fields are
/// only valid once [`FrameHeader::decode`] returns `Some`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag.
    pub fin: bool,
    /// RSV1, set on the first frame of a compressed message.
    pub rsv1: bool,
    /// RSV2, reserved.
    pub rsv2: bool,
    /// RSV3, reserved.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Mask flag; true for client-to-server frames.
    pub masked: bool,
    /// Payload byte count.
    pub payload_len: u64,
    /// Masking key when the mask flag is set.
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Decode a header from the front of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold the complete
    /// header; otherwise the header and its encoded size.
    pub fn decode(buf: &[u8]) -> Result<Option<(FrameHeader, usize)>> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let b0 = buf[0];
        let b1 = buf[1];

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::InvalidFrame("reserved opcode"))?;
        let masked = b1 & 0x80 != 0;
        let len7 = b1 & 0x7F;

        let ext_len = match len7 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let header_size = 2 + ext_len + if masked { 4 } else { 0 };
        if buf.len() < header_size {
            return Ok(None);
        }

        let payload_len = match len7 {
            126 => {
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len <= LEN7_MAX as u64 {
                    return Err(Error::InvalidFrame("payload length not minimal"));
                }
                len
            }
            127 => {
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len <= LEN16_MAX as u64 {
                    return Err(Error::InvalidFrame("payload length not minimal"));
                }
                if len >> 63 != 0 {
                    return Err(Error::InvalidFrame("payload length MSB must be 0"));
                }
                len
            }
            _ => len7 as u64,
        };

        let mask = if masked {
            let at = 2 + ext_len;
            Some([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
        } else {
            None
        };

        Ok(Some((
            FrameHeader {
                fin: b0 & 0x80 != 0,
                rsv1: b0 & 0x40 != 0,
                rsv2: b0 & 0x20 != 0,
                rsv3: b0 & 0x10 != 0,
                opcode,
                masked,
                payload_len,
                mask,
            },
            header_size,
        )))
    }

    /// Encoded size of this header in bytes.
    #[inline]
    pub fn header_size(&self) -> usize {
        let ext = if self.payload_len > LEN16_MAX as u64 {
            8
        } else if self.payload_len > LEN7_MAX as u64 {
            2
        } else {
            0
        };
        2 + ext + if self.masked { 4 } else { 0 }
    }

    /// Encode the header into `out`, bit for bit per the layout above.
    pub fn encode(&self, out: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        if self.rsv1 {
            b0 |= 0x40;
        }
        if self.rsv2 {
            b0 |= 0x20;
        }
        if self.rsv3 {
            b0 |= 0x10;
        }
        out.put_u8(b0);

        let mask_bit = if self.masked { 0x80 } else { 0x00 };
        if self.payload_len <= LEN7_MAX as u64 {
            out.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= LEN16_MAX as u64 {
            out.put_u8(mask_bit | 126);
            out.put_u16(self.payload_len as u16);
        } else {
            out.put_u8(mask_bit | 127);
            out.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            out.put_slice(&mask);
        }
    }
}

/// Encode a complete frame (header plus payload) into `out`.
///
/// Server-to-client frames are unmasked; when a mask is given the payload
/// is copied and masked.
pub fn encode_frame(
    out: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    rsv1: bool,
    mask: Option<[u8; 4]>,
) {
    let header = FrameHeader {
        fin,
        rsv1,
        rsv2: false,
        rsv3: false,
        opcode,
        masked: mask.is_some(),
        payload_len: payload.len() as u64,
        mask,
    };
    out.reserve(header.header_size() + payload.len());
    header.encode(out);

    match mask {
        Some(key) => {
            let start = out.len();
            out.put_slice(payload);
            apply_mask_offset(&mut out[start..], key, 0);
        }
        None => out.put_slice(payload),
    }
}

/// Event emitted by the frame parser.
#[derive(Debug)]
pub enum FrameEvent<'a> {
    /// All header bytes are available; fields are now valid.
    Header(FrameHeader),
    /// A slice of payload bytes, already unmasked.
    Payload(&'a [u8]),
    /// The payload countdown reached zero.
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    InHeader,
    InPayload,
}

/// Incremental frame parser for the modern dialect.
pub struct FrameParser {
    state: ParseState,
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    header: Option<FrameHeader>,
    remaining: u64,
    mask_pos: usize,
    max_frame_size: usize,
    expect_masked: bool,
    allow_rsv1: bool,
}

impl FrameParser {
    /// Create a parser. Servers set `expect_masked`; clients do not.
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::InHeader,
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            header_len: 0,
            header: None,
            remaining: 0,
            mask_pos: 0,
            max_frame_size,
            expect_masked,
            allow_rsv1: false,
        }
    }

    /// Allow RSV1 on data frames once permessage-deflate is negotiated.
    pub fn set_compression(&mut self, enabled: bool) {
        self.allow_rsv1 = enabled;
    }

    fn validate(&self, header: &FrameHeader) -> Result<()> {
        if header.rsv1 && !self.allow_rsv1 {
            return Err(Error::Protocol("RSV1 set without negotiated extension"));
        }
        if header.rsv2 || header.rsv3 {
            return Err(Error::Protocol("RSV2 and RSV3 must be 0"));
        }
        if header.opcode.is_control() {
            if !header.fin {
                return Err(Error::Protocol("control frame must not be fragmented"));
            }
            if header.payload_len > LEN7_MAX as u64 {
                return Err(Error::Protocol("control frame too large"));
            }
        }
        if self.expect_masked && !header.masked {
            return Err(Error::Protocol("client frames must be masked"));
        }
        if !self.expect_masked && header.masked {
            return Err(Error::Protocol("server frames must not be masked"));
        }
        if header.payload_len > self.max_frame_size as u64 {
            return Err(Error::FrameTooLarge);
        }
        Ok(())
    }

    /// Consume as many bytes from `buf` as possible, emitting events.
    pub fn feed(
        &mut self,
        buf: &mut BytesMut,
        sink: &mut dyn FnMut(FrameEvent<'_>) -> Result<()>,
    ) -> Result<()> {
        loop {
            match self.state {
                ParseState::InHeader => {
                    if buf.is_empty() {
                        return Ok(());
                    }
                    let take = buf.len().min(MAX_FRAME_HEADER_SIZE - self.header_len);
                    self.header_buf[self.header_len..self.header_len + take]
                        .copy_from_slice(&buf[..take]);

                    match FrameHeader::decode(&self.header_buf[..self.header_len + take])? {
                        None => {
                            // All of `take` belongs to the still-incomplete
                            // header; more bytes are needed.
                            self.header_len += take;
                            buf.advance(take);
                        }
                        Some((header, header_size)) => {
                            buf.advance(header_size - self.header_len);
                            self.header_len = 0;
                            self.validate(&header)?;
                            self.remaining = header.payload_len;
                            self.mask_pos = 0;
                            self.header = Some(header);
                            sink(FrameEvent::Header(header))?;
                            self.state = ParseState::InPayload;
                        }
                    }
                }
                ParseState::InPayload => {
                    if self.remaining > 0 {
                        if buf.is_empty() {
                            return Ok(());
                        }
                        let take = (self.remaining).min(buf.len() as u64) as usize;
                        let mut chunk = buf.split_to(take);
                        if let Some(mask) = self.header.and_then(|h| h.mask) {
                            apply_mask_offset(&mut chunk, mask, self.mask_pos);
                            self.mask_pos = (self.mask_pos + take) & 3;
                        }
                        self.remaining -= take as u64;
                        sink(FrameEvent::Payload(&chunk))?;
                    }
                    if self.remaining == 0 {
                        sink(FrameEvent::Complete)?;
                        self.header = None;
                        self.state = ParseState::InHeader;
                    }
                }
            }
        }
    }
}
