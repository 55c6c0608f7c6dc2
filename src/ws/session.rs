//! Per-connection WebSocket session.
//!
//! Owns the frame-reassembly state machine for the modern dialect and the
//! sentinel-delimited parser for the two legacy dialects, plus the
//! connection-state lifecycle: a session transitions to closed exactly
//! once and frames arriving after that are ignored.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::ws::deflate::DeflateContext;
use crate::ws::frame::{encode_frame, FrameEvent, FrameHeader, FrameParser, OpCode};
use crate::ws::handshake::Dialect;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Frames flow in both directions.
    Open,
    /// Peer sent a close frame.
    CloseReceived,
    /// We sent a close frame.
    CloseSent,
    /// Terminal; entered exactly once.
    Closed,
}

/// Event surfaced to the connection from incoming bytes.
#[derive(Debug)]
pub enum SessionEvent {
    /// A complete (possibly reassembled, possibly decompressed) message.
    Message {
        /// Whether the payload is binary; text payloads are valid UTF-8.
        binary: bool,
        /// Message payload.
        data: Bytes,
    },
    /// A ping frame arrived. Surfaced but not auto-answered.
    Ping(Bytes),
    /// A pong frame arrived.
    Pong(Bytes),
    /// The peer initiated closure.
    CloseRequested(Option<CloseReason>),
}

/// Staged frame-parser output, buffered so the session can apply frame
/// effects without holding the parser borrow.
enum FrameStep {
    Header(FrameHeader),
    Payload(Bytes),
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SentinelState {
    Idle,
    Text,
    AwaitCloseNul,
}

/// WebSocket session bound to one upgraded connection.
pub struct Session {
    dialect: Dialect,
    state: SessionState,
    parser: FrameParser,
    deflate: Option<DeflateContext>,
    max_message_size: usize,
    // Data-message reassembly.
    message_buf: BytesMut,
    message_opcode: Option<OpCode>,
    message_compressed: bool,
    // Control frames may interleave with fragments.
    control_buf: BytesMut,
    current: Option<FrameHeader>,
    // Sentinel framing for the legacy dialects.
    sentinel_state: SentinelState,
}

impl Session {
    /// Create a session for an upgraded connection.
    pub fn new(
        dialect: Dialect,
        deflate: Option<DeflateContext>,
        max_frame_size: usize,
        max_message_size: usize,
    ) -> Self {
        let mut parser = FrameParser::new(max_frame_size, true);
        if deflate.is_some() {
            parser.set_compression(true);
        }
        Self {
            dialect,
            state: SessionState::Open,
            parser,
            deflate,
            max_message_size,
            message_buf: BytesMut::new(),
            message_opcode: None,
            message_compressed: false,
            control_buf: BytesMut::new(),
            current: None,
            sentinel_state: SentinelState::Idle,
        }
    }

    /// Active dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Current connection state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Transition to `Closed`. Returns `true` on the first call only, so
    /// the close callback fires exactly once.
    pub fn mark_closed(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        self.state = SessionState::Closed;
        true
    }

    /// Demultiplex incoming bytes into session events.
    ///
    /// Bytes arriving after the session closed are discarded.
    pub fn receive(&mut self, buf: &mut BytesMut, events: &mut Vec<SessionEvent>) -> Result<()> {
        if self.state == SessionState::Closed {
            buf.clear();
            return Ok(());
        }
        if self.dialect.is_sentinel_framed() {
            return self.receive_sentinel(buf, events);
        }

        let mut staged = Vec::new();
        self.parser.feed(buf, &mut |ev| {
            staged.push(match ev {
                FrameEvent::Header(h) => FrameStep::Header(h),
                FrameEvent::Payload(p) => FrameStep::Payload(Bytes::copy_from_slice(p)),
                FrameEvent::Complete => FrameStep::Complete,
            });
            Ok(())
        })?;

        for step in staged {
            self.apply(step, events)?;
        }
        Ok(())
    }

    fn apply(&mut self, step: FrameStep, events: &mut Vec<SessionEvent>) -> Result<()> {
        match step {
            FrameStep::Header(header) => {
                match header.opcode {
                    OpCode::Continuation => {
                        if self.message_opcode.is_none() {
                            return Err(Error::Protocol("continuation without a message"));
                        }
                    }
                    OpCode::Text | OpCode::Binary => {
                        if self.message_opcode.is_some() {
                            return Err(Error::Protocol("expected continuation frame"));
                        }
                        self.message_opcode = Some(header.opcode);
                        self.message_compressed = header.rsv1;
                    }
                    _ => {
                        self.control_buf.clear();
                    }
                }
                self.current = Some(header);
                Ok(())
            }
            FrameStep::Payload(chunk) => {
                let header = self.current.as_ref().expect("payload before header");
                if header.opcode.is_control() {
                    self.control_buf.extend_from_slice(&chunk);
                } else {
                    if self.message_buf.len() + chunk.len() > self.max_message_size {
                        return Err(Error::MessageTooLarge);
                    }
                    self.message_buf.extend_from_slice(&chunk);
                }
                Ok(())
            }
            FrameStep::Complete => {
                let header = self.current.take().expect("complete before header");
                match header.opcode {
                    OpCode::Close => self.on_close_frame(events),
                    OpCode::Ping => {
                        events.push(SessionEvent::Ping(self.control_buf.split().freeze()));
                        Ok(())
                    }
                    OpCode::Pong => {
                        events.push(SessionEvent::Pong(self.control_buf.split().freeze()));
                        Ok(())
                    }
                    _ if header.fin => self.on_message_complete(events),
                    // Non-final data fragment: keep accumulating.
                    _ => Ok(()),
                }
            }
        }
    }

    fn on_close_frame(&mut self, events: &mut Vec<SessionEvent>) -> Result<()> {
        let payload = self.control_buf.split().freeze();
        let reason = match payload.len() {
            0 => None,
            1 => return Err(Error::Protocol("close frame with one-byte payload")),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !CloseReason::is_valid_code(code) {
                    return Err(Error::InvalidCloseCode(code));
                }
                let text = std::str::from_utf8(&payload[2..])
                    .map_err(|_| Error::Protocol("invalid utf-8 in close reason"))?;
                Some(CloseReason::new(code, text))
            }
        };

        if self.state == SessionState::Open {
            self.state = SessionState::CloseReceived;
        }
        events.push(SessionEvent::CloseRequested(reason));
        Ok(())
    }

    fn on_message_complete(&mut self, events: &mut Vec<SessionEvent>) -> Result<()> {
        let opcode = self.message_opcode.take().expect("message without opcode");
        let compressed = std::mem::take(&mut self.message_compressed);
        let mut data = self.message_buf.split().freeze();

        if compressed {
            let deflate = self
                .deflate
                .as_mut()
                .ok_or(Error::Protocol("compressed frame without extension"))?;
            data = deflate.decompress_message(&data, self.max_message_size)?;
        }

        let binary = opcode == OpCode::Binary;
        if !binary && std::str::from_utf8(&data).is_err() {
            return Err(Error::Protocol("invalid utf-8 in text message"));
        }

        events.push(SessionEvent::Message { binary, data });
        Ok(())
    }

    fn receive_sentinel(
        &mut self,
        buf: &mut BytesMut,
        events: &mut Vec<SessionEvent>,
    ) -> Result<()> {
        let input = buf.split();
        for &byte in input.iter() {
            match self.sentinel_state {
                SentinelState::Idle => match byte {
                    0x00 => self.sentinel_state = SentinelState::Text,
                    0xFF => self.sentinel_state = SentinelState::AwaitCloseNul,
                    _ => return Err(Error::Protocol("unexpected byte between sentinel frames")),
                },
                SentinelState::Text => {
                    if byte == 0xFF {
                        let data = self.message_buf.split().freeze();
                        if std::str::from_utf8(&data).is_err() {
                            return Err(Error::Protocol("invalid utf-8 in text message"));
                        }
                        events.push(SessionEvent::Message {
                            binary: false,
                            data,
                        });
                        self.sentinel_state = SentinelState::Idle;
                    } else {
                        if self.message_buf.len() + 1 > self.max_message_size {
                            return Err(Error::MessageTooLarge);
                        }
                        self.message_buf.put_u8(byte);
                    }
                }
                SentinelState::AwaitCloseNul => {
                    if byte != 0x00 {
                        return Err(Error::Protocol("malformed sentinel close"));
                    }
                    if self.state == SessionState::Open {
                        self.state = SessionState::CloseReceived;
                    }
                    events.push(SessionEvent::CloseRequested(None));
                    self.sentinel_state = SentinelState::Idle;
                }
            }
        }
        Ok(())
    }

    /// Frame an outgoing message for the active dialect.
    ///
    /// Modern-dialect messages compress when permessage-deflate was
    /// negotiated and the payload benefits; server frames are unmasked.
    pub fn encode_message(&mut self, binary: bool, data: &[u8], out: &mut BytesMut) -> Result<()> {
        if self.state != SessionState::Open {
            return Err(Error::ConnectionClosed);
        }

        if self.dialect.is_sentinel_framed() {
            if binary {
                return Err(Error::Protocol("legacy framing is text-only"));
            }
            if std::str::from_utf8(data).is_err() {
                return Err(Error::Protocol("invalid utf-8 in text message"));
            }
            out.reserve(data.len() + 2);
            out.put_u8(0x00);
            out.put_slice(data);
            out.put_u8(0xFF);
            return Ok(());
        }

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        if let Some(deflate) = self.deflate.as_mut() {
            if let Some(compressed) = deflate.compress_message(data)? {
                encode_frame(out, opcode, &compressed, true, true, None);
                return Ok(());
            }
        }
        encode_frame(out, opcode, data, true, false, None);
        Ok(())
    }

    /// Frame a server-initiated close for the active dialect.
    pub fn encode_close(&mut self, reason: Option<&CloseReason>, out: &mut BytesMut) {
        if self.dialect.is_sentinel_framed() {
            out.put_u8(0xFF);
            out.put_u8(0x00);
        } else {
            let payload = match reason {
                Some(reason) => {
                    let mut p = BytesMut::with_capacity(2 + reason.reason.len());
                    p.put_u16(reason.code);
                    p.put_slice(reason.reason.as_bytes());
                    p.freeze()
                }
                None => Bytes::new(),
            };
            encode_frame(out, OpCode::Close, &payload, true, false, None);
        }
        if self.state == SessionState::Open {
            self.state = SessionState::CloseSent;
        }
    }
}
