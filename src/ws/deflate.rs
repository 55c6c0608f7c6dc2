//! permessage-deflate extension (RFC 7692): negotiation and message codec.
//!
//! Negotiation parses the `Sec-WebSocket-Extensions` request header into
//! `name; param=value` token lists, recognizes `permessage-deflate`, and
//! extracts four knobs: the two no-context-takeover booleans and the two
//! max-window-bits values (range 8..=15, default 15 when absent). An
//! invalid window-bits token rejects the whole extension. On acceptance a
//! mirrored response header echoes only the options actually honored.

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, Result};

/// Trailer removed after compression and restored before decompression.
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size exponent (32 KiB).
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum negotiable window size exponent.
pub const MIN_WINDOW_BITS: u8 = 8;

/// Scratch buffer size for the DEFLATE loops.
const SCRATCH_SIZE: usize = 16 * 1024;

/// Iteration guard for the codec loops.
const MAX_ITERATIONS: u32 = 100_000;

/// Negotiated permessage-deflate parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateParams {
    /// Server resets its compression context after each message.
    pub server_no_context_takeover: bool,
    /// Client resets its compression context after each message.
    pub client_no_context_takeover: bool,
    /// Server-to-client LZ77 window size exponent.
    pub server_max_window_bits: u8,
    /// Client-to-server LZ77 window size exponent.
    pub client_max_window_bits: u8,
}

impl Default for DeflateParams {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
        }
    }
}

impl DeflateParams {
    /// Build the mirrored `Sec-WebSocket-Extensions` response value.
    pub fn response_header(&self) -> String {
        let mut parts = vec!["permessage-deflate".to_owned()];
        if self.server_no_context_takeover {
            parts.push("server_no_context_takeover".to_owned());
        }
        if self.client_no_context_takeover {
            parts.push("client_no_context_takeover".to_owned());
        }
        if self.server_max_window_bits < DEFAULT_WINDOW_BITS {
            parts.push(format!(
                "server_max_window_bits={}",
                self.server_max_window_bits
            ));
        }
        if self.client_max_window_bits < DEFAULT_WINDOW_BITS {
            parts.push(format!(
                "client_max_window_bits={}",
                self.client_max_window_bits
            ));
        }
        parts.join("; ")
    }
}

/// Parse a window-bits token: 1-2 decimal digits in 8..=15.
fn parse_window_bits(token: &str) -> Option<u8> {
    let token = token.trim().trim_matches('"');
    if token.is_empty() || token.len() > 2 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let bits: u8 = token.parse().ok()?;
    (MIN_WINDOW_BITS..=DEFAULT_WINDOW_BITS)
        .contains(&bits)
        .then_some(bits)
}

/// Negotiate against a `Sec-WebSocket-Extensions` request value.
///
/// Returns the accepted parameters, or `None` when the header carries no
/// valid `permessage-deflate` offer; any invalid parameter rejects the
/// whole extension.
pub fn negotiate(header_value: &str) -> Option<DeflateParams> {
    for offer in header_value.split(',') {
        let mut tokens = offer.split(';').map(str::trim);
        if tokens.next() != Some("permessage-deflate") {
            continue;
        }

        let mut params = DeflateParams::default();
        let mut valid = true;
        for token in tokens {
            if token.is_empty() {
                continue;
            }
            let (name, value) = match token.split_once('=') {
                Some((n, v)) => (n.trim(), Some(v)),
                None => (token, None),
            };
            match (name, value) {
                ("server_no_context_takeover", None) => params.server_no_context_takeover = true,
                ("client_no_context_takeover", None) => params.client_no_context_takeover = true,
                ("server_max_window_bits", Some(v)) => match parse_window_bits(v) {
                    Some(bits) => params.server_max_window_bits = bits,
                    None => valid = false,
                },
                ("client_max_window_bits", None) => {
                    // Bare token: the client merely signals support.
                }
                ("client_max_window_bits", Some(v)) => match parse_window_bits(v) {
                    Some(bits) => params.client_max_window_bits = bits,
                    None => valid = false,
                },
                _ => valid = false,
            }
            if !valid {
                break;
            }
        }

        return valid.then_some(params);
    }
    None
}

/// Engine-side compression tuning, independent of negotiation.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    /// zlib compression level (0..=9).
    pub level: u32,
    /// Messages below this size are sent uncompressed.
    pub threshold: usize,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: 6,
            threshold: 32,
        }
    }
}

/// Per-connection compression context for the server role.
///
/// Outgoing messages compress with the server window; incoming messages
/// decompress with the client window.
pub struct DeflateContext {
    compress: Compress,
    decompress: Decompress,
    reset_compress: bool,
    reset_decompress: bool,
    threshold: usize,
}

impl DeflateContext {
    /// Build a server-role context from negotiated parameters.
    ///
    /// zlib cannot emit a true 256-byte window, so a negotiated value of 8
    /// is widened to 9 when constructing the contexts.
    pub fn server(params: &DeflateParams, options: &DeflateOptions) -> Self {
        Self {
            compress: Compress::new_with_window_bits(
                Compression::new(options.level),
                false,
                params.server_max_window_bits.max(9),
            ),
            decompress: Decompress::new_with_window_bits(
                false,
                params.client_max_window_bits.max(9),
            ),
            reset_compress: params.server_no_context_takeover,
            reset_decompress: params.client_no_context_takeover,
            threshold: options.threshold,
        }
    }

    /// Compress a message payload.
    ///
    /// Returns `None` when the payload is below the threshold or when
    /// compression would not shrink it; the caller then sends the message
    /// uncompressed with RSV1 clear.
    pub fn compress_message(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.threshold {
            return Ok(None);
        }
        if self.reset_compress {
            self.compress.reset();
        }

        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let mut scratch = vec![0u8; SCRATCH_SIZE];
        let mut consumed = 0usize;
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression("deflate made no progress".into()));
            }

            let before_in = self.compress.total_in();
            let before_out = self.compress.total_out();
            let status = self
                .compress
                .compress(&data[consumed..], &mut scratch, FlushCompress::Sync)
                .map_err(|e| Error::Compression(format!("deflate error: {e}")))?;
            consumed += (self.compress.total_in() - before_in) as usize;
            let produced = (self.compress.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);

            match status {
                Status::StreamEnd => break,
                // A short write means the sync flush fully drained.
                _ if consumed >= data.len() && produced < scratch.len() => break,
                _ => {}
            }
        }

        // RFC 7692: strip the trailing 00 00 FF FF before framing.
        if out.ends_with(&DEFLATE_TRAILER) {
            out.truncate(out.len() - DEFLATE_TRAILER.len());
        }

        if out.len() >= data.len() {
            return Ok(None);
        }
        Ok(Some(out.into()))
    }

    /// Decompress a message payload, bounding the output at `max_size`.
    pub fn decompress_message(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        if self.reset_decompress {
            self.decompress.reset(false);
        }

        // RFC 7692: restore the trailer before inflating.
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(1024));
        let mut scratch = vec![0u8; SCRATCH_SIZE];
        let mut consumed = 0usize;
        let mut iterations = 0u32;
        loop {
            iterations += 1;
            if iterations > MAX_ITERATIONS {
                return Err(Error::Compression("inflate made no progress".into()));
            }

            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();
            let status = self
                .decompress
                .decompress(&input[consumed..], &mut scratch, FlushDecompress::Sync)
                .map_err(|e| Error::Compression(format!("inflate error: {e}")))?;
            consumed += (self.decompress.total_in() - before_in) as usize;
            let produced = (self.decompress.total_out() - before_out) as usize;
            out.extend_from_slice(&scratch[..produced]);
            if out.len() > max_size {
                return Err(Error::MessageTooLarge);
            }

            match status {
                Status::StreamEnd => break,
                _ if consumed >= input.len() && produced < scratch.len() => break,
                _ => {}
            }
        }

        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(params: &DeflateParams) -> DeflateContext {
        DeflateContext::server(
            params,
            &DeflateOptions {
                level: 6,
                threshold: 0,
            },
        )
    }

    #[test]
    fn negotiate_window_bits() {
        let params = negotiate("permessage-deflate; server_max_window_bits=10").unwrap();
        assert_eq!(params.server_max_window_bits, 10);
        assert_eq!(params.client_max_window_bits, DEFAULT_WINDOW_BITS);
        assert!(!params.server_no_context_takeover);
        assert!(!params.client_no_context_takeover);
    }

    #[test]
    fn negotiate_out_of_range_rejects_extension() {
        assert!(negotiate("permessage-deflate; server_max_window_bits=7").is_none());
        assert!(negotiate("permessage-deflate; server_max_window_bits=16").is_none());
    }

    #[test]
    fn negotiate_malformed_window_bits_rejects_extension() {
        assert!(negotiate("permessage-deflate; server_max_window_bits=abc").is_none());
        assert!(negotiate("permessage-deflate; server_max_window_bits=015").is_none());
        assert!(negotiate("permessage-deflate; client_max_window_bits=9x").is_none());
    }

    #[test]
    fn negotiate_flags_and_bare_client_bits() {
        let params = negotiate(
            "permessage-deflate; server_no_context_takeover; client_max_window_bits",
        )
        .unwrap();
        assert!(params.server_no_context_takeover);
        assert_eq!(params.client_max_window_bits, DEFAULT_WINDOW_BITS);
    }

    #[test]
    fn negotiate_ignores_other_extensions() {
        assert!(negotiate("x-webkit-deflate-frame").is_none());
        let params = negotiate("x-custom, permessage-deflate; client_max_window_bits=12").unwrap();
        assert_eq!(params.client_max_window_bits, 12);
    }

    #[test]
    fn negotiate_unknown_parameter_rejects_extension() {
        assert!(negotiate("permessage-deflate; mystery_knob=1").is_none());
    }

    #[test]
    fn response_header_mirrors_honored_options() {
        let params = DeflateParams {
            server_no_context_takeover: true,
            client_no_context_takeover: false,
            server_max_window_bits: 12,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
        };
        let header = params.response_header();
        assert!(header.starts_with("permessage-deflate"));
        assert!(header.contains("server_no_context_takeover"));
        assert!(header.contains("server_max_window_bits=12"));
        assert!(!header.contains("client_max_window_bits"));
    }

    #[test]
    fn compress_decompress_round_trip() {
        let mut ctx = context(&DeflateParams::default());
        let message = b"the quick brown fox jumps over the lazy dog, repeatedly, \
                        the quick brown fox jumps over the lazy dog";
        let compressed = ctx.compress_message(message).unwrap().unwrap();
        assert!(compressed.len() < message.len());

        let restored = ctx.decompress_message(&compressed, 1 << 20).unwrap();
        assert_eq!(restored.as_ref(), message.as_ref());
    }

    #[test]
    fn threshold_skips_tiny_messages() {
        let mut ctx = DeflateContext::server(
            &DeflateParams::default(),
            &DeflateOptions {
                level: 6,
                threshold: 100,
            },
        );
        assert!(ctx.compress_message(b"tiny").unwrap().is_none());
    }

    #[test]
    fn incompressible_payload_sent_uncompressed() {
        let mut ctx = context(&DeflateParams::default());
        // Pseudo-random bytes do not shrink under DEFLATE.
        let mut state = 0x12345678u32;
        let noise: Vec<u8> = (0..512)
            .map(|_| {
                state = state.wrapping_mul(1664525).wrapping_add(1013904223);
                (state >> 24) as u8
            })
            .collect();
        assert!(ctx.compress_message(&noise).unwrap().is_none());
    }

    #[test]
    fn no_context_takeover_resets_between_messages() {
        let params = DeflateParams {
            server_no_context_takeover: true,
            ..DeflateParams::default()
        };
        let mut ctx = context(&params);
        let msg = b"repetition repetition repetition repetition";
        let first = ctx.compress_message(msg).unwrap().unwrap();
        let second = ctx.compress_message(msg).unwrap().unwrap();
        // Without carried context both messages compress identically.
        assert_eq!(first, second);
    }

    #[test]
    fn context_takeover_improves_second_message() {
        let mut ctx = context(&DeflateParams::default());
        let msg = b"carry the window across messages, carry the window";
        let first = ctx.compress_message(msg).unwrap().unwrap();
        let second = ctx.compress_message(msg).unwrap().unwrap();
        assert!(second.len() <= first.len());
    }

    #[test]
    fn decompress_respects_size_limit() {
        let mut ctx = context(&DeflateParams::default());
        let message = vec![b'a'; 64 * 1024];
        let compressed = ctx.compress_message(&message).unwrap().unwrap();
        assert!(matches!(
            ctx.decompress_message(&compressed, 1024),
            Err(Error::MessageTooLarge)
        ));
    }
}
