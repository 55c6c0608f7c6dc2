//! WebSocket upgrade handshake across the three historical dialects.
//!
//! Oldest to newest: `Legacy` (sentinel-framed, no challenge key),
//! `Intermediate` (two number-keys plus an 8-byte nonce, MD5-derived
//! response body), `Modern` (RFC 6455, SHA-1 derived
//! `Sec-WebSocket-Accept`). Each dialect can report whether it claims a
//! set of request headers and can produce the 101 response head and
//! handshake body from validated inputs. Selection is a pure function
//! over the headers, trying dialects in a fixed fallback order and taking
//! the first claim.

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use md5::Md5;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::http::headers::HeaderMap;
use crate::ws::deflate::{self, DeflateParams};
use crate::WS_GUID;

/// The three handshake/framing variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Sentinel-framed, no challenge (hixie-75 era).
    Legacy,
    /// Number-key challenge with an MD5 response body (hixie-76 era).
    Intermediate,
    /// Length-prefixed masked frames with SHA-1 accept key (RFC 6455).
    Modern,
}

/// Fallback try-order: most specific claim first.
pub const FALLBACK_ORDER: [Dialect; 3] = [Dialect::Modern, Dialect::Intermediate, Dialect::Legacy];

impl Dialect {
    /// Whether this dialect claims the given request headers.
    pub fn claims(self, headers: &HeaderMap) -> bool {
        let upgrade_ok = headers
            .get("upgrade")
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
        if !upgrade_ok {
            return false;
        }
        match self {
            Dialect::Modern => headers.contains("sec-websocket-key"),
            Dialect::Intermediate => {
                headers.contains("sec-websocket-key1") && headers.contains("sec-websocket-key2")
            }
            Dialect::Legacy => true,
        }
    }

    /// Bytes of handshake body this dialect expects after the header
    /// block. Only the intermediate dialect carries a nonce.
    pub fn nonce_len(self) -> usize {
        match self {
            Dialect::Intermediate => 8,
            _ => 0,
        }
    }

    /// Whether frames use the sentinel-delimited legacy wire format.
    pub fn is_sentinel_framed(self) -> bool {
        !matches!(self, Dialect::Modern)
    }
}

/// Select the dialect for a set of request headers.
pub fn select_dialect(headers: &HeaderMap) -> Option<Dialect> {
    FALLBACK_ORDER.iter().copied().find(|d| d.claims(headers))
}

/// A negotiated handshake: serialized 101 head, handshake body bytes, and
/// the compression parameters when permessage-deflate was accepted.
#[derive(Debug)]
pub struct Handshake {
    /// Dialect that claimed the request.
    pub dialect: Dialect,
    /// Serialized response head, through the blank line.
    pub head: Bytes,
    /// Handshake body written after the head (MD5 digest for the
    /// intermediate dialect, empty otherwise).
    pub body: Bytes,
    /// Accepted permessage-deflate parameters, modern dialect only.
    pub deflate: Option<DeflateParams>,
}

/// Compute the RFC 6455 `Sec-WebSocket-Accept` value.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Extract a number-key: digits form a decimal number that must divide
/// evenly by the count of space characters.
fn number_key(value: &str) -> Result<u32> {
    let digits: String = value.chars().filter(|c| c.is_ascii_digit()).collect();
    let spaces = value.chars().filter(|&c| c == ' ').count() as u64;
    if digits.is_empty() || spaces == 0 {
        return Err(Error::Handshake("malformed number-key"));
    }
    let number: u64 = digits
        .parse()
        .map_err(|_| Error::Handshake("number-key overflow"))?;
    if number % spaces != 0 {
        return Err(Error::Handshake("number-key not divisible by spaces"));
    }
    u32::try_from(number / spaces).map_err(|_| Error::Handshake("number-key out of range"))
}

/// Compute the 16-byte intermediate-dialect response body.
fn challenge_response(key1: u32, key2: u32, nonce: &[u8]) -> [u8; 16] {
    let mut challenge = [0u8; 16];
    challenge[..4].copy_from_slice(&key1.to_be_bytes());
    challenge[4..8].copy_from_slice(&key2.to_be_bytes());
    challenge[8..].copy_from_slice(nonce);
    Md5::digest(challenge).into()
}

fn put_header(out: &mut BytesMut, name: &str, value: &str) {
    out.put_slice(name.as_bytes());
    out.put_slice(b": ");
    out.put_slice(value.as_bytes());
    out.put_slice(b"\r\n");
}

fn location(headers: &HeaderMap, target: &str) -> String {
    let host = headers.get("host").unwrap_or("localhost");
    format!("ws://{host}{target}")
}

/// Produce the 101 response for a validated upgrade request.
///
/// `nonce` must hold exactly [`Dialect::nonce_len`] bytes of handshake
/// body. `deflate_enabled` gates the permessage-deflate negotiation;
/// extension rejection is not an error, the upgrade simply proceeds
/// uncompressed.
pub fn negotiate(
    dialect: Dialect,
    headers: &HeaderMap,
    target: &str,
    nonce: &[u8],
    deflate_enabled: bool,
) -> Result<Handshake> {
    if nonce.len() != dialect.nonce_len() {
        return Err(Error::Handshake("wrong handshake body length"));
    }

    let mut head = BytesMut::with_capacity(256);
    let mut body = Bytes::new();
    let mut deflate_params = None;

    match dialect {
        Dialect::Modern => {
            let key = headers
                .get("sec-websocket-key")
                .ok_or(Error::Handshake("missing Sec-WebSocket-Key"))?;

            head.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
            put_header(&mut head, "Upgrade", "websocket");
            put_header(&mut head, "Connection", "Upgrade");
            put_header(&mut head, "Sec-WebSocket-Accept", &accept_key(key));

            if deflate_enabled {
                if let Some(params) = headers
                    .get("sec-websocket-extensions")
                    .and_then(deflate::negotiate)
                {
                    put_header(
                        &mut head,
                        "Sec-WebSocket-Extensions",
                        &params.response_header(),
                    );
                    deflate_params = Some(params);
                }
            }
        }
        Dialect::Intermediate => {
            let key1 = number_key(
                headers
                    .get("sec-websocket-key1")
                    .ok_or(Error::Handshake("missing Sec-WebSocket-Key1"))?,
            )?;
            let key2 = number_key(
                headers
                    .get("sec-websocket-key2")
                    .ok_or(Error::Handshake("missing Sec-WebSocket-Key2"))?,
            )?;

            head.put_slice(b"HTTP/1.1 101 WebSocket Protocol Handshake\r\n");
            put_header(&mut head, "Upgrade", "WebSocket");
            put_header(&mut head, "Connection", "Upgrade");
            if let Some(origin) = headers.get("origin") {
                put_header(&mut head, "Sec-WebSocket-Origin", origin);
            }
            put_header(
                &mut head,
                "Sec-WebSocket-Location",
                &location(headers, target),
            );

            body = Bytes::copy_from_slice(&challenge_response(key1, key2, nonce));
        }
        Dialect::Legacy => {
            head.put_slice(b"HTTP/1.1 101 Web Socket Protocol Handshake\r\n");
            put_header(&mut head, "Upgrade", "WebSocket");
            put_header(&mut head, "Connection", "Upgrade");
            if let Some(origin) = headers.get("origin") {
                put_header(&mut head, "WebSocket-Origin", origin);
            }
            put_header(
                &mut head,
                "WebSocket-Location",
                &location(headers, target),
            );
        }
    }

    head.put_slice(b"\r\n");
    Ok(Handshake {
        dialect,
        head: head.freeze(),
        body,
        deflate: deflate_params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn modern_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.append("Host", "server.example.com");
        headers.append("Upgrade", "websocket");
        headers.append("Connection", "Upgrade");
        headers.append("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==");
        headers.append("Sec-WebSocket-Version", "13");
        headers
    }

    #[test]
    fn rfc6455_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn modern_dialect_selected_and_negotiated() {
        let headers = modern_headers();
        assert_eq!(select_dialect(&headers), Some(Dialect::Modern));

        let hs = negotiate(Dialect::Modern, &headers, "/chat", b"", false).unwrap();
        let head = std::str::from_utf8(&hs.head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(hs.body.is_empty());
        assert!(hs.deflate.is_none());
    }

    #[test]
    fn modern_dialect_negotiates_deflate() {
        let mut headers = modern_headers();
        headers.append(
            "Sec-WebSocket-Extensions",
            "permessage-deflate; server_max_window_bits=10",
        );

        let hs = negotiate(Dialect::Modern, &headers, "/chat", b"", true).unwrap();
        let params = hs.deflate.unwrap();
        assert_eq!(params.server_max_window_bits, 10);
        let head = std::str::from_utf8(&hs.head).unwrap();
        assert!(head.contains("Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10\r\n"));
    }

    #[test]
    fn rejected_deflate_proceeds_uncompressed() {
        let mut headers = modern_headers();
        headers.append(
            "Sec-WebSocket-Extensions",
            "permessage-deflate; server_max_window_bits=7",
        );

        let hs = negotiate(Dialect::Modern, &headers, "/chat", b"", true).unwrap();
        assert!(hs.deflate.is_none());
        assert!(!std::str::from_utf8(&hs.head)
            .unwrap()
            .contains("Sec-WebSocket-Extensions"));
    }

    #[test]
    fn number_key_extraction() {
        // Digits concatenate to a decimal number divided by the space count.
        assert_eq!(number_key("4 @1  46546xW%0l 1 5").unwrap(), 829309203);
        assert_eq!(number_key("12998 5 Y3 1  .P00").unwrap(), 259970620);
        assert!(number_key("no digits here ").is_err());
        assert!(number_key("123456").is_err()); // no spaces
        assert!(number_key("1234567 89 x").is_err()); // not divisible
    }

    #[test]
    fn intermediate_dialect_challenge_vector() {
        // Example handshake from the hixie-76 draft.
        let mut headers = HeaderMap::new();
        headers.append("Host", "example.com");
        headers.append("Upgrade", "WebSocket");
        headers.append("Connection", "Upgrade");
        headers.append("Origin", "http://example.com");
        headers.append("Sec-WebSocket-Key1", "4 @1  46546xW%0l 1 5");
        headers.append("Sec-WebSocket-Key2", "12998 5 Y3 1  .P00");

        assert_eq!(select_dialect(&headers), Some(Dialect::Intermediate));

        let hs = negotiate(Dialect::Intermediate, &headers, "/demo", b"^n:ds[4U", false).unwrap();
        assert_eq!(hs.body.as_ref(), b"8jKS'y:G*Co,Wxa-");

        let head = std::str::from_utf8(&hs.head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));
        assert!(head.contains("Sec-WebSocket-Origin: http://example.com\r\n"));
        assert!(head.contains("Sec-WebSocket-Location: ws://example.com/demo\r\n"));
    }

    #[test]
    fn intermediate_dialect_requires_nonce() {
        let mut headers = HeaderMap::new();
        headers.append("Upgrade", "websocket");
        headers.append("Sec-WebSocket-Key1", "1 0");
        headers.append("Sec-WebSocket-Key2", "2 0");
        assert!(negotiate(Dialect::Intermediate, &headers, "/", b"", false).is_err());
    }

    #[test]
    fn legacy_dialect_claims_bare_upgrade() {
        let mut headers = HeaderMap::new();
        headers.append("Host", "example.com");
        headers.append("Upgrade", "WebSocket");
        headers.append("Connection", "Upgrade");
        headers.append("Origin", "http://example.com");

        assert_eq!(select_dialect(&headers), Some(Dialect::Legacy));

        let hs = negotiate(Dialect::Legacy, &headers, "/live", b"", false).unwrap();
        let head = std::str::from_utf8(&hs.head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 Web Socket Protocol Handshake\r\n"));
        assert!(head.contains("WebSocket-Origin: http://example.com\r\n"));
        assert!(head.contains("WebSocket-Location: ws://example.com/live\r\n"));
        assert!(hs.body.is_empty());
    }

    #[test]
    fn no_upgrade_header_claims_nothing() {
        let mut headers = HeaderMap::new();
        headers.append("Host", "example.com");
        assert_eq!(select_dialect(&headers), None);
    }

    #[test]
    fn fallback_order_prefers_modern() {
        // A request carrying both kinds of keys takes the modern path.
        let mut headers = modern_headers();
        headers.append("Sec-WebSocket-Key1", "1 0");
        headers.append("Sec-WebSocket-Key2", "2 0");
        assert_eq!(select_dialect(&headers), Some(Dialect::Modern));
    }
}
