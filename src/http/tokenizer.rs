//! Incremental HTTP/1.1 request tokenizer.
//!
//! The tokenizer turns raw bytes into a typed event stream consumed by the
//! connection state machine. It is an injected dependency behind the
//! [`Tokenizer`] trait; the default implementation buffers the header block
//! and parses it with `httparse`, then counts down a `Content-Length` body.

use bytes::BytesMut;

use crate::error::{Error, Result};

/// Maximum number of header fields accepted per request.
const MAX_HEADERS: usize = 64;

/// Request line fields, available once the header block is complete.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method, e.g. `GET`.
    pub method: String,
    /// Raw request target (path plus optional query).
    pub target: String,
    /// HTTP minor version (0 or 1).
    pub minor_version: u8,
}

/// One tokenizer event.
#[derive(Debug)]
pub enum HttpEvent<'a> {
    /// A header field name.
    HeaderField(&'a str),
    /// The value belonging to the preceding field.
    HeaderValue(&'a str),
    /// The header block is complete.
    HeadersComplete(RequestHead),
    /// A slice of body bytes.
    Body(&'a [u8]),
    /// The message is complete; a request can be dispatched.
    MessageComplete,
    /// The request asks for a protocol upgrade. Emitted instead of
    /// `MessageComplete`; bytes past the header block are not consumed.
    Upgrade,
}

/// Sink receiving tokenizer events.
pub type EventSink<'s> = dyn FnMut(HttpEvent<'_>) -> Result<()> + 's;

/// Incremental request tokenizer interface.
pub trait Tokenizer {
    /// Consume bytes from `input`, emitting events into `sink`.
    ///
    /// Returns the number of bytes consumed. Bytes past an `Upgrade` event
    /// are left unconsumed for the caller to replay into the next protocol
    /// layer.
    fn advance(&mut self, input: &[u8], sink: &mut EventSink<'_>) -> Result<usize>;

    /// Reset for the next message on the same connection.
    fn reset(&mut self);
}

enum State {
    Headers,
    Body { remaining: u64 },
    Done,
}

/// Default [`Tokenizer`] built on `httparse`.
pub struct HttpTokenizer {
    state: State,
    buf: BytesMut,
    max_header_size: usize,
}

impl HttpTokenizer {
    /// Create a tokenizer that rejects header blocks larger than
    /// `max_header_size` bytes.
    pub fn new(max_header_size: usize) -> Self {
        Self {
            state: State::Headers,
            buf: BytesMut::new(),
            max_header_size,
        }
    }

    fn advance_headers(&mut self, input: &[u8], sink: &mut EventSink<'_>) -> Result<usize> {
        let prior = self.buf.len();
        self.buf.extend_from_slice(input);
        if self.buf.len() > self.max_header_size {
            return Err(Error::Http("header block too large"));
        }

        let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut storage);
        let parsed = match req.parse(&self.buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(input.len()),
            Err(_) => return Err(Error::Http("malformed request head")),
        };

        let mut content_length: u64 = 0;
        let mut has_upgrade_header = false;
        let mut connection_upgrade = false;
        for header in req.headers.iter() {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::Http("non-utf8 header value"))?;
            sink(HttpEvent::HeaderField(header.name))?;
            sink(HttpEvent::HeaderValue(value))?;

            if header.name.eq_ignore_ascii_case("content-length") {
                content_length = value
                    .trim()
                    .parse()
                    .map_err(|_| Error::Http("invalid content-length"))?;
            } else if header.name.eq_ignore_ascii_case("upgrade") {
                has_upgrade_header = true;
            } else if header.name.eq_ignore_ascii_case("connection") {
                connection_upgrade = value
                    .split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("upgrade"));
            }
        }

        let head = RequestHead {
            method: req
                .method
                .ok_or(Error::Http("missing request method"))?
                .to_owned(),
            target: req.path.ok_or(Error::Http("missing request target"))?.to_owned(),
            minor_version: req.version.unwrap_or(1) as u8,
        };

        // Bytes of this call's input that belong to the header block.
        let consumed = parsed - prior;
        self.buf.clear();

        sink(HttpEvent::HeadersComplete(head))?;

        if has_upgrade_header && connection_upgrade {
            self.state = State::Done;
            sink(HttpEvent::Upgrade)?;
            return Ok(consumed);
        }

        if content_length == 0 {
            self.state = State::Done;
            sink(HttpEvent::MessageComplete)?;
            return Ok(consumed);
        }

        self.state = State::Body {
            remaining: content_length,
        };
        let body_consumed = self.advance_body(&input[consumed..], sink)?;
        Ok(consumed + body_consumed)
    }

    fn advance_body(&mut self, input: &[u8], sink: &mut EventSink<'_>) -> Result<usize> {
        let State::Body { remaining } = &mut self.state else {
            return Ok(0);
        };
        let take = (*remaining).min(input.len() as u64) as usize;
        if take > 0 {
            sink(HttpEvent::Body(&input[..take]))?;
        }
        *remaining -= take as u64;
        if *remaining == 0 {
            self.state = State::Done;
            sink(HttpEvent::MessageComplete)?;
        }
        Ok(take)
    }
}

impl Tokenizer for HttpTokenizer {
    fn advance(&mut self, input: &[u8], sink: &mut EventSink<'_>) -> Result<usize> {
        match self.state {
            State::Headers => self.advance_headers(input, sink),
            State::Body { .. } => self.advance_body(input, sink),
            State::Done => {
                if input.is_empty() {
                    Ok(0)
                } else {
                    Err(Error::Http("unexpected data after message"))
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = State::Headers;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(tok: &mut HttpTokenizer, input: &[u8]) -> Result<(Vec<String>, usize)> {
        let mut events = Vec::new();
        let consumed = tok.advance(input, &mut |ev| {
            events.push(match ev {
                HttpEvent::HeaderField(n) => format!("field:{n}"),
                HttpEvent::HeaderValue(v) => format!("value:{v}"),
                HttpEvent::HeadersComplete(head) => {
                    format!("head:{} {}", head.method, head.target)
                }
                HttpEvent::Body(b) => format!("body:{}", String::from_utf8_lossy(b)),
                HttpEvent::MessageComplete => "complete".to_owned(),
                HttpEvent::Upgrade => "upgrade".to_owned(),
            });
            Ok(())
        })?;
        Ok((events, consumed))
    }

    #[test]
    fn simple_get() {
        let mut tok = HttpTokenizer::new(8192);
        let input = b"GET /index.html?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (events, consumed) = collect(&mut tok, input).unwrap();
        assert_eq!(consumed, input.len());
        assert_eq!(
            events,
            vec![
                "field:Host",
                "value:example.com",
                "head:GET /index.html?x=1",
                "complete",
            ]
        );
    }

    #[test]
    fn partial_headers_resume() {
        let mut tok = HttpTokenizer::new(8192);
        let (events, consumed) = collect(&mut tok, b"GET / HTTP/1.1\r\nHo").unwrap();
        assert!(events.is_empty());
        assert_eq!(consumed, 18);

        let rest = b"st: a\r\n\r\n";
        let (events, consumed) = collect(&mut tok, rest).unwrap();
        assert_eq!(consumed, rest.len());
        assert_eq!(events.last().unwrap(), "complete");
    }

    #[test]
    fn body_split_across_calls() {
        let mut tok = HttpTokenizer::new(8192);
        let head = b"POST /submit HTTP/1.1\r\nContent-Length: 10\r\n\r\nhello";
        let (events, consumed) = collect(&mut tok, head).unwrap();
        assert_eq!(consumed, head.len());
        assert!(events.contains(&"body:hello".to_owned()));
        assert!(!events.contains(&"complete".to_owned()));

        let (events, consumed) = collect(&mut tok, b"world").unwrap();
        assert_eq!(consumed, 5);
        assert_eq!(events, vec!["body:world", "complete"]);
    }

    #[test]
    fn upgrade_leaves_leftover_unconsumed() {
        let mut tok = HttpTokenizer::new(8192);
        let input = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x00";
        let (events, consumed) = collect(&mut tok, input).unwrap();
        assert_eq!(consumed, input.len() - 2);
        assert_eq!(events.last().unwrap(), "upgrade");
    }

    #[test]
    fn upgrade_requires_connection_token() {
        let mut tok = HttpTokenizer::new(8192);
        let input = b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n";
        let (events, _) = collect(&mut tok, input).unwrap();
        // Without Connection: Upgrade this is a plain request.
        assert_eq!(events.last().unwrap(), "complete");
    }

    #[test]
    fn oversized_header_block_rejected() {
        let mut tok = HttpTokenizer::new(64);
        let mut input = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        input.extend(std::iter::repeat(b'a').take(128));
        assert!(matches!(
            collect(&mut tok, &input),
            Err(Error::Http("header block too large"))
        ));
    }

    #[test]
    fn malformed_head_rejected() {
        let mut tok = HttpTokenizer::new(8192);
        assert!(collect(&mut tok, b"NOT AN HTTP REQUEST\r\n\r\n").is_err());
    }

    #[test]
    fn data_after_message_rejected() {
        let mut tok = HttpTokenizer::new(8192);
        collect(&mut tok, b"GET / HTTP/1.1\r\n\r\n").unwrap();
        assert!(collect(&mut tok, b"GET / HTTP/1.1\r\n\r\n").is_err());
    }
}
