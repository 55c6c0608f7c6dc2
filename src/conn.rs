//! Connection / HTTP state machine.
//!
//! One `Connection` exists per accepted socket. It drives the injected
//! HTTP tokenizer, accumulates the header map and body, detects
//! protocol-upgrade requests, and hands completed requests or WebSocket
//! events to the per-connection task. Pipelined requests are rejected by
//! closing the connection: any byte that arrives while a request is being
//! handled is a protocol violation here.
//!
//! The struct holds no socket so the state machine can be driven directly
//! from byte buffers; the owning task performs all I/O.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::http::headers::HeaderMap;
use crate::http::request::Request;
use crate::http::tokenizer::{HttpEvent, HttpTokenizer, RequestHead, Tokenizer};
use crate::ws::deflate::DeflateContext;
use crate::ws::handshake::{self, select_dialect, Dialect};
use crate::ws::session::{Session, SessionEvent};
use crate::Config;

/// Connection identifier used to reference background-owned connections
/// from the main thread.
pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Idle,
    ParsingHeaders,
    ParsingBody,
    Complete,
    /// Headers accepted for an intermediate-dialect upgrade; waiting for
    /// the 8-byte handshake body.
    AwaitingNonce,
    Upgraded,
}

/// Event surfaced by [`Connection::on_bytes`] for the owning task to act
/// on.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    /// A complete request is ready for the application boundary.
    Dispatch(Request),
    /// The upgrade was validated: write head and body, then the session
    /// is live.
    UpgradeAccepted { head: Bytes, body: Bytes },
    /// A complete WebSocket message arrived.
    WsMessage { binary: bool, data: Bytes },
    /// A ping frame arrived. Surfaced without an automatic pong.
    WsPing(Bytes),
    /// A pong frame arrived.
    WsPong(Bytes),
    /// The peer initiated WebSocket closure.
    WsCloseRequested,
}

/// Tokenizer events staged into owned values so they can be applied after
/// the tokenizer borrow ends.
enum Staged {
    Field(String),
    Value(String),
    Head(RequestHead),
    Body(Bytes),
    Complete,
    Upgrade,
}

/// Per-socket protocol state machine.
pub(crate) struct Connection {
    state: ConnState,
    tokenizer: Box<dyn Tokenizer + Send>,
    headers: HeaderMap,
    pending_field: Option<String>,
    head: Option<RequestHead>,
    body: BytesMut,
    handling_request: bool,
    response_scheduled: bool,
    peer_wants_close: bool,
    nonce_buf: BytesMut,
    pending_dialect: Option<Dialect>,
    session: Option<Session>,
    peer_addr: Option<String>,
    local_addr: Option<String>,
    max_body_size: usize,
    max_frame_size: usize,
    max_message_size: usize,
    deflate: Option<crate::ws::deflate::DeflateOptions>,
}

impl Connection {
    pub(crate) fn new(
        config: &Config,
        peer_addr: Option<String>,
        local_addr: Option<String>,
    ) -> Self {
        Self {
            state: ConnState::Idle,
            tokenizer: Box::new(HttpTokenizer::new(config.max_header_size)),
            headers: HeaderMap::new(),
            pending_field: None,
            head: None,
            body: BytesMut::new(),
            handling_request: false,
            response_scheduled: false,
            peer_wants_close: false,
            nonce_buf: BytesMut::new(),
            pending_dialect: None,
            session: None,
            peer_addr,
            local_addr,
            max_body_size: config.max_body_size,
            max_frame_size: config.max_frame_size,
            max_message_size: config.max_message_size,
            deflate: config.deflate.clone(),
        }
    }

    /// Whether the connection switched to the WebSocket protocol.
    pub(crate) fn is_upgraded(&self) -> bool {
        self.state == ConnState::Upgraded
    }

    /// The WebSocket session, once upgraded.
    pub(crate) fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Whether the request being handled asked for `Connection: close`.
    pub(crate) fn peer_wants_close(&self) -> bool {
        self.peer_wants_close
    }

    /// Whether a response has already been scheduled for the current
    /// request.
    pub(crate) fn response_scheduled(&self) -> bool {
        self.response_scheduled
    }

    /// Mark that a response has been scheduled for the current request.
    pub(crate) fn set_response_scheduled(&mut self) {
        self.response_scheduled = true;
    }

    /// Reset for the next request after a response completed (keep-alive).
    pub(crate) fn request_finished(&mut self) {
        self.state = ConnState::Idle;
        self.tokenizer.reset();
        self.headers = HeaderMap::new();
        self.pending_field = None;
        self.head = None;
        self.body.clear();
        self.handling_request = false;
        self.response_scheduled = false;
        self.peer_wants_close = false;
    }

    /// Feed received bytes through the state machine.
    ///
    /// Consumes all of `input` unless an error aborts the connection.
    pub(crate) fn on_bytes(
        &mut self,
        input: &mut BytesMut,
        events: &mut Vec<ConnEvent>,
    ) -> Result<()> {
        loop {
            if input.is_empty() {
                return Ok(());
            }
            match self.state {
                ConnState::Upgraded => return self.on_ws_bytes(input, events),
                ConnState::AwaitingNonce => {
                    let need = self
                        .pending_dialect
                        .map(|d| d.nonce_len())
                        .unwrap_or(0)
                        .saturating_sub(self.nonce_buf.len());
                    let take = need.min(input.len());
                    self.nonce_buf.extend_from_slice(&input.split_to(take));
                    if self.nonce_buf.len()
                        == self.pending_dialect.map(|d| d.nonce_len()).unwrap_or(0)
                    {
                        self.finish_upgrade(events)?;
                    }
                }
                ConnState::Complete => {
                    // A second message before the response finished.
                    return Err(Error::Pipelined);
                }
                _ => self.on_http_bytes(input, events)?,
            }
        }
    }

    fn on_http_bytes(&mut self, input: &mut BytesMut, events: &mut Vec<ConnEvent>) -> Result<()> {
        if self.handling_request {
            return Err(Error::Pipelined);
        }
        if self.state == ConnState::Idle {
            self.state = ConnState::ParsingHeaders;
        }

        let mut staged: Vec<Staged> = Vec::new();
        let consumed = self.tokenizer.advance(input, &mut |ev| {
            staged.push(match ev {
                HttpEvent::HeaderField(name) => Staged::Field(name.to_owned()),
                HttpEvent::HeaderValue(value) => Staged::Value(value.to_owned()),
                HttpEvent::HeadersComplete(head) => Staged::Head(head),
                HttpEvent::Body(chunk) => Staged::Body(Bytes::copy_from_slice(chunk)),
                HttpEvent::MessageComplete => Staged::Complete,
                HttpEvent::Upgrade => Staged::Upgrade,
            });
            Ok(())
        })?;
        let _ = input.split_to(consumed);

        for staged_event in staged {
            match staged_event {
                Staged::Field(name) => self.pending_field = Some(name),
                Staged::Value(value) => {
                    let field = self
                        .pending_field
                        .take()
                        .ok_or(Error::Http("header value without field"))?;
                    self.headers.append(&field, &value);
                }
                Staged::Head(head) => self.head = Some(head),
                Staged::Body(chunk) => {
                    self.state = ConnState::ParsingBody;
                    if self.body.len() + chunk.len() > self.max_body_size {
                        return Err(Error::BodyTooLarge);
                    }
                    self.body.extend_from_slice(&chunk);
                }
                Staged::Complete => {
                    self.state = ConnState::Complete;
                    self.handling_request = true;
                    self.peer_wants_close = self.headers.has_token("connection", "close");
                    events.push(ConnEvent::Dispatch(self.build_request()?));
                }
                Staged::Upgrade => self.begin_upgrade(events)?,
            }
        }
        Ok(())
    }

    fn on_ws_bytes(&mut self, input: &mut BytesMut, events: &mut Vec<ConnEvent>) -> Result<()> {
        let session = self
            .session
            .as_mut()
            .ok_or(Error::Protocol("upgraded connection without session"))?;
        let mut ws_events = Vec::new();
        session.receive(input, &mut ws_events)?;
        for ev in ws_events {
            events.push(match ev {
                SessionEvent::Message { binary, data } => ConnEvent::WsMessage { binary, data },
                SessionEvent::Ping(data) => ConnEvent::WsPing(data),
                SessionEvent::Pong(data) => ConnEvent::WsPong(data),
                SessionEvent::CloseRequested(_) => ConnEvent::WsCloseRequested,
            });
        }
        Ok(())
    }

    fn build_request(&mut self) -> Result<Request> {
        let head = self.head.take().ok_or(Error::Http("message without head"))?;
        Ok(Request::new(
            head.method,
            head.target,
            std::mem::take(&mut self.headers),
            self.body.split().freeze(),
            self.peer_addr.clone(),
            self.local_addr.clone(),
        ))
    }

    /// Validate the upgrade request and pick a dialect.
    ///
    /// The intermediate dialect needs the 8-byte handshake body before the
    /// 101 can be computed; the others complete immediately.
    fn begin_upgrade(&mut self, events: &mut Vec<ConnEvent>) -> Result<()> {
        let dialect =
            select_dialect(&self.headers).ok_or(Error::Handshake("no dialect claims request"))?;
        self.pending_dialect = Some(dialect);
        if dialect.nonce_len() > 0 {
            self.state = ConnState::AwaitingNonce;
            Ok(())
        } else {
            self.finish_upgrade(events)
        }
    }

    fn finish_upgrade(&mut self, events: &mut Vec<ConnEvent>) -> Result<()> {
        let dialect = self
            .pending_dialect
            .take()
            .ok_or(Error::Handshake("upgrade without dialect"))?;
        let head = self.head.as_ref().ok_or(Error::Http("upgrade without head"))?;

        let handshake = handshake::negotiate(
            dialect,
            &self.headers,
            &head.target,
            &self.nonce_buf,
            self.deflate.is_some(),
        )?;

        let deflate_ctx = match (&handshake.deflate, &self.deflate) {
            (Some(params), Some(options)) => Some(DeflateContext::server(params, options)),
            _ => None,
        };
        self.session = Some(Session::new(
            dialect,
            deflate_ctx,
            self.max_frame_size,
            self.max_message_size,
        ));
        self.state = ConnState::Upgraded;
        self.nonce_buf.clear();

        events.push(ConnEvent::UpgradeAccepted {
            head: handshake.head,
            body: handshake.body,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(crate::Endpoint::tcp("127.0.0.1", 0))
    }

    fn conn() -> Connection {
        Connection::new(&config(), Some("1.2.3.4:5".into()), Some("5.6.7.8:80".into()))
    }

    fn feed(conn: &mut Connection, bytes: &[u8]) -> Result<Vec<ConnEvent>> {
        let mut input = BytesMut::from(bytes);
        let mut events = Vec::new();
        conn.on_bytes(&mut input, &mut events)?;
        Ok(events)
    }

    #[test]
    fn dispatches_simple_request() {
        let mut conn = conn();
        let events = feed(
            &mut conn,
            b"GET /status?verbose=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();

        match &events[..] {
            [ConnEvent::Dispatch(req)] => {
                assert_eq!(req.method(), "GET");
                assert_eq!(req.path(), "/status");
                assert_eq!(req.query(), Some("verbose=1"));
                assert_eq!(req.headers().get("host"), Some("example.com"));
                assert_eq!(req.peer_addr(), Some("1.2.3.4:5"));
                assert!(req.body().is_empty());
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn accumulates_body_across_reads() {
        let mut conn = conn();
        let events = feed(
            &mut conn,
            b"POST /upload HTTP/1.1\r\nContent-Length: 8\r\n\r\nfour",
        )
        .unwrap();
        assert!(events.is_empty());

        let events = feed(&mut conn, b"more").unwrap();
        match &events[..] {
            [ConnEvent::Dispatch(req)] => assert_eq!(req.body().as_ref(), b"fourmore"),
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn repeated_header_fields_comma_join() {
        let mut conn = conn();
        let events = feed(
            &mut conn,
            b"GET / HTTP/1.1\r\nX-Tag: a\r\nX-Tag: b\r\nX-Tag:\r\n\r\n",
        )
        .unwrap();
        match &events[..] {
            [ConnEvent::Dispatch(req)] => {
                assert_eq!(req.headers().get("x-tag"), Some("a,b"));
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn pipelined_requests_rejected() {
        let mut conn = conn();
        let result = feed(
            &mut conn,
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        assert!(matches!(result, Err(Error::Pipelined)));
    }

    #[test]
    fn second_request_while_handling_rejected() {
        let mut conn = conn();
        let events = feed(&mut conn, b"GET /a HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(&events[..], [ConnEvent::Dispatch(_)]));

        let result = feed(&mut conn, b"GET /b HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(Error::Pipelined)));
    }

    #[test]
    fn keep_alive_after_request_finished() {
        let mut conn = conn();
        feed(&mut conn, b"GET /a HTTP/1.1\r\nX-Tag: a\r\n\r\n").unwrap();
        conn.request_finished();

        let events = feed(&mut conn, b"GET /b HTTP/1.1\r\n\r\n").unwrap();
        match &events[..] {
            [ConnEvent::Dispatch(req)] => {
                assert_eq!(req.path(), "/b");
                // Headers from the first request do not leak.
                assert_eq!(req.headers().get("x-tag"), None);
            }
            other => panic!("unexpected events: {other:?}"),
        }
    }

    #[test]
    fn connection_close_request_flagged() {
        let mut conn = conn();
        feed(&mut conn, b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(conn.peer_wants_close());
    }

    #[test]
    fn modern_upgrade_flips_protocol() {
        let mut conn = conn();
        let events = feed(
            &mut conn,
            b"GET /chat HTTP/1.1\r\n\
              Host: server.example.com\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .unwrap();

        match &events[..] {
            [ConnEvent::UpgradeAccepted { head, body }] => {
                let head = std::str::from_utf8(head).unwrap();
                assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
                assert!(body.is_empty());
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(conn.is_upgraded());
    }

    #[test]
    fn bytes_past_http_boundary_replay_into_ws_layer() {
        let mut conn = conn();

        // Upgrade request with a masked text frame in the same packet.
        let mut wire = BytesMut::from(
            &b"GET /chat HTTP/1.1\r\n\
               Host: h\r\n\
               Upgrade: websocket\r\n\
               Connection: Upgrade\r\n\
               Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"[..],
        );
        let mask = [1, 2, 3, 4];
        let mut frame = BytesMut::new();
        crate::ws::frame::encode_frame(
            &mut frame,
            crate::ws::OpCode::Text,
            b"early",
            true,
            false,
            Some(mask),
        );
        wire.extend_from_slice(&frame);

        let mut events = Vec::new();
        conn.on_bytes(&mut wire, &mut events).unwrap();

        assert!(matches!(&events[0], ConnEvent::UpgradeAccepted { .. }));
        assert!(
            matches!(&events[1], ConnEvent::WsMessage { binary: false, data } if data.as_ref() == b"early")
        );
    }

    #[test]
    fn intermediate_upgrade_waits_for_nonce() {
        let mut conn = conn();
        let events = feed(
            &mut conn,
            b"GET /demo HTTP/1.1\r\n\
              Host: example.com\r\n\
              Upgrade: WebSocket\r\n\
              Connection: Upgrade\r\n\
              Origin: http://example.com\r\n\
              Sec-WebSocket-Key1: 4 @1  46546xW%0l 1 5\r\n\
              Sec-WebSocket-Key2: 12998 5 Y3 1  .P00\r\n\r\n^n:d",
        )
        .unwrap();
        assert!(events.is_empty());

        let events = feed(&mut conn, b"s[4U").unwrap();
        match &events[..] {
            [ConnEvent::UpgradeAccepted { head, body }] => {
                assert!(std::str::from_utf8(head)
                    .unwrap()
                    .starts_with("HTTP/1.1 101 WebSocket Protocol Handshake\r\n"));
                assert_eq!(body.as_ref(), b"8jKS'y:G*Co,Wxa-");
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert!(conn.is_upgraded());
    }

    #[test]
    fn invalid_upgrade_closes_connection() {
        let mut conn = conn();
        let result = feed(
            &mut conn,
            b"GET / HTTP/1.1\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n",
        );
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn malformed_number_key_closes_connection() {
        let mut conn = conn();
        let result = feed(
            &mut conn,
            b"GET / HTTP/1.1\r\n\
              Host: h\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key1: nodigits\r\n\
              Sec-WebSocket-Key2: 1 0\r\n\r\n12345678",
        );
        assert!(matches!(result, Err(Error::Handshake(_))));
    }

    #[test]
    fn oversized_body_rejected() {
        let mut config = config();
        config.max_body_size = 4;
        let mut conn = Connection::new(&config, None, None);
        let result = feed(
            &mut conn,
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789",
        );
        assert!(matches!(result, Err(Error::BodyTooLarge)));
    }
}
