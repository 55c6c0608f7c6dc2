//! HTTP response with a streaming body.

use std::time::SystemTime;

use bytes::{BufMut, Bytes, BytesMut};

use super::status::reason_phrase;
use crate::io::source::{BufferSource, DataSource};

/// An HTTP response under construction.
///
/// Headers are kept as an ordered list; duplicates are allowed unless
/// explicitly overwritten with [`Response::set_header`]. The body is an
/// optional [`DataSource`] drained by the streaming writer on the
/// background thread. The response is destroyed after the write completes
/// (or immediately on write failure), at which point the owning connection
/// is closed when [`Response::close_after_write`] was set.
pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: Option<Box<dyn DataSource + Send>>,
    close_after_write: bool,
}

impl Response {
    /// Create a response with the given status code and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: None,
            headers: Vec::new(),
            body: None,
            close_after_write: false,
        }
    }

    /// Override the reason phrase derived from the status code.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Append a header. Repeated names produce repeated header lines.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overwrite the first header with this name, appending when absent.
    pub fn set_header(mut self, name: &str, value: impl Into<String>) -> Self {
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, stored)) => *stored = value.into(),
            None => self.headers.push((name.to_owned(), value.into())),
        }
        self
    }

    /// Attach a streaming body.
    pub fn body(mut self, source: impl DataSource + Send + 'static) -> Self {
        self.body = Some(Box::new(source));
        self
    }

    /// Attach an in-memory body.
    pub fn body_bytes(self, data: impl Into<Bytes>) -> Self {
        self.body(BufferSource::new(data))
    }

    /// Request connection closure once the response is fully written.
    pub fn close_after_write(mut self, close: bool) -> Self {
        self.close_after_write = close;
        self
    }

    /// Whether the connection should close after the write completes.
    pub fn wants_close(&self) -> bool {
        self.close_after_write
    }

    /// Response status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Serialize the status line and headers.
    ///
    /// A `Date` header is always present; `Content-Length` is synthesized
    /// from the body size unless already set. A body of unknown size is
    /// EOF-delimited: no `Content-Length` is emitted and the close flag is
    /// forced so the peer sees the end of the body.
    pub(crate) fn encode_head(&mut self, out: &mut BytesMut) {
        let body_len = match &self.body {
            Some(source) => source.total_len(),
            None => Some(0),
        };
        if body_len.is_none() {
            self.close_after_write = true;
        }

        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| reason_phrase(self.status).to_owned());
        out.put_slice(b"HTTP/1.1 ");
        out.put_slice(self.status.to_string().as_bytes());
        out.put_u8(b' ');
        out.put_slice(reason.as_bytes());
        out.put_slice(b"\r\n");

        for (name, value) in &self.headers {
            out.put_slice(name.as_bytes());
            out.put_slice(b": ");
            out.put_slice(value.as_bytes());
            out.put_slice(b"\r\n");
        }

        if !self.has_header("date") {
            out.put_slice(b"Date: ");
            out.put_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
            out.put_slice(b"\r\n");
        }
        if let Some(len) = body_len {
            if !self.has_header("content-length") {
                out.put_slice(b"Content-Length: ");
                out.put_slice(len.to_string().as_bytes());
                out.put_slice(b"\r\n");
            }
        }
        if self.close_after_write && !self.has_header("connection") {
            out.put_slice(b"Connection: close\r\n");
        }

        out.put_slice(b"\r\n");
    }

    /// Detach the body source for streaming.
    pub(crate) fn take_body(&mut self) -> Option<Box<dyn DataSource + Send>> {
        self.body.take()
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("close_after_write", &self.close_after_write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_string(resp: &mut Response) -> String {
        let mut out = BytesMut::new();
        resp.encode_head(&mut out);
        String::from_utf8(out.to_vec()).unwrap()
    }

    #[test]
    fn status_line_and_header_order() {
        let mut resp = Response::new(200)
            .header("X-First", "1")
            .header("X-Second", "2")
            .header("X-First", "again");
        let head = head_string(&mut resp);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        let first = head.find("X-First: 1").unwrap();
        let second = head.find("X-Second: 2").unwrap();
        let third = head.find("X-First: again").unwrap();
        assert!(first < second && second < third);
        assert!(head.ends_with("\r\n\r\n"));
    }

    #[test]
    fn content_length_synthesized_from_body() {
        let mut resp = Response::new(200).body_bytes("hello");
        let head = head_string(&mut resp);
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Date: "));
    }

    #[test]
    fn explicit_content_length_not_duplicated() {
        let mut resp = Response::new(200)
            .header("Content-Length", "99")
            .body_bytes("hello");
        let head = head_string(&mut resp);
        assert_eq!(head.matches("Content-Length").count(), 1);
        assert!(head.contains("Content-Length: 99\r\n"));
    }

    #[test]
    fn empty_body_reports_zero_length() {
        let mut resp = Response::new(204);
        let head = head_string(&mut resp);
        assert!(head.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn set_header_overwrites() {
        let mut resp = Response::new(200)
            .header("Server", "a")
            .set_header("Server", "b");
        let head = head_string(&mut resp);
        assert!(head.contains("Server: b\r\n"));
        assert!(!head.contains("Server: a\r\n"));
    }

    #[test]
    fn close_flag_adds_connection_close() {
        let mut resp = Response::new(200).close_after_write(true);
        let head = head_string(&mut resp);
        assert!(head.contains("Connection: close\r\n"));
    }
}
