//! Parsed HTTP request handed to the application boundary.

use bytes::Bytes;

use super::headers::HeaderMap;

/// A complete HTTP request.
///
/// Immutable once the header block is complete; the body may still grow
/// until message-complete fires, after which the request crosses to the
/// main thread as a value.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    target: String,
    headers: HeaderMap,
    body: Bytes,
    peer_addr: Option<String>,
    local_addr: Option<String>,
}

impl Request {
    pub(crate) fn new(
        method: String,
        target: String,
        headers: HeaderMap,
        body: Bytes,
        peer_addr: Option<String>,
        local_addr: Option<String>,
    ) -> Self {
        Self {
            method,
            target,
            headers,
            body,
            peer_addr,
            local_addr,
        }
    }

    /// Request method, e.g. `GET`.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw request target as received (path plus optional query).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Path component of the target, split lazily.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// Query component of the target, without the `?`, split lazily.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Client address, when the transport has one.
    pub fn peer_addr(&self) -> Option<&str> {
        self.peer_addr.as_deref()
    }

    /// Server address, when the transport has one.
    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    /// Whether the client asked for the connection to close after the
    /// response.
    pub fn wants_close(&self) -> bool {
        self.headers.has_token("connection", "close")
    }
}
