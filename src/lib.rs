//! # Sockline: embedded event-driven HTTP and WebSocket server engine
//!
//! Sockline accepts TCP (or Unix-domain) connections, parses HTTP
//! requests incrementally, negotiates and frames WebSocket traffic across
//! three historical protocol dialects, optionally compresses frame
//! payloads with permessage-deflate, and streams response bodies
//! (in-memory, file-backed, or gzip-encoded) without blocking the event
//! loop.
//!
//! The engine is embedded: the host process supplies request-handling
//! logic through the [`Handler`] trait on its own "main" thread while all
//! network I/O runs on a dedicated background thread. The two threads
//! exchange work exclusively through mutex-guarded task queues; the main
//! thread references connections by numeric handle, never by pointer.
//!
//! ## Example
//!
//! ```no_run
//! use sockline::{Config, Endpoint, Handler, Request, Response, Server};
//!
//! struct App;
//!
//! impl Handler for App {
//!     fn on_request(&mut self, request: Request) -> Response {
//!         Response::new(200)
//!             .header("Content-Type", "text/plain")
//!             .body_bytes(format!("hello from {}", request.path()))
//!     }
//! }
//!
//! # fn main() -> sockline::Result<()> {
//! let mut server = Server::bind(Config::new(Endpoint::tcp("127.0.0.1", 8080)), App)?;
//! loop {
//!     // The embedder's loop: drain engine callbacks alongside its own work.
//!     server.pump(std::time::Duration::from_millis(50));
//! }
//! # }
//! ```

pub mod error;
pub mod exec;
pub mod http;
pub mod io;
pub mod ws;

mod conn;
mod server;

pub use error::{CloseReason, Error, Result};
pub use exec::{current_role, register_role, Role};
pub use http::{HeaderMap, Request, Response};
pub use io::{BufferSource, DataSource, FileSource, GzipSource};
pub use server::{Handler, Server, WsHandle};
pub use ws::{DeflateOptions, Dialect};

/// Largest payload length encodable in the 7-bit length field.
pub const LEN7_MAX: usize = 125;

/// Largest payload length encodable in the 16-bit extended length field.
pub const LEN16_MAX: usize = 65535;

/// Maximum WebSocket frame header size (2 + 8 + 4 bytes).
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// WebSocket GUID appended to the key for the accept-key digest.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Receive buffer size per connection.
pub const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Where the engine listens for connections.
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// A TCP host/port pair.
    Tcp {
        /// Interface to bind.
        host: String,
        /// Port to bind; 0 picks an ephemeral port.
        port: u16,
    },
    /// A named local endpoint (Unix-domain socket).
    #[cfg(unix)]
    Unix {
        /// Filesystem path of the socket.
        path: std::path::PathBuf,
    },
}

impl Endpoint {
    /// A TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp {
            host: host.into(),
            port,
        }
    }

    /// A Unix-domain endpoint.
    #[cfg(unix)]
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        Endpoint::Unix { path: path.into() }
    }
}

/// Engine configuration, accepted at server-creation time.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener endpoint.
    pub endpoint: Endpoint,
    /// Maximum accepted HTTP header-block size.
    pub max_header_size: usize,
    /// Maximum accepted request body size.
    pub max_body_size: usize,
    /// Maximum accepted WebSocket frame payload.
    pub max_frame_size: usize,
    /// Maximum reassembled WebSocket message size.
    pub max_message_size: usize,
    /// permessage-deflate tuning; `None` disables the extension.
    pub deflate: Option<DeflateOptions>,
}

impl Config {
    /// Configuration with defaults for everything but the endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_header_size: 8 * 1024,
            max_body_size: 16 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            deflate: Some(DeflateOptions::default()),
        }
    }
}
