//! Streaming response I/O: pull-based data sources and the socket write
//! driver.

pub mod source;
pub mod writer;

pub use source::{BufferSource, DataSource, FileSource, GzipSource};
pub use writer::{write_source, WRITE_CHUNK};
