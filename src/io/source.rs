//! Pull-based byte sources backing response bodies.
//!
//! A source yields chunks until it returns an empty chunk, which signals
//! end-of-stream and occurs exactly once; callers must not pull again
//! after that. `get_data` is never called with a zero-byte request.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Bytes, BytesMut};
use flate2::write::GzEncoder;
use flate2::Compression;

/// Producer of response body chunks.
pub trait DataSource {
    /// Total number of bytes this source will yield, when known up front.
    fn total_len(&self) -> Option<u64>;

    /// Pull the next chunk of at most `max` bytes. `max` is never zero.
    /// An empty chunk signals end-of-stream and is returned exactly once;
    /// no further calls may follow it.
    fn get_data(&mut self, max: usize) -> io::Result<Bytes>;
}

/// Serves from an owned in-memory buffer, advancing a cursor.
pub struct BufferSource {
    data: Bytes,
    finished: bool,
}

impl BufferSource {
    /// Create a source over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            finished: false,
        }
    }
}

impl DataSource for BufferSource {
    fn total_len(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn get_data(&mut self, max: usize) -> io::Result<Bytes> {
        debug_assert!(max > 0, "zero-byte pull");
        debug_assert!(!self.finished, "pull after end-of-stream");
        if self.data.is_empty() {
            self.finished = true;
            return Ok(Bytes::new());
        }
        Ok(self.data.split_to(max.min(self.data.len())))
    }
}

/// Serves a file opened read-only for sequential scanning.
///
/// In owned mode the path is unlinked right after a successful open, so
/// the fileset is cleaned up even if the process later decides not to
/// consume the body; the open handle keeps the data readable to the end.
pub struct FileSource {
    file: File,
    len: u64,
    finished: bool,
}

impl FileSource {
    /// Open `path` for streaming. With `owned` set, the path is deleted
    /// once the open succeeds.
    pub fn open(path: impl AsRef<Path>, owned: bool) -> io::Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if owned {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), %err, "failed to unlink owned file");
            }
        }
        Ok(Self {
            file,
            len,
            finished: false,
        })
    }
}

impl DataSource for FileSource {
    fn total_len(&self) -> Option<u64> {
        Some(self.len)
    }

    fn get_data(&mut self, max: usize) -> io::Result<Bytes> {
        debug_assert!(max > 0, "zero-byte pull");
        debug_assert!(!self.finished, "pull after end-of-stream");
        let mut buf = BytesMut::zeroed(max);
        let n = self.file.read(&mut buf)?;
        if n == 0 {
            self.finished = true;
            return Ok(Bytes::new());
        }
        buf.truncate(n);
        Ok(buf.freeze())
    }
}

/// Gzip-compresses another source on the fly.
///
/// The inner source is pulled chunk by chunk and fed through a gzip
/// encoder; once the inner source signals end-of-stream the encoder is
/// finished, flushing the trailer. Total size is unknown, so responses
/// carrying this source are EOF-delimited.
pub struct GzipSource {
    inner: Box<dyn DataSource + Send>,
    encoder: Option<GzEncoder<Vec<u8>>>,
    pending: Bytes,
    finished: bool,
}

impl GzipSource {
    /// Wrap `inner`, compressing at the default gzip level.
    pub fn new(inner: impl DataSource + Send + 'static) -> Self {
        Self::with_level(inner, Compression::default())
    }

    /// Wrap `inner` with an explicit compression level.
    pub fn with_level(inner: impl DataSource + Send + 'static, level: Compression) -> Self {
        Self {
            inner: Box::new(inner),
            encoder: Some(GzEncoder::new(Vec::new(), level)),
            pending: Bytes::new(),
            finished: false,
        }
    }
}

impl DataSource for GzipSource {
    fn total_len(&self) -> Option<u64> {
        None
    }

    fn get_data(&mut self, max: usize) -> io::Result<Bytes> {
        debug_assert!(max > 0, "zero-byte pull");
        debug_assert!(!self.finished, "pull after end-of-stream");

        while self.pending.is_empty() && self.encoder.is_some() {
            let chunk = self.inner.get_data(max)?;
            if chunk.is_empty() {
                // Inner end-of-stream: flush the gzip trailer.
                let out = self.encoder.take().expect("encoder present").finish()?;
                self.pending = out.into();
                break;
            }
            let encoder = self.encoder.as_mut().expect("encoder present");
            encoder.write_all(&chunk)?;
            let out = std::mem::take(encoder.get_mut());
            if !out.is_empty() {
                self.pending = out.into();
            }
        }

        if self.pending.is_empty() {
            self.finished = true;
            return Ok(Bytes::new());
        }
        Ok(self.pending.split_to(max.min(self.pending.len())))
    }
}
