//! Extended-write driver.
//!
//! Pulls one chunk at a time from a [`DataSource`] and writes it to the
//! socket, waiting for the OS write queue to drain before pulling the
//! next chunk. In-flight memory stays at roughly one chunk per active
//! write, which is the engine's only backpressure mechanism.

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::source::DataSource;
use crate::error::{Error, Result};

/// Bytes requested from the source per pull.
pub const WRITE_CHUNK: usize = 64 * 1024;

/// Drain `source` onto `sock`. Returns the number of body bytes written.
///
/// End-of-stream terminates the loop normally; a source read failure is
/// surfaced as [`Error::Source`] and a socket failure as [`Error::Io`].
/// Either way the caller treats the write as complete and disposes of the
/// response.
pub async fn write_source<W>(sock: &mut W, source: &mut (dyn DataSource + Send)) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0u64;
    loop {
        let chunk = source.get_data(WRITE_CHUNK).map_err(Error::Source)?;
        if chunk.is_empty() {
            break;
        }
        sock.write_all(&chunk).await?;
        // Wait for the queued bytes to reach the OS before the next pull.
        sock.flush().await?;
        written += chunk.len() as u64;
    }
    Ok(written)
}
