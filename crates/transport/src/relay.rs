use std::{
    fmt, io,
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Why a relay direction stopped copying.
#[derive(Debug)]
pub enum RelayEnd {
    /// The reader reached end of stream.
    Eof,
    ReadError(io::Error),
    WriteError(io::Error),
    /// The sibling direction asked this one to stop.
    Stopped,
}

impl RelayEnd {
    pub fn is_eof(&self) -> bool {
        matches!(self, RelayEnd::Eof)
    }
}

impl fmt::Display for RelayEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEnd::Eof => write!(f, "peer closed"),
            RelayEnd::ReadError(err) => write!(f, "read failed: {err}"),
            RelayEnd::WriteError(err) => write!(f, "write failed: {err}"),
            RelayEnd::Stopped => write!(f, "stopped by sibling"),
        }
    }
}

/// Copies `reader` into `writer` one chunk at a time until either side fails.
///
/// At most `buffer_size` bytes are in flight; the next read only starts once
/// the previous chunk was fully accepted by `writer`. Every delivered chunk is
/// added to `transferred`, so the count is accurate even if the future is
/// dropped mid-copy.
pub async fn relay<R, W>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
    transferred: &AtomicU64,
) -> RelayEnd
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; buffer_size.max(1)];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return RelayEnd::Eof,
            Ok(n) => n,
            Err(err) => return RelayEnd::ReadError(err),
        };

        if let Err(err) = writer.write_all(&buf[..n]).await {
            return RelayEnd::WriteError(err);
        }
        if let Err(err) = writer.flush().await {
            return RelayEnd::WriteError(err);
        }

        transferred.fetch_add(n as u64, Ordering::Relaxed);
    }
}
