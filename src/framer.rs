//! Length-prefixed framing over a full-duplex byte stream (§4.1).
//!
//! Wire format: 4-byte little-endian unsigned length, followed by exactly
//! that many UTF-8 JSON bytes. There is no resync on a malformed length —
//! an oversize or zero-length prefix is fatal for the connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::FramerError;

/// Maximum frame payload, in bytes (§4.1).
pub const MAX_FRAME_BYTES: u32 = 256 * 1024;

/// Total budget for acquiring the write guard plus performing the write (§4.1, §5).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reads length-prefixed frames off an `AsyncRead` half. Owned by the single
/// reader task of a connection — there is intentionally no internal
/// synchronization since only one task ever calls `read_frame`.
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read exactly one frame's payload bytes.
    ///
    /// Returns `Ok(None)` on a clean close (zero-byte read while expecting
    /// the length prefix). Any other error is connection-fatal.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FramerError> {
        let mut len_buf = [0u8; 4];
        match read_exact_or_eof(&mut self.inner, &mut len_buf).await? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Short(got) => {
                return Err(FramerError::ShortRead {
                    expected: 4,
                    got,
                });
            }
            ReadOutcome::Full => {}
        }

        let len = u32::from_le_bytes(len_buf);
        if len == 0 {
            return Err(FramerError::ZeroLengthFrame);
        }
        if len > MAX_FRAME_BYTES {
            return Err(FramerError::OversizeFrame(len));
        }

        let mut payload = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut payload)
            .await
            .map_err(FramerError::Io)?;

        Ok(Some(payload))
    }
}

enum ReadOutcome {
    Full,
    Short(usize),
    Eof,
}

/// Like `read_exact`, but a zero-byte read on the very first attempt is
/// reported as a clean EOF rather than an error (§4.1's "zero-byte read
/// while expecting the length prefix means clean close").
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<ReadOutcome, FramerError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Short(filled)
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Writes length-prefixed frames onto an `AsyncWrite` half. Serializes
/// concurrent writers behind a mutex and bounds total write time (§4.1).
pub struct FrameWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Write one frame. Bounded by [`WRITE_TIMEOUT`] covering both mutex
    /// acquisition and the I/O itself; on timeout the write is abandoned
    /// with a warning but the connection is left open for the caller to
    /// decide what to do next (§4.1).
    pub async fn write_frame(&self, payload: &[u8]) -> Result<(), FramerError> {
        if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
            return Err(FramerError::OversizeFrame(payload.len() as u32));
        }

        let result = timeout(WRITE_TIMEOUT, async {
            let mut guard = self.inner.lock().await;
            let len = (payload.len() as u32).to_le_bytes();
            guard.write_all(&len).await?;
            guard.write_all(payload).await?;
            guard.flush().await?;
            Ok::<(), std::io::Error>(())
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(io_err)) => Err(FramerError::Io(io_err)),
            Err(_elapsed) => {
                tracing::warn!("writeFrame abandoned after {:?}", WRITE_TIMEOUT);
                Err(FramerError::WriteTimeout(WRITE_TIMEOUT))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_single_frame() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);

        let writer = FrameWriter::new(client_w);
        writer.write_frame(b"hello").await.unwrap();
        drop(writer);
        drop(client_r);

        let mut reader = FrameReader::new(server_r);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, b"hello");

        drop(server_w);
    }

    #[tokio::test]
    async fn clean_close_on_zero_byte_read() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);
        let mut reader = FrameReader::new(server);
        let frame = reader.read_frame().await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_fatal() {
        let (mut client, server) = tokio::io::duplex(8);
        let len: u32 = 300_000;
        tokio::spawn(async move {
            client.write_all(&len.to_le_bytes()).await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FramerError::OversizeFrame(300_000)));
        assert!(err.is_connection_fatal());
    }

    #[tokio::test]
    async fn zero_length_prefix_is_fatal() {
        let (mut client, server) = tokio::io::duplex(8);
        tokio::spawn(async move {
            client.write_all(&0u32.to_le_bytes()).await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, FramerError::ZeroLengthFrame));
    }

    #[tokio::test]
    async fn exactly_max_size_frame_is_accepted() {
        let (client, server) = tokio::io::duplex(1 << 20);
        let payload = vec![b'x'; MAX_FRAME_BYTES as usize];
        let (client_r, client_w) = tokio::io::split(client);
        drop(client_r);

        let writer = FrameWriter::new(client_w);
        writer.write_frame(&payload).await.unwrap();

        let mut reader = FrameReader::new(server);
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.len(), MAX_FRAME_BYTES as usize);
    }

    #[tokio::test]
    async fn writer_rejects_oversize_payload_before_sending() {
        let (_client, server) = tokio::io::duplex(16);
        let writer = FrameWriter::new(server);
        let payload = vec![0u8; MAX_FRAME_BYTES as usize + 1];
        let err = writer.write_frame(&payload).await.unwrap_err();
        assert!(matches!(err, FramerError::OversizeFrame(_)));
    }

    #[tokio::test]
    async fn concurrent_writers_do_not_interleave() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let writer = std::sync::Arc::new(FrameWriter::new(client));

        let mut handles = Vec::new();
        for i in 0..20u8 {
            let writer = writer.clone();
            let payload = vec![i; 100];
            handles.push(tokio::spawn(async move {
                writer.write_frame(&payload).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        drop(writer);

        let mut seen = 0;
        let mut reader = FrameReader::new(&mut server);
        while let Some(frame) = reader.read_frame().await.unwrap() {
            assert_eq!(frame.len(), 100);
            assert!(frame.iter().all(|b| *b == frame[0]));
            seen += 1;
            if seen == 20 {
                break;
            }
        }
        assert_eq!(seen, 20);
    }
}
