//! `Transfer-Encoding: chunked` framing, both directions

use crate::errors::HttpError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// A chunk-size line is a hex count plus optional extensions; anything past
// this length is hostile input, not a plausible size.
const MAX_SIZE_LINE: usize = 256;

/// Writes chunked framing over an underlying stream.
///
/// Every write emits `hex(len)\r\n`, the payload, and `\r\n`; `close` emits
/// the terminal `0\r\n\r\n` and is idempotent. The underlying stream is never
/// shut down here.
#[derive(Debug)]
pub struct ChunkedWriter<T> {
    inner: T,
    closed: bool,
    payload_bytes: u64,
}

impl<T> ChunkedWriter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            closed: false,
            payload_bytes: 0,
        }
    }

    /// Payload bytes written so far, excluding framing.
    pub fn payload_bytes(&self) -> u64 {
        self.payload_bytes
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncWrite + Unpin> ChunkedWriter<T> {
    /// Writes one chunk. Empty buffers are skipped: an empty chunk would be
    /// the terminator.
    pub async fn write(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if self.closed {
            return Err(HttpError::Internal("write after chunked close".into()));
        }
        if data.is_empty() {
            return Ok(());
        }

        let mut frame = Vec::with_capacity(data.len() + 16);
        frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.inner.write_all(&frame).await?;

        self.payload_bytes += data.len() as u64;
        Ok(())
    }

    /// Emits the terminal chunk. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), HttpError> {
        if self.closed {
            return Ok(());
        }
        self.inner.write_all(b"0\r\n\r\n").await?;
        self.closed = true;
        Ok(())
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush().await
    }
}

/// Reads chunked framing until the zero-length terminal chunk.
#[derive(Debug)]
pub struct ChunkedReader<T> {
    inner: T,
    remaining_in_chunk: u64,
    done: bool,
}

impl<T> ChunkedReader<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            remaining_in_chunk: 0,
            done: false,
        }
    }

    /// True once the terminal chunk and its trailing CRLF were consumed.
    pub fn end_of_stream(&self) -> bool {
        self.done
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> ChunkedReader<T> {
    /// Reads decoded payload bytes. `Ok(0)` once the stream is done.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }

        if self.remaining_in_chunk == 0 {
            let size = self.read_size_line().await?;
            if size == 0 {
                self.expect_crlf().await?;
                self.done = true;
                return Ok(0);
            }
            self.remaining_in_chunk = size;
        }

        let want = buf
            .len()
            .min(self.remaining_in_chunk.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(HttpError::ProtocolViolation(
                "connection closed inside a chunk".into(),
            ));
        }
        self.remaining_in_chunk -= n as u64;
        if self.remaining_in_chunk == 0 {
            self.expect_crlf().await?;
        }
        Ok(n)
    }

    async fn read_byte(&mut self) -> Result<u8, HttpError> {
        let mut byte = [0u8; 1];
        match self.inner.read_exact(&mut byte).await {
            Ok(_) => Ok(byte[0]),
            Err(_) => Err(HttpError::ProtocolViolation(
                "connection closed inside chunk framing".into(),
            )),
        }
    }

    /// Parses `hex-size[;extensions]\r\n`.
    async fn read_size_line(&mut self) -> Result<u64, HttpError> {
        let mut line = Vec::with_capacity(16);
        loop {
            let byte = self.read_byte().await?;
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_SIZE_LINE {
                return Err(HttpError::ProtocolViolation("chunk size line too long".into()));
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        let hex_end = line
            .iter()
            .position(|b| !b.is_ascii_hexdigit())
            .unwrap_or(line.len());
        if hex_end == 0 {
            return Err(HttpError::ProtocolViolation("empty chunk size".into()));
        }
        // Whatever follows the digits must be a chunk extension.
        if hex_end < line.len() && line[hex_end] != b';' {
            return Err(HttpError::ProtocolViolation("malformed chunk size line".into()));
        }

        let digits = std::str::from_utf8(&line[..hex_end])
            .map_err(|_| HttpError::ProtocolViolation("malformed chunk size line".into()))?;
        u64::from_str_radix(digits, 16)
            .map_err(|_| HttpError::ProtocolViolation("chunk size out of range".into()))
    }

    async fn expect_crlf(&mut self) -> Result<(), HttpError> {
        let cr = self.read_byte().await?;
        let lf = self.read_byte().await?;
        if (cr, lf) != (b'\r', b'\n') {
            return Err(HttpError::ProtocolViolation(
                "chunk payload not followed by CRLF".into(),
            ));
        }
        Ok(())
    }
}
