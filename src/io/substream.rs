//! Length-bounded slice over a byte stream

use crate::errors::HttpError;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Exposes exactly `N` bytes of an underlying stream.
///
/// On the read side it clamps every read to the remaining count and treats an
/// early EOF as an error. On the write side it rejects any write that would
/// exceed the promised length and can verify at the end that the promise was
/// kept. It never closes the underlying stream.
#[derive(Debug)]
pub struct Substream<T> {
    inner: T,
    remaining: u64,
    promised: u64,
}

impl<T> Substream<T> {
    pub fn new(inner: T, len: u64) -> Self {
        Self {
            inner,
            remaining: len,
            promised: len,
        }
    }

    pub fn end_of_stream(&self) -> bool {
        self.remaining == 0
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> Substream<T> {
    /// Reads at most `min(buf.len(), remaining)` bytes. Returns `Ok(0)` once
    /// the slice is exhausted; EOF before that is an `UnexpectedEof` error.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(self.remaining.min(usize::MAX as u64) as usize);
        let n = self.inner.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended before the promised length",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

impl<T: AsyncWrite + Unpin> Substream<T> {
    /// Writes the whole buffer, failing before any byte lands if it would
    /// exceed the promised length.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), HttpError> {
        if buf.len() as u64 > self.remaining {
            return Err(HttpError::Internal(format!(
                "body write of {} bytes exceeds the {} bytes left of Content-Length {}",
                buf.len(),
                self.remaining,
                self.promised
            )));
        }
        self.inner.write_all(buf).await?;
        self.remaining -= buf.len() as u64;
        Ok(())
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().await
    }

    /// Fails with [`HttpError::IncompleteBody`] unless exactly the promised
    /// number of bytes went through.
    pub fn verify_complete(&self) -> Result<(), HttpError> {
        if self.remaining != 0 {
            return Err(HttpError::IncompleteBody {
                promised: self.promised,
                written: self.promised - self.remaining,
            });
        }
        Ok(())
    }
}
