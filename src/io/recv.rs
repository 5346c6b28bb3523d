//! Buffered reading over the connection's receive half

use crate::errors::HttpError;
use memchr::memchr;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

const READ_CHUNK: usize = 8 * 1024;
const COMPACT_THRESHOLD: usize = 8 * 1024;

/// Growable receive buffer over a byte stream.
///
/// Extracts head lines for the request parser and chunk-size scanning, and
/// doubles as an [`AsyncRead`] that serves buffered bytes before touching the
/// underlying stream - which is what lets a request body start with bytes
/// that arrived together with the head.
#[derive(Debug)]
pub struct RecvBuffer<R> {
    reader: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R> RecvBuffer<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Bytes received but not yet consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Hands out the unconsumed bytes, e.g. for a protocol upgrade.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        let leftover = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        leftover
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn compact(&mut self) {
        if self.pos >= COMPACT_THRESHOLD {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

impl<R: AsyncRead + Unpin> RecvBuffer<R> {
    /// Pulls more bytes from the stream into the buffer. `Ok(0)` is EOF.
    async fn fill(&mut self) -> io::Result<usize> {
        self.compact();
        let mut chunk = [0u8; READ_CHUNK];
        let n = self.reader.read(&mut chunk).await?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Reads one line terminated by `\n`, stripping the terminator and an
    /// optional preceding `\r`.
    ///
    /// Returns `Ok(None)` on a clean EOF with nothing buffered - the idle
    /// peer simply went away. EOF in the middle of a line is a protocol
    /// violation, and a line longer than `max` overflows the request.
    pub async fn read_line(&mut self, max: usize) -> Result<Option<Vec<u8>>, HttpError> {
        loop {
            if let Some(offset) = memchr(b'\n', &self.buf[self.pos..]) {
                let end = self.pos + offset;
                let mut line = self.buf[self.pos..end].to_vec();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                self.pos = end + 1;
                if self.pos == self.buf.len() {
                    self.buf.clear();
                    self.pos = 0;
                }
                return Ok(Some(line));
            }

            if self.buf.len() - self.pos > max {
                return Err(HttpError::RequestTooLarge("header line exceeds the line cap"));
            }

            if self.fill().await? == 0 {
                if self.pos == self.buf.len() {
                    return Ok(None);
                }
                return Err(HttpError::ProtocolViolation(
                    "connection closed in the middle of a header line".into(),
                ));
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for RecvBuffer<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        if me.pos < me.buf.len() {
            let available = me.buf.len() - me.pos;
            let n = available.min(out.remaining());
            out.put_slice(&me.buf[me.pos..me.pos + n]);
            me.pos += n;
            if me.pos == me.buf.len() {
                me.buf.clear();
                me.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut me.reader).poll_read(cx, out)
    }
}
