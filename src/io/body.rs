//! Request and response body composition

use crate::errors::HttpError;
use crate::io::chunked::{ChunkedReader, ChunkedWriter};
use crate::io::compress::{Compression, Compressor};
use crate::io::substream::Substream;
use std::io::{Cursor, Read};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// The request body, exactly one adapter per request.
///
/// A body with known length is a [`Substream`]; a chunked body is a
/// [`ChunkedReader`]; an eagerly decoded form body is replayed from memory.
/// Whichever it is, the engine recovers the connection reader from it at the
/// end of the cycle.
#[derive(Debug)]
pub struct RequestBody<R> {
    kind: BodyKind<R>,
}

#[derive(Debug)]
enum BodyKind<R> {
    None,
    Buffered(Cursor<Vec<u8>>),
    Sized(Substream<R>),
    Chunked(ChunkedReader<R>),
    Taken,
}

impl<R> RequestBody<R> {
    pub(crate) fn empty() -> Self {
        Self { kind: BodyKind::None }
    }

    pub(crate) fn sized(reader: R, len: u64) -> Self {
        Self {
            kind: BodyKind::Sized(Substream::new(reader, len)),
        }
    }

    pub(crate) fn chunked(reader: R) -> Self {
        Self {
            kind: BodyKind::Chunked(ChunkedReader::new(reader)),
        }
    }

    pub(crate) fn buffered(bytes: Vec<u8>) -> Self {
        Self {
            kind: BodyKind::Buffered(Cursor::new(bytes)),
        }
    }

    /// Whether the body still depends on the connection (as opposed to
    /// being absent or replayed from memory).
    pub(crate) fn is_stream(&self) -> bool {
        matches!(self.kind, BodyKind::Sized(_) | BodyKind::Chunked(_))
    }

    /// True once every body byte was consumed (trivially true for absent
    /// and in-memory bodies at their end).
    pub fn end_of_stream(&self) -> bool {
        match &self.kind {
            BodyKind::None | BodyKind::Taken => true,
            BodyKind::Buffered(cursor) => cursor.position() >= cursor.get_ref().len() as u64,
            BodyKind::Sized(sub) => sub.end_of_stream(),
            BodyKind::Chunked(reader) => reader.end_of_stream(),
        }
    }

    /// Recovers the connection reader once the body is finished with it.
    pub(crate) fn take_reader(&mut self) -> Option<R> {
        match std::mem::replace(&mut self.kind, BodyKind::Taken) {
            BodyKind::Sized(sub) => Some(sub.into_inner()),
            BodyKind::Chunked(reader) => Some(reader.into_inner()),
            other => {
                self.kind = other;
                None
            }
        }
    }

    /// Swaps the body for an in-memory replay buffer, returning the
    /// connection reader that backed it.
    pub(crate) fn replace_with_buffer(&mut self, bytes: Vec<u8>) -> Option<R> {
        let reader = self.take_reader();
        self.kind = BodyKind::Buffered(Cursor::new(bytes));
        reader
    }
}

impl<R: AsyncRead + Unpin> RequestBody<R> {
    /// Reads body payload. `Ok(0)` at end of stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, HttpError> {
        match &mut self.kind {
            BodyKind::None | BodyKind::Taken => Ok(0),
            BodyKind::Buffered(cursor) => Ok(cursor.read(buf).map_err(HttpError::Io)?),
            BodyKind::Sized(sub) => Ok(sub.read(buf).await?),
            BodyKind::Chunked(reader) => reader.read(buf).await,
        }
    }

    /// Reads the whole body, failing with `413` once more than `cap` bytes
    /// have shown up.
    pub async fn read_to_end_capped(&mut self, cap: usize) -> Result<Vec<u8>, HttpError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8 * 1024];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            if out.len() + n > cap {
                return Err(HttpError::RequestTooLarge("request body exceeds the decode cap"));
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

/// How the response body reaches the socket, decided at header emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkMode {
    /// Raw bytes until close (no keep-alive, no length).
    Raw,
    /// Exactly this many bytes, enforced.
    Fixed(u64),
    /// Chunked framing.
    Chunked,
    /// Accept and discard (HEAD requests, body-forbidden statuses).
    Discard,
}

enum Sink<W> {
    Raw(W),
    Fixed(Substream<W>),
    Chunked(ChunkedWriter<W>),
    Discard(W),
}

/// The composed response body pipeline: optional compressor feeding either
/// chunked framing, a length-checked substream, or the raw socket.
///
/// Disposing the pipeline never closes the underlying socket; `finish` hands
/// it back to the engine.
pub struct ResponseBody<W> {
    sink: Sink<W>,
    compressor: Option<Compressor>,
    accepted: u64,
}

impl<W: AsyncWrite + Unpin> ResponseBody<W> {
    pub(crate) fn new(writer: W, mode: SinkMode, compression: Option<Compression>) -> Self {
        let sink = match mode {
            SinkMode::Raw => Sink::Raw(writer),
            SinkMode::Fixed(len) => Sink::Fixed(Substream::new(writer, len)),
            SinkMode::Chunked => Sink::Chunked(ChunkedWriter::new(writer)),
            SinkMode::Discard => Sink::Discard(writer),
        };
        Self {
            sink,
            compressor: compression.map(Compressor::new),
            accepted: 0,
        }
    }

    async fn sink_write(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.sink {
            Sink::Raw(w) => w.write_all(data).await.map_err(HttpError::Io),
            Sink::Fixed(sub) => sub.write_all(data).await,
            Sink::Chunked(chunked) => chunked.write(data).await,
            Sink::Discard(_) => Ok(()),
        }
    }

    /// Writes handler payload through the pipeline.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), HttpError> {
        self.accepted += data.len() as u64;
        match &mut self.compressor {
            Some(compressor) => {
                compressor.write(data).map_err(HttpError::Io)?;
                let ready = compressor.take_output();
                self.sink_write(&ready).await
            }
            None => self.sink_write(data).await,
        }
    }

    pub async fn flush(&mut self) -> Result<(), HttpError> {
        match &mut self.sink {
            Sink::Raw(w) | Sink::Discard(w) => w.flush().await.map_err(HttpError::Io),
            Sink::Fixed(sub) => sub.flush().await.map_err(HttpError::Io),
            Sink::Chunked(chunked) => chunked.flush().await.map_err(HttpError::Io),
        }
    }

    /// Payload bytes the handler wrote, before compression.
    pub fn payload_bytes(&self) -> u64 {
        self.accepted
    }

    /// Finalizes the pipeline in order: codec trailer, terminal chunk,
    /// length verification. Returns the socket writer and the payload count.
    pub(crate) async fn finish(mut self) -> Result<(W, u64), HttpError> {
        if let Some(compressor) = self.compressor.take() {
            let trailer = compressor.finish().map_err(HttpError::Io)?;
            self.sink_write(&trailer).await?;
        }

        let writer = match self.sink {
            Sink::Raw(w) | Sink::Discard(w) => w,
            Sink::Fixed(sub) => {
                sub.verify_complete()?;
                sub.into_inner()
            }
            Sink::Chunked(mut chunked) => {
                chunked.close().await?;
                chunked.into_inner()
            }
        };
        Ok((writer, self.accepted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn request_body_kinds() {
        let mut none: RequestBody<Cursor<Vec<u8>>> = RequestBody::empty();
        assert!(none.end_of_stream());
        let mut buf = [0u8; 4];
        assert_eq!(none.read(&mut buf).await.unwrap(), 0);

        let mut sized = RequestBody::sized(Cursor::new(b"abcdef".to_vec()), 4);
        assert!(!sized.end_of_stream());
        assert_eq!(sized.read_to_end_capped(1024).await.unwrap(), b"abcd");
        assert!(sized.end_of_stream());
        assert!(sized.take_reader().is_some());

        let mut chunked = RequestBody::chunked(Cursor::new(b"3\r\nxyz\r\n0\r\n\r\n".to_vec()));
        assert_eq!(chunked.read_to_end_capped(1024).await.unwrap(), b"xyz");
        assert!(chunked.end_of_stream());

        let mut buffered: RequestBody<Cursor<Vec<u8>>> = RequestBody::buffered(b"mem".to_vec());
        assert!(!buffered.is_stream());
        assert_eq!(buffered.read_to_end_capped(16).await.unwrap(), b"mem");
        assert!(buffered.end_of_stream());
        assert!(buffered.take_reader().is_none());
    }

    #[tokio::test]
    async fn capped_read_rejects_oversize() {
        let mut body = RequestBody::sized(Cursor::new(vec![0u8; 100]), 100);
        assert!(matches!(
            body.read_to_end_capped(64).await,
            Err(HttpError::RequestTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn replace_with_buffer_returns_reader() {
        let mut body = RequestBody::sized(Cursor::new(b"a=1".to_vec()), 3);
        body.read_to_end_capped(16).await.unwrap();

        let reader = body.replace_with_buffer(b"a=1".to_vec());
        assert!(reader.is_some());
        assert_eq!(body.read_to_end_capped(16).await.unwrap(), b"a=1");
    }

    #[tokio::test]
    async fn fixed_sink_verifies_length() {
        let mut body = ResponseBody::new(Vec::new(), SinkMode::Fixed(5), None);
        body.write_all(b"hello").await.unwrap();
        let (wire, accepted) = body.finish().await.unwrap();
        assert_eq!(wire, b"hello");
        assert_eq!(accepted, 5);

        let mut short = ResponseBody::new(Vec::new(), SinkMode::Fixed(5), None);
        short.write_all(b"hi").await.unwrap();
        assert!(matches!(
            short.finish().await,
            Err(HttpError::IncompleteBody { .. })
        ));
    }

    #[tokio::test]
    async fn chunked_sink_terminates() {
        let mut body = ResponseBody::new(Vec::new(), SinkMode::Chunked, None);
        body.write_all(b"data").await.unwrap();
        let (wire, _) = body.finish().await.unwrap();
        assert_eq!(wire, b"4\r\ndata\r\n0\r\n\r\n");
    }

    #[tokio::test]
    async fn discard_sink_swallows_everything() {
        let mut body = ResponseBody::new(Vec::new(), SinkMode::Discard, None);
        body.write_all(b"invisible").await.unwrap();
        let (wire, accepted) = body.finish().await.unwrap();
        assert!(wire.is_empty());
        assert_eq!(accepted, 9);
    }

    #[tokio::test]
    async fn compressed_chunked_round_trip() {
        use std::io::Read as _;

        let payload = b"repetitive payload ".repeat(64);
        let mut body = ResponseBody::new(Vec::new(), SinkMode::Chunked, Some(Compression::Gzip));
        for piece in payload.chunks(100) {
            body.write_all(piece).await.unwrap();
        }
        let (wire, accepted) = body.finish().await.unwrap();
        assert_eq!(accepted, payload.len() as u64);

        // unwrap the chunk framing, then gunzip
        let mut reader = crate::io::chunked::ChunkedReader::new(Cursor::new(wire));
        let mut compressed = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            compressed.extend_from_slice(&buf[..n]);
        }

        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(&compressed[..])
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }
}
