//! Response compression: negotiation and streaming codecs

use flate2::write::{DeflateEncoder, GzEncoder};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// A content coding the server can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Brotli,
    Gzip,
    Deflate,
}

impl Compression {
    pub const fn token(&self) -> &'static str {
        match self {
            Compression::Brotli => "br",
            Compression::Gzip => "gzip",
            Compression::Deflate => "deflate",
        }
    }

    fn from_token(token: &str) -> Option<Compression> {
        match token {
            "br" => Some(Compression::Brotli),
            "gzip" => Some(Compression::Gzip),
            "deflate" => Some(Compression::Deflate),
            _ => None,
        }
    }

    /// Server preference used for tie-breaking equal client weights.
    const fn preference(&self) -> u8 {
        match self {
            Compression::Brotli => 3,
            Compression::Gzip => 2,
            Compression::Deflate => 1,
        }
    }
}

/// One parsed `Accept-Encoding` entry: `name[;q=weight]`.
///
/// Unrecognized algorithms parse with `algorithm: None` so they can still
/// participate in (and lose) negotiation. The weight is clamped to `[0, 1]`
/// and defaults to `1`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressionMethod {
    pub algorithm: Option<Compression>,
    pub weight: f32,
}

impl CompressionMethod {
    pub fn parse(entry: &str) -> CompressionMethod {
        let mut parts = entry.split(';');
        let name = parts.next().unwrap_or("").trim();

        let mut weight = 1.0f32;
        for param in parts {
            if let Some(q) = param.trim().strip_prefix("q=") {
                weight = q.trim().parse::<f32>().unwrap_or(1.0);
            }
        }

        CompressionMethod {
            algorithm: Compression::from_token(name),
            weight: weight.clamp(0.0, 1.0),
        }
    }
}

/// Picks the client's highest-weight algorithm the server supports; ties go
/// to the server's preference order (`br`, `gzip`, `deflate`).
pub fn negotiate(accept_encoding: Option<&str>) -> Option<Compression> {
    let header = accept_encoding?;

    let mut best: Option<(f32, Compression)> = None;
    for entry in header.split(',') {
        let method = CompressionMethod::parse(entry);
        let Some(algorithm) = method.algorithm else {
            continue;
        };
        if method.weight <= 0.0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((weight, current)) => {
                method.weight > weight
                    || (method.weight == weight && algorithm.preference() > current.preference())
            }
        };
        if better {
            best = Some((method.weight, algorithm));
        }
    }
    best.map(|(_, algorithm)| algorithm)
}

/// Shared output buffer the sync encoders write into, drained between async
/// socket writes.
#[derive(Debug, Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.0.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum Encoder {
    Gzip(GzEncoder<SharedBuf>),
    Deflate(DeflateEncoder<SharedBuf>),
    Brotli(Box<brotli::CompressorWriter<SharedBuf>>),
}

/// Streaming compressor over an in-memory drain.
///
/// The encoders are synchronous writers; the engine feeds payload in, drains
/// whatever compressed bytes are ready, and ships them through the chunked
/// framing. `finish` flushes the codec trailer.
pub(crate) struct Compressor {
    encoder: Encoder,
    out: SharedBuf,
}

impl Compressor {
    pub(crate) fn new(algorithm: Compression) -> Self {
        let out = SharedBuf::default();
        let encoder = match algorithm {
            Compression::Gzip => {
                Encoder::Gzip(GzEncoder::new(out.clone(), flate2::Compression::default()))
            }
            Compression::Deflate => Encoder::Deflate(DeflateEncoder::new(
                out.clone(),
                flate2::Compression::default(),
            )),
            Compression::Brotli => Encoder::Brotli(Box::new(brotli::CompressorWriter::new(
                out.clone(),
                4096,
                5,
                22,
            ))),
        };
        Self { encoder, out }
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.encoder {
            Encoder::Gzip(e) => e.write_all(data),
            Encoder::Deflate(e) => e.write_all(data),
            Encoder::Brotli(e) => e.write_all(data),
        }
    }

    /// Compressed bytes ready so far; empties the drain.
    pub(crate) fn take_output(&mut self) -> Vec<u8> {
        self.out.take()
    }

    /// Finalizes the stream and returns the trailing compressed bytes.
    pub(crate) fn finish(self) -> io::Result<Vec<u8>> {
        match self.encoder {
            Encoder::Gzip(e) => {
                e.finish()?;
            }
            Encoder::Deflate(e) => {
                e.finish()?;
            }
            Encoder::Brotli(mut e) => {
                e.flush()?;
                drop(e);
            }
        }
        Ok(self.out.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn method_parsing() {
        #[rustfmt::skip]
        let cases = [
            ("gzip",            Some(Compression::Gzip),    1.0),
            ("br",              Some(Compression::Brotli),  1.0),
            ("deflate;q=0.5",   Some(Compression::Deflate), 0.5),
            (" gzip ; q=0.25",  Some(Compression::Gzip),    0.25),
            ("gzip;q=7",        Some(Compression::Gzip),    1.0),   // clamped
            ("gzip;q=-1",       Some(Compression::Gzip),    0.0),   // clamped
            ("gzip;q=junk",     Some(Compression::Gzip),    1.0),   // default
            ("zstd",            None,                       1.0),
            ("identity;q=0",    None,                       0.0),
        ];

        for (entry, algorithm, weight) in cases {
            let method = CompressionMethod::parse(entry);
            assert_eq!(method.algorithm, algorithm, "{entry}");
            assert!((method.weight - weight).abs() < f32::EPSILON, "{entry}");
        }
    }

    #[test]
    fn negotiation() {
        #[rustfmt::skip]
        let cases = [
            (None,                              None),
            (Some(""),                          None),
            (Some("identity"),                  None),
            (Some("gzip"),                      Some(Compression::Gzip)),
            (Some("gzip, br"),                  Some(Compression::Brotli)),      // tie -> server pref
            (Some("gzip, deflate"),             Some(Compression::Gzip)),
            (Some("br;q=0.1, gzip;q=0.9"),      Some(Compression::Gzip)),
            (Some("gzip;q=0, deflate"),         Some(Compression::Deflate)),
            (Some("zstd, deflate;q=0.3"),       Some(Compression::Deflate)),
            (Some("gzip;q=0, br;q=0"),          None),
        ];

        for (header, expected) in cases {
            assert_eq!(negotiate(header), expected, "{header:?}");
        }
    }

    fn decompress(algorithm: Compression, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        match algorithm {
            Compression::Gzip => {
                flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
            }
            Compression::Deflate => {
                flate2::read::DeflateDecoder::new(data).read_to_end(&mut out).unwrap();
            }
            Compression::Brotli => {
                brotli::Decompressor::new(data, 4096).read_to_end(&mut out).unwrap();
            }
        }
        out
    }

    #[test]
    fn compression_is_transparent() {
        let payload: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();

        for algorithm in [Compression::Gzip, Compression::Deflate, Compression::Brotli] {
            let mut compressor = Compressor::new(algorithm);
            let mut wire = Vec::new();
            for piece in payload.chunks(777) {
                compressor.write(piece).unwrap();
                wire.extend_from_slice(&compressor.take_output());
            }
            wire.extend_from_slice(&compressor.finish().unwrap());

            assert_eq!(decompress(algorithm, &wire), payload, "{algorithm:?}");
        }
    }
}
