//! Content-derived entity tags

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha1::{Digest, Sha1};
use std::io::{self, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Files up to this size are hashed in full.
const FULL_HASH_LIMIT: u64 = 3_000_000;
/// Sample size taken from each end of larger files.
const SAMPLE: u64 = 1_000_000;

/// Computes the ETag for a file.
///
/// Small files hash their whole content with SHA-1. Large files hash the
/// first and last megabyte plus a 16-byte trailer of size and mtime (both
/// little-endian i64), so an append or a touch still changes the tag without
/// rereading gigabytes. The digest is URL-safe unpadded base64, quoted.
pub(crate) async fn compute_etag(
    file: &mut File,
    size: u64,
    modified_unix_ms: i64,
) -> io::Result<String> {
    let mut hasher = Sha1::new();
    file.seek(SeekFrom::Start(0)).await?;

    if size <= FULL_HASH_LIMIT {
        hash_exactly(file, size, &mut hasher).await?;
    } else {
        hash_exactly(file, SAMPLE, &mut hasher).await?;
        file.seek(SeekFrom::Start(size - SAMPLE)).await?;
        hash_exactly(file, SAMPLE, &mut hasher).await?;

        let mut tail = [0u8; 16];
        tail[..8].copy_from_slice(&(size as i64).to_le_bytes());
        tail[8..].copy_from_slice(&modified_unix_ms.to_le_bytes());
        hasher.update(tail);
    }

    let digest = hasher.finalize();
    Ok(format!("\"{}\"", URL_SAFE_NO_PAD.encode(digest)))
}

async fn hash_exactly(file: &mut File, mut count: u64, hasher: &mut Sha1) -> io::Result<()> {
    let mut buf = [0u8; 64 * 1024];
    while count > 0 {
        let want = buf.len().min(count.min(usize::MAX as u64) as usize);
        let n = file.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "file shrank while hashing",
            ));
        }
        hasher.update(&buf[..n]);
        count -= n as u64;
    }
    Ok(())
}
