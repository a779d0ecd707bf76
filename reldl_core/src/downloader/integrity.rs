use std::io;

use base64::Engine;
use md5::{Digest, Md5};

use crate::downloader::sink::Sink;
use crate::types::error::DownloadError;

/// Read-back buffer used while hashing the output.
const VERIFY_BUFFER: usize = 256 * 1024;

/// MD5 of the first `len` bytes of the sink.
pub async fn md5_of_sink(sink: &dyn Sink, len: u64) -> io::Result<Vec<u8>> {
    let mut hasher = Md5::new();
    let mut offset = 0u64;
    while offset < len {
        let want = (len - offset).min(VERIFY_BUFFER as u64) as usize;
        let block = sink.read_at(offset, want).await?;
        if block.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("output ends at {} bytes, expected {}", offset, len),
            ));
        }
        hasher.update(&block);
        offset += block.len() as u64;
    }
    Ok(hasher.finalize().to_vec())
}

/// Compares the written output against the digest the origin advertised.
pub async fn verify(sink: &dyn Sink, len: u64, expected: &[u8]) -> Result<(), DownloadError> {
    let actual = md5_of_sink(sink, len).await?;
    if actual.as_slice() == expected {
        Ok(())
    } else {
        Err(DownloadError::IntegrityMismatch {
            expected: encode_digest(expected),
            actual: encode_digest(&actual),
        })
    }
}

/// Base64, the `Content-MD5` wire form.
pub fn encode_digest(digest: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(digest)
}
