use std::fmt;
use std::path::Path;

use md5::{Digest, Md5};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Lowercase hex MD5 digest of a file's content, the same form Drive
/// reports in `md5Checksum`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compare against a checksum reported by the remote side.
    pub fn matches(&self, remote: &str) -> bool {
        self.0.eq_ignore_ascii_case(remote)
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the MD5 fingerprint of a file, reading in 64 KB chunks.
pub async fn fingerprint(path: &Path) -> std::io::Result<Fingerprint> {
    fingerprint_with_buffer(path, BUF_SIZE).await
}

async fn fingerprint_with_buffer(path: &Path, buf_size: usize) -> std::io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; buf_size];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(Fingerprint(hex_encode(&hasher.finalize())))
}

/// Fingerprint of an in-memory buffer.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    Fingerprint(hex_encode(&Md5::digest(data)))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
