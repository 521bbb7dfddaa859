use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use memmap2::Mmap;

/// Algorithm tag recorded in manifests and run metadata.
pub const HASH_ALGORITHM: &str = "blake3";

/// Length of a hex-encoded identity.
pub const IDENTITY_HEX_LEN: usize = 64;

/// Read buffer used for streaming hashes and random writes.
pub const IO_BUFFER_SIZE: usize = 1 << 20;

/// Files at or above this size are hashed through a read-only mapping.
pub const MMAP_THRESHOLD: u64 = 16 << 20;

/// Content identity of a whole byte stream.
pub fn digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Incremental form of [`digest`], for content that is produced or read in slices.
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    pub fn finalize(&self) -> String {
        self.inner.finalize().to_hex().to_string()
    }
}

/// Hash an open file with bounded memory. `buf` is the caller's reusable read buffer.
pub fn digest_reader(f: &mut File, buf: &mut [u8]) -> io::Result<String> {
    let len = f.metadata()?.len();
    if len >= MMAP_THRESHOLD {
        // Safety: the mapping is read-only and dropped before returning. Files
        // truncated underneath us surface as a mismatch at worst.
        let map = unsafe { Mmap::map(&*f)? };
        return Ok(digest(&map));
    }
    let mut h = ContentHasher::new();
    loop {
        let n = f.read(buf)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finalize())
}

/// Hash the file at `path`.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    digest_reader(&mut f, &mut buf)
}

/// File name for a digest. Attempt 0 is the bare digest; later attempts add
/// a `-N` suffix to keep identical content from clobbering an earlier file.
pub fn name_for(digest: &str, attempt: u32) -> String {
    if attempt == 0 {
        digest.to_string()
    } else {
        format!("{digest}-{attempt}")
    }
}

/// Strip a disambiguation suffix, returning the digest part of a name.
pub fn digest_part(name: &str) -> &str {
    name.split_once('-').map_or(name, |(d, _)| d)
}

/// A name is valid when it is a lowercase hex identity, optionally followed by
/// `-N`. Anything else (separators, dots, `..`) could escape the directory.
pub fn is_valid_name(name: &str) -> bool {
    let (hex, suffix) = match name.split_once('-') {
        Some((h, s)) => (h, Some(s)),
        None => (name, None),
    };
    let hex_ok = hex.len() == IDENTITY_HEX_LEN
        && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    let suffix_ok = match suffix {
        None => true,
        Some(s) => !s.is_empty() && s.len() <= 10 && s.bytes().all(|b| b.is_ascii_digit()),
    };
    hex_ok && suffix_ok
}

/// A digest is valid when it is a bare hex identity.
pub fn is_valid_digest(d: &str) -> bool {
    !d.contains('-') && is_valid_name(d)
}
