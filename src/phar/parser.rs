//! Low-level PHAR parser.
//!
//! This module reads the binary PHAR layout from any source that
//! implements the [`ReadAt`] trait.
//!
//! ## Parsing Strategy
//!
//! A PHAR is read from both ends:
//! 1. Scan forward for the stub sentinel; the manifest starts after it
//! 2. Read the manifest length, then the whole manifest in one request
//! 3. Entry data follows the manifest, at offsets implied by entry order
//! 4. The optional signature trailer is located from the last 8 bytes
//!
//! Listing an archive therefore only touches the stub, the manifest and
//! the tail, which keeps HTTP Range usage low.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{PharError, Result};
use crate::io::ReadAt;

use super::signature::{self, Signature, SignatureVerifier};
use super::structures::*;
use super::stub::{self, SentinelMatcher};

/// Chunk size for sequential scans and hashing.
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Low-level PHAR parser.
///
/// Typically used through [`PharExtractor`](super::PharExtractor)
/// rather than directly.
pub struct PharParser<R: ReadAt + ?Sized> {
    /// The underlying data source
    reader: Arc<R>,
    /// Total size of the archive in bytes
    size: u64,
}

impl<R: ReadAt + ?Sized> PharParser<R> {
    pub fn new(reader: Arc<R>) -> Self {
        let size = reader.size();
        Self { reader, size }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Find the offset where the manifest begins.
    ///
    /// Scans for `sentinel`, then skips an optional ` ?>` and an optional
    /// `\r\n` or `\n` after it.
    ///
    /// # Errors
    ///
    /// [`PharError::SentinelNotFound`] when the data ends first.
    pub async fn locate_stub_end(&self, sentinel: &[u8]) -> Result<u64> {
        let mut matcher = SentinelMatcher::new(sentinel);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut offset = 0u64;

        while offset < self.size {
            let n = self.reader.read_at(offset, &mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(i) = buf[..n].iter().position(|&b| matcher.feed(b)) {
                let end = offset + i as u64 + 1;
                let mut after = [0u8; 5];
                let available = (self.size - end).min(after.len() as u64) as usize;
                self.reader
                    .read_exact_at(end, &mut after[..available])
                    .await?;
                let stub_end = end + stub::terminator_len(&after[..available]) as u64;
                debug!(stub_end, "located end of stub");
                return Ok(stub_end);
            }
            offset += n as u64;
        }

        Err(PharError::SentinelNotFound {
            sentinel: stub::sentinel_display(sentinel),
        })
    }

    /// Read and decode the manifest starting at `stub_end`.
    ///
    /// # Returns
    ///
    /// The manifest and the offset where file data begins.
    pub async fn read_manifest(&self, stub_end: u64) -> Result<(Manifest, u64)> {
        if stub_end + 4 > self.size {
            return Err(PharError::corrupt(stub_end, "truncated manifest length"));
        }
        let mut len_buf = [0u8; 4];
        self.reader.read_exact_at(stub_end, &mut len_buf).await?;
        let manifest_len = u32::from_le_bytes(len_buf);

        if manifest_len > MAX_MANIFEST_SIZE {
            return Err(PharError::corrupt(
                stub_end,
                format!("manifest length {manifest_len} exceeds the {MAX_MANIFEST_SIZE} byte limit"),
            ));
        }
        let end = stub_end + 4 + u64::from(manifest_len);
        if end > self.size {
            return Err(PharError::corrupt(
                stub_end,
                format!(
                    "manifest length {manifest_len} runs past the end of the archive ({} bytes)",
                    self.size
                ),
            ));
        }

        // Read the entire manifest in one request
        let mut buf = vec![0u8; 4 + manifest_len as usize];
        self.reader.read_exact_at(stub_end, &mut buf).await?;
        let manifest = Manifest::from_bytes(&buf)?;

        debug!(
            entries = manifest.entries.len(),
            manifest_len,
            "decoded manifest"
        );
        Ok((manifest, end))
    }

    /// Read the signature trailer, if any.
    ///
    /// `data_end` is where the file data ends; a trailer reaching into the
    /// file data is rejected.
    ///
    /// # Returns
    ///
    /// The signature and the length of the signed prefix, or `None` for
    /// an unsigned archive.
    pub async fn read_signature(&self, data_end: u64) -> Result<Option<(Signature, u64)>> {
        if self.size < data_end + 8 {
            return Ok(None);
        }
        let mut footer = [0u8; 8];
        self.reader.read_exact_at(self.size - 8, &mut footer).await?;
        let Some(algorithm) = signature::parse_footer(&footer)? else {
            return Ok(None);
        };

        let (digest_len, trailer_len) = match algorithm.digest_len() {
            Some(len) => (len as u64, len as u64 + 8),
            None => {
                if self.size < data_end + 12 {
                    return Err(PharError::Signature(
                        "OpenSSL trailer is missing its length field".into(),
                    ));
                }
                let mut len_buf = [0u8; 4];
                self.reader
                    .read_exact_at(self.size - 12, &mut len_buf)
                    .await?;
                let len = u64::from(u32::from_le_bytes(len_buf));
                (len, len + 12)
            }
        };

        if trailer_len > self.size - data_end {
            return Err(PharError::Signature(format!(
                "{} trailer of {trailer_len} bytes overlaps the file data",
                algorithm.name()
            )));
        }
        let signed_len = self.size - trailer_len;
        if signed_len != data_end {
            warn!(
                signed_len,
                data_end, "unexpected bytes between file data and signature"
            );
        }

        let mut digest = vec![0u8; digest_len as usize];
        self.reader.read_exact_at(signed_len, &mut digest).await?;
        Ok(Some((Signature::from_raw(algorithm, digest), signed_len)))
    }

    /// Recompute `signature` over the first `signed_len` bytes.
    pub async fn verify_signature(
        &self,
        signature: &Signature,
        signed_len: u64,
        public_key: Option<&str>,
    ) -> Result<bool> {
        let mut verifier = SignatureVerifier::new(signature.algorithm())?;
        let mut buf = vec![0u8; READ_CHUNK];
        let mut offset = 0u64;
        while offset < signed_len {
            let want = (signed_len - offset).min(READ_CHUNK as u64) as usize;
            self.reader.read_exact_at(offset, &mut buf[..want]).await?;
            verifier.update(&buf[..want])?;
            offset += want as u64;
        }
        verifier.finish(signature, public_key)
    }

    /// Read `len` bytes at `offset`.
    pub async fn read_range(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len as usize];
        self.reader.read_exact_at(offset, &mut buf).await?;
        Ok(buf)
    }

    /// Get a reference to the underlying reader.
    pub fn reader(&self) -> &Arc<R> {
        &self.reader
    }
}
