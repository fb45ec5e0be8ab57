//! Compression codecs for entry data and whole-archive wrapping.
//!
//! Entry data uses raw DEFLATE (GZ) or a bzip2 stream (BZ2). A compressed
//! archive file is a gzip or bzip2 stream around the complete PHAR.
//! Which codecs exist depends on the `gzip` and `bzip2` features.

#[cfg(any(feature = "gzip", feature = "bzip2"))]
use std::io::{Read, Write};

#[cfg(any(feature = "gzip", feature = "bzip2"))]
use tracing::debug;

use crate::error::{PharError, Result};

use super::structures::Compression;

pub fn is_available(compression: Compression) -> bool {
    match compression {
        Compression::None => true,
        Compression::Gz => cfg!(feature = "gzip"),
        Compression::Bz2 => cfg!(feature = "bzip2"),
    }
}

fn codec_name(compression: Compression) -> &'static str {
    match compression {
        Compression::None => "none",
        Compression::Gz => "zlib (gzip)",
        Compression::Bz2 => "bzip2",
    }
}

/// Fail with [`PharError::MissingCapability`] when `compression` is not
/// compiled in.
pub fn ensure_available(compression: Compression, path: &str) -> Result<()> {
    if is_available(compression) {
        Ok(())
    } else {
        Err(PharError::MissingCapability {
            codec: codec_name(compression),
            path: path.to_string(),
        })
    }
}

/// Compress one entry's content.
pub fn compress(compression: Compression, data: &[u8], path: &str) -> Result<Vec<u8>> {
    ensure_available(compression, path)?;
    match compression {
        Compression::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        Compression::Gz => {
            let mut encoder = flate2::write::DeflateEncoder::new(
                Vec::with_capacity(data.len() / 2),
                flate2::Compression::default(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        #[cfg(feature = "bzip2")]
        Compression::Bz2 => {
            let mut encoder = bzip2::write::BzEncoder::new(
                Vec::with_capacity(data.len() / 2),
                bzip2::Compression::best(),
            );
            encoder.write_all(data)?;
            Ok(encoder.finish()?)
        }
        #[allow(unreachable_patterns)]
        _ => Err(PharError::MissingCapability {
            codec: codec_name(compression),
            path: path.to_string(),
        }),
    }
}

/// Decompress one entry's stored bytes.
///
/// Output is capped at one byte past `expected_len`, so a lying header
/// surfaces as a size mismatch instead of an unbounded allocation. A
/// corrupt stream is not an error here: whatever decoded before the
/// failure is returned and the caller's CRC check rejects it.
pub fn decompress(
    compression: Compression,
    data: &[u8],
    expected_len: u32,
    path: &str,
) -> Result<Vec<u8>> {
    ensure_available(compression, path)?;
    match compression {
        Compression::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        Compression::Gz => Ok(inflate(
            flate2::read::DeflateDecoder::new(data),
            data.len(),
            expected_len,
            path,
        )),
        #[cfg(feature = "bzip2")]
        Compression::Bz2 => Ok(inflate(
            bzip2::read::BzDecoder::new(data),
            data.len(),
            expected_len,
            path,
        )),
        #[allow(unreachable_patterns)]
        _ => Err(PharError::MissingCapability {
            codec: codec_name(compression),
            path: path.to_string(),
        }),
    }
}

// Upfront reservation never trusts the header beyond this multiple of the
// stored size; past it the buffer grows as data actually decodes.
#[cfg(any(feature = "gzip", feature = "bzip2"))]
const RESERVE_RATIO: usize = 4;

#[cfg(any(feature = "gzip", feature = "bzip2"))]
fn inflate(decoder: impl Read, stored_len: usize, expected_len: u32, path: &str) -> Vec<u8> {
    let reserve = (expected_len as usize).min(stored_len.saturating_mul(RESERVE_RATIO));
    let mut out = Vec::with_capacity(reserve);
    // read_to_end keeps what it decoded before an error
    if let Err(e) = decoder
        .take(u64::from(expected_len) + 1)
        .read_to_end(&mut out)
    {
        debug!("corrupt stream in '{path}' after {} bytes: {e}", out.len());
    }
    out
}

/// Detect a whole-file gzip or bzip2 wrapper from the leading bytes.
pub fn sniff_archive_compression(head: &[u8]) -> Compression {
    if head.starts_with(&[0x1f, 0x8b]) {
        Compression::Gz
    } else if head.starts_with(b"BZh") {
        Compression::Bz2
    } else {
        Compression::None
    }
}

/// Wrap a complete archive in a gzip or bzip2 stream.
pub fn compress_archive(compression: Compression, data: Vec<u8>, name: &str) -> Result<Vec<u8>> {
    ensure_available(compression, name)?;
    match compression {
        Compression::None => Ok(data),
        #[cfg(feature = "gzip")]
        Compression::Gz => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
        #[cfg(feature = "bzip2")]
        Compression::Bz2 => {
            let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::best());
            encoder.write_all(&data)?;
            Ok(encoder.finish()?)
        }
        #[allow(unreachable_patterns)]
        _ => Err(PharError::MissingCapability {
            codec: codec_name(compression),
            path: name.to_string(),
        }),
    }
}

/// Inverse of [`compress_archive`].
pub fn decompress_archive(compression: Compression, data: &[u8], name: &str) -> Result<Vec<u8>> {
    ensure_available(compression, name)?;
    match compression {
        Compression::None => Ok(data.to_vec()),
        #[cfg(feature = "gzip")]
        Compression::Gz => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        #[cfg(feature = "bzip2")]
        Compression::Bz2 => {
            let mut out = Vec::new();
            bzip2::read::BzDecoder::new(data).read_to_end(&mut out)?;
            Ok(out)
        }
        #[allow(unreachable_patterns)]
        _ => Err(PharError::MissingCapability {
            codec: codec_name(compression),
            path: name.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_passthrough() {
        let out = compress(Compression::None, b"<?php echo 1;", "a.php").unwrap();
        assert_eq!(out, b"<?php echo 1;");
        assert_eq!(
            decompress(Compression::None, &out, 13, "a.php").unwrap(),
            b"<?php echo 1;"
        );
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn gz_entries_are_raw_deflate() {
        let data = b"<?php\n".repeat(64);
        let packed = compress(Compression::Gz, &data, "a.php").unwrap();
        assert!(packed.len() < data.len());
        // no gzip header on entry data
        assert_ne!(&packed[..2], &[0x1f, 0x8b]);
        let unpacked = decompress(Compression::Gz, &packed, data.len() as u32, "a.php").unwrap();
        assert_eq!(unpacked, data);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn decompress_caps_output() {
        let data = vec![b'x'; 4096];
        let packed = compress(Compression::Gz, &data, "a").unwrap();
        let out = decompress(Compression::Gz, &packed, 10, "a").unwrap();
        assert_eq!(out.len(), 11);
    }

    #[cfg(feature = "gzip")]
    #[test]
    fn huge_claimed_size_is_not_preallocated() {
        let packed = compress(Compression::Gz, b"hello", "a").unwrap();
        let out = decompress(Compression::Gz, &packed, u32::MAX, "a").unwrap();
        assert_eq!(out, b"hello");
        assert!(out.capacity() < 1 << 20);
    }

    #[test]
    fn corrupt_streams_yield_partial_output() {
        let data = b"<?php echo 'corrupt me';\n".repeat(32);
        for compression in [Compression::Gz, Compression::Bz2] {
            if !is_available(compression) {
                continue;
            }
            let mut packed = compress(compression, &data, "a").unwrap();
            let mid = packed.len() / 2;
            packed[mid] ^= 0x20;
            packed.truncate(packed.len() - 2);
            let out = decompress(compression, &packed, data.len() as u32, "a").unwrap();
            assert_ne!(out, data, "{compression:?}");
            assert!(out.len() <= data.len() + 1);
        }
    }

    #[cfg(feature = "bzip2")]
    #[test]
    fn archive_wrapping_is_detected() {
        let wrapped = compress_archive(Compression::Bz2, b"<?php __HALT_COMPILER();".to_vec(), "a.phar")
            .unwrap();
        assert_eq!(sniff_archive_compression(&wrapped), Compression::Bz2);
        assert_eq!(
            decompress_archive(Compression::Bz2, &wrapped, "a.phar").unwrap(),
            b"<?php __HALT_COMPILER();"
        );
        assert_eq!(sniff_archive_compression(b"#!/usr/bin/env php"), Compression::None);
    }
}
