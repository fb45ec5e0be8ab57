//! PHAR archive reading, writing and verification.
//!
//! ## Architecture
//!
//! - [`structures`]: format constants, entries and the manifest model
//! - [`manifest`]: binary manifest codec
//! - [`signature`]: signature trailer, hashing and OpenSSL signing
//! - [`parser`]: low-level reads over a [`ReadAt`](crate::io::ReadAt) source
//! - [`extractor`]: listing, integrity-checked reads and extraction
//! - [`builder`]: archive assembly
//!
//! ## PHAR Format Overview
//!
//! A PHAR file consists of:
//! 1. A stub: bootstrap code ending in `__HALT_COMPILER();`
//! 2. The manifest: archive fields and one record per entry
//! 3. Entry contents, concatenated in manifest order
//! 4. An optional signature trailer ending in `GBMB`
//!
//! Entry contents may be stored raw, as raw DEFLATE (GZ) or as bzip2
//! (BZ2). Independently, a whole archive may be wrapped in gzip or bzip2.
//!
//! ## Limitations
//!
//! - Tar- and zip-based PHAR variants are not supported
//! - Metadata blobs are carried opaquely, never unserialized

mod archive;
mod builder;
pub mod codec;
mod extractor;
mod info;
pub mod manifest;
mod parser;
pub mod signature;
pub mod structures;
pub mod stub;

pub use archive::PharArchive;
pub use builder::{public_key_path, BuildEntry, BuildOptions, Phar, PharBuilder};
pub use extractor::{safe_join, ExtractOptions, PharExtractor, Verification, EXTRACT_MARKER_PREFIX};
pub use info::{format_size, PharInfo};
pub use parser::PharParser;
pub use signature::{PrivateKey, Signature, SignatureAlgorithm};
pub use structures::*;
