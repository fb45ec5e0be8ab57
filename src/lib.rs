//! # runphar
//!
//! Build, inspect, verify, extract and compare PHAR archives.
//!
//! Archives are read through the [`ReadAt`] trait, so local files and
//! remote archives served over HTTP (using Range requests) go through the
//! same code paths. Only the stub, manifest and the entries actually read
//! are fetched from a remote archive.
//!
//! ## Features
//!
//! - Stub location with a configurable sentinel
//! - Manifest decoding with bounds checks on every field
//! - Per-entry NONE, GZ and BZ2 compression (`gzip` and `bzip2` features)
//! - Whole-archive gzip/bzip2 wrapping (`.phar.gz`, `.phar.bz2`)
//! - MD5, SHA-1, SHA-256, SHA-512 and OpenSSL signatures
//! - Size and CRC32 checks on every extracted entry
//! - File-name, checksum and textual (git/GNU diff) archive comparison
//!
//! ## Example
//!
//! ```no_run
//! use runphar::{BuildEntry, Compression, PharArchive, PharBuilder};
//! use runphar::phar::stub;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let phar = PharBuilder::new(stub::generate("app.phar", Some("index.php"), true))
//!         .build(vec![BuildEntry::file("index.php", "<?php echo 'hi';", Compression::Gz)])
//!         .await?;
//!     phar.write_to(std::path::Path::new("app.phar")).await?;
//!
//!     let archive = PharArchive::open("app.phar").await?;
//!     for entry in archive.extractor().entries() {
//!         println!("{}", entry.path);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod collect;
pub mod diff;
pub mod error;
pub mod io;
pub mod phar;

pub use cli::Cli;
pub use collect::{ContentTransformer, FileCollector};
pub use diff::{diff, DiffContext, DiffMode, DiffReport};
pub use error::{PharError, Result};
pub use io::{HttpRangeReader, LocalFileReader, MemoryReader, ReadAt};
pub use phar::{
    BuildEntry, BuildOptions, Compression, ExtractOptions, Manifest, PharArchive, PharBuilder,
    PharEntry, PharExtractor, PharInfo, Signature, SignatureAlgorithm, Verification,
};
