use chrono::{DateTime, Utc};

use crate::error::{PharError, Result};

/// Sentinel closing the stub; the manifest starts right after it.
pub const HALT_COMPILER: &[u8] = b"__HALT_COMPILER();";

/// What the builder writes after the sentinel.
pub const STUB_TERMINATOR: &[u8] = b" ?>\r\n";

/// Magic closing a signed archive.
pub const SIGNATURE_MAGIC: &[u8; 4] = b"GBMB";

/// Manifest API version 1.1.1, stored big-endian with the low nibble unused.
pub const API_VERSION: u16 = 0x1110;
pub const API_VERSION_MASK: u16 = 0xF000;

/// Largest manifest accepted when reading.
pub const MAX_MANIFEST_SIZE: u32 = 100 * 1024 * 1024;

/// Fixed part of an entry record, excluding path and metadata bytes.
pub const ENTRY_FIXED_SIZE: usize = 28;

/// Manifest header size after `manifest_len`, excluding alias and metadata.
pub const MANIFEST_HEADER_SIZE: usize = 18;

pub mod flags {
    pub const PERMISSIONS_MASK: u32 = 0x0000_01FF;
    pub const COMPRESSED_GZ: u32 = 0x0000_1000;
    pub const COMPRESSED_BZ2: u32 = 0x0000_2000;
    pub const COMPRESSION_MASK: u32 = 0x0000_F000;
    /// Global flag: a signature trailer follows the file data.
    pub const SIGNED: u32 = 0x0001_0000;

    pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;
    pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;
}

/// Compression algorithms, used both per entry ("files compression") and
/// for wrapping a whole archive ("archive compression").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Compression {
    #[default]
    None,
    Gz,
    Bz2,
}

impl Compression {
    /// Decode the compression bits of an entry's flags.
    pub fn from_flags(entry_flags: u32, path: &str) -> Result<Self> {
        match entry_flags & flags::COMPRESSION_MASK {
            0 => Ok(Compression::None),
            flags::COMPRESSED_GZ => Ok(Compression::Gz),
            flags::COMPRESSED_BZ2 => Ok(Compression::Bz2),
            _ => Err(PharError::UnknownCompression {
                path: path.to_string(),
                flags: entry_flags,
            }),
        }
    }

    pub fn as_flag(&self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gz => flags::COMPRESSED_GZ,
            Compression::Bz2 => flags::COMPRESSED_BZ2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "None",
            Compression::Gz => "GZ",
            Compression::Bz2 => "BZ2",
        }
    }
}

impl std::str::FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Compression::None),
            "gz" | "gzip" => Ok(Compression::Gz),
            "bz2" | "bzip2" => Ok(Compression::Bz2),
            other => Err(format!("unknown compression '{other}' (expected none, gz or bz2)")),
        }
    }
}

/// One manifest record: a packaged file, or a directory when the path ends
/// with `/`.
///
/// `crc32` and `uncompressed_size` always describe the decompressed
/// content; `compressed_size` is the number of bytes actually stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PharEntry {
    pub path: String,
    pub uncompressed_size: u32,
    pub timestamp: u32,
    pub compressed_size: u32,
    pub crc32: u32,
    pub flags: u32,
    pub metadata: Vec<u8>,
}

impl PharEntry {
    pub fn is_directory(&self) -> bool {
        self.path.ends_with('/')
    }

    pub fn compression(&self) -> Result<Compression> {
        Compression::from_flags(self.flags, &self.path)
    }

    pub fn permissions(&self) -> u32 {
        self.flags & flags::PERMISSIONS_MASK
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(i64::from(self.timestamp), 0)
    }
}

/// Decoded manifest: the archive's entry index plus archive-level fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub entries: Vec<PharEntry>,
    pub alias: Option<String>,
    pub metadata: Option<Vec<u8>>,
    /// Archive flags; after decoding this also carries the OR of every
    /// entry's compression bits.
    pub global_flags: u32,
    pub api_version: u16,
}

impl Manifest {
    pub fn new(entries: Vec<PharEntry>) -> Self {
        let global_flags = entries
            .iter()
            .fold(0, |acc, e| acc | (e.flags & flags::COMPRESSION_MASK));
        Self {
            entries,
            alias: None,
            metadata: None,
            global_flags,
            api_version: API_VERSION,
        }
    }

    pub fn has_gz(&self) -> bool {
        self.global_flags & flags::COMPRESSED_GZ != 0
    }

    pub fn has_bz2(&self) -> bool {
        self.global_flags & flags::COMPRESSED_BZ2 != 0
    }

    pub fn is_signed(&self) -> bool {
        self.global_flags & flags::SIGNED != 0
    }

    /// Total length of the file data region.
    pub fn data_size(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.compressed_size))
            .sum()
    }

    /// Offset of every entry's data relative to the start of the data region.
    pub fn data_offsets(&self) -> Vec<u64> {
        let mut offset = 0u64;
        self.entries
            .iter()
            .map(|e| {
                let current = offset;
                offset += u64::from(e.compressed_size);
                current
            })
            .collect()
    }

    pub fn find(&self, path: &str) -> Option<&PharEntry> {
        self.entries.iter().find(|e| e.path == path)
    }

    pub fn files(&self) -> impl Iterator<Item = &PharEntry> {
        self.entries.iter().filter(|e| !e.is_directory())
    }

    /// Newest entry timestamp, used as the archive timestamp.
    pub fn timestamp(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.timestamp).max()
    }
}
