use std::io;
use std::path::PathBuf;

/// Errors raised while reading, writing, verifying or comparing PHAR archives.
///
/// Every variant aborts the operation in progress. A signature that simply
/// does not match is not an error; see [`crate::phar::Verification`].
#[derive(Debug, thiserror::Error)]
pub enum PharError {
    #[error("stub sentinel {sentinel:?} not found before end of file")]
    SentinelNotFound { sentinel: String },

    #[error("corrupt manifest at offset {offset}: {reason}")]
    CorruptManifest { offset: u64, reason: String },

    #[error("size mismatch for '{path}': manifest says {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("checksum mismatch for '{path}': manifest says {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    #[error("'{path}' needs the {codec} codec, which this build does not include")]
    MissingCapability { codec: &'static str, path: String },

    #[error("unknown compression flags {flags:#010x} for '{path}'")]
    UnknownCompression { path: String, flags: u32 },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed signature: {0}")]
    Signature(String),

    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    #[error("entry path '{0}' escapes the output directory")]
    UnsafePath(String),

    #[error("remote read failed: {0}")]
    Remote(String),

    #[error("external diff failed: {0}")]
    ExternalDiff(String),

    #[error("failed to {action} '{}': {source}", path.display())]
    PathIo {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PharError {
    pub(crate) fn corrupt(offset: u64, reason: impl Into<String>) -> Self {
        Self::CorruptManifest {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn path_io(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::PathIo {
            action,
            path: path.into(),
            source,
        }
    }
}

impl From<reqwest::Error> for PharError {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PharError>;
