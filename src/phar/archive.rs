use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::error::{PharError, Result};
use crate::io::{self, MemoryReader, ReadAt};

use super::builder::public_key_path;
use super::codec;
use super::extractor::{PharExtractor, Verification};
use super::info::PharInfo;
use super::structures::Compression;

/// An opened archive: the extractor plus where it came from.
pub struct PharArchive {
    name: String,
    local_path: Option<PathBuf>,
    archive_compression: Compression,
    stored_size: u64,
    extractor: PharExtractor<dyn ReadAt>,
}

impl PharArchive {
    /// Open a local path or an HTTP(S) URL.
    pub async fn open(location: &str) -> Result<Self> {
        let source = io::open_source(location).await?;
        let extractor = PharExtractor::open(source.reader).await?;
        Ok(Self {
            name: source.name,
            local_path: (!io::is_http_url(location)).then(|| PathBuf::from(location)),
            archive_compression: source.archive_compression,
            stored_size: source.stored_size,
            extractor,
        })
    }

    /// Open archive bytes held in memory, e.g. straight from the builder.
    pub async fn from_bytes(name: impl Into<String>, bytes: Vec<u8>) -> Result<Self> {
        let name = name.into();
        let stored_size = bytes.len() as u64;
        let archive_compression = codec::sniff_archive_compression(&bytes);
        let bytes = match archive_compression {
            Compression::None => bytes,
            compression => codec::decompress_archive(compression, &bytes, &name)?,
        };
        let reader: Arc<dyn ReadAt> = Arc::new(MemoryReader::new(bytes));
        Ok(Self {
            name,
            local_path: None,
            archive_compression,
            stored_size,
            extractor: PharExtractor::open(reader).await?,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn extractor(&self) -> &PharExtractor<dyn ReadAt> {
        &self.extractor
    }

    pub fn archive_compression(&self) -> Compression {
        self.archive_compression
    }

    pub async fn info(&self) -> Result<PharInfo> {
        Ok(PharInfo::new(
            self.name.clone(),
            self.extractor.manifest(),
            self.archive_compression,
            self.extractor.signature().await?,
            self.stored_size,
        ))
    }

    /// Verify the signature. For OpenSSL signatures without an explicit
    /// `public_key`, the `<archive>.pubkey` sibling of a local file is used.
    pub async fn verify(
        &self,
        public_key: Option<&str>,
        require_signature: bool,
    ) -> Result<Verification> {
        let needs_key = public_key.is_none()
            && self
                .extractor
                .signature()
                .await?
                .is_some_and(|s| s.algorithm().is_openssl());

        let sibling_key = match (&self.local_path, needs_key) {
            (Some(path), true) => Some(read_public_key(path).await?),
            _ => None,
        };

        self.extractor
            .verify(public_key.or(sibling_key.as_deref()), require_signature)
            .await
    }
}

async fn read_public_key(archive: &Path) -> Result<String> {
    let key_path = public_key_path(archive);
    debug!(path = %key_path.display(), "loading public key");
    tokio::fs::read_to_string(&key_path).await.map_err(|e| {
        PharError::Signature(format!(
            "cannot read public key '{}': {e}",
            key_path.display()
        ))
    })
}
