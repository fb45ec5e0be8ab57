use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{PharError, Result};
use crate::io::ReadAt;

use super::codec;
use super::parser::{PharParser, READ_CHUNK};
use super::signature::Signature;
use super::structures::{HALT_COMPILER, Manifest, PharEntry};

/// Prefix of the completion marker written into an extraction directory.
pub const EXTRACT_MARKER_PREFIX: &str = ".runphar-extracted-";

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Skip extraction when the directory already holds a completed
    /// extraction of the same archive content.
    pub use_cache: bool,
    /// Restore entry permission bits (unix only).
    pub restore_permissions: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            use_cache: true,
            restore_permissions: true,
        }
    }
}

/// Result of checking an archive's signature trailer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Unsigned,
    Valid(Signature),
    Invalid(Signature),
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid(_))
    }
}

/// PHAR reader: lists, reads, verifies and extracts entries.
pub struct PharExtractor<R: ReadAt + ?Sized> {
    parser: PharParser<R>,
    stub_end: u64,
    manifest: Manifest,
    data_offset: u64,
    offsets: Vec<u64>,
}

impl<R: ReadAt + ?Sized> PharExtractor<R> {
    /// Open an archive whose stub ends with `__HALT_COMPILER();`.
    pub async fn open(reader: Arc<R>) -> Result<Self> {
        Self::open_with_sentinel(reader, HALT_COMPILER).await
    }

    /// Open an archive whose stub ends with a custom sentinel.
    pub async fn open_with_sentinel(reader: Arc<R>, sentinel: &[u8]) -> Result<Self> {
        let parser = PharParser::new(reader);
        let stub_end = parser.locate_stub_end(sentinel).await?;
        Self::from_parser(parser, stub_end).await
    }

    /// Open an archive whose manifest starts at a known offset.
    pub async fn at_offset(reader: Arc<R>, stub_end: u64) -> Result<Self> {
        Self::from_parser(PharParser::new(reader), stub_end).await
    }

    async fn from_parser(parser: PharParser<R>, stub_end: u64) -> Result<Self> {
        let (manifest, data_offset) = parser.read_manifest(stub_end).await?;
        let offsets = manifest.data_offsets();

        let data_end = data_offset + manifest.data_size();
        if data_end > parser.size() {
            return Err(PharError::InvalidArchive(format!(
                "file data needs {} bytes after offset {data_offset} but the archive has {}",
                manifest.data_size(),
                parser.size() - data_offset
            )));
        }

        Ok(Self {
            parser,
            stub_end,
            manifest,
            data_offset,
            offsets,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// List all entries in manifest order
    pub fn entries(&self) -> &[PharEntry] {
        &self.manifest.entries
    }

    pub fn stub_end(&self) -> u64 {
        self.stub_end
    }

    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn data_end(&self) -> u64 {
        self.data_offset + self.manifest.data_size()
    }

    pub fn size(&self) -> u64 {
        self.parser.size()
    }

    pub async fn stub(&self) -> Result<Vec<u8>> {
        self.parser.read_range(0, self.stub_end).await
    }

    /// Stored (possibly compressed) bytes of entry `index`.
    pub async fn read_raw(&self, index: usize) -> Result<Vec<u8>> {
        let entry = &self.manifest.entries[index];
        self.parser
            .read_range(
                self.data_offset + self.offsets[index],
                u64::from(entry.compressed_size),
            )
            .await
    }

    /// Decompressed content of entry `index`, checked against the
    /// manifest's CRC32 and size.
    ///
    /// The CRC goes first: damaged data (including a stream the codec gave
    /// up on) is a checksum mismatch, and a size mismatch means the content
    /// is intact but the header disagrees with it.
    pub async fn read(&self, index: usize) -> Result<Vec<u8>> {
        let entry = &self.manifest.entries[index];
        let raw = self.read_raw(index).await?;
        let data = codec::decompress(
            entry.compression()?,
            &raw,
            entry.uncompressed_size,
            &entry.path,
        )?;

        let crc = crc32fast::hash(&data);
        if crc != entry.crc32 {
            return Err(PharError::ChecksumMismatch {
                path: entry.path.clone(),
                expected: entry.crc32,
                actual: crc,
            });
        }
        if data.len() as u64 != u64::from(entry.uncompressed_size) {
            return Err(PharError::SizeMismatch {
                path: entry.path.clone(),
                expected: u64::from(entry.uncompressed_size),
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    /// Decompressed content of the entry at `path`, if present.
    pub async fn read_path(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.manifest.entries.iter().position(|e| e.path == path) {
            Some(index) => self.read(index).await.map(Some),
            None => Ok(None),
        }
    }

    /// Fail unless every codec the entries need is compiled in.
    pub fn check_capabilities(&self) -> Result<()> {
        for entry in self.manifest.entries.iter().filter(|e| !e.is_directory()) {
            codec::ensure_available(entry.compression()?, &entry.path)?;
        }
        Ok(())
    }

    /// SHA-256 of the whole (uncompressed) archive, as lowercase hex.
    pub async fn content_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; READ_CHUNK];
        let mut offset = 0u64;
        while offset < self.size() {
            let want = (self.size() - offset).min(READ_CHUNK as u64) as usize;
            self.parser
                .reader()
                .read_exact_at(offset, &mut buf[..want])
                .await?;
            hasher.update(&buf[..want]);
            offset += want as u64;
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Read the signature trailer without checking it.
    pub async fn signature(&self) -> Result<Option<Signature>> {
        Ok(self
            .parser
            .read_signature(self.data_end())
            .await?
            .map(|(sig, _)| sig))
    }

    /// Check the signature trailer.
    ///
    /// With `require_signature`, an unsigned archive is an
    /// [`PharError::InvalidArchive`]. An archive whose manifest says it is
    /// signed but has no trailer is always invalid.
    pub async fn verify(
        &self,
        public_key: Option<&str>,
        require_signature: bool,
    ) -> Result<Verification> {
        let Some((signature, signed_len)) = self.parser.read_signature(self.data_end()).await?
        else {
            if self.manifest.is_signed() {
                return Err(PharError::InvalidArchive(
                    "manifest is flagged as signed but the signature trailer is missing".into(),
                ));
            }
            if require_signature {
                return Err(PharError::InvalidArchive("archive is not signed".into()));
            }
            return Ok(Verification::Unsigned);
        };

        let valid = self
            .parser
            .verify_signature(&signature, signed_len, public_key)
            .await?;
        debug!(
            algorithm = signature.algorithm().name(),
            valid, "checked signature"
        );
        Ok(if valid {
            Verification::Valid(signature)
        } else {
            Verification::Invalid(signature)
        })
    }

    /// Extract every entry below `output_dir`.
    ///
    /// Codec availability is checked before anything is written. The
    /// completion marker is only written once every entry succeeded.
    pub async fn extract(&self, output_dir: &Path, options: &ExtractOptions) -> Result<PathBuf> {
        self.check_capabilities()?;
        let targets = self
            .manifest
            .entries
            .iter()
            .map(|e| safe_join(output_dir, &e.path))
            .collect::<Result<Vec<_>>>()?;

        let marker = if options.use_cache {
            let hash = self.content_hash().await?;
            let marker = output_dir.join(format!("{EXTRACT_MARKER_PREFIX}{hash}"));
            if fs::try_exists(&marker).await.unwrap_or(false) {
                info!(dir = %output_dir.display(), "archive already extracted, skipping");
                return Ok(output_dir.to_path_buf());
            }
            Some(marker)
        } else {
            None
        };

        fs::create_dir_all(output_dir)
            .await
            .map_err(|e| PharError::path_io("create directory", output_dir, e))?;

        for (index, (entry, target)) in self.manifest.entries.iter().zip(&targets).enumerate() {
            if entry.is_directory() {
                fs::create_dir_all(target)
                    .await
                    .map_err(|e| PharError::path_io("create directory", target, e))?;
                continue;
            }

            let data = self.read(index).await?;
            self.extract_to_file(entry, &data, target, options).await?;
            debug!(path = %entry.path, size = data.len(), "extracted");
        }

        if let Some(marker) = marker {
            fs::write(&marker, format!("{} entries\n", self.manifest.entries.len()))
                .await
                .map_err(|e| PharError::path_io("write", &marker, e))?;
        }

        info!(
            entries = self.manifest.entries.len(),
            dir = %output_dir.display(),
            "extraction complete"
        );
        Ok(output_dir.to_path_buf())
    }

    async fn extract_to_file(
        &self,
        entry: &PharEntry,
        data: &[u8],
        output_path: &Path,
        options: &ExtractOptions,
    ) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PharError::path_io("create directory", parent, e))?;
            }
        }

        let mut file = fs::File::create(output_path)
            .await
            .map_err(|e| PharError::path_io("create", output_path, e))?;
        file.write_all(data)
            .await
            .map_err(|e| PharError::path_io("write", output_path, e))?;
        file.flush()
            .await
            .map_err(|e| PharError::path_io("write", output_path, e))?;

        #[cfg(unix)]
        if options.restore_permissions && entry.permissions() != 0 {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(
                output_path,
                std::fs::Permissions::from_mode(entry.permissions()),
            )
            .await
            .map_err(|e| PharError::path_io("set permissions on", output_path, e))?;
        }
        #[cfg(not(unix))]
        let _ = (entry, options);

        Ok(())
    }
}

/// Resolve an entry path below `root`, refusing absolute paths and `..`.
pub fn safe_join(root: &Path, entry_path: &str) -> Result<PathBuf> {
    let relative = Path::new(entry_path.trim_end_matches('/'));
    let mut out = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(PharError::UnsafePath(entry_path.to_string()));
            }
        }
    }
    if out == root {
        return Err(PharError::UnsafePath(entry_path.to_string()));
    }
    Ok(out)
}
