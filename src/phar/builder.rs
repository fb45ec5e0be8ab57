use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::error::{PharError, Result};

use super::codec;
use super::signature::{self, PrivateKey, Signature, SignatureAlgorithm};
use super::structures::*;
use super::stub;

/// One file (or directory, when the path ends with `/`) to package.
///
/// `content` is the final original content: any transformation has
/// already happened, so CRC32 and size are computed from it as-is.
#[derive(Debug, Clone)]
pub struct BuildEntry {
    pub path: String,
    pub content: Vec<u8>,
    pub compression: Compression,
    pub timestamp: Option<u32>,
    pub permissions: Option<u32>,
    pub metadata: Vec<u8>,
}

impl BuildEntry {
    pub fn file(path: impl Into<String>, content: impl Into<Vec<u8>>, compression: Compression) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
            compression,
            timestamp: None,
            permissions: None,
            metadata: Vec::new(),
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.ends_with('/') {
            path.push('/');
        }
        Self::file(path, Vec::new(), Compression::None)
    }

    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub alias: Option<String>,
    /// Archive metadata blob, stored as-is (usually PHP-serialized).
    pub metadata: Option<Vec<u8>>,
    pub signature: Option<SignatureAlgorithm>,
    /// Needed for the OpenSSL signature variants.
    pub private_key: Option<PrivateKey>,
    /// Timestamp for entries that do not carry their own; defaults to now.
    pub timestamp: Option<u32>,
    /// Whole-file compression applied when the archive is written out.
    pub archive_compression: Compression,
}

/// A built archive.
#[derive(Debug, Clone)]
pub struct Phar {
    stub: Vec<u8>,
    manifest: Manifest,
    file_data: Vec<u8>,
    signature: Option<Signature>,
    archive_compression: Compression,
}

impl Phar {
    pub fn stub(&self) -> &[u8] {
        &self.stub
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn file_data(&self) -> &[u8] {
        &self.file_data
    }

    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    pub fn archive_compression(&self) -> Compression {
        self.archive_compression
    }

    /// The PHAR bytes: stub, manifest, file data and signature trailer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = signed_region(&self.stub, &self.manifest.to_bytes(), &self.file_data);
        if let Some(signature) = &self.signature {
            out.extend_from_slice(&signature.to_trailer());
        }
        out
    }

    /// The bytes as written to disk, with archive compression applied.
    pub fn to_file_bytes(&self) -> Result<Vec<u8>> {
        codec::compress_archive(self.archive_compression, self.to_bytes(), "archive")
    }

    /// Write the archive to `path` through a temporary sibling file that is
    /// renamed into place once complete. OpenSSL-signed archives also get
    /// their public key written to `<path>.pubkey`.
    pub async fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.to_file_bytes()?;
        let target = path.to_path_buf();
        tokio::task::spawn_blocking(move || persist_atomically(&target, &bytes))
            .await
            .map_err(|e| PharError::Io(std::io::Error::other(e)))??;

        if let Some(public_key) = self.signature.as_ref().and_then(Signature::public_key) {
            let key_path = public_key_path(path);
            let key = public_key.as_bytes().to_vec();
            tokio::task::spawn_blocking(move || persist_atomically(&key_path, &key))
                .await
                .map_err(|e| PharError::Io(std::io::Error::other(e)))??;
        }

        info!(path = %path.display(), entries = self.manifest.entries.len(), "wrote archive");
        Ok(())
    }
}

/// Sibling file holding the public key of an OpenSSL-signed archive.
pub fn public_key_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".pubkey");
    PathBuf::from(name)
}

fn persist_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(".runphar-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| PharError::path_io("create temporary file in", dir, e))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.flush())
        .map_err(|e| PharError::path_io("write", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| PharError::path_io("rename into", path, e.error))?;
    Ok(())
}

fn signed_region(stub: &[u8], manifest: &[u8], file_data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(stub.len() + manifest.len() + file_data.len() + 76);
    out.extend_from_slice(stub);
    out.extend_from_slice(manifest);
    out.extend_from_slice(file_data);
    out
}

/// Assembles archives from materialized entries.
///
/// Entry compression runs on the blocking thread pool; the manifest is
/// assembled afterwards in one sequential pass, since every entry's data
/// offset depends on the compressed sizes before it.
#[derive(Debug, Clone)]
pub struct PharBuilder {
    stub: Vec<u8>,
    options: BuildOptions,
}

struct Packed {
    entry: PharEntry,
    data: Vec<u8>,
}

impl PharBuilder {
    pub fn new(stub: impl Into<Vec<u8>>) -> Self {
        Self {
            stub: stub.into(),
            options: BuildOptions::default(),
        }
    }

    pub fn with_options(mut self, options: BuildOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub async fn build(&self, entries: Vec<BuildEntry>) -> Result<Phar> {
        let stub = stub::normalize(&self.stub)?;
        self.preflight(&entries)?;

        let now = self.options.timestamp.unwrap_or_else(unix_now);

        let mut jobs = Vec::with_capacity(entries.len());
        for entry in entries {
            jobs.push(tokio::task::spawn_blocking(move || pack(entry, now)));
        }
        let mut packed = Vec::with_capacity(jobs.len());
        for job in jobs {
            packed.push(
                job.await
                    .map_err(|e| PharError::Io(std::io::Error::other(e)))??,
            );
        }

        // Second, sequential pass: sizes are known, lay out the data.
        let data_len: usize = packed.iter().map(|p| p.data.len()).sum();
        let mut file_data = Vec::with_capacity(data_len);
        let mut manifest_entries = Vec::with_capacity(packed.len());
        for Packed { entry, data } in packed {
            file_data.extend_from_slice(&data);
            manifest_entries.push(entry);
        }

        let mut manifest = Manifest::new(manifest_entries);
        manifest.alias = self.options.alias.clone().filter(|a| !a.is_empty());
        manifest.metadata = self.options.metadata.clone().filter(|m| !m.is_empty());
        if self.options.signature.is_some() {
            manifest.global_flags |= flags::SIGNED;
        }

        let signature = match self.options.signature {
            Some(algorithm) => {
                let region = signed_region(&stub, &manifest.to_bytes(), &file_data);
                Some(signature::compute(
                    &region,
                    algorithm,
                    self.options.private_key.as_ref(),
                )?)
            }
            None => None,
        };

        debug!(
            entries = manifest.entries.len(),
            data_len = file_data.len(),
            signature = signature.as_ref().map(|s| s.algorithm().name()),
            "built archive"
        );

        Ok(Phar {
            stub,
            manifest,
            file_data,
            signature,
            archive_compression: self.options.archive_compression,
        })
    }

    /// Everything that can fail without doing real work fails here, before
    /// any compression starts.
    fn preflight(&self, entries: &[BuildEntry]) -> Result<()> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in entries {
            validate_entry_path(&entry.path)?;
            if !seen.insert(entry.path.as_str()) {
                return Err(PharError::InvalidArchive(format!(
                    "duplicate entry '{}'",
                    entry.path
                )));
            }
            if entry.content.len() > u32::MAX as usize {
                return Err(PharError::InvalidArchive(format!(
                    "'{}' is larger than 4 GiB",
                    entry.path
                )));
            }
            codec::ensure_available(entry.compression, &entry.path)?;
        }
        codec::ensure_available(self.options.archive_compression, "archive")?;

        // Same bound the reader enforces, so a built archive always reopens.
        let manifest_len = MANIFEST_HEADER_SIZE
            + self.options.alias.as_ref().map_or(0, String::len)
            + self.options.metadata.as_ref().map_or(0, Vec::len)
            + entries
                .iter()
                .map(|e| ENTRY_FIXED_SIZE + e.path.len() + e.metadata.len())
                .sum::<usize>();
        if manifest_len > MAX_MANIFEST_SIZE as usize {
            return Err(PharError::InvalidArchive(format!(
                "manifest would be {manifest_len} bytes, over the {MAX_MANIFEST_SIZE} byte limit"
            )));
        }

        if let Some(algorithm) = self.options.signature {
            if algorithm.is_openssl() {
                let key = self.options.private_key.as_ref().ok_or_else(|| {
                    PharError::Signing(format!("{} signing needs a private key", algorithm.name()))
                })?;
                key.validate()?;
            }
        }
        Ok(())
    }
}

fn validate_entry_path(path: &str) -> Result<()> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty()
        || path.starts_with('/')
        || path.contains('\\')
        || trimmed.split('/').any(|c| c.is_empty() || c == "." || c == "..")
    {
        return Err(PharError::UnsafePath(path.to_string()));
    }
    Ok(())
}

fn pack(entry: BuildEntry, now: u32) -> Result<Packed> {
    let is_directory = entry.path.ends_with('/');
    let compression = if is_directory {
        Compression::None
    } else {
        entry.compression
    };
    let data = codec::compress(compression, &entry.content, &entry.path)?;
    if data.len() > u32::MAX as usize {
        return Err(PharError::InvalidArchive(format!(
            "'{}' is larger than 4 GiB once compressed",
            entry.path
        )));
    }

    let default_permissions = if is_directory {
        flags::DEFAULT_DIR_PERMISSIONS
    } else {
        flags::DEFAULT_FILE_PERMISSIONS
    };
    let permissions = entry.permissions.unwrap_or(default_permissions) & flags::PERMISSIONS_MASK;

    Ok(Packed {
        entry: PharEntry {
            uncompressed_size: entry.content.len() as u32,
            timestamp: entry.timestamp.unwrap_or(now),
            compressed_size: data.len() as u32,
            crc32: crc32fast::hash(&entry.content),
            flags: permissions | compression.as_flag(),
            metadata: entry.metadata,
            path: entry.path,
        },
        data,
    })
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}
