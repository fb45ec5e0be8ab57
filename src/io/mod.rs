mod http;
mod local;
mod memory;

pub use http::HttpRangeReader;
pub use local::LocalFileReader;
pub use memory::MemoryReader;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{PharError, Result};
use crate::phar::{codec, Compression};

/// Trait for random access reading from a data source
#[async_trait]
pub trait ReadAt: Send + Sync {
    /// Read data at the specified offset into the buffer
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Get the total size of the data source
    fn size(&self) -> u64;

    /// Fill `buf` completely, failing if the source ends first.
    async fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..]).await?;
            if n == 0 {
                return Err(PharError::InvalidArchive(format!(
                    "unexpected end of data at offset {} (wanted {} more bytes)",
                    offset + filled as u64,
                    buf.len() - filled
                )));
            }
            filled += n;
        }
        Ok(())
    }
}

/// A PHAR source opened from a path or URL.
pub struct Source {
    pub reader: Arc<dyn ReadAt>,
    /// Whole-file compression that was stripped while opening.
    pub archive_compression: Compression,
    /// Size of the source as stored, before any whole-file decompression.
    pub stored_size: u64,
    pub name: String,
}

pub fn is_http_url(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Open a local path or HTTP URL.
///
/// Archives wrapped in a whole-file gzip or bzip2 layer (`.phar.gz`,
/// `.phar.bz2`) are inflated into memory; plain archives stay random access.
pub async fn open_source(location: &str) -> Result<Source> {
    let reader: Arc<dyn ReadAt> = if is_http_url(location) {
        Arc::new(HttpRangeReader::new(location.to_string()).await?)
    } else {
        Arc::new(LocalFileReader::new(Path::new(location))?)
    };
    let stored_size = reader.size();

    let mut magic = [0u8; 3];
    let n = reader.read_at(0, &mut magic).await?;
    let archive_compression = codec::sniff_archive_compression(&magic[..n]);

    let reader = match archive_compression {
        Compression::None => reader,
        compression => {
            debug!(%location, codec = compression.name(), "inflating whole-file compression");
            let mut raw = vec![0u8; stored_size as usize];
            reader.read_exact_at(0, &mut raw).await?;
            let inflated = codec::decompress_archive(compression, &raw, location)?;
            Arc::new(MemoryReader::new(inflated)) as Arc<dyn ReadAt>
        }
    };

    let name = location
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(location)
        .to_string();

    Ok(Source {
        reader,
        archive_compression,
        stored_size,
        name,
    })
}
