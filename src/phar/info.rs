use std::collections::BTreeMap;

use chrono::DateTime;

use super::signature::Signature;
use super::structures::{Compression, Manifest};

/// Archive-level summary, shown by `info` and compared first by `diff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PharInfo {
    pub name: String,
    /// Whole-file compression (`.phar.gz`), distinct from per-entry
    /// compression.
    pub archive_compression: Compression,
    /// Number of file entries per entry compression.
    pub files_compression: BTreeMap<Compression, usize>,
    pub signature: Option<Signature>,
    pub alias: Option<String>,
    pub metadata: Option<Vec<u8>>,
    pub api_version: u16,
    pub timestamp: Option<u32>,
    pub file_count: usize,
    /// Size of the archive as stored.
    pub size: u64,
}

impl PharInfo {
    pub fn new(
        name: impl Into<String>,
        manifest: &Manifest,
        archive_compression: Compression,
        signature: Option<Signature>,
        size: u64,
    ) -> Self {
        let mut files_compression = BTreeMap::new();
        for entry in manifest.files() {
            // Unknown flags are reported when the entry is read.
            let compression = entry.compression().unwrap_or_default();
            *files_compression.entry(compression).or_insert(0) += 1;
        }

        Self {
            name: name.into(),
            archive_compression,
            files_compression,
            signature,
            alias: manifest.alias.clone(),
            metadata: manifest.metadata.clone(),
            api_version: manifest.api_version,
            timestamp: manifest.timestamp(),
            file_count: manifest.files().count(),
            size,
        }
    }

    /// `None`, a single algorithm name, or a percentage breakdown when
    /// entries use different compression.
    pub fn files_compression_label(&self) -> String {
        match self.files_compression.len() {
            0 => Compression::None.name().to_string(),
            1 => self
                .files_compression
                .keys()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            _ => self
                .files_compression
                .iter()
                .map(|(c, n)| {
                    format!("{} ({:.2}%)", c.name(), *n as f64 * 100.0 / self.file_count as f64)
                })
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    pub fn api_version_label(&self) -> String {
        format!(
            "{}.{}.{}",
            self.api_version >> 12,
            (self.api_version >> 8) & 0xF,
            (self.api_version >> 4) & 0xF
        )
    }

    /// `key: value` lines without the archive name, in a fixed order so
    /// two summaries can be compared line by line.
    pub fn summary_lines(&self) -> Vec<String> {
        let signature = match &self.signature {
            Some(sig) => vec![
                format!("Signature: {}", sig.algorithm().name()),
                format!("Signature Hash: {}", sig.hash()),
            ],
            None => vec!["Signature: None".to_string()],
        };

        let metadata = match &self.metadata {
            Some(m) => String::from_utf8_lossy(m).into_owned(),
            None => "None".to_string(),
        };

        let timestamp = match self.timestamp {
            Some(ts) => match DateTime::from_timestamp(i64::from(ts), 0) {
                Some(dt) => format!("{ts} ({})", dt.to_rfc3339()),
                None => ts.to_string(),
            },
            None => "None".to_string(),
        };

        let mut lines = vec![
            format!("API Version: {}", self.api_version_label()),
            format!("Archive Compression: {}", self.archive_compression.name()),
            format!("Files Compression: {}", self.files_compression_label()),
        ];
        lines.extend(signature);
        lines.push(format!(
            "Alias: {}",
            self.alias.as_deref().unwrap_or("None")
        ));
        lines.push(format!("Metadata: {metadata}"));
        lines.push(format!("Timestamp: {timestamp}"));
        lines.push(format!(
            "Contents: {} file{} ({})",
            self.file_count,
            if self.file_count == 1 { "" } else { "s" },
            format_size(self.size)
        ));
        lines
    }
}

/// Format a byte size into a human-readable string.
///
/// Automatically selects the appropriate unit (bytes, KB, MB, GB)
/// based on the size magnitude.
///
/// # Examples
///
/// ```
/// use runphar::phar::format_size;
///
/// assert_eq!(format_size(500), "500 bytes");
/// assert_eq!(format_size(1536), "1.50 KB");
/// assert_eq!(format_size(1048576), "1.00 MB");
/// ```
pub fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
