//! Directory collection feeding the builder.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;
use walkdir::WalkDir;

use crate::error::{PharError, Result};
use crate::phar::{BuildEntry, Compression};

/// Rewrites file content before it is packaged (for example a minifier).
///
/// The output is what gets hashed and sized in the manifest.
pub trait ContentTransformer: Send + Sync {
    fn transform(&self, path: &str, content: Vec<u8>) -> Result<Vec<u8>>;
}

/// Walks a directory tree into ordered [`BuildEntry`] values.
///
/// Logical paths are relative to the root, `/`-separated, sorted. Empty
/// directories are not recorded.
pub struct FileCollector {
    root: PathBuf,
    excludes: Vec<String>,
    skip: Vec<PathBuf>,
    compression: Compression,
    transformers: Vec<Box<dyn ContentTransformer>>,
}

impl FileCollector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            excludes: Vec::new(),
            skip: Vec::new(),
            compression: Compression::None,
            transformers: Vec::new(),
        }
    }

    /// Exclude paths matching a glob (`*`, `?`), a relative path prefix or
    /// a file name.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.excludes.push(pattern.into());
        self
    }

    /// Never collect this exact file, e.g. the archive being written.
    pub fn skip(mut self, path: &Path) -> Self {
        if let Ok(path) = path.canonicalize() {
            self.skip.push(path);
        }
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn transformer(mut self, transformer: impl ContentTransformer + 'static) -> Self {
        self.transformers.push(Box::new(transformer));
        self
    }

    fn is_excluded(&self, relative: &str) -> bool {
        let basename = relative.rsplit('/').next().unwrap_or(relative);
        self.excludes.iter().any(|pattern| {
            let pattern = pattern.trim_end_matches('/');
            relative == pattern
                || relative.starts_with(&format!("{pattern}/"))
                || glob_match(pattern, relative)
                || glob_match(pattern, basename)
        })
    }

    pub fn collect(&self) -> Result<Vec<BuildEntry>> {
        let mut entries = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                relative_path(&self.root, e.path())
                    .map_or(true, |rel| rel.is_empty() || !self.is_excluded(&rel))
            });

        for item in walker {
            let item = item.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
                PharError::path_io("walk", path, e.into())
            })?;
            if !item.file_type().is_file() {
                continue;
            }
            let path = item.path();
            if !self.skip.is_empty() {
                if let Ok(canonical) = path.canonicalize() {
                    if self.skip.contains(&canonical) {
                        continue;
                    }
                }
            }
            let Some(relative) = relative_path(&self.root, path) else {
                continue;
            };

            let mut content = std::fs::read(path).map_err(|e| PharError::path_io("read", path, e))?;
            for transformer in &self.transformers {
                content = transformer.transform(&relative, content)?;
            }

            let metadata = item
                .metadata()
                .map_err(|e| PharError::path_io("stat", path, e.into()))?;
            let mut entry = BuildEntry::file(relative, content, self.compression);
            entry.timestamp = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as u32);
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                entry.permissions = Some(metadata.permissions().mode() & 0o777);
            }
            entries.push(entry);
        }

        debug!(root = %self.root.display(), files = entries.len(), "collected files");
        Ok(entries)
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect();
    Some(parts.join("/"))
}

/// Simple glob pattern matching supporting `*` and `?` wildcards.
///
/// - `*` matches zero or more characters
/// - `?` matches exactly one character
///
/// ```
/// use runphar::collect::glob_match;
///
/// assert!(glob_match("*.txt", "readme.txt"));
/// assert!(glob_match("file?.dat", "file1.dat"));
/// assert!(!glob_match("*.txt", "readme.md"));
/// ```
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            // Star: skip it, or consume one character and keep it
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}
