//! Archive comparison.
//!
//! Archive-level metadata is always compared first. Entry contents are then
//! compared in one of four [`DiffMode`]s, from cheapest (`file-name`) to
//! line-level textual diffs run by an external tool.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use sha2::{Digest, Sha384};
use tokio::process::Command;
use tracing::debug;

use crate::error::{PharError, Result};
use crate::io::ReadAt;
use crate::phar::{ExtractOptions, PharArchive, PharExtractor, PharInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiffMode {
    /// Paths only. Entries present on both sides are never compared.
    #[default]
    FileName,
    /// SHA-384 of each decompressed entry.
    Checksum,
    /// `git diff --no-index` over extracted trees.
    Git,
    /// GNU `diff -ru` over extracted trees.
    Gnu,
}

impl DiffMode {
    pub fn name(&self) -> &'static str {
        match self {
            DiffMode::FileName => "file-name",
            DiffMode::Checksum => "checksum",
            DiffMode::Git => "git",
            DiffMode::Gnu => "gnu",
        }
    }
}

impl FromStr for DiffMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file-name" | "filename" => Ok(DiffMode::FileName),
            "checksum" => Ok(DiffMode::Checksum),
            "git" => Ok(DiffMode::Git),
            "gnu" | "diff" => Ok(DiffMode::Gnu),
            other => Err(format!(
                "unknown diff mode '{other}' (expected file-name, checksum, git or gnu)"
            )),
        }
    }
}

/// Per-invocation state for the diff engine: external tools are located at
/// most once per context.
#[derive(Debug, Default)]
pub struct DiffContext {
    git: OnceLock<Option<PathBuf>>,
    gnu: OnceLock<Option<PathBuf>>,
}

impl DiffContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the executable a textual mode runs, if it is installed.
    pub fn executable(&self, mode: DiffMode) -> Option<&Path> {
        let (cell, program) = match mode {
            DiffMode::Git => (&self.git, "git"),
            DiffMode::Gnu => (&self.gnu, "diff"),
            DiffMode::FileName | DiffMode::Checksum => return None,
        };
        cell.get_or_init(|| {
            let found = which::which(program).ok();
            debug!(program, path = ?found, "located diff executable");
            found
        })
        .as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumChange {
    pub path: String,
    pub left: String,
    pub right: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentDiff {
    FileNames {
        only_in_left: Vec<String>,
        only_in_right: Vec<String>,
    },
    Checksums {
        /// Paths with the SHA-384 of their content. Directories carry an
        /// empty hash.
        only_in_left: Vec<(String, String)>,
        only_in_right: Vec<(String, String)>,
        changed: Vec<ChecksumChange>,
    },
    /// Output of the external tool; empty when the trees are identical.
    Text { output: String },
}

impl ContentDiff {
    pub fn is_empty(&self) -> bool {
        match self {
            ContentDiff::FileNames {
                only_in_left,
                only_in_right,
            } => only_in_left.is_empty() && only_in_right.is_empty(),
            ContentDiff::Checksums {
                only_in_left,
                only_in_right,
                changed,
            } => only_in_left.is_empty() && only_in_right.is_empty() && changed.is_empty(),
            ContentDiff::Text { output } => output.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffReport {
    pub left: PharInfo,
    pub right: PharInfo,
    /// Unified diff of the two summaries, `None` when they match.
    pub metadata_diff: Option<String>,
    pub content: ContentDiff,
}

impl DiffReport {
    pub fn has_differences(&self) -> bool {
        self.metadata_diff.is_some() || !self.content.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(metadata) = &self.metadata_diff {
            out.push_str(metadata);
        }

        let (left, right) = (&self.left.name, &self.right.name);
        match &self.content {
            ContentDiff::FileNames {
                only_in_left,
                only_in_right,
            } => {
                for path in only_in_left {
                    let _ = writeln!(out, "Only in {left}: {path}");
                }
                for path in only_in_right {
                    let _ = writeln!(out, "Only in {right}: {path}");
                }
            }
            ContentDiff::Checksums {
                only_in_left,
                only_in_right,
                changed,
            } => {
                for (side, entries) in [(left, only_in_left), (right, only_in_right)] {
                    for (path, hash) in entries {
                        if hash.is_empty() {
                            let _ = writeln!(out, "Only in {side}: {path}");
                        } else {
                            let _ = writeln!(out, "Only in {side}: {path} ({hash})");
                        }
                    }
                }
                for change in changed {
                    let _ = writeln!(out, "Changed: {}", change.path);
                    let _ = writeln!(out, "  {left}: {}", change.left);
                    let _ = writeln!(out, "  {right}: {}", change.right);
                }
            }
            ContentDiff::Text { output } => out.push_str(output),
        }

        if !self.has_differences() {
            let _ = writeln!(out, "{left} and {right} are identical");
        }
        out
    }
}

/// Compare two archives.
pub async fn diff(
    left: &PharArchive,
    right: &PharArchive,
    mode: DiffMode,
    ctx: &DiffContext,
) -> Result<DiffReport> {
    let left_info = left.info().await?;
    let right_info = right.info().await?;
    let metadata_diff = metadata_diff(&left_info, &right_info);

    debug!(
        left = left.name(),
        right = right.name(),
        mode = mode.name(),
        metadata_differs = metadata_diff.is_some(),
        "comparing archives"
    );

    let content = match mode {
        DiffMode::FileName => file_names(left.extractor(), right.extractor()),
        DiffMode::Checksum => checksums(left.extractor(), right.extractor()).await?,
        DiffMode::Git | DiffMode::Gnu => {
            let program = ctx.executable(mode).ok_or_else(|| {
                PharError::ExternalDiff(format!(
                    "the {} mode needs '{}' on PATH",
                    mode.name(),
                    if mode == DiffMode::Git { "git" } else { "diff" }
                ))
            })?;
            text_diff(left, right, mode, program).await?
        }
    };

    Ok(DiffReport {
        left: left_info,
        right: right_info,
        metadata_diff,
        content,
    })
}

/// Render differing summary lines as a unified diff keyed on the line's
/// label, so a line present on one side only still lines up.
fn metadata_diff(left: &PharInfo, right: &PharInfo) -> Option<String> {
    let left_lines = left.summary_lines();
    let right_lines = right.summary_lines();
    if left_lines == right_lines {
        return None;
    }

    fn key(line: &str) -> &str {
        line.split_once(": ").map_or(line, |(k, _)| k)
    }

    let mut keys: Vec<&str> = left_lines.iter().map(|l| key(l)).collect();
    for line in &right_lines {
        if !keys.contains(&key(line)) {
            keys.push(key(line));
        }
    }

    let mut out = format!("--- {}\n+++ {}\n", left.name, right.name);
    for k in keys {
        let l = left_lines.iter().find(|line| key(line) == k);
        let r = right_lines.iter().find(|line| key(line) == k);
        match (l, r) {
            (Some(l), Some(r)) if l == r => {
                let _ = writeln!(out, " {l}");
            }
            (l, r) => {
                if let Some(l) = l {
                    let _ = writeln!(out, "-{l}");
                }
                if let Some(r) = r {
                    let _ = writeln!(out, "+{r}");
                }
            }
        }
    }
    Some(out)
}

fn file_names(left: &PharExtractor<dyn ReadAt>, right: &PharExtractor<dyn ReadAt>) -> ContentDiff {
    let only = |a: &PharExtractor<dyn ReadAt>, b: &PharExtractor<dyn ReadAt>| {
        let mut paths: Vec<String> = a
            .entries()
            .iter()
            .filter(|e| b.manifest().find(&e.path).is_none())
            .map(|e| e.path.clone())
            .collect();
        paths.sort();
        paths
    };

    ContentDiff::FileNames {
        only_in_left: only(left, right),
        only_in_right: only(right, left),
    }
}

async fn content_checksums(extractor: &PharExtractor<dyn ReadAt>) -> Result<BTreeMap<String, String>> {
    let mut sums = BTreeMap::new();
    for (index, entry) in extractor.entries().iter().enumerate() {
        if entry.is_directory() {
            sums.insert(entry.path.clone(), String::new());
            continue;
        }
        let data = extractor.read(index).await?;
        sums.insert(entry.path.clone(), hex::encode(Sha384::digest(&data)));
    }
    Ok(sums)
}

async fn checksums(
    left: &PharExtractor<dyn ReadAt>,
    right: &PharExtractor<dyn ReadAt>,
) -> Result<ContentDiff> {
    let left = content_checksums(left).await?;
    let right = content_checksums(right).await?;

    let mut only_in_left = Vec::new();
    let mut changed = Vec::new();
    for (path, hash) in &left {
        match right.get(path) {
            None => only_in_left.push((path.clone(), hash.clone())),
            Some(other) if other != hash => changed.push(ChecksumChange {
                path: path.clone(),
                left: hash.clone(),
                right: other.clone(),
            }),
            Some(_) => {}
        }
    }
    let only_in_right = right
        .iter()
        .filter(|(path, _)| !left.contains_key(*path))
        .map(|(path, hash)| (path.clone(), hash.clone()))
        .collect();

    Ok(ContentDiff::Checksums {
        only_in_left,
        only_in_right,
        changed,
    })
}

async fn text_diff(
    left: &PharArchive,
    right: &PharArchive,
    mode: DiffMode,
    program: &Path,
) -> Result<ContentDiff> {
    let workdir = tempfile::tempdir()?;
    // No completion marker, and no permission bits a tool could report.
    let options = ExtractOptions {
        use_cache: false,
        restore_permissions: false,
    };
    left.extractor()
        .extract(&workdir.path().join("a"), &options)
        .await?;
    right
        .extractor()
        .extract(&workdir.path().join("b"), &options)
        .await?;

    let mut command = Command::new(program);
    match mode {
        DiffMode::Git => command.args(["diff", "--no-index", "--no-color", "--", "a", "b"]),
        _ => command.args(["-ruN", "a", "b"]),
    };
    let output = command
        .current_dir(workdir.path())
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .await
        .map_err(|e| PharError::ExternalDiff(format!("cannot run '{}': {e}", program.display())))?;

    // Both tools exit 0 for identical trees and 1 for differences.
    match output.status.code() {
        Some(0) => Ok(ContentDiff::Text {
            output: String::new(),
        }),
        Some(1) => Ok(ContentDiff::Text {
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        }),
        _ => Err(PharError::ExternalDiff(format!(
            "'{}' exited with {}: {}",
            program.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
    }
}
