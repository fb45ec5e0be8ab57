//! Stub handling: sentinel matching, normalization and a default loader.

use crate::error::{PharError, Result};

use super::structures::{HALT_COMPILER, STUB_TERMINATOR};

/// Online matcher for the stub sentinel.
///
/// Bytes are fed one at a time. On a mismatch the match falls back to the
/// longest prefix of the sentinel that is still matched, so overlapping
/// partial matches such as `__HALT__HALT_COMPILER();` are not skipped.
#[derive(Debug, Clone)]
pub struct SentinelMatcher<'a> {
    pattern: &'a [u8],
    fallback: Vec<usize>,
    matched: usize,
}

impl<'a> SentinelMatcher<'a> {
    pub fn new(pattern: &'a [u8]) -> Self {
        let mut fallback = vec![0; pattern.len()];
        let mut k = 0;
        for i in 1..pattern.len() {
            while k > 0 && pattern[i] != pattern[k] {
                k = fallback[k - 1];
            }
            if pattern[i] == pattern[k] {
                k += 1;
            }
            fallback[i] = k;
        }
        Self {
            pattern,
            fallback,
            matched: 0,
        }
    }

    /// Returns true when `byte` completes the sentinel.
    pub fn feed(&mut self, byte: u8) -> bool {
        if self.pattern.is_empty() {
            return true;
        }
        while self.matched > 0 && self.pattern[self.matched] != byte {
            self.matched = self.fallback[self.matched - 1];
        }
        if self.pattern[self.matched] == byte {
            self.matched += 1;
        }
        if self.matched == self.pattern.len() {
            self.matched = 0;
            return true;
        }
        false
    }
}

/// Offset just past the first occurrence of `sentinel` in `data`.
pub fn find_sentinel(data: &[u8], sentinel: &[u8]) -> Option<usize> {
    let mut matcher = SentinelMatcher::new(sentinel);
    data.iter().position(|&b| matcher.feed(b)).map(|i| i + 1)
}

/// Length of the optional ` ?>` and line ending that may follow the
/// sentinel.
pub fn terminator_len(after: &[u8]) -> usize {
    let mut len = 0;
    if after.starts_with(b" ?>") {
        len = 3;
    }
    let rest = &after[len..];
    if rest.starts_with(b"\r\n") {
        len + 2
    } else if rest.starts_with(b"\n") {
        len + 1
    } else {
        len
    }
}

pub(crate) fn sentinel_display(sentinel: &[u8]) -> String {
    String::from_utf8_lossy(sentinel).into_owned()
}

/// Cut the stub right after `__HALT_COMPILER();` and append the canonical
/// ` ?>\r\n` terminator.
pub fn normalize(stub: &[u8]) -> Result<Vec<u8>> {
    let end = find_sentinel(stub, HALT_COMPILER).ok_or_else(|| PharError::SentinelNotFound {
        sentinel: sentinel_display(HALT_COMPILER),
    })?;
    let mut out = Vec::with_capacity(end + STUB_TERMINATOR.len());
    out.extend_from_slice(&stub[..end]);
    out.extend_from_slice(STUB_TERMINATOR);
    Ok(out)
}

/// Minimal loader stub: map the archive under `alias`, then run `index`.
pub fn generate(alias: &str, index: Option<&str>, shebang: bool) -> Vec<u8> {
    let alias = php_single_quote(alias);
    let mut stub = String::new();
    if shebang {
        stub.push_str("#!/usr/bin/env php\n");
    }
    stub.push_str("<?php\n\n");
    stub.push_str(&format!("Phar::mapPhar('{alias}');\n\n"));
    if let Some(index) = index {
        let index = php_single_quote(index.trim_start_matches('/'));
        stub.push_str(&format!("require 'phar://{alias}/{index}';\n\n"));
    }
    stub.push_str("__HALT_COMPILER(); ?>\r\n");
    stub.into_bytes()
}

fn php_single_quote(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
