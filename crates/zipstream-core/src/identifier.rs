//! Archive identifiers taken from the request path.
//!
//! An identifier names a directory directly under the configured base
//! directory and is passed to the archiver as an argument, so it must be a
//! single, unremarkable path segment.

use std::fmt;

use crate::error::{ArchiveError, ArchiveResult};

const MAX_IDENTIFIER_LEN: usize = 255;

/// A validated archive identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveId(String);

impl ArchiveId {
    /// Accepts ASCII alphanumerics, `-`, `_` and `.`, without a leading dot.
    ///
    /// Rejects path separators, `.`/`..`, hidden entries, shell
    /// metacharacters and anything that could be read as an option by the
    /// archiver.
    pub fn parse(raw: &str) -> ArchiveResult<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_IDENTIFIER_LEN
            && !raw.starts_with('.')
            && !raw.starts_with('-')
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(ArchiveError::InvalidIdentifier(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
