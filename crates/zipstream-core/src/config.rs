//! zipstream.toml configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working configuration that serves `test_photos/` through `zip`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArchiveError, ArchiveResult};

/// Placeholder in [`ArchiverCommand::args`] replaced by the archive identifier.
pub const IDENTIFIER_PLACEHOLDER: &str = "{identifier}";

/// Default maximum number of bytes forwarded per read/write cycle.
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding one sub-directory per archive identifier.
    pub base_dir: PathBuf,
    pub chunk_size: usize,
    /// Artificial delay after every chunk read, in whole seconds.
    pub chunk_delay_secs: u64,
    pub archive_name: String,
    pub content_type: String,
    pub archiver: ArchiverCommand,
    /// Upper bound on archivers running at once. `None` means unbounded.
    pub max_concurrent_archives: Option<usize>,
    pub index_page: PathBuf,
}

/// External program that writes an archive of one directory to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiverCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("test_photos/"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_delay_secs: 0,
            archive_name: "archive.zip".to_string(),
            content_type: "application/zip".to_string(),
            archiver: ArchiverCommand::default(),
            max_concurrent_archives: None,
            index_page: PathBuf::from("index.html"),
        }
    }
}

impl Default for ArchiverCommand {
    fn default() -> Self {
        Self {
            program: "zip".to_string(),
            args: vec!["-r".into(), "-".into(), IDENTIFIER_PLACEHOLDER.into()],
        }
    }
}

impl ArchiverCommand {
    /// Arguments with every placeholder replaced by `identifier`.
    pub fn args_for(&self, identifier: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| arg.replace(IDENTIFIER_PLACEHOLDER, identifier))
            .collect()
    }
}

impl ArchiveConfig {
    pub fn from_file(path: &Path) -> ArchiveResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArchiveError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ArchiveResult<Self> {
        let config: ArchiveConfig =
            toml::from_str(content).map_err(|e| ArchiveError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ArchiveResult<String> {
        toml::to_string_pretty(self).map_err(|e| ArchiveError::Config(e.to_string()))
    }

    /// Check invariants that serde cannot express.
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.chunk_size == 0 {
            return Err(ArchiveError::Config("chunk_size must be > 0".into()));
        }
        if self.archiver.program.trim().is_empty() {
            return Err(ArchiveError::Config("archiver.program must not be empty".into()));
        }
        if self.max_concurrent_archives == Some(0) {
            return Err(ArchiveError::Config(
                "max_concurrent_archives must be > 0 when set".into(),
            ));
        }
        // The name is interpolated into a header value unquoted.
        if self.archive_name.is_empty()
            || self
                .archive_name
                .chars()
                .any(|c| c.is_control() || matches!(c, '"' | ';' | '/' | '\\'))
        {
            return Err(ArchiveError::Config(format!(
                "archive_name {:?} is not a valid attachment file name",
                self.archive_name
            )));
        }
        if self.content_type.trim().is_empty() || self.content_type.chars().any(char::is_control) {
            return Err(ArchiveError::Config(format!(
                "content_type {:?} is not a valid header value",
                self.content_type
            )));
        }
        Ok(())
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_secs(self.chunk_delay_secs)
    }

    /// `Content-Disposition` header value for the streamed archive.
    pub fn content_disposition(&self) -> String {
        format!("attachment; filename={}", self.archive_name)
    }
}
