//! zipstream-core — on-the-fly directory archives with bounded memory.
//!
//! # Modules
//!
//! - **`config`** — `zipstream.toml` settings (base directory, chunk size, archiver command)
//! - **`identifier`** — archive identifier sanitization
//! - **`validator`** — existence check that runs before any response is committed
//! - **`source`** — byte sources with a kill-and-reap lifecycle (archiver subprocess, in-process readers)
//! - **`relay`** — the chunked, backpressure-aware copy loop
//! - **`error`** — error taxonomy shared with the HTTP layer

pub mod config;
pub mod error;
pub mod identifier;
pub mod relay;
pub mod source;
pub mod validator;

pub use config::{ArchiveConfig, ArchiverCommand};
pub use error::{ArchiveError, ArchiveResult};
pub use identifier::ArchiveId;
pub use relay::{ChunkSink, Relay, RelayStats, SinkClosed};
pub use source::{ArchiveProcess, ByteSource, ReaderSource, SourceExit};
pub use validator::{ArchiveRequest, archive_exists, resolve};
