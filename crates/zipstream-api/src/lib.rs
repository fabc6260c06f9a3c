//! zipstream-api — HTTP surface for zipstream.
//!
//! Builds the axum router and owns the glue between an HTTP response body
//! and the core relay.
//!
//! # Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | Static index page |
//! | GET | `/archive/{identifier}/` | Stream `base_dir/<identifier>` as an archive |

pub mod body;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use zipstream_core::{ArchiveConfig, ArchiveResult};

/// Shared state for handlers.
///
/// Cloned per request; holds no per-request mutable state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ArchiveConfig>,
    /// Flips to `true` when the server is shutting down.
    pub shutdown: watch::Receiver<bool>,
    permits: Option<Arc<Semaphore>>,
}

impl AppState {
    /// Rejects a config that fails [`ArchiveConfig::validate`].
    pub fn new(config: ArchiveConfig, shutdown: watch::Receiver<bool>) -> ArchiveResult<Self> {
        config.validate()?;
        let permits = config
            .max_concurrent_archives
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Ok(Self {
            config: Arc::new(config),
            shutdown,
            permits,
        })
    }

    /// Reserve a slot for one archiver. `Ok(None)` when uncapped,
    /// `Err(())` when every slot is taken.
    pub(crate) fn try_reserve(&self) -> Result<Option<OwnedSemaphorePermit>, ()> {
        match &self.permits {
            None => Ok(None),
            Some(permits) => permits.clone().try_acquire_owned().map(Some).map_err(|_| ()),
        }
    }
}

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index_page))
        .route("/archive/{identifier}/", get(handlers::stream_archive))
        .with_state(state)
}
