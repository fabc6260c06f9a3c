//! Route handlers.
//!
//! `stream_archive` validates, reserves a slot, launches the archiver and
//! only then returns the response head, so every failure up to that point
//! is still a clean HTTP error. From there on the relay task owns the
//! archiver and the body until the stream ends.

use std::io;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::response::{Html, IntoResponse, Response};
use tracing::{Instrument, error, info, info_span, warn};
use zipstream_core::{ArchiveError, ArchiveProcess, ByteSource, Relay, validator};

use crate::AppState;
use crate::body;

fn error_response(err: &ArchiveError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let text = match err {
        ArchiveError::NotFound(_) => "404: Not Found\nThe archive does not exist or has been deleted",
        ArchiveError::InvalidIdentifier(_) => "400: Bad Request\nInvalid archive identifier",
        _ => "500: Internal Server Error\nThe archive could not be prepared",
    };
    (status, text).into_response()
}

fn busy_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "503: Service Unavailable\nToo many archives are being prepared, try again later",
    )
        .into_response()
}

/// GET /
pub async fn index_page(State(state): State<AppState>) -> Response {
    let path = &state.config.index_page;
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Html(contents).into_response(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "index page missing");
            (StatusCode::NOT_FOUND, "404: Not Found").into_response()
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "failed to read index page");
            (StatusCode::INTERNAL_SERVER_ERROR, "500: Internal Server Error").into_response()
        }
    }
}

/// GET /archive/{identifier}/
pub async fn stream_archive(
    State(state): State<AppState>,
    Path(identifier): Path<String>,
) -> Response {
    let config = &state.config;

    let request = match validator::resolve(&config.base_dir, &identifier).await {
        Ok(request) => request,
        Err(e) => {
            info!(%identifier, error = %e, "archive request rejected");
            return error_response(&e);
        }
    };

    let relay = match Relay::new(config.chunk_size, config.chunk_delay()) {
        Ok(relay) => relay,
        Err(e) => {
            error!(identifier = %request.id, error = %e, "invalid relay settings");
            return error_response(&e);
        }
    };

    let permit = match state.try_reserve() {
        Ok(permit) => permit,
        Err(()) => {
            warn!(identifier = %request.id, "archiver limit reached");
            return busy_response();
        }
    };

    let mut process =
        match ArchiveProcess::spawn(&config.archiver, &request.id, &config.base_dir) {
            Ok(process) => process,
            Err(e) => {
                error!(identifier = %request.id, error = %e, "failed to launch archiver");
                return error_response(&e);
            }
        };
    let pid = process.pid();

    let (mut sink, body) = body::channel();
    let response = axum::http::Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, config.content_type.as_str())
        .header(CONTENT_DISPOSITION, config.content_disposition())
        .body(Body::from_stream(body));
    let response = match response {
        Ok(response) => response,
        Err(e) => {
            error!(identifier = %request.id, error = %e, "invalid archive response headers");
            if let Err(e) = process.terminate().await {
                error!(pid, error = %e, "failed to reap archiver");
            }
            return (StatusCode::INTERNAL_SERVER_ERROR, "500: Internal Server Error")
                .into_response();
        }
    };

    let shutdown = state.shutdown.clone();
    let span = info_span!("archive", identifier = %request.id, pid);

    tokio::spawn(
        async move {
            let _permit = permit;
            if let Err(e) = relay.run(process, &mut sink, shutdown).await {
                // A vanished client needs no abort; anything else must not
                // look like a complete archive.
                if !sink.is_closed() {
                    sink.abort(io::Error::other(e.to_string())).await;
                }
            }
        }
        .instrument(span),
    );

    info!(identifier = %request.id, path = %request.path.display(), pid, "streaming archive");
    response
}
