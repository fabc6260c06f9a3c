//! Channel-backed streaming response body.
//!
//! The relay task writes into a [`ChannelSink`]; the HTTP layer polls the
//! matching [`ChannelBody`]. The channel holds a single chunk, so a send
//! completes only once the previous chunk has been taken by the connection
//! and the relay inherits the client's backpressure. When the client goes
//! away hyper drops the body, which closes the channel and cancels the relay.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use tokio::sync::mpsc;
use tracing::debug;
use zipstream_core::{ChunkSink, SinkClosed};

/// In-flight chunks between the relay and the connection.
const CHANNEL_CAPACITY: usize = 1;

/// How long an abort waits for room in the channel before giving up.
const ABORT_TIMEOUT: Duration = Duration::from_secs(5);

pub type BodyItem = Result<Bytes, io::Error>;

/// Create a connected sink/body pair.
pub fn channel() -> (ChannelSink, ChannelBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (ChannelSink { tx }, ChannelBody { rx })
}

/// Relay-side half.
pub struct ChannelSink {
    tx: mpsc::Sender<BodyItem>,
}

impl ChannelSink {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// End the body with an error so the connection is torn down instead of
    /// terminating the chunked encoding cleanly. A client must not mistake a
    /// truncated archive for a complete one.
    pub async fn abort(&self, err: io::Error) {
        match tokio::time::timeout(ABORT_TIMEOUT, self.tx.send(Err(err))).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!("body already dropped; nothing to abort"),
            Err(_) => debug!("timed out delivering body abort"),
        }
    }
}

impl ChunkSink for ChannelSink {
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Connection-side half, suitable for `axum::body::Body::from_stream`.
pub struct ChannelBody {
    rx: mpsc::Receiver<BodyItem>,
}

impl Stream for ChannelBody {
    type Item = BodyItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}
