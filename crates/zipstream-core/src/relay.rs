//! The streaming relay: source → bounded chunks → sink.
//!
//! Reads at most `chunk_size` bytes from a [`ByteSource`], optionally
//! sleeps, and hands the chunk to a [`ChunkSink`]. The next read does not
//! start until the sink has accepted the previous chunk, so memory stays at
//! O(chunk_size) and the source runs at the pace of the slowest consumer.
//!
//! Every suspension point (read, delay, write, reap) is raced against
//! cancellation: the sink going away or the server shutdown signal. On
//! every exit path the source is finished or terminated before
//! [`Relay::run`] returns.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{ArchiveError, ArchiveResult};
use crate::source::{ByteSource, SourceExit};

/// The consumer went away; no further chunks can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkClosed;

/// Destination for relayed chunks, typically an HTTP response body.
pub trait ChunkSink: Send + Sync {
    /// Deliver one chunk, suspending while the consumer applies backpressure.
    fn send(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Resolves once the consumer has gone away.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

impl<K: ChunkSink + ?Sized> ChunkSink for &mut K {
    fn send(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send {
        (**self).send(chunk)
    }

    fn closed(&self) -> impl Future<Output = ()> + Send {
        (**self).closed()
    }
}

/// Why a relay stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelReason {
    ClientGone,
    Shutdown,
}

/// Totals for one relayed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Chunked, backpressure-aware copy loop with kill-and-reap cleanup.
#[derive(Debug, Clone)]
pub struct Relay {
    chunk_size: usize,
    chunk_delay: Duration,
}

impl Relay {
    pub fn new(chunk_size: usize, chunk_delay: Duration) -> ArchiveResult<Self> {
        if chunk_size == 0 {
            return Err(ArchiveError::Config("chunk_size must be > 0".into()));
        }
        Ok(Self {
            chunk_size,
            chunk_delay,
        })
    }

    /// Relay `source` into `sink` until end of stream, failure, or
    /// cancellation.
    ///
    /// Returns [`ArchiveError::Cancelled`] when the sink closed or
    /// `shutdown` flipped to `true`; the source has been terminated and
    /// reaped by then.
    pub async fn run<S, K>(
        &self,
        mut source: S,
        mut sink: K,
        mut shutdown: watch::Receiver<bool>,
    ) -> ArchiveResult<RelayStats>
    where
        S: ByteSource,
        K: ChunkSink,
    {
        let pumped = self.pump(&mut source, &mut sink, &mut shutdown).await;

        let mut cancelled_while_reaping = None;
        let exit = match &pumped {
            // End of stream: the source should be exiting on its own.
            Ok(_) => {
                tokio::select! {
                    exit = source.finish() => exit,
                    reason = cancelled(&sink, &mut shutdown) => {
                        cancelled_while_reaping = Some(reason);
                        source.terminate().await
                    }
                }
            }
            Err(_) => source.terminate().await,
        };

        let exit = match exit {
            Ok(exit) => Some(exit),
            Err(e) => {
                error!(error = %e, "failed to reap archive source");
                None
            }
        };

        let stats = match pumped {
            Ok(stats) => stats,
            Err(e) => {
                match &e {
                    ArchiveError::Cancelled => {}
                    other => error!(error = %other, "archive stream aborted"),
                }
                return Err(e);
            }
        };

        if let Some(reason) = cancelled_while_reaping {
            warn!(?reason, "download was interrupted while the archiver was exiting");
            return Err(ArchiveError::Cancelled);
        }

        match exit {
            Some(SourceExit::Completed) => {
                info!(chunks = stats.chunks, bytes = stats.bytes, "archive stream complete");
                Ok(stats)
            }
            Some(SourceExit::Failed { reason }) => {
                error!(chunks = stats.chunks, bytes = stats.bytes, %reason, "archiver failed after streaming");
                Err(ArchiveError::ArchiverFailed(reason))
            }
            Some(SourceExit::Killed) => Err(ArchiveError::ArchiverFailed(
                "source terminated before it exited".into(),
            )),
            None => Err(ArchiveError::ArchiverFailed(
                "could not determine archiver exit status".into(),
            )),
        }
    }

    async fn pump<S, K>(
        &self,
        source: &mut S,
        sink: &mut K,
        shutdown: &mut watch::Receiver<bool>,
    ) -> ArchiveResult<RelayStats>
    where
        S: ByteSource,
        K: ChunkSink,
    {
        let mut buf = vec![0u8; self.chunk_size];
        let mut stats = RelayStats::default();

        loop {
            let n = tokio::select! {
                read = source.read(&mut buf) => read?,
                reason = cancelled(&*sink, shutdown) => return Err(interrupted(reason, &stats)),
            };
            debug!(bytes = n, "sending archive chunk");

            if !self.chunk_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.chunk_delay) => {}
                    reason = cancelled(&*sink, shutdown) => return Err(interrupted(reason, &stats)),
                }
            }

            if n == 0 {
                return Ok(stats);
            }

            let chunk = Bytes::copy_from_slice(&buf[..n]);
            tokio::select! {
                sent = sink.send(chunk) => {
                    if sent.is_err() {
                        return Err(interrupted(CancelReason::ClientGone, &stats));
                    }
                }
                _ = shutdown_signalled(shutdown) => {
                    return Err(interrupted(CancelReason::Shutdown, &stats));
                }
            }

            stats.chunks += 1;
            stats.bytes += n as u64;
        }
    }
}

fn interrupted(reason: CancelReason, stats: &RelayStats) -> ArchiveError {
    warn!(?reason, chunks = stats.chunks, bytes = stats.bytes, "download was interrupted");
    ArchiveError::Cancelled
}

async fn cancelled<K: ChunkSink>(sink: &K, shutdown: &mut watch::Receiver<bool>) -> CancelReason {
    tokio::select! {
        _ = sink.closed() => CancelReason::ClientGone,
        _ = shutdown_signalled(shutdown) => CancelReason::Shutdown,
    }
}

/// Resolves once shutdown is requested. A dropped sender never resolves.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Instant;

    use tokio::io::{AsyncRead, ReadBuf};

    use crate::source::ReaderSource;

    /// Records every chunk; optionally closes after a number of sends.
    #[derive(Default)]
    struct RecordingSink {
        chunks: Vec<Bytes>,
        close_after: Option<usize>,
        is_closed: bool,
    }

    impl ChunkSink for RecordingSink {
        async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
            if self.is_closed {
                return Err(SinkClosed);
            }
            self.chunks.push(chunk);
            if self.close_after == Some(self.chunks.len()) {
                self.is_closed = true;
            }
            Ok(())
        }

        async fn closed(&self) {
            if self.is_closed {
                return;
            }
            std::future::pending::<()>().await
        }
    }

    /// A source that yields some bytes, then never produces more until
    /// terminated. Tracks whether terminate ran.
    struct StallingSource {
        prefix: Option<Bytes>,
        terminated: Arc<AtomicBool>,
    }

    impl AsyncRead for StallingSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.get_mut().prefix.take() {
                Some(bytes) => {
                    buf.put_slice(&bytes);
                    Poll::Ready(Ok(()))
                }
                None => Poll::Pending,
            }
        }
    }

    impl ByteSource for StallingSource {
        async fn finish(&mut self) -> io::Result<SourceExit> {
            std::future::pending().await
        }

        async fn terminate(&mut self) -> io::Result<SourceExit> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(SourceExit::Killed)
        }
    }

    /// A source whose reads fail.
    struct BrokenSource {
        terminated: Arc<AtomicBool>,
    }

    impl AsyncRead for BrokenSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::other("pipe exploded")))
        }
    }

    impl ByteSource for BrokenSource {
        async fn finish(&mut self) -> io::Result<SourceExit> {
            Ok(SourceExit::Completed)
        }

        async fn terminate(&mut self) -> io::Result<SourceExit> {
            self.terminated.store(true, Ordering::SeqCst);
            Ok(SourceExit::Killed)
        }
    }

    fn no_shutdown() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        // A dropped sender means "never shut down".
        drop(tx);
        rx
    }

    fn synthetic(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn ten_byte_chunks_over_one_kilobyte() {
        let data = synthetic(1024);
        let mut sink = RecordingSink::default();
        let relay = Relay::new(10, Duration::ZERO).unwrap();

        let stats = relay
            .run(ReaderSource::new(&data[..]), &mut sink, no_shutdown())
            .await
            .unwrap();

        assert_eq!(sink.chunks.len(), 1024usize.div_ceil(10));
        assert_eq!(stats.chunks, 103);
        assert_eq!(stats.bytes, 1024);
        assert!(sink.chunks.iter().all(|c| !c.is_empty() && c.len() <= 10));
        let joined: Vec<u8> = sink.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn chunks_preserve_order_across_uneven_sizes() {
        let data = synthetic(300_001);
        let mut sink = RecordingSink::default();
        let relay = Relay::new(100_000, Duration::ZERO).unwrap();

        relay
            .run(ReaderSource::new(&data[..]), &mut sink, no_shutdown())
            .await
            .unwrap();

        assert_eq!(sink.chunks.len(), 4);
        assert_eq!(sink.chunks[3].len(), 1);
        let joined: Vec<u8> = sink.chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn empty_source_sends_nothing() {
        let mut sink = RecordingSink::default();
        let stats = Relay::new(16, Duration::ZERO).unwrap()
            .run(ReaderSource::new(&b""[..]), &mut sink, no_shutdown())
            .await
            .unwrap();
        assert_eq!(stats, RelayStats::default());
        assert!(sink.chunks.is_empty());
    }

    #[tokio::test]
    async fn delay_applies_per_chunk() {
        let data = synthetic(30);
        let mut sink = RecordingSink::default();
        let relay = Relay::new(10, Duration::from_millis(20)).unwrap();

        let started = Instant::now();
        relay
            .run(ReaderSource::new(&data[..]), &mut sink, no_shutdown())
            .await
            .unwrap();

        // Three data chunks plus the final empty read.
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(sink.chunks.len(), 3);
    }

    #[tokio::test]
    async fn client_disconnect_after_first_chunk_terminates_source() {
        let terminated = Arc::new(AtomicBool::new(false));
        let source = StallingSource {
            prefix: Some(Bytes::from_static(b"first")),
            terminated: terminated.clone(),
        };
        let mut sink = RecordingSink {
            close_after: Some(1),
            ..Default::default()
        };

        let err = Relay::new(1024, Duration::ZERO).unwrap()
            .run(source, &mut sink, no_shutdown())
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(terminated.load(Ordering::SeqCst));
        assert_eq!(sink.chunks, vec![Bytes::from_static(b"first")]);
    }

    #[tokio::test]
    async fn disconnect_during_write_is_cancellation() {
        let data = synthetic(100);
        let mut sink = RecordingSink {
            is_closed: true,
            ..Default::default()
        };
        let err = Relay::new(10, Duration::ZERO).unwrap()
            .run(ReaderSource::new(&data[..]), &mut sink, no_shutdown())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(sink.chunks.is_empty());
    }

    #[tokio::test]
    async fn shutdown_signal_cancels_stalled_read() {
        let terminated = Arc::new(AtomicBool::new(false));
        let source = StallingSource {
            prefix: None,
            terminated: terminated.clone(),
        };
        let (tx, rx) = watch::channel(false);
        let mut sink = RecordingSink::default();

        let relay = Relay::new(1024, Duration::ZERO).unwrap();
        let run = relay.run(source, &mut sink, rx);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(run, trigger);

        assert!(result.unwrap_err().is_cancelled());
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn shutdown_interrupts_delay() {
        let data = synthetic(10);
        let (tx, rx) = watch::channel(false);
        let mut sink = RecordingSink::default();
        let relay = Relay::new(10, Duration::from_secs(60)).unwrap();

        let started = Instant::now();
        let run = relay.run(ReaderSource::new(&data[..]), &mut sink, rx);
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(true).unwrap();
        };
        let (result, ()) = tokio::join!(run, trigger);

        assert!(result.unwrap_err().is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(sink.chunks.is_empty());
    }

    #[tokio::test]
    async fn read_error_terminates_and_surfaces() {
        let terminated = Arc::new(AtomicBool::new(false));
        let source = BrokenSource {
            terminated: terminated.clone(),
        };
        let mut sink = RecordingSink::default();
        let err = Relay::new(16, Duration::ZERO).unwrap()
            .run(source, &mut sink, no_shutdown())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Io(_)));
        assert!(terminated.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failed_exit_after_eof_is_reported() {
        struct FailingExit(ReaderSource<&'static [u8]>);

        impl AsyncRead for FailingExit {
            fn poll_read(
                self: Pin<&mut Self>,
                cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
            }
        }

        impl ByteSource for FailingExit {
            async fn finish(&mut self) -> io::Result<SourceExit> {
                Ok(SourceExit::Failed {
                    reason: "exit status: 18".into(),
                })
            }

            async fn terminate(&mut self) -> io::Result<SourceExit> {
                self.0.terminate().await
            }
        }

        let mut sink = RecordingSink::default();
        let err = Relay::new(4, Duration::ZERO).unwrap()
            .run(FailingExit(ReaderSource::new(&b"partial"[..])), &mut sink, no_shutdown())
            .await
            .unwrap_err();
        assert!(matches!(err, ArchiveError::ArchiverFailed(ref r) if r.contains("18")));
        assert_eq!(sink.chunks.len(), 2);
    }

    /// An endless source that counts reads and bytes handed out.
    struct CountingSource {
        reads: Arc<AtomicUsize>,
        produced: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingSource {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let n = buf.remaining();
            buf.put_slice(&vec![b'z'; n]);
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.produced.fetch_add(n, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    impl ByteSource for CountingSource {
        async fn finish(&mut self) -> io::Result<SourceExit> {
            Ok(SourceExit::Completed)
        }

        async fn terminate(&mut self) -> io::Result<SourceExit> {
            Ok(SourceExit::Killed)
        }
    }

    /// Accepts one chunk, then never accepts another.
    #[derive(Default)]
    struct StuckSink {
        accepted: Vec<Bytes>,
    }

    impl ChunkSink for StuckSink {
        async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
            if !self.accepted.is_empty() {
                std::future::pending::<()>().await;
            }
            self.accepted.push(chunk);
            Ok(())
        }

        async fn closed(&self) {
            std::future::pending::<()>().await
        }
    }

    #[tokio::test]
    async fn blocked_sink_stops_reading() {
        let reads = Arc::new(AtomicUsize::new(0));
        let produced = Arc::new(AtomicUsize::new(0));
        let source = CountingSource {
            reads: reads.clone(),
            produced: produced.clone(),
        };
        let mut sink = StuckSink::default();
        let relay = Relay::new(8, Duration::ZERO).unwrap();

        let stalled = tokio::time::timeout(
            Duration::from_millis(100),
            relay.run(source, &mut sink, no_shutdown()),
        )
        .await;
        assert!(stalled.is_err(), "relay finished despite a blocked sink");

        let accepted: usize = sink.accepted.iter().map(Bytes::len).sum();
        assert_eq!(sink.accepted.len(), 1);
        assert_eq!(accepted, 8);
        // One read for the accepted chunk, one for the chunk stuck in send.
        assert_eq!(reads.load(Ordering::SeqCst), 2);
        assert!(produced.load(Ordering::SeqCst) - accepted <= 8);
    }

    #[test]
    fn zero_chunk_size_is_config_error() {
        let err = Relay::new(0, Duration::ZERO).unwrap_err();
        assert!(matches!(err, ArchiveError::Config(ref msg) if msg.contains("chunk_size")));
    }
}
