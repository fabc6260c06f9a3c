//! Byte sources feeding the relay.
//!
//! A [`ByteSource`] is a readable byte stream with an explicit lifecycle:
//! the relay either waits for it to finish on its own ([`ByteSource::finish`])
//! or tears it down ([`ByteSource::terminate`]). [`ArchiveProcess`] backs it
//! with an external archiver; [`ReaderSource`] wraps any in-process
//! [`AsyncRead`] producer.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ArchiverCommand;
use crate::error::{ArchiveError, ArchiveResult};
use crate::identifier::ArchiveId;

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL_LINES: usize = 8;

/// How long to wait for the stderr tail after a failed exit.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// How long a clean exit waits for the last stderr lines to be logged.
const STDERR_LOG_GRACE: Duration = Duration::from_millis(50);

/// How a source ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceExit {
    /// Finished on its own and reported success.
    Completed,
    /// Finished on its own and reported failure.
    Failed { reason: String },
    /// Torn down by [`ByteSource::terminate`] before it finished.
    Killed,
}

/// A readable byte stream with a kill-and-reap lifecycle.
pub trait ByteSource: AsyncRead + Unpin + Send {
    /// Wait for the source to finish on its own. Called after end of stream.
    ///
    /// Must be cancel safe: the relay races it against cancellation and
    /// falls back to [`terminate`](ByteSource::terminate).
    fn finish(&mut self) -> impl Future<Output = io::Result<SourceExit>> + Send;

    /// Stop the source if it is still running and release its resources.
    fn terminate(&mut self) -> impl Future<Output = io::Result<SourceExit>> + Send;
}

// ── Archiver subprocess ────────────────────────────────────────

/// A running archiver whose stdout is the archive byte stream.
///
/// Stderr is drained in the background so a chatty archiver can never
/// block on a full pipe; its last lines are attached to failure reports.
pub struct ArchiveProcess {
    child: Child,
    stdout: ChildStdout,
    stderr_task: Option<JoinHandle<String>>,
    program: String,
}

impl ArchiveProcess {
    /// Launch `command` for `id` with `cwd` as working directory.
    pub fn spawn(command: &ArchiverCommand, id: &ArchiveId, cwd: &Path) -> ArchiveResult<Self> {
        let launch_error = |source: io::Error| ArchiveError::Launch {
            program: command.program.clone(),
            source,
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(command.args_for(id.as_str()))
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Running: {:?}", cmd);

        let mut child = cmd.spawn().map_err(launch_error)?;
        let pid = child.id();

        let stdout = match child.stdout.take() {
            Some(stdout) => stdout,
            None => {
                // Dropping the child kills it (kill_on_drop).
                return Err(launch_error(io::Error::other("archiver stdout was not captured")));
            }
        };
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(stderr, pid)));

        debug!(pid, program = %command.program, identifier = %id, "archiver started");

        Ok(Self {
            child,
            stdout,
            stderr_task,
            program: command.program.clone(),
        })
    }

    /// OS process id, or `None` once the process has been reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn collect_exit(&mut self, status: ExitStatus, killed: bool) -> SourceExit {
        if killed {
            // The stderr pipe may be held open by descendants of the archiver.
            if let Some(task) = self.stderr_task.take() {
                task.abort();
            }
            debug!(program = %self.program, %status, "archiver killed and reaped");
            return SourceExit::Killed;
        }

        // Descendants of the archiver can keep stderr open past its exit.
        let wait = if status.success() {
            STDERR_LOG_GRACE
        } else {
            STDERR_DRAIN_TIMEOUT
        };
        let stderr = match self.stderr_task.take() {
            Some(mut task) => match tokio::time::timeout(wait, &mut task).await {
                Ok(Ok(tail)) => tail,
                Ok(Err(_)) => String::new(),
                Err(_) => {
                    task.abort();
                    String::new()
                }
            },
            None => String::new(),
        };

        if status.success() {
            debug!(program = %self.program, "archiver exited cleanly");
            SourceExit::Completed
        } else if stderr.is_empty() {
            SourceExit::Failed {
                reason: format!("{} {status}", self.program),
            }
        } else {
            SourceExit::Failed {
                reason: format!("{} {status}: {stderr}", self.program),
            }
        }
    }
}

impl AsyncRead for ArchiveProcess {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl ByteSource for ArchiveProcess {
    async fn finish(&mut self) -> io::Result<SourceExit> {
        let status = self.child.wait().await?;
        Ok(self.collect_exit(status, false).await)
    }

    async fn terminate(&mut self) -> io::Result<SourceExit> {
        let killed = match self.child.try_wait()? {
            Some(_) => false,
            None => match self.child.start_kill() {
                Ok(()) => true,
                // Exited between try_wait and start_kill.
                Err(e) if e.kind() == io::ErrorKind::InvalidInput => false,
                Err(e) => return Err(e),
            },
        };
        let status = self.child.wait().await?;
        Ok(self.collect_exit(status, killed).await)
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: Option<u32>) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(pid, "archiver: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(pid, error = %e, "failed to read archiver stderr");
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

// ── In-process producers ───────────────────────────────────────

/// Adapts any [`AsyncRead`] (for example one half of a
/// [`tokio::io::duplex`] fed by an in-process encoder) into a [`ByteSource`].
///
/// It completes successfully once the reader reports end of stream; a
/// terminate before that point counts as a kill.
pub struct ReaderSource<R> {
    reader: Option<R>,
    eof: bool,
}

impl<R> ReaderSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(reader),
            eof: false,
        }
    }
}

impl<R: AsyncRead + Unpin + Send> AsyncRead for ReaderSource<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(reader) = this.reader.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "source already terminated",
            )));
        };
        let before = buf.filled().len();
        let poll = Pin::new(reader).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            if buf.remaining() > 0 && buf.filled().len() == before {
                this.eof = true;
            }
        }
        poll
    }
}

impl<R: AsyncRead + Unpin + Send> ByteSource for ReaderSource<R> {
    async fn finish(&mut self) -> io::Result<SourceExit> {
        self.reader = None;
        if self.eof {
            Ok(SourceExit::Completed)
        } else {
            Ok(SourceExit::Failed {
                reason: "reader released before end of stream".into(),
            })
        }
    }

    async fn terminate(&mut self) -> io::Result<SourceExit> {
        self.reader = None;
        Ok(if self.eof {
            SourceExit::Completed
        } else {
            SourceExit::Killed
        })
    }
}
