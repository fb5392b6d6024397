//! Output reader for the generator's stdout and stderr.
//!
//! The reader runs on its own thread for the lifetime of one session. Each
//! pass waits at most one poll interval for a chunk, splits it into lines,
//! classifies the non-blank ones and hands the events to its host. The host
//! is held weakly so a reader never keeps a torn-down manager alive.

use std::sync::Weak;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClassifiedEvent, LineClassifier};

/// Chunk size for a single read.
const READ_CHUNK: usize = 4096;

/// Identifies one supervised session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a reader loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The stop signal was raised.
    StopRequested,
    /// The owning manager is gone or tearing down.
    HostGone,
    /// Every output stream reached end of file.
    EndOfStream,
    /// The process exited and its remaining output was drained.
    ProcessExited,
}

/// The side of the manager a reader talks to.
pub trait SessionHost: Send + Sync {
    /// True while the session is active and its process is alive.
    fn is_session_running(&self, session: SessionId) -> bool;

    /// True once the host has begun teardown.
    fn is_shutting_down(&self) -> bool;

    /// Deliver the events classified from one line, in order.
    fn deliver(&self, session: SessionId, events: Vec<ClassifiedEvent>);

    /// Called once when the reader loop has ended and its pipes are closed.
    fn reader_exited(&self, session: SessionId, reason: ReaderExit);
}

/// Splits a byte stream into lines on `\n`, `\r\n` or bare `\r`.
///
/// Partial lines are kept across chunks. Bytes are decoded lossily per line.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' || byte == b'\r' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Return the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

/// A type-erased output stream.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

struct Stream {
    name: &'static str,
    reader: Option<BoxedReader>,
    splitter: LineSplitter,
    buf: Vec<u8>,
}

impl Stream {
    fn new(name: &'static str, reader: Option<BoxedReader>) -> Self {
        Self {
            name,
            reader,
            splitter: LineSplitter::new(),
            buf: vec![0; READ_CHUNK],
        }
    }

    fn is_open(&self) -> bool {
        self.reader.is_some()
    }

    async fn read_chunk(&mut self) -> std::io::Result<usize> {
        match self.reader.as_mut() {
            Some(reader) => reader.read(&mut self.buf).await,
            None => std::future::pending().await,
        }
    }

    /// Apply a read result. Returns the completed lines.
    fn accept(&mut self, result: std::io::Result<usize>) -> Vec<String> {
        match result {
            Ok(0) => self.close(),
            Ok(n) => self.splitter.push(&self.buf[..n]),
            Err(e) => {
                tracing::warn!(stream = self.name, error = %e, "Read failed, closing stream");
                self.close()
            }
        }
    }

    fn close(&mut self) -> Vec<String> {
        tracing::debug!(stream = self.name, "Stream closed");
        self.reader = None;
        self.splitter.finish().into_iter().collect()
    }
}

/// Reads one session's output until stopped, orphaned or drained.
pub struct OutputReader {
    session: SessionId,
    stdout: Stream,
    stderr: Stream,
    host: Weak<dyn SessionHost>,
    classifier: LineClassifier,
    cancel: CancellationToken,
    poll_interval: Duration,
}

impl OutputReader {
    /// Create a reader over the session's stdout and optional stderr.
    pub fn new(
        session: SessionId,
        stdout: impl AsyncRead + Unpin + Send + 'static,
        stderr: Option<BoxedReader>,
        host: Weak<dyn SessionHost>,
        classifier: LineClassifier,
        cancel: CancellationToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            session,
            stdout: Stream::new("stdout", Some(Box::new(stdout))),
            stderr: Stream::new("stderr", stderr),
            host,
            classifier,
            cancel,
            poll_interval,
        }
    }

    /// Run the loop, close the pipes, then report the exit to the host.
    pub async fn run(mut self) -> ReaderExit {
        tracing::debug!(session = %self.session, "Output reader started");
        let reason = self.read_loop().await;
        let Self {
            session,
            stdout,
            stderr,
            host,
            ..
        } = self;
        drop(stdout);
        drop(stderr);

        tracing::debug!(session = %session, ?reason, "Output reader exiting");
        if let Some(host) = host.upgrade() {
            host.reader_exited(session, reason);
        }
        reason
    }

    async fn read_loop(&mut self) -> ReaderExit {
        let mut draining = false;

        loop {
            let (got_data, lines) = tokio::select! {
                biased;

                () = self.cancel.cancelled() => return ReaderExit::StopRequested,
                result = self.stdout.read_chunk(), if self.stdout.is_open() => {
                    (true, self.stdout.accept(result))
                }
                result = self.stderr.read_chunk(), if self.stderr.is_open() => {
                    (true, self.stderr.accept(result))
                }
                () = tokio::time::sleep(self.poll_interval) => (false, Vec::new()),
            };

            if !lines.is_empty() && !self.dispatch(lines) {
                return ReaderExit::HostGone;
            }

            if !self.stdout.is_open() && !self.stderr.is_open() {
                return ReaderExit::EndOfStream;
            }

            if draining && !got_data {
                return ReaderExit::ProcessExited;
            }

            let Some(host) = self.host.upgrade() else {
                return ReaderExit::HostGone;
            };
            if host.is_shutting_down() {
                return ReaderExit::HostGone;
            }
            if !draining && !host.is_session_running(self.session) {
                tracing::debug!(session = %self.session, "Process no longer running, draining output");
                draining = true;
            }
        }
    }

    /// Classify and forward lines. Returns false if the host is gone.
    fn dispatch(&self, lines: Vec<String>) -> bool {
        let Some(host) = self.host.upgrade() else {
            return false;
        };
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            tracing::trace!(session = %self.session, %line, "Output line");
            host.deliver(self.session, self.classifier.classify(&line));
        }
        true
    }
}
