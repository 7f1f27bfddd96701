//! Bounded producer/consumer byte pipeline.
//!
//! One blocking producer writes canonical bytes through [`ChannelWriter`];
//! the caller consumes them as a [`CanonicalStream`]. The channel holds at
//! most `capacity` chunks, so a slow consumer stalls the producer instead of
//! the artifact piling up in memory. Every stream ends with an explicit
//! [`Frame::End`] or [`Frame::Failed`]; a channel that closes without one is
//! reported as a stream error.
use std::{
    io::{self, Write},
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};

use crate::error::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 4;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub capacity: usize,
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Debug)]
pub enum Frame {
    Data(Bytes),
    End,
    Failed(Error),
}

/// Consumer half of the pipeline.
#[derive(Debug)]
pub struct CanonicalStream {
    rx: mpsc::Receiver<Frame>,
    done: bool,
}

impl CanonicalStream {
    /// Drain the stream into memory. Test and small-artifact helper.
    pub async fn collect_bytes(mut self) -> Result<Vec<u8>> {
        use futures::StreamExt;

        let mut out = Vec::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl Stream for CanonicalStream {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Frame::Data(bytes))) => Poll::Ready(Some(Ok(bytes))),
            Poll::Ready(Some(Frame::End)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(Some(Frame::Failed(err))) => {
                self.done = true;
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(Error::Stream(
                    "producer exited without terminating the stream".to_owned(),
                ))))
            }
        }
    }
}

/// Producer half. Buffers up to `chunk_size` bytes and then blocks on the
/// channel until the consumer makes room.
pub struct ChannelWriter {
    tx: mpsc::Sender<Frame>,
    buf: BytesMut,
    chunk_size: usize,
    sent: u64,
}

impl ChannelWriter {
    fn send(&mut self, frame: Frame) -> io::Result<()> {
        self.tx
            .blocking_send(frame)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "canonical stream dropped"))
    }

    fn flush_chunk(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.sent += chunk.len() as u64;
        self.send(Frame::Data(chunk))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let room = self.chunk_size - self.buf.len();
        let n = room.min(data.len());
        self.buf.extend_from_slice(&data[..n]);
        if self.buf.len() >= self.chunk_size {
            self.flush_chunk()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_chunk()
    }
}

/// Handle on the blocking pool the producer runs on. Fails outside a tokio
/// runtime instead of panicking at spawn time.
pub fn current_runtime() -> Result<Handle> {
    Handle::try_current().map_err(|e| {
        Error::Configuration(format!("canonical streams need a tokio runtime: {e}"))
    })
}

/// Producer side as seen by the owner of the read side.
#[derive(Debug)]
pub struct Producer {
    handle: JoinHandle<()>,
    failed: Arc<AtomicBool>,
}

impl Producer {
    /// True once the producer has failed or panicked. Set before the
    /// consumer can observe the terminal error. A consumer that walks away
    /// does not count.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub async fn join(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| Error::Stream(format!("canonical producer did not finish: {e}")))
    }
}

/// Marks the producer failed unless it settled normally. Covers panics.
struct FailureGuard {
    failed: Arc<AtomicBool>,
    settled: bool,
}

impl Drop for FailureGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.failed.store(true, Ordering::SeqCst);
        }
    }
}

/// Start the single background producer for one read side.
///
/// `produce` runs on the blocking pool of `runtime`. Its result becomes
/// the stream's terminal frame; bytes written before a failure are
/// delivered ahead of it. If the consumer goes away the next write fails
/// with `BrokenPipe`, `produce` returns, and everything it owns is dropped.
pub fn spawn_producer<F>(
    runtime: &Handle,
    config: PipelineConfig,
    produce: F,
) -> (CanonicalStream, Producer)
where
    F: FnOnce(&mut dyn Write) -> Result<()> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let writer = ChannelWriter {
        tx,
        buf: BytesMut::with_capacity(config.chunk_size.max(1)),
        chunk_size: config.chunk_size.max(1),
        sent: 0,
    };
    let failed = Arc::new(AtomicBool::new(false));
    let guard = FailureGuard {
        failed: failed.clone(),
        settled: false,
    };
    let handle = runtime.spawn_blocking(move || {
        // Declared in this order so an unwinding producer flags the failure
        // before its channel closes.
        let mut writer = writer;
        let mut guard = guard;
        let result = produce(&mut writer);
        // Whatever was produced before a failure still reaches the consumer.
        let flushed = writer.flush_chunk().map_err(Error::from);
        let terminal = match result.and(flushed) {
            Ok(()) => {
                log::debug!("canonical stream finished after {} bytes", writer.sent);
                guard.settled = true;
                Frame::End
            }
            Err(err) if writer.tx.is_closed() => {
                log::warn!(
                    "canonical stream abandoned by its consumer after {} bytes: {err}",
                    writer.sent
                );
                guard.settled = true;
                return;
            }
            Err(err) => {
                log::error!("canonical producer failed after {} bytes: {err}", writer.sent);
                guard.failed.store(true, Ordering::SeqCst);
                Frame::Failed(into_stream_error(err))
            }
        };
        if writer.send(terminal).is_err() {
            log::warn!("canonical stream dropped before its terminal frame");
        }
    });
    (CanonicalStream { rx, done: false }, Producer { handle, failed })
}

fn into_stream_error(err: Error) -> Error {
    match err {
        Error::Stream(_) => err,
        other => Error::Stream(other.to_string()),
    }
}
