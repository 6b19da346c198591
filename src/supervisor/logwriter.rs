// src/supervisor/logwriter.rs

//! Destinations for captured stdout/stderr.
//!
//! Output goes to a file under `<data_dir>/logs` when one can be opened, and
//! to a bounded in-memory ring buffer otherwise. The ring buffer keeps the
//! most recent bytes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Capacity of the in-memory fallback buffer.
pub const RING_BUFFER_CAPACITY: usize = 2 * 1024 * 1024;

/// Fixed-capacity byte buffer that drops its oldest bytes on overflow.
#[derive(Debug)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        let data = if data.len() > self.capacity {
            &data[data.len() - self.capacity..]
        } else {
            data
        };
        let overflow = (self.buf.len() + data.len()).saturating_sub(self.capacity);
        self.buf.drain(..overflow);
        self.buf.extend(data);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

/// Read side of a captured stream, kept on the `ProcRun`.
#[derive(Debug, Clone)]
pub enum LogHandle {
    File(PathBuf),
    Memory(Arc<Mutex<RingBuffer>>),
}

impl LogHandle {
    /// Everything captured so far, lossily decoded.
    pub async fn contents(&self) -> String {
        match self {
            LogHandle::File(path) => match tokio::fs::read(path).await {
                Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read captured output");
                    String::new()
                }
            },
            LogHandle::Memory(buf) => String::from_utf8_lossy(&buf.lock().contents()).into_owned(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            LogHandle::File(path) => Some(path),
            LogHandle::Memory(_) => None,
        }
    }
}

/// Write side, owned by the pump task.
#[derive(Debug)]
pub(crate) enum LogSink {
    File(tokio::fs::File),
    Memory(Arc<Mutex<RingBuffer>>),
}

impl LogSink {
    /// Open `path` for appending; fall back to a fresh ring buffer.
    pub(crate) async fn open(path: &Path) -> (LogSink, LogHandle) {
        let opened = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await;
        match opened {
            Ok(file) => (LogSink::File(file), LogHandle::File(path.to_path_buf())),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "cannot open log file; capturing output in memory"
                );
                Self::memory()
            }
        }
    }

    pub(crate) fn memory() -> (LogSink, LogHandle) {
        let buf = Arc::new(Mutex::new(RingBuffer::new(RING_BUFFER_CAPACITY)));
        (LogSink::Memory(buf.clone()), LogHandle::Memory(buf))
    }

    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            LogSink::File(file) => file.write_all(data).await,
            LogSink::Memory(buf) => {
                buf.lock().write(data);
                Ok(())
            }
        }
    }

    async fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LogSink::File(file) => file.flush().await,
            LogSink::Memory(_) => Ok(()),
        }
    }
}

/// Copy `reader` into `sink` until EOF. Write errors switch the rest of the
/// stream to being drained and discarded, so the child never blocks on a
/// full pipe.
pub(crate) async fn pump<R>(mut reader: R, mut sink: LogSink, stream: &'static str, proc_id: String)
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; 8 * 1024];
    let mut failed = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if failed {
                    continue;
                }
                if let Err(e) = sink.write_all(&chunk[..n]).await {
                    warn!(proc_id = %proc_id, stream, error = %e, "log write failed; discarding further output");
                    failed = true;
                }
            }
            Err(e) => {
                debug!(proc_id = %proc_id, stream, error = %e, "output stream closed with error");
                break;
            }
        }
    }
    if let Err(e) = sink.flush().await {
        warn!(proc_id = %proc_id, stream, error = %e, "failed to flush captured output");
    }
}
