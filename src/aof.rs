//! Append-only file.
//!
//! Every accepted write command is appended to the file in its wire encoding, so the file is a
//! plain concatenation of RESP arrays. On startup the file is replayed from the beginning to
//! rebuild the in-memory state.
//!
//! Appends only hand the bytes to the operating system. A background task syncs the file to
//! storage once per flush interval, which bounds what a crash can lose to the writes of the
//! last interval.

use std::io::{Cursor, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Buf;
use thiserror::Error as ThisError;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::frame::{self, Frame};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, ThisError)]
pub enum AofError {
    #[error("append-only file is closed")]
    Closed,
    #[error("flush interval must be greater than zero")]
    ZeroFlushInterval,
    #[error("append-only file holds a partially written record at byte {offset}")]
    Torn { offset: u64 },
    #[error("append-only file i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("append-only file is corrupt at byte {offset}: {source}")]
    Corrupt {
        offset: u64,
        #[source]
        source: frame::Error,
    },
}

/// Shared handle to the append-only file.
///
/// Cloning is cheap, all clones write to the same file. Appends, flushes and replay are
/// serialized by a single lock over the file handle.
#[derive(Clone)]
pub struct Aof {
    inner: Arc<Inner>,
}

struct Inner {
    path: PathBuf,
    // `None` once the file has been closed.
    file: Mutex<Option<LogFile>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

struct LogFile {
    file: File,
    // Length of the file up to the end of the last complete record.
    len: u64,
    // Set when a failed append could not be rolled back.
    torn: bool,
}

impl Aof {
    /// Opens (or creates) the file at `path` and starts the background flush task.
    ///
    /// Must be called from within a Tokio runtime.
    pub async fn open(path: impl AsRef<Path>, flush_interval: Duration) -> Result<Aof, AofError> {
        if flush_interval.is_zero() {
            return Err(AofError::ZeroFlushInterval);
        }

        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .await?;
        let len = file.metadata().await?.len();

        let inner = Arc::new(Inner {
            path,
            file: Mutex::new(Some(LogFile {
                file,
                len,
                torn: false,
            })),
            flush_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        let task = tokio::spawn({
            let inner = inner.clone();
            async move { flush_periodically(inner, flush_interval).await }
        });
        *inner.flush_task.lock().await = Some(task);

        info!(path = %inner.path.display(), "Opened append-only file");

        Ok(Aof { inner })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Appends the wire encoding of `frame` at the end of the file.
    ///
    /// If the write fails, whatever part of the record reached the file is cut off again so
    /// that later records still start on a record boundary.
    pub async fn append(&self, frame: &Frame) -> Result<(), AofError> {
        let bytes = frame.serialize();

        let mut file = self.inner.file.lock().await;
        let log = file.as_mut().ok_or(AofError::Closed)?;

        if log.torn {
            return Err(AofError::Torn { offset: log.len });
        }

        if let Err(e) = log.write(&bytes).await {
            if let Err(rollback) = log.rollback().await {
                error!(
                    offset = log.len,
                    "Failed to remove partially written record: {}", rollback
                );
                log.torn = true;
            }
            return Err(e.into());
        }

        log.len += bytes.len() as u64;

        Ok(())
    }

    /// Forces everything appended so far to durable storage.
    pub async fn flush(&self) -> Result<(), AofError> {
        self.inner.sync().await
    }

    /// Decodes every record from the beginning of the file and passes it to `apply`, in
    /// file order. Returns the number of records applied.
    ///
    /// Replay never writes to the file. A record that can't be decoded, including a
    /// truncated one at the end of the file, stops the replay with `AofError::Corrupt`.
    pub async fn replay<F>(&self, mut apply: F) -> Result<usize, AofError>
    where
        F: FnMut(Frame),
    {
        let mut file = self.inner.file.lock().await;
        let log = file.as_mut().ok_or(AofError::Closed)?;

        // The file is opened in append mode, writes always land at the end no matter where
        // the read position is.
        log.file.seek(SeekFrom::Start(0)).await?;
        let mut buf = Vec::new();
        log.file.read_to_end(&mut buf).await?;

        let mut cursor = Cursor::new(&buf[..]);
        let mut records = 0;

        while cursor.has_remaining() {
            let offset = cursor.position();
            let frame =
                Frame::parse(&mut cursor).map_err(|source| AofError::Corrupt { offset, source })?;

            apply(frame);
            records += 1;
        }

        debug!(records, bytes = buf.len(), "Replayed append-only file");

        Ok(records)
    }

    /// Stops the flush task, syncs the file one last time and releases it.
    ///
    /// Closing an already closed file is a no-op.
    pub async fn close(&self) -> Result<(), AofError> {
        self.inner.shutdown.cancel();

        let task = self.inner.flush_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Append-only file flush task failed: {}", e);
            }
        }

        let mut file = self.inner.file.lock().await;
        if let Some(log) = file.take() {
            log.file.sync_all().await?;
            info!(path = %self.inner.path.display(), "Closed append-only file");
        }

        Ok(())
    }
}

impl Inner {
    async fn sync(&self) -> Result<(), AofError> {
        let file = self.file.lock().await;
        let log = file.as_ref().ok_or(AofError::Closed)?;
        log.file.sync_all().await?;
        Ok(())
    }
}

impl LogFile {
    async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        // Tokio performs the write on a blocking thread. Flushing waits until it is done, so
        // the whole record is in the file before the lock is released.
        self.file.flush().await
    }

    /// Cuts the file back to the end of the last complete record.
    async fn rollback(&mut self) -> std::io::Result<()> {
        self.file.set_len(self.len).await
    }
}

async fn flush_periodically(inner: Arc<Inner>, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        match inner.sync().await {
            Ok(()) => {}
            Err(AofError::Closed) => break,
            Err(e) => warn!("Failed to flush append-only file: {}", e),
        }
    }

    debug!("Append-only file flush task stopped");
}
