//! AOF writer with configurable fsync policy.
//!
//! Under `always` the caller's thread writes and fsyncs inline, so the
//! record is durable before the client sees its reply. Under `everysec`
//! and `no` records flow over a bounded channel to a dedicated writer
//! thread: file IO is blocking, so the writer is a plain thread rather
//! than an async task; the channel bound applies backpressure to the
//! command path instead of growing without limit.
//!
//! A rewrite replaces the whole log: the new payload goes to a sibling
//! temp file, is fsynced, and atomically renamed over the active file.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use cinder_protocol::{serialize_cmd_line, CmdLine};
use thiserror::Error;
use tracing::{error, info, warn};

/// Records buffered between the command path and the writer thread.
const QUEUE_DEPTH: usize = 8192;

/// How the log reaches stable storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// fsync after every record, before the client reply. Safest, slowest.
    Always,
    /// fsync once per second from the writer thread.
    #[default]
    EverySec,
    /// Let the OS flush on its own schedule.
    No,
}

/// Errors from opening, writing, or rewriting the log.
#[derive(Debug, Error)]
pub enum AofError {
    #[error("aof io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("aof writer has shut down")]
    WriterGone,

    #[error("aof rewrite failed: {0}")]
    RewriteFailed(String),
}

/// The open log file plus the db-index tracking that decides when a
/// synthetic SELECT frame is needed.
struct AofFile {
    writer: BufWriter<File>,
    path: PathBuf,
    last_db: Option<usize>,
}

impl AofFile {
    fn open(path: PathBuf) -> Result<Self, AofError> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path,
            last_db: None,
        })
    }

    fn append(&mut self, db: usize, line: &CmdLine) -> Result<(), AofError> {
        let mut buf = BytesMut::new();
        if self.last_db != Some(db) {
            serialize_cmd_line(
                &[
                    Bytes::from_static(b"SELECT"),
                    Bytes::from(db.to_string()),
                ],
                &mut buf,
            );
            self.last_db = Some(db);
        }
        serialize_cmd_line(line, &mut buf);
        self.writer.write_all(&buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AofError> {
        self.writer.flush()?;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), AofError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Writes `payload` to a temp sibling, fsyncs it, renames over the
    /// active file, and reopens for appending.
    fn replace_with(&mut self, payload: &[u8]) -> Result<(), AofError> {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("rewrite");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(payload)?;
            tmp.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        // the rewritten payload carries its own SELECT frames
        self.last_db = None;
        info!(path = %self.path.display(), bytes = payload.len(), "aof rewritten");
        Ok(())
    }
}

enum Event {
    Record { db: usize, line: CmdLine },
    Rewrite { payload: Vec<u8>, done: SyncSender<Result<(), String>> },
    Flush { done: SyncSender<()> },
    Shutdown,
}

enum Inner {
    /// `always`: callers write inline under a mutex.
    Direct {
        file: Mutex<AofFile>,
        last_error: Mutex<Option<String>>,
    },
    /// `everysec` / `no`: a writer thread owns the file.
    Background {
        tx: SyncSender<Event>,
        handle: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Shared handle to the append-only log.
pub struct AofHandle {
    inner: Inner,
    policy: FsyncPolicy,
}

impl AofHandle {
    /// Opens (or creates) the log at `path` with the given policy. For the
    /// background policies this spawns the writer thread.
    pub fn open(path: impl Into<PathBuf>, policy: FsyncPolicy) -> Result<Self, AofError> {
        let file = AofFile::open(path.into())?;
        let inner = match policy {
            FsyncPolicy::Always => Inner::Direct {
                file: Mutex::new(file),
                last_error: Mutex::new(None),
            },
            FsyncPolicy::EverySec | FsyncPolicy::No => {
                let (tx, rx) = std::sync::mpsc::sync_channel(QUEUE_DEPTH);
                let sync_each_second = policy == FsyncPolicy::EverySec;
                let handle = std::thread::Builder::new()
                    .name("aof-writer".into())
                    .spawn(move || writer_loop(file, rx, sync_each_second))
                    .map_err(AofError::Io)?;
                Inner::Background {
                    tx,
                    handle: Mutex::new(Some(handle)),
                }
            }
        };
        Ok(Self { inner, policy })
    }

    /// The configured policy.
    pub fn policy(&self) -> FsyncPolicy {
        self.policy
    }

    /// Appends one record. Under `always` this blocks until the record is
    /// durable; failures are remembered for [`AofHandle::take_error`].
    /// Under the background policies this enqueues, applying backpressure
    /// when the writer falls behind.
    pub fn append(&self, db: usize, line: CmdLine) {
        match &self.inner {
            Inner::Direct { file, last_error } => {
                let mut file = file.lock().expect("aof file lock poisoned");
                let result = file.append(db, &line).and_then(|()| file.sync());
                if let Err(e) = result {
                    error!("aof append failed: {e}");
                    *last_error.lock().expect("aof error lock poisoned") = Some(e.to_string());
                }
            }
            Inner::Background { tx, .. } => {
                if tx.send(Event::Record { db, line }).is_err() {
                    warn!("aof record dropped: writer has shut down");
                }
            }
        }
    }

    /// Takes the most recent `always`-mode write error, if any. The engine
    /// turns this into a `-MISCONF` reply.
    pub fn take_error(&self) -> Option<String> {
        match &self.inner {
            Inner::Direct { last_error, .. } => {
                last_error.lock().expect("aof error lock poisoned").take()
            }
            Inner::Background { .. } => None,
        }
    }

    /// Replaces the log contents with `payload` (a fully serialized
    /// snapshot), atomically. Appends made while the rewrite is queued land
    /// after it.
    pub fn rewrite(&self, payload: Vec<u8>) -> Result<(), AofError> {
        match &self.inner {
            Inner::Direct { file, .. } => {
                let mut file = file.lock().expect("aof file lock poisoned");
                file.replace_with(&payload)
            }
            Inner::Background { tx, .. } => {
                let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
                tx.send(Event::Rewrite {
                    payload,
                    done: done_tx,
                })
                .map_err(|_| AofError::WriterGone)?;
                match done_rx.recv() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(msg)) => Err(AofError::RewriteFailed(msg)),
                    Err(_) => Err(AofError::WriterGone),
                }
            }
        }
    }

    /// Flushes and fsyncs everything buffered so far. Used on shutdown.
    pub fn flush_sync(&self) -> Result<(), AofError> {
        match &self.inner {
            Inner::Direct { file, .. } => file.lock().expect("aof file lock poisoned").sync(),
            Inner::Background { tx, .. } => {
                let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
                tx.send(Event::Flush { done: done_tx })
                    .map_err(|_| AofError::WriterGone)?;
                done_rx.recv().map_err(|_| AofError::WriterGone)
            }
        }
    }

    /// Stops the writer thread after draining the queue.
    pub fn shutdown(&self) {
        if let Inner::Background { tx, handle } = &self.inner {
            let _ = tx.send(Event::Shutdown);
            if let Some(handle) = handle.lock().expect("aof handle lock poisoned").take() {
                let _ = handle.join();
            }
        }
    }
}

fn writer_loop(mut file: AofFile, rx: Receiver<Event>, sync_each_second: bool) {
    let mut last_sync = Instant::now();
    let tick = Duration::from_secs(1);

    loop {
        let timeout = tick
            .checked_sub(last_sync.elapsed())
            .unwrap_or(Duration::ZERO);
        match rx.recv_timeout(timeout) {
            Ok(Event::Record { db, line }) => {
                if let Err(e) = file.append(db, &line) {
                    // keep running: the disk may come back, and everysec is
                    // explicitly allowed to retry on its own schedule
                    error!("aof append failed: {e}");
                }
            }
            Ok(Event::Rewrite { payload, done }) => {
                let result = file.replace_with(&payload).map_err(|e| e.to_string());
                let _ = done.send(result);
            }
            Ok(Event::Flush { done }) => {
                if let Err(e) = file.sync() {
                    error!("aof flush failed: {e}");
                }
                let _ = done.send(());
            }
            Ok(Event::Shutdown) => {
                if let Err(e) = file.sync() {
                    error!("aof final sync failed: {e}");
                }
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                let _ = file.sync();
                return;
            }
        }

        if last_sync.elapsed() >= tick {
            let result = if sync_each_second { file.sync() } else { file.flush() };
            if let Err(e) = result {
                error!("aof periodic sync failed: {e}");
            }
            last_sync = Instant::now();
        }
    }
}

/// Serializes one record the way the writer would, for building rewrite
/// payloads.
pub fn encode_record(db: usize, line: &CmdLine, last_db: &mut Option<usize>, out: &mut BytesMut) {
    if *last_db != Some(db) {
        serialize_cmd_line(
            &[Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())],
            &mut *out,
        );
        *last_db = Some(db);
    }
    serialize_cmd_line(line, out);
}
