//! Input Writer
//!
//! Writes to a PTY go through a bounded queue drained by a dedicated thread,
//! since a PTY write blocks while the child is not reading. Payloads up to
//! `chunk_size` are written in a single call; larger ones are split into
//! `chunk_size` pieces with a yield between pieces. A failed write drops the
//! rest of that item only. Disposing stops the thread after the chunk in
//! flight and drops everything still queued.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::InputConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InputError {
    #[error("input queue is full")]
    QueueFull,

    #[error("input writer is closed")]
    Closed,
}

pub struct InputWriter {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    cancelled: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl InputWriter {
    /// Start the drain thread for `writer`
    pub fn spawn(
        pane_id: &str,
        writer: Box<dyn Write + Send>,
        config: InputConfig,
    ) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancelled = Arc::new(AtomicBool::new(false));
        let drain = Drain {
            pane_id: pane_id.to_string(),
            writer,
            chunk_size: config.chunk_size.max(1),
            cancelled: Arc::clone(&cancelled),
        };
        let thread = thread::Builder::new()
            .name(format!("pty-input-{}", pane_id))
            .spawn(move || drain.run(rx))?;
        Ok(Self {
            tx: Some(tx),
            cancelled,
            thread: Some(thread),
        })
    }

    /// Queue bytes for the PTY; never waits
    pub fn write(&self, data: &[u8]) -> Result<(), InputError> {
        if data.is_empty() {
            return Ok(());
        }
        let tx = self.tx.as_ref().ok_or(InputError::Closed)?;
        tx.try_send(data.to_vec()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => InputError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => InputError::Closed,
        })
    }

    /// Cancel queued writes; safe to call more than once.
    ///
    /// Never joins the thread: a write stuck on a full PTY only returns once
    /// the child reads or the PTY closes.
    pub fn dispose(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.tx.take();
        self.thread.take();
    }

    pub fn is_disposed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Drop for InputWriter {
    fn drop(&mut self) {
        self.dispose();
    }
}

struct Drain {
    pane_id: String,
    writer: Box<dyn Write + Send>,
    chunk_size: usize,
    cancelled: Arc<AtomicBool>,
}

impl Drain {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn run(mut self, mut rx: mpsc::Receiver<Vec<u8>>) {
        while let Some(item) = rx.blocking_recv() {
            if self.is_cancelled() {
                break;
            }
            if item.len() <= self.chunk_size {
                if let Err(e) = self.write_chunk(&item) {
                    tracing::warn!("[{}] Input write failed: {}", self.pane_id, e);
                }
                continue;
            }

            let total = item.len();
            for (index, chunk) in item.chunks(self.chunk_size).enumerate() {
                if self.is_cancelled() {
                    break;
                }
                if let Err(e) = self.write_chunk(chunk) {
                    tracing::warn!(
                        "[{}] Input chunk {} of {} bytes failed, dropping rest: {}",
                        self.pane_id,
                        index,
                        total,
                        e
                    );
                    break;
                }
                thread::yield_now();
            }
        }
        tracing::debug!("[{}] Input writer stopped", self.pane_id);
    }

    fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(chunk)?;
        self.writer.flush()
    }
}
