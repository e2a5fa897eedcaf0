//! Data Batcher
//!
//! Coalesces raw PTY output into one delivery per interval instead of one per
//! OS read. A timer task is started on the first write of a batch; the sink is
//! invoked under the buffer lock so batches never reorder.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

/// Receives each coalesced batch
pub type BatchSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

struct Shared {
    pending: Mutex<Vec<u8>>,
    scheduled: AtomicBool,
    sink: BatchSink,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn flush(&self) {
        let mut pending = self.lock();
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut *pending);
        (self.sink)(batch);
    }
}

pub struct DataBatcher {
    shared: Arc<Shared>,
    interval: Duration,
    timer: Option<JoinHandle<()>>,
    disposed: bool,
}

impl DataBatcher {
    /// Must be called from within a tokio runtime
    pub fn new(interval: Duration, sink: BatchSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::new()),
                scheduled: AtomicBool::new(false),
                sink,
            }),
            interval,
            timer: None,
            disposed: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        if self.disposed || data.is_empty() {
            return;
        }
        self.shared.lock().extend_from_slice(data);

        if !self.shared.scheduled.swap(true, Ordering::AcqRel) {
            let shared = Arc::clone(&self.shared);
            let interval = self.interval;
            self.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                shared.scheduled.store(false, Ordering::Release);
                shared.flush();
            }));
        }
    }

    /// Deliver whatever is buffered right now
    pub fn flush(&self) {
        self.shared.flush();
    }

    /// Flush pending bytes and stop the timer; later writes are ignored
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.shared.flush();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

impl Drop for DataBatcher {
    fn drop(&mut self) {
        self.dispose();
    }
}
