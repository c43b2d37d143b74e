//! In-memory staging buffer and the background committer.
//!
//! Messages either accumulate in the buffer until the committer's next
//! flush, or, with `memory_buffer_time_seconds == 0`, are committed
//! synchronously on append. The committer swaps the buffer out under the
//! lock and commits outside it, so ingestion is never blocked on disk I/O
//! in the buffered mode.
//!
//! The buffer is unbounded; a stalled committer grows memory.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::gelf::GelfMessage;
use crate::instance::CeruleanInstance;
use crate::storage::StorageError;
use crate::storage::collection::ShardCollection;

#[derive(Debug)]
struct BufferInner {
    messages: Vec<GelfMessage>,
    last_swap: Instant,
}

/// The staging buffer. Created once per instance and never destroyed.
#[derive(Debug)]
pub(crate) struct MsgBuffer {
    inner: Mutex<BufferInner>,
}

impl MsgBuffer {
    pub(crate) fn new() -> Self {
        MsgBuffer {
            inner: Mutex::new(BufferInner {
                messages: Vec::new(),
                last_swap: Instant::now(),
            }),
        }
    }

    /// Append a message.
    ///
    /// With `buffer_seconds == 0` the entire buffer (including this message)
    /// is committed before returning; on failure the buffer keeps its
    /// contents for the next attempt and the error surfaces to the caller.
    /// The lock is held across the synchronous commit in that mode, an
    /// accepted throughput cost of the durability-first setting.
    pub(crate) fn add(
        &self,
        msg: GelfMessage,
        buffer_seconds: u32,
        shards: &ShardCollection,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        inner.messages.push(msg);
        if buffer_seconds == 0 {
            shards.commit_messages(&mut inner.messages)?;
            inner.messages.clear();
        }
        Ok(())
    }

    /// Committer tick: swap and commit when the buffer is non-empty and the
    /// flush interval has elapsed. Otherwise a no-op.
    pub(crate) fn flush_due(&self, buffer_seconds: u32, shards: &ShardCollection) {
        let batch = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(e) => {
                    tracing::error!(error = %e, "buffer flush skipped");
                    return;
                }
            };
            if inner.messages.is_empty()
                || inner.last_swap.elapsed() < Duration::from_secs(u64::from(buffer_seconds))
            {
                return;
            }
            inner.last_swap = Instant::now();
            std::mem::take(&mut inner.messages)
        };
        commit_swapped(batch, shards);
    }

    /// Unconditional swap and commit of whatever the buffer holds.
    pub(crate) fn flush_all(&self, shards: &ShardCollection) {
        let batch = {
            let mut inner = match self.lock() {
                Ok(inner) => inner,
                Err(e) => {
                    tracing::error!(error = %e, "buffer flush skipped");
                    return;
                }
            };
            if inner.messages.is_empty() {
                return;
            }
            inner.last_swap = Instant::now();
            std::mem::take(&mut inner.messages)
        };
        commit_swapped(batch, shards);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().map(|i| i.messages.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BufferInner>, StorageError> {
        self.inner
            .lock()
            .map_err(|e| StorageError::Internal(format!("buffer lock poisoned: {e}")))
    }
}

/// Commit a swapped-out batch. Runs outside the buffer lock; a failure loses
/// the batch, which is logged but not retried so memory stays bounded.
fn commit_swapped(mut batch: Vec<GelfMessage>, shards: &ShardCollection) {
    match shards.commit_messages(&mut batch) {
        Ok(()) => tracing::info!(count = batch.len(), "committed messages to shards"),
        Err(e) => {
            tracing::error!(count = batch.len(), error = %e, "cannot commit messages to shards, messages lost");
        }
    }
}

/// Commands understood by the committer thread.
#[derive(Debug)]
enum Command {
    /// Flush the buffer now, regardless of the configured interval.
    Flush,
    /// Flush, then exit the thread.
    Shutdown,
}

/// The background committer: a dedicated thread that wakes every second and
/// flushes the buffer once the configured interval has elapsed.
pub struct Committer;

impl Committer {
    /// Spawn the committer thread for `instance`.
    pub fn spawn(instance: Arc<CeruleanInstance>) -> CommitterHandle {
        let (tx, rx) = mpsc::channel();
        let join = thread::spawn(move || Self::run(&instance, &rx));
        CommitterHandle {
            tx,
            join: Some(join),
        }
    }

    fn run(instance: &CeruleanInstance, rx: &Receiver<Command>) {
        let buffer_seconds = instance.config().memory_buffer_time_seconds;
        tracing::info!(
            data_dir = %instance.data_dir().display(),
            flush_seconds = buffer_seconds,
            "committer started"
        );

        loop {
            match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(Command::Flush) => instance.buffer().flush_all(instance.shards()),
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            instance.buffer().flush_due(buffer_seconds, instance.shards());
        }

        // Final swap+commit so a clean shutdown loses nothing.
        instance.buffer().flush_all(instance.shards());
        tracing::info!("committer stopped");
    }
}

/// Handle to a running committer thread.
pub struct CommitterHandle {
    tx: Sender<Command>,
    join: Option<JoinHandle<()>>,
}

impl CommitterHandle {
    /// Ask the committer to flush ahead of schedule.
    pub fn flush(&self) {
        let _ = self.tx.send(Command::Flush);
    }

    /// Flush and stop the committer, waiting for the thread to exit.
    pub fn shutdown(mut self) -> Result<(), StorageError> {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| StorageError::Internal("failed to join committer thread".to_string()))?;
        }
        Ok(())
    }
}

impl Drop for CommitterHandle {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = self.tx.send(Command::Shutdown);
            let _ = join.join();
        }
    }
}
