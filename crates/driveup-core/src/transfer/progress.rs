use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Pending progress updates buffered for a slow sink before new ones are dropped.
/// Each update supersedes the previous one, so a small buffer loses nothing useful.
const PROGRESS_BUFFER_SIZE: usize = 16;

/// Committed bytes of a transfer, reported after each durable chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub committed: u64,
    pub total: u64,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.committed as f64 / self.total as f64
        }
    }

    pub fn is_complete(&self) -> bool {
        self.committed >= self.total
    }
}

/// Receiver of progress updates. Errors are logged and otherwise ignored.
pub trait ProgressSink: Send + Sync + 'static {
    fn on_progress(&self, progress: Progress) -> anyhow::Result<()>;
}

/// Sink that discards every update.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_progress(&self, _progress: Progress) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Decouples a [`ProgressSink`] from the transfer loop.
///
/// Updates go through a bounded channel to a separate task, so publishing
/// never waits on the sink. When the buffer is full the update is dropped.
pub struct ProgressDispatcher {
    tx: mpsc::Sender<Progress>,
    handle: JoinHandle<()>,
}

impl ProgressDispatcher {
    pub fn spawn(sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Progress>(PROGRESS_BUFFER_SIZE);
        let handle = tokio::spawn(async move {
            while let Some(progress) = rx.recv().await {
                if let Err(e) = sink.on_progress(progress) {
                    warn!(error = %e, "Progress sink failed");
                }
            }
        });
        Self { tx, handle }
    }

    pub fn publish(&self, progress: Progress) {
        if let Err(mpsc::error::TrySendError::Full(dropped)) = self.tx.try_send(progress) {
            debug!(committed = dropped.committed, "Progress sink is behind, dropping update");
        }
    }

    /// Deliver what is buffered and stop the delivery task.
    pub async fn finish(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Progress sink task ended abnormally");
        }
    }
}
