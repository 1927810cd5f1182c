//! Progress reporting from the package installation worker.
//!
//! The worker owns a [`ProgressReporter`] holding the sending halves of two
//! queues: integer percentages and human-readable status lines. Dropping the
//! reporter closes both queues. Two consumer tasks drain them into a
//! [`ProgressSink`] until closed.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// The presentation layer's view of an installation in progress.
pub trait ProgressSink: std::fmt::Debug + Send + Sync {
    /// Overall completion, 0 to 100.
    fn progress(&self, percent: u8);
    /// A line describing what is happening now.
    fn status(&self, line: &str);
}

/// Reports progress through the log; used when nobody is watching.
#[derive(Debug, Default)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn progress(&self, percent: u8) {
        tracing::debug!("progress: {percent}%");
    }

    fn status(&self, line: &str) {
        tracing::info!("{line}");
    }
}

/// The producer side of the progress and status queues.
#[derive(Debug)]
pub struct ProgressReporter {
    progress: UnboundedSender<u8>,
    status: UnboundedSender<String>,
}

impl ProgressReporter {
    /// Report overall completion; values above 100 are clamped.
    pub fn progress(&self, percent: u8) {
        // The consumers only go away once we're dropped, or the runtime is shutting down
        if self.progress.send(percent.min(100)).is_err() {
            tracing::trace!("progress queue closed");
        }
    }

    /// Report a status line.
    pub fn status(&self, line: impl Into<String>) {
        if self.status.send(line.into()).is_err() {
            tracing::trace!("status queue closed");
        }
    }
}

/// The consumer side of the progress and status queues.
#[derive(Debug)]
pub struct ProgressReceivers {
    progress: UnboundedReceiver<u8>,
    status: UnboundedReceiver<String>,
}

/// Create a connected reporter and receiver pair.
pub fn progress_channel() -> (ProgressReporter, ProgressReceivers) {
    let (progress_tx, progress_rx) = unbounded_channel();
    let (status_tx, status_rx) = unbounded_channel();
    (
        ProgressReporter {
            progress: progress_tx,
            status: status_tx,
        },
        ProgressReceivers {
            progress: progress_rx,
            status: status_rx,
        },
    )
}

impl ProgressReceivers {
    /// Forward every message to `sink` until both queues are closed. The two
    /// queues are drained by independent tasks, so there is no ordering
    /// between a percentage and a status line.
    pub async fn drain(self, sink: Arc<dyn ProgressSink>) -> Result<()> {
        let Self {
            mut progress,
            mut status,
        } = self;
        let progress_sink = Arc::clone(&sink);
        let progress_task = tokio::spawn(async move {
            while let Some(percent) = progress.recv().await {
                progress_sink.progress(percent);
            }
        });
        let status_task = tokio::spawn(async move {
            while let Some(line) = status.recv().await {
                sink.status(&line);
            }
        });
        let (p, s) = tokio::join!(progress_task, status_task);
        p?;
        s?;
        Ok(())
    }
}
