//! Fire-and-forget progress reporting.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Coarse phase of a provisioning call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressStatus {
    /// Querying the marketplace.
    Searching,
    /// Creating instances.
    Creating,
    /// Waiting for instances to become ready.
    Waiting,
    /// Running the remote command check.
    Verifying,
    /// Resuming a paused instance.
    Resuming,
    /// A machine is ready.
    Ready,
    /// The call failed.
    Failed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Searching => "searching",
            Self::Creating => "creating",
            Self::Waiting => "waiting",
            Self::Verifying => "verifying",
            Self::Resuming => "resuming",
            Self::Ready => "ready",
            Self::Failed => "failed",
        })
    }
}

/// One progress notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Current phase.
    pub status: ProgressStatus,
    /// Human readable detail.
    pub message: String,
    /// Rough completion, 0 to 100.
    pub percent: u8,
}

/// Receives progress notifications. Implementations must not block.
pub trait ProgressReporter: Send + Sync {
    /// Handles one update.
    fn report(&self, update: ProgressUpdate);
}

impl<F> ProgressReporter for F
where
    F: Fn(ProgressUpdate) + Send + Sync,
{
    fn report(&self, update: ProgressUpdate) {
        self(update);
    }
}

/// Optional reporter handle passed to strategies.
#[derive(Clone, Default)]
pub struct Progress {
    reporter: Option<Arc<dyn ProgressReporter>>,
}

impl Progress {
    /// A handle that discards every update.
    #[must_use]
    pub const fn none() -> Self {
        Self { reporter: None }
    }

    /// Wraps a reporter.
    #[must_use]
    pub fn new(reporter: impl ProgressReporter + 'static) -> Self {
        Self {
            reporter: Some(Arc::new(reporter)),
        }
    }

    /// Forwards updates into a channel. A closed receiver is ignored.
    #[must_use]
    pub fn channel(sender: UnboundedSender<ProgressUpdate>) -> Self {
        Self::new(move |update: ProgressUpdate| {
            if sender.send(update).is_err() {
                debug!("progress receiver dropped");
            }
        })
    }

    /// Sends an update. A panicking reporter is logged and otherwise ignored.
    pub fn emit(&self, status: ProgressStatus, message: impl Into<String>, percent: u8) {
        let Some(reporter) = self.reporter.as_ref() else {
            return;
        };
        let update = ProgressUpdate {
            status,
            message: message.into(),
            percent: percent.min(100),
        };
        if catch_unwind(AssertUnwindSafe(|| reporter.report(update))).is_err() {
            warn!(%status, "progress reporter panicked");
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn closure_reporter_receives_clamped_updates() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress = Progress::new(move |update: ProgressUpdate| {
            sink.lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(update);
        });

        progress.emit(ProgressStatus::Creating, "creating 3 instances", 150);

        let updates = seen.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(
            updates.as_slice(),
            [ProgressUpdate {
                status: ProgressStatus::Creating,
                message: String::from("creating 3 instances"),
                percent: 100,
            }]
        );
    }

    #[test]
    fn panicking_reporter_is_contained() {
        let progress = Progress::new(|update: ProgressUpdate| {
            assert!(update.percent > 100, "reporter bug");
        });
        progress.emit(ProgressStatus::Waiting, "still waiting", 40);
    }

    #[test]
    fn channel_reporter_tolerates_closed_receiver() {
        let (sender, receiver) = tokio::sync::mpsc::unbounded_channel();
        drop(receiver);
        Progress::channel(sender).emit(ProgressStatus::Ready, "ready", 100);
    }
}
