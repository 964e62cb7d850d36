use std::sync::Arc;

/// First failure recorded by a scheduler.
///
/// Any task that returns an error or panics cancels its whole scheduler:
/// the failure is stored once, later closures are skipped, and the
/// dependency bookkeeping still drains to quiescence. The error is
/// cloneable because every attached thread observes the cancellation;
/// only the thread that entered `join` or `spawn_root` surfaces it.
#[derive(Clone, Debug, thiserror::Error)]
#[error("scheduler cancelled: {0}")]
pub struct CancelError(Arc<anyhow::Error>);

impl CancelError {
    pub(crate) fn new(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }

    /// The error raised by the first failing task.
    pub fn cause(&self) -> &anyhow::Error {
        &self.0
    }
}
