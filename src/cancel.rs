use tokio_util::sync::CancellationToken;

use crate::error::IngestError;

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    // Checked between chunks of work by every long-running step.
    pub fn check(&self) -> Result<(), IngestError> {
        if self.is_cancelled() {
            return Err(IngestError::Cancelled);
        }
        Ok(())
    }
}
