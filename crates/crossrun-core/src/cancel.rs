//! Cancellation token shared across request pipelines.
//!
//! A clonable token observed by every proxy a manager owns. Cancelling
//! any clone cancels all of them. A worker that is mid-launch when the
//! token fires is still allowed to finish connecting before teardown,
//! so no orphaned processes are left behind.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A cancellation token for cooperative cancellation of async operations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create a new cancellation token.
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request cancellation. All clones observe it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Create a child token sharing cancellation state with this one.
    pub fn child_token(&self) -> Self {
        Self {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Return an error if cancellation has been requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::CrossrunError::Cancelled)
        } else {
            Ok(())
        }
    }
}
