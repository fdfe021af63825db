//! Cancellation and deadline context threaded through storage operations

use crate::storage::error::{StorageError, StorageResult};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation token plus an optional deadline.
///
/// Cloning shares the token; [`Context::child`] derives a context that is
/// cancelled with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Derive a child, keeping the earlier of the two deadlines
    pub fn child(&self, timeout: Option<Duration>) -> Self {
        let deadline = match (self.deadline, timeout.map(|t| Instant::now() + t)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns a future to await on cancellation
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Fail fast if the context is done
    pub fn check(&self) -> StorageResult<()> {
        if self.token.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}
