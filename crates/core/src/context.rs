//! Cancellation and deadline context threaded through accessor and modifier calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::AccessError;

#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Child context cancelled with the parent, and additionally bounded by `timeout`.
    /// The earlier of the two deadlines wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mine = Instant::now() + timeout;
        let deadline = Some(self.deadline.map_or(mine, |d| d.min(mine)));
        Self { cancel: self.cancel.child_token(), deadline }
    }

    /// Child context cancelled with the parent, cancellable on its own.
    pub fn child(&self) -> Self {
        Self { cancel: self.cancel.child_token(), deadline: self.deadline }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves once this context (or an ancestor) is cancelled. Deadlines do not fire it.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The reason this context is done, if it is.
    pub fn err(&self) -> Option<AccessError> {
        if self.cancel.is_cancelled() {
            return Some(AccessError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(AccessError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Run `fut` until it completes or the context is done, whichever comes first.
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output, AccessError> {
        if let Some(e) = self.err() {
            return Err(e);
        }
        let expiry = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AccessError::Cancelled),
            _ = expiry => Err(AccessError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}
