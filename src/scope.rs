//! Per-request cancellation scope.
//!
//! Every chat request owns one [`RequestScope`]: a cancellation token plus a
//! hard deadline. Client disconnects, the abort endpoint, deadline expiry and
//! upstream failures all cancel the same token, and every backend call runs
//! through [`RequestScope::run`] so in-flight I/O stops promptly.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RequestScope {
    token: CancellationToken,
    deadline: Instant,
}

impl RequestScope {
    pub fn new(deadline: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Instant::now() + deadline,
        }
    }

    /// A handle other tasks can use to observe or trigger cancellation.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Drive `fut` to completion unless the scope is cancelled or the
    /// deadline passes first. Deadline expiry also cancels the token so
    /// sibling tasks stop too.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep_until(self.deadline) => {
                self.token.cancel();
                Err(Error::DeadlineExceeded)
            }
            result = fut => result,
        }
    }
}

/// Cancels the scope when dropped. Attached to the SSE generator so a client
/// disconnect (which drops the response body) propagates to backend I/O.
pub struct ScopeGuard {
    scope: RequestScope,
}

impl ScopeGuard {
    pub fn new(scope: RequestScope) -> Self {
        Self { scope }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}
