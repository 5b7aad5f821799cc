//! Operation context: cancellation plus an optional deadline.
//!
//! Every externally visible operation in the core (enqueue, dequeue, batch
//! dispatch, enrichment) takes an [`OpContext`]. Cancellation is cooperative:
//! work already owned by a worker is allowed to finish, items still queued
//! stay queued.

use std::future::Future;
use std::time::Duration;

use snafu::Snafu;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an operation stopped before producing a result.
#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[snafu(display("operation was cancelled"))]
    Cancelled,
    #[snafu(display("operation deadline exceeded"))]
    DeadlineExceeded,
}

/// Cancellation token and optional deadline for a single operation.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that never cancels and never expires.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// A context bound to the given cancellation token.
    pub fn with_cancellation(cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            deadline: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Attach a deadline, keeping the existing cancellation token.
    #[must_use]
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The underlying cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Whether the context has already been cancelled or expired.
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled()
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Check the context without suspending, for use inside per-item loops.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.cancellation.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Interrupted::DeadlineExceeded);
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context cancels or expires first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, Interrupted>
    where
        F: Future,
    {
        // Both guards are optional; a default context degenerates to `fut`.
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    () = self.cancellation.cancelled() => Err(Interrupted::Cancelled),
                    () = tokio::time::sleep_until(deadline) => Err(Interrupted::DeadlineExceeded),
                    out = fut => Ok(out),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    () = self.cancellation.cancelled() => Err(Interrupted::Cancelled),
                    out = fut => Ok(out),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_pending_future() {
        let ctx = OpContext::with_timeout(Duration::from_millis(50));
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_interrupts_pending_future() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancellation(token.clone());
        token.cancel();
        let result = ctx.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn completed_future_wins() {
        let ctx = OpContext::unbounded();
        let result = ctx.run(async { 7 }).await;
        assert_eq!(result, Ok(7));
        assert!(ctx.check().is_ok());
    }
}
