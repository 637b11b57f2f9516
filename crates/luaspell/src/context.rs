//! Execution context: cancellation plus an optional deadline.
//!
//! Every suspension point in the engine (pool lease, channel op, promise
//! await, pipeline run) takes an [`ExecContext`]. Cancellation and deadline
//! expiry wake blocked callers with the two distinct canonical errors:
//! explicit cancellation surfaces [`EngineError::Cancelled`], deadline expiry
//! surfaces [`EngineError::Timeout`]. Callers match on the kind to tell them
//! apart.
//!
//! Contexts form a tree: [`ExecContext::child`] derives a context that is
//! cancelled whenever its parent is, without the child's cancellation
//! propagating upward.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

/// Cancellation token plus optional deadline, passed through every blocking
/// surface of the engine. Cheap to clone; clones share the same token.
#[derive(Debug, Clone)]
pub struct ExecContext {
    token: CancellationToken,
    deadline: Option<Instant>,
    /// The duration the deadline was derived from, kept for error reporting.
    limit: Option<Duration>,
}

impl ExecContext {
    /// A context that never expires and is only cancelled explicitly.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            limit: None,
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
            limit: Some(timeout),
        }
    }

    /// Derives a child context: cancelled when `self` is cancelled, sharing
    /// the same deadline. Cancelling the child does not cancel the parent.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            limit: self.limit,
        }
    }

    /// Returns a copy of this context whose deadline is the earlier of the
    /// existing one and `now + timeout`. Used by the pipeline to apply the
    /// configured default execution limit.
    pub fn bounded_by(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        match self.deadline {
            Some(existing) if existing <= candidate => self.clone(),
            _ => Self {
                token: self.token.clone(),
                deadline: Some(candidate),
                limit: Some(timeout),
            },
        }
    }

    /// Explicitly cancels this context (and all children).
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once [`cancel`](Self::cancel) has been called on this context or
    /// an ancestor. Deadline expiry does not set this.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the deadline (if any) has passed.
    pub fn deadline_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The timeout this context's deadline was derived from, in milliseconds.
    /// 0 when the context has no deadline.
    pub fn limit_ms(&self) -> u64 {
        self.limit.map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// The underlying token, for integration with `tokio::select!`.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fails fast if the context is already cancelled or expired.
    ///
    /// Cancellation wins when both have happened: an explicit cancel is a
    /// stronger statement of intent than a deadline racing it.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if self.deadline_expired() {
            return Err(EngineError::Timeout {
                limit_ms: self.limit_ms(),
            });
        }
        Ok(())
    }

    /// Runs `fut` until completion, cancellation, or deadline — whichever
    /// comes first. This is the single wait primitive every suspension point
    /// in the engine goes through.
    ///
    /// Branch order is biased, not random: a ready result is delivered even
    /// when the context fired in the same poll, and cancellation is checked
    /// before the deadline so an explicit cancel is never reported as a
    /// timeout — the same precedence [`check`](Self::check) applies.
    pub async fn run_until<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = T>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    out = fut => Ok(out),
                    _ = self.token.cancelled() => Err(EngineError::Cancelled),
                    _ = tokio::time::sleep_until(deadline) => Err(EngineError::Timeout {
                        limit_ms: self.limit_ms(),
                    }),
                }
            }
            None => {
                tokio::select! {
                    biased;
                    out = fut => Ok(out),
                    _ = self.token.cancelled() => Err(EngineError::Cancelled),
                }
            }
        }
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}
