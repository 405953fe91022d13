//! Cancellation and deadline carrier.
//!
//! A `Context` is cloned into every call that can block on I/O or lock
//! acquisition. Cancellation is cooperative: `cancel()` sets a flag that the
//! next checkable point observes (before I/O, between retry attempts).
//! Already-published commits are never reversed by cancellation.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Inner {
    canceled: AtomicBool,
    deadline: Option<Instant>,
}

/// Shared cancellation/deadline handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// A context that never expires and starts uncanceled.
    pub fn new() -> Self {
        Context {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: None,
            }),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Context {
            inner: Arc::new(Inner {
                canceled: AtomicBool::new(false),
                deadline: Some(Instant::now() + timeout),
            }),
        }
    }

    /// Request cancellation. Takes effect at the next checkable point.
    pub fn cancel(&self) {
        self.inner.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast when canceled or expired. Called before I/O and between
    /// retry attempts.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            return Err(Error::Canceled);
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() > deadline {
                return Err(Error::Timeout);
            }
        }
        Ok(())
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_passes() {
        let ctx = Context::new();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
    }

    #[test]
    fn cancel_is_observed_by_clones() {
        let ctx = Context::new();
        let clone = ctx.clone();
        ctx.cancel();
        assert!(matches!(clone.check(), Err(Error::Canceled)));
    }

    #[test]
    fn deadline_expiry_reports_timeout() {
        let ctx = Context::with_timeout(Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(ctx.check(), Err(Error::Timeout)));
    }
}
