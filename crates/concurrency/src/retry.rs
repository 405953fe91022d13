//! Bounded retry for environmental failures inside a single call.
//!
//! Only `Io` and `Timeout` class failures are retried; user errors,
//! conflicts and fatal errors propagate immediately. The jittered delay
//! schedule is shared with lock acquisition.

use sop_core::{Context, Result};
use sop_storage::RetryPolicy;

/// Run `op`, retrying environmental failures until the policy's budget is
/// spent. The last error is surfaced unchanged.
pub fn with_io_retries<T>(
    ctx: &Context,
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        ctx.check()?;
        match op() {
            Err(e) if e.is_environmental() && attempt + 1 < policy.max_attempts => {
                tracing::debug!(attempt, error = %e, "environmental failure, retrying");
                std::thread::sleep(policy.delay_for(attempt));
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sop_core::Error;
    use std::time::Duration;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn retries_io_then_succeeds() {
        let ctx = Context::new();
        let mut calls = 0;
        let result = with_io_retries(&ctx, &quick_policy(), || {
            calls += 1;
            if calls < 3 {
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "flaky",
                )))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[test]
    fn budget_exhaustion_surfaces_last_error() {
        let ctx = Context::new();
        let mut calls = 0;
        let result: Result<()> = with_io_retries(&ctx, &quick_policy(), || {
            calls += 1;
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "always",
            )))
        });
        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn user_errors_do_not_retry() {
        let ctx = Context::new();
        let mut calls = 0;
        let result: Result<()> = with_io_retries(&ctx, &quick_policy(), || {
            calls += 1;
            Err(Error::not_found("x"))
        });
        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(calls, 1);
    }
}
