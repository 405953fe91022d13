//! Multi-key lock acquisition with bounded, jittered retry.
//!
//! Commit takes its locks in globally sorted key order so two transactions
//! with overlapping write sets can never deadlock. Acquisition retries with
//! jittered backoff until the retry budget runs out (`LockTimeout`);
//! acquired keys are released on failure, on explicit release, and as a
//! last resort when the `LockSet` drops.

use crate::cache::DistributedCache;
use rand::Rng;
use sop_core::{Context, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry budget for one acquisition pass.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with full jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jittered = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}

/// Acquires and tracks lease locks for one transaction.
pub struct LockManager {
    backend: Arc<dyn DistributedCache>,
    owner: String,
    lease: Duration,
    policy: RetryPolicy,
}

/// The set of keys currently held. Release is explicit on the happy path;
/// drop releases whatever is left after a failure.
pub struct LockSet {
    backend: Arc<dyn DistributedCache>,
    owner: String,
    held: Vec<String>,
}

impl LockManager {
    pub fn new(
        backend: Arc<dyn DistributedCache>,
        owner: impl Into<String>,
        lease: Duration,
        policy: RetryPolicy,
    ) -> Self {
        LockManager {
            backend,
            owner: owner.into(),
            lease,
            policy,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Acquire every key, sorted, all-or-nothing. On any failure the keys
    /// already taken are released before the error propagates.
    pub fn acquire_all(&self, ctx: &Context, keys: &[String]) -> Result<LockSet> {
        let mut sorted: Vec<String> = keys.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut set = LockSet {
            backend: Arc::clone(&self.backend),
            owner: self.owner.clone(),
            held: Vec::with_capacity(sorted.len()),
        };
        for key in sorted {
            self.acquire_one(ctx, &key)?;
            set.held.push(key);
        }
        Ok(set)
    }

    fn acquire_one(&self, ctx: &Context, key: &str) -> Result<()> {
        for attempt in 0..self.policy.max_attempts {
            ctx.check()?;
            if self.backend.try_lock(key, &self.owner, self.lease)? {
                return Ok(());
            }
            std::thread::sleep(self.policy.delay_for(attempt));
        }
        debug!(key, attempts = self.policy.max_attempts, "lock retry budget exhausted");
        Err(Error::lock_timeout(key))
    }

    /// Renew every held lease. A lost lease means another owner may already
    /// hold the key, so the whole set is poisoned.
    pub fn renew(&self, set: &LockSet) -> Result<()> {
        for key in &set.held {
            if !self.backend.renew_lock(key, &self.owner, self.lease)? {
                return Err(Error::lock_timeout(key.clone()));
            }
        }
        Ok(())
    }
}

impl LockSet {
    pub fn keys(&self) -> &[String] {
        &self.held
    }

    /// Release everything. Failures are logged, not propagated: leases
    /// expire on their own.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        for key in self.held.drain(..) {
            match self.backend.unlock(&key, &self.owner) {
                Ok(true) => {}
                Ok(false) => warn!(key, "lease was already lost at release"),
                Err(e) => warn!(key, error = %e, "lock release failed; lease will expire"),
            }
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_inner();
    }
}
