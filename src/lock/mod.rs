use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use crate::{
    config::{RetryPolicy, TABLE_STATUS_LOCK},
    errors::{self, ErrorCodes, Errors},
};

pub mod file;
pub mod memory;

pub use file::FileLockProvider;
pub use memory::InProcessLockProvider;

// Named advisory lock backend. Implementations only need a non-blocking try and a release;
// retry and backoff live in SegmentLock.
pub trait LockProvider: std::fmt::Debug + Send + Sync {
    // Returns Ok(false) when the lock is held by someone else.
    fn try_lock(&self, name: &str) -> errors::Result<bool>;

    // Releasing a lock that is not held is an error.
    fn unlock(&self, name: &str) -> errors::Result<()>;
}

/// A held lock.
///
/// Clones share the released flag, so the lock can be handed to another owner (a deferred
/// transaction action) while the first holder keeps a copy for its own unconditional
/// release. Only the first `release` reaches the provider.
#[derive(Debug, Clone)]
pub struct LockHandle {
    name: String,
    provider: Arc<dyn LockProvider>,
    released: Arc<AtomicBool>,
}

impl LockHandle {
    fn new(name: String, provider: Arc<dyn LockProvider>) -> Self {
        Self {
            name,
            provider,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn release(&self) -> errors::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.provider.unlock(&self.name).map_err(|e| {
            Errors::new(ErrorCodes::LockReleaseError)
                .with_message(format!("Failed to release lock '{}': {}", self.name, e))
        })?;

        log::debug!("Released lock {}", self.name);

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SegmentLock {
    provider: Arc<dyn LockProvider>,
}

impl SegmentLock {
    pub fn new(provider: Arc<dyn LockProvider>) -> Self {
        Self { provider }
    }

    pub fn segment_lock_name(table: &str, segment_id: &str) -> String {
        format!("{}/Segment_{}.lock", table, segment_id)
    }

    pub fn table_status_lock_name(table: &str) -> String {
        format!("{}/{}", table, TABLE_STATUS_LOCK)
    }

    // Lock one segment of a table. At most one job holds it at a time; a second loader
    // targeting the same id gets LockTimeout once the retry budget is spent.
    pub async fn acquire(
        &self,
        table: &str,
        segment_id: &str,
        policy: RetryPolicy,
    ) -> errors::Result<LockHandle> {
        self.acquire_named(Self::segment_lock_name(table, segment_id), policy)
            .await
    }

    // Short-lived lock guarding read-modify-write of the table status file.
    pub async fn acquire_table_status(
        &self,
        table: &str,
        policy: RetryPolicy,
    ) -> errors::Result<LockHandle> {
        self.acquire_named(Self::table_status_lock_name(table), policy)
            .await
    }

    async fn acquire_named(&self, name: String, policy: RetryPolicy) -> errors::Result<LockHandle> {
        for attempt in 0..=policy.max_retries {
            if self.provider.try_lock(&name)? {
                log::debug!("Acquired lock {} (attempt {})", name, attempt + 1);
                return Ok(LockHandle::new(name, self.provider.clone()));
            }

            if attempt < policy.max_retries {
                log::debug!(
                    "Lock {} is busy, retrying in {:?} ({}/{})",
                    name,
                    policy.backoff,
                    attempt + 1,
                    policy.max_retries
                );
                tokio::time::sleep(policy.backoff).await;
            }
        }

        log::warn!(
            "Giving up on lock {} after {} retries",
            name,
            policy.max_retries
        );

        Err(Errors::new(ErrorCodes::LockTimeout).with_message(format!(
            "Lock '{}' is held by another job ({} retries exhausted)",
            name, policy.max_retries
        )))
    }
}
