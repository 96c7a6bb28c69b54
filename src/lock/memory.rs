use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    errors::{self, ErrorCodes, Errors},
    lock::LockProvider,
};

// Process-local named try-locks: one AtomicBool per lock name.
#[derive(Debug, Default)]
pub struct InProcessLockProvider {
    locks: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl InProcessLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, name: &str) -> errors::Result<Arc<AtomicBool>> {
        let mut locks = self.locks.lock().map_err(|e| {
            Errors::new(ErrorCodes::LockAcquireError)
                .with_message(format!("Lock table is poisoned: {}", e))
        })?;

        Ok(locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone())
    }
}

impl LockProvider for InProcessLockProvider {
    fn try_lock(&self, name: &str) -> errors::Result<bool> {
        let flag = self.flag(name)?;
        Ok(!flag.swap(true, Ordering::Acquire))
    }

    fn unlock(&self, name: &str) -> errors::Result<()> {
        let flag = self.flag(name)?;

        if !flag.swap(false, Ordering::Release) {
            return Err(Errors::new(ErrorCodes::LockReleaseError)
                .with_message(format!("Lock '{}' is not held", name)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_lock() {
        let provider = InProcessLockProvider::new();
        assert!(provider.try_lock("t/Segment_0.lock").unwrap());
        assert!(!provider.try_lock("t/Segment_0.lock").unwrap());
        assert!(provider.try_lock("t/Segment_1.lock").unwrap());

        provider.unlock("t/Segment_0.lock").unwrap();
        assert!(provider.try_lock("t/Segment_0.lock").unwrap());
    }

    #[test]
    fn test_unlock_not_held() {
        let provider = InProcessLockProvider::new();
        let err = provider.unlock("t/Segment_0.lock").unwrap_err();
        assert!(err.is(ErrorCodes::LockReleaseError));
    }
}
