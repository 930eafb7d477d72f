// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Exclusive, bounded-wait access to a board.
//!
//! Every hardware access site goes through [`HardwareLock::try_lock_for`], so
//! no two operations on the same board ever run concurrently and no caller
//! waits longer than its timeout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Shared handle to a value guarded by a try-lock-with-timeout mutex.
pub struct HardwareLock<T> {
    inner: Arc<Mutex<T>>,
}

/// Scoped guard; the lock is released when it is dropped.
pub type HardwareGuard<T> = OwnedMutexGuard<T>;

impl<T> HardwareLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(Mutex::new(value)),
        }
    }

    /// Wait at most `timeout` for exclusive access.
    ///
    /// Returns `None` when the lock is still held by someone else once the
    /// timeout elapses.
    pub async fn try_lock_for(&self, timeout: Duration) -> Option<HardwareGuard<T>> {
        tokio::time::timeout(timeout, self.inner.clone().lock_owned())
            .await
            .ok()
    }

    /// Take the lock only if it is free right now.
    pub fn try_lock(&self) -> Option<HardwareGuard<T>> {
        self.inner.clone().try_lock_owned().ok()
    }
}

impl<T> Clone for HardwareLock<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_acquires_free_lock() {
        let lock = HardwareLock::new(0u32);
        let mut guard = lock
            .try_lock_for(Duration::from_millis(10))
            .await
            .expect("free lock");
        *guard += 1;
        drop(guard);
        assert_eq!(*lock.try_lock().expect("released"), 1);
    }

    #[tokio::test]
    async fn test_times_out_when_held() {
        let lock = HardwareLock::new(());
        let _held = lock.try_lock().expect("first holder");

        let started = Instant::now();
        let second = lock.try_lock_for(Duration::from_millis(50)).await;
        assert!(second.is_none());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(45));
        assert!(waited < Duration::from_millis(500));
    }
}
