//! FIFO mutual exclusion for async critical sections.

use std::future::Future;

use tokio::sync::Mutex;

/// Async mutex that runs critical sections one at a time, in request order.
///
/// Built on [`tokio::sync::Mutex`], which hands the lock out first-come
/// first-served. The guard is dropped however the body exits, so a failing
/// or panicking section never leaves the lock held.
#[derive(Debug, Default)]
pub struct SerialMutex {
    inner: Mutex<()>,
}

impl SerialMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` exclusively.
    ///
    /// `f` is not called until every earlier `with_lock` body has finished.
    /// Its output, including any error, is returned after the lock is released.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        f().await
    }

    /// Whether a critical section is currently running.
    pub fn is_locked(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}
