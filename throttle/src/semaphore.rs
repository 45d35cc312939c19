use std::sync::atomic::{AtomicBool, Ordering};

/// Token pool that can be switched off entirely.
///
/// A capacity of 0 disables the limit: `acquire` then returns immediately without a permit.
#[derive(Debug)]
pub struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

impl Semaphore {
    /// Creates a disabled semaphore, call [`Semaphore::setup`] to enable it.
    #[must_use]
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(tokio::sync::Semaphore::MAX_PERMITS),
        }
    }

    /// Creates a semaphore limited to `capacity` permits (0 = unlimited).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let sem = Self::new();
        sem.setup(capacity);
        sem
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn available_permits(&self) -> usize {
        self.sem.available_permits()
    }

    pub async fn acquire(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        if self.is_enabled() {
            // the semaphore is never closed
            self.sem.acquire().await.ok()
        } else {
            None
        }
    }

    pub async fn consume(&self) {
        if self.is_enabled() {
            if let Ok(permit) = self.sem.acquire().await {
                permit.forget();
            }
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}
