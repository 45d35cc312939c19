//! Resource throttling for verified file transfers
//!
//! This crate bounds the resources a transfer may consume. It provides three limiters:
//!
//! 1. **Open Files Limit** - global cap on simultaneously open file handles
//! 2. **Chunk IOPS Throttle** - global cap on chunk reads per second
//! 3. **Read Gate** - per-transfer cap on in-flight source reads (bounds chunk buffer memory)
//!
//! All of them are token-bucket semaphores. A limit of 0 disables the limiter.
//!
//! # Open Files Limit
//!
//! ```rust,no_run
//! use throttle::{set_max_open_files, open_file_permit};
//!
//! # async fn example() {
//! set_max_open_files(8000);
//!
//! let _guard = open_file_permit().await;
//! // open the file here - the permit is released when the guard is dropped
//! # }
//! ```
//!
//! # Chunk IOPS Throttle
//!
//! Every chunk read costs one token. Tokens are put back by a background task:
//!
//! ```rust,no_run
//! use throttle::{init_iops_tokens, run_iops_replenish_thread, get_chunk_iops_token};
//! use std::time::Duration;
//!
//! # async fn example() {
//! // 100 chunks every 100ms = 1000 chunks/sec (~1 GiB/s with 1 MiB chunks)
//! init_iops_tokens(100);
//! tokio::spawn(run_iops_replenish_thread(100, Duration::from_millis(100)));
//!
//! get_chunk_iops_token().await;
//! // read the chunk here
//! # }
//! ```
//!
//! # Read Gate
//!
//! ```rust,no_run
//! # async fn example() {
//! let gate = throttle::ReadGate::new(4);
//! let _permit = gate.enter().await;
//! // at most 4 tasks get here at the same time
//! # }
//! ```

mod semaphore;

pub use semaphore::Semaphore;

static OPEN_FILES_LIMIT: std::sync::LazyLock<Semaphore> = std::sync::LazyLock::new(Semaphore::new);
static IOPS_THROTTLE: std::sync::LazyLock<Semaphore> = std::sync::LazyLock::new(Semaphore::new);

pub fn set_max_open_files(max_open_files: usize) {
    tracing::debug!("max open files: {}", max_open_files);
    OPEN_FILES_LIMIT.setup(max_open_files);
}

pub struct OpenFileGuard {
    _permit: Option<tokio::sync::SemaphorePermit<'static>>,
}

pub async fn open_file_permit() -> OpenFileGuard {
    OpenFileGuard {
        _permit: OPEN_FILES_LIMIT.acquire().await,
    }
}

pub fn init_iops_tokens(iops_tokens: usize) {
    tracing::debug!("chunk iops tokens per interval: {}", iops_tokens);
    IOPS_THROTTLE.setup(iops_tokens);
}

pub async fn get_chunk_iops_token() {
    IOPS_THROTTLE.consume().await;
}

pub async fn run_iops_replenish_thread(replenish: usize, interval: std::time::Duration) {
    IOPS_THROTTLE
        .run_replenish_thread(replenish, interval)
        .await;
}

/// Bounds the number of concurrent source reads of a single transfer.
#[derive(Debug)]
pub struct ReadGate {
    sem: Semaphore,
}

/// Held while a source read is in flight.
pub struct ReadPermit<'a> {
    _permit: Option<tokio::sync::SemaphorePermit<'a>>,
}

impl ReadGate {
    /// Creates a gate admitting `capacity` readers at once (0 = unlimited).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Semaphore::with_capacity(capacity),
        }
    }

    pub async fn enter(&self) -> ReadPermit<'_> {
        ReadPermit {
            _permit: self.sem.acquire().await,
        }
    }

    #[must_use]
    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }
}
