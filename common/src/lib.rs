//! Common utilities and types for verified chunked file copies
//!
//! This crate provides the core of `vcp`: a single file is copied chunk by chunk, every chunk is
//! read back and compared against the source before the transfer moves on, and the finished copy
//! is checked once more with a whole-file hash.
//!
//! # Core Modules
//!
//! - [`planner`] - chunk and region arithmetic
//! - [`digest`] - fast per-chunk (MD5) and strong whole-file (SHA-256) hashing
//! - [`fs`] - the filesystem capability used by transfers
//! - [`chunk`] - the write-read-verify protocol for a single chunk
//! - [`ledger`] - record of verified chunks
//! - [`transfer`] - sequential and concurrent orchestration, cleanup on failure
//! - [`progress`] - progress counters and their text rendering
//! - [`error`] - typed transfer failures
//!
//! # Progress Reporting
//!
//! Progress is tracked in the global [`PROGRESS`] and can be displayed as an interactive progress
//! bar or as periodic text updates, see [`ProgressType`].
//!
//! # Runtime
//!
//! [`run`] sets up logging, the tokio runtime, the throttles and the progress display, then
//! executes the given async function and prints its summary.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::instrument;

pub mod chunk;
pub mod config;
pub mod digest;
pub mod error;
pub mod fs;
pub mod ledger;
pub mod planner;
pub mod progress;
pub mod transfer;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, RuntimeConfig, ThrottleConfig};
pub use error::TransferError;
pub use transfer::{Report, Settings, Summary};

pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

/// Copies `source` into `destination_dir` on the local filesystem, verifying every chunk.
///
/// The destination file keeps the name of the source and is overwritten if it exists.
#[instrument]
pub async fn transfer_file(
    source: &std::path::Path,
    destination_dir: &std::path::Path,
    settings: &transfer::Settings,
) -> Result<transfer::Report, transfer::Error> {
    transfer::Transferer::new(
        Arc::new(fs::TokioFilesystem),
        Arc::new(digest::StandardDigests),
        *settings,
        &PROGRESS,
    )
    .transfer_file(source, destination_dir)
    .await
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    /// Progress bar when stderr is a terminal, text updates otherwise
    #[default]
    #[value(name = "auto", alias = "Auto")]
    Auto,
    /// Interactive progress bar
    #[value(name = "progress-bar", alias = "ProgressBar")]
    ProgressBar,
    /// Periodic text updates, suitable for logs
    #[value(name = "text-updates", alias = "TextUpdates")]
    TextUpdates,
}

impl ProgressType {
    fn resolve(self) -> Self {
        match self {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        }
    }

    fn default_delay(self) -> std::time::Duration {
        match self {
            ProgressType::TextUpdates => std::time::Duration::from_secs(10),
            _ => std::time::Duration::from_millis(200),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// human readable delay between updates, e.g. "200ms" or "10s"
    pub progress_delay: Option<String>,
}

impl ProgressSettings {
    fn delay(&self, progress_type: ProgressType) -> anyhow::Result<std::time::Duration> {
        match &self.progress_delay {
            Some(delay) => humantime::parse_duration(delay)
                .with_context(|| format!("invalid progress delay {delay:?}")),
            None => Ok(progress_type.default_delay()),
        }
    }
}

type DoneSignal = Arc<(std::sync::Mutex<bool>, std::sync::Condvar)>;

/// Background thread rendering [`PROGRESS`] until dropped.
struct ProgressTracker {
    done: DoneSignal,
    handle: Option<std::thread::JoinHandle<()>>,
}

fn wait_for_done(done: &DoneSignal, delay: std::time::Duration) -> bool {
    let (lock, cvar) = &**done;
    let is_done = lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let (is_done, _) = cvar
        .wait_timeout_while(is_done, delay, |is_done| !*is_done)
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    *is_done
}

fn progress_bar(done: &DoneSignal, delay: std::time::Duration) {
    let pbar = indicatif::ProgressBar::new_spinner();
    let style = indicatif::ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| indicatif::ProgressStyle::default_spinner());
    pbar.set_style(style);
    let mut printer = progress::ProgressPrinter::new(&PROGRESS);
    loop {
        pbar.set_message(printer.print());
        pbar.tick();
        if wait_for_done(done, delay) {
            break;
        }
    }
    pbar.finish_and_clear();
}

fn text_updates(done: &DoneSignal, delay: std::time::Duration) {
    let mut printer = progress::ProgressPrinter::new(&PROGRESS);
    while !wait_for_done(done, delay) {
        eprintln!("{}", printer.print());
    }
}

impl ProgressTracker {
    fn start(settings: &ProgressSettings) -> anyhow::Result<Self> {
        let progress_type = settings.progress_type.resolve();
        let delay = settings.delay(progress_type)?;
        let done: DoneSignal = Arc::new((std::sync::Mutex::new(false), std::sync::Condvar::new()));
        let handle = {
            let done = done.clone();
            std::thread::Builder::new()
                .name("progress".to_string())
                .spawn(move || match progress_type {
                    ProgressType::TextUpdates => text_updates(&done, delay),
                    _ => progress_bar(&done, delay),
                })
                .context("failed to start the progress thread")?
        };
        Ok(Self {
            done,
            handle: Some(handle),
        })
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        let (lock, cvar) = &*self.done;
        *lock.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = true;
        cvar.notify_one();
        let joined = self.handle.take().map(std::thread::JoinHandle::join);
        if matches!(joined, Some(Err(_))) {
            tracing::error!("progress thread panicked");
        }
    }
}

/// Default open files limit: 80% of the soft `RLIMIT_NOFILE`.
fn default_max_open_files() -> anyhow::Result<usize> {
    let (soft, _hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_NOFILE)
        .context("failed reading the open files limit")?;
    let limit = soft / 10 * 8;
    Ok(usize::try_from(limit)
        .unwrap_or(usize::MAX)
        .min(tokio::sync::Semaphore::MAX_PERMITS))
}

/// Splits a chunk reads per second budget into (tokens, replenish interval).
///
/// Budgets that divide evenly by 10 are refilled every 100ms, anything else once per second so
/// the rate stays exact.
fn iops_schedule(iops_throttle: usize) -> (usize, std::time::Duration) {
    if iops_throttle >= 10 && iops_throttle.is_multiple_of(10) {
        (iops_throttle / 10, std::time::Duration::from_millis(100))
    } else {
        (iops_throttle, std::time::Duration::from_secs(1))
    }
}

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = match std::env::var(tracing_subscriber::EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => tracing_subscriber::EnvFilter::try_new(directives)
            .context("invalid RUST_LOG directives")?,
        _ => tracing_subscriber::EnvFilter::new(output.level()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))
}

fn setup_throttle(throttle_config: &ThrottleConfig) -> anyhow::Result<()> {
    throttle_config.validate().map_err(|err| anyhow!(err))?;
    let max_open_files = match throttle_config.max_open_files {
        Some(max_open_files) => max_open_files,
        None => default_max_open_files()?,
    };
    throttle::set_max_open_files(max_open_files);
    if throttle_config.iops_throttle > 0 {
        let (tokens, _) = iops_schedule(throttle_config.iops_throttle);
        throttle::init_iops_tokens(tokens);
    }
    Ok(())
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    builder.build().context("failed to create the tokio runtime")
}

/// Runs `func` with logging, throttles and progress reporting configured.
///
/// Returns `None` if setup failed or `func` returned an error, which has been printed already
/// unless `output.quiet` is set.
pub fn run<Fut, Summary, Error>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    throttle_config: ThrottleConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Error: std::fmt::Display,
    Fut: std::future::Future<Output = Result<Summary, Error>>,
{
    let report_setup_error = |error: anyhow::Error| {
        if !output.quiet {
            eprintln!("{error:#}");
        }
    };
    if let Err(error) = init_tracing(&output) {
        report_setup_error(error);
        return None;
    }
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            report_setup_error(error);
            return None;
        }
    };
    if let Err(error) = setup_throttle(&throttle_config) {
        report_setup_error(error);
        return None;
    }
    let progress_tracker = match progress.as_ref().map(ProgressTracker::start).transpose() {
        Ok(tracker) => tracker,
        Err(error) => {
            report_setup_error(error);
            return None;
        }
    };
    let res = runtime.block_on(async move {
        if throttle_config.iops_throttle > 0 {
            let (tokens, interval) = iops_schedule(throttle_config.iops_throttle);
            tokio::spawn(throttle::run_iops_replenish_thread(tokens, interval));
        }
        func().await
    });
    drop(progress_tracker);
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                println!("walltime: {:.2?}", PROGRESS.get_duration());
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("{error:#}");
            }
            None
        }
    }
}
