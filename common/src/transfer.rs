//! Transfer orchestration
//!
//! A transfer copies one file into a destination directory chunk by chunk, either:
//! - sequentially: one source handle and one destination handle, chunks in index order, or
//! - concurrently: the file is split into regions, each region is handled by its own task.
//!
//! In both modes there's exactly one destination write handle, guarded by an async mutex that is
//! held only for the write+flush of a single attempt. In concurrent mode verification reads go
//! through a separate destination handle per region and are never gated by that lock.
//!
//! Once all chunks are verified the whole source and the whole destination are hashed again with
//! a strong hash. Any failure removes the partially written destination file.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use tracing::instrument;

use crate::chunk::{ChunkTransfer, ReadBack, MAX_RETRY_ATTEMPTS};
use crate::digest::{Digest, DigestProvider};
use crate::error::TransferError;
use crate::fs::{BoxedStream, Filesystem};
use crate::ledger::{LedgerEntry, TransferLedger};
use crate::planner::{self, Region};
use crate::progress;

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_REGION_COUNT: usize = 4;
pub const DEFAULT_MAX_CONCURRENT_READS: usize = 4;

/// Error type for transfer operations that preserves the summary of verified work.
///
/// The Display implementation shows the full error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }

    /// The typed failure behind this error, if it was one.
    #[must_use]
    pub fn kind(&self) -> Option<&TransferError> {
        self.source.downcast_ref::<TransferError>()
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    pub chunk_size: u64,
    pub concurrent: bool,
    /// number of regions the file is split into in concurrent mode
    pub region_count: usize,
    /// source reads allowed in flight at once, 0 means no limit
    pub max_concurrent_reads: usize,
    /// write+verify attempts per chunk
    pub max_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrent: false,
            region_count: DEFAULT_REGION_COUNT,
            max_concurrent_reads: DEFAULT_MAX_CONCURRENT_READS,
            max_attempts: MAX_RETRY_ATTEMPTS,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            return Err(anyhow!("chunk size must be greater than 0"));
        }
        if self.region_count == 0 {
            return Err(anyhow!("region count must be greater than 0"));
        }
        if self.max_attempts == 0 {
            return Err(anyhow!("at least one write attempt per chunk is required"));
        }
        if usize::try_from(self.chunk_size).is_err() {
            return Err(anyhow!(
                "chunk size {} does not fit in memory",
                bytesize::ByteSize(self.chunk_size)
            ));
        }
        Ok(())
    }
}

/// Immutable description of a single transfer.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TransferPlan {
    pub source: std::path::PathBuf,
    pub destination: std::path::PathBuf,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u64,
    pub concurrent: bool,
}

impl TransferPlan {
    #[must_use]
    pub fn new(
        source: &std::path::Path,
        destination: &std::path::Path,
        file_size: u64,
        settings: &Settings,
    ) -> Self {
        Self {
            source: source.to_path_buf(),
            destination: destination.to_path_buf(),
            file_size,
            chunk_size: settings.chunk_size,
            total_chunks: planner::total_chunks(file_size, settings.chunk_size),
            concurrent: settings.concurrent,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub bytes_copied: u64,
    pub chunks_verified: u64,
    pub chunk_retries: u64,
}

impl Summary {
    fn chunk(length: u64, attempts: u32) -> Self {
        Self {
            bytes_copied: length,
            chunks_verified: 1,
            chunk_retries: u64::from(attempts - 1),
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            chunks_verified: self.chunks_verified + other.chunks_verified,
            chunk_retries: self.chunk_retries + other.chunk_retries,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            chunks verified: {}\n\
            chunk retries: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.chunks_verified,
            self.chunk_retries,
        )
    }
}

/// Result of a successful, fully verified transfer.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Report {
    pub plan: TransferPlan,
    pub summary: Summary,
    /// verified chunks ordered by offset
    pub ledger: Vec<LedgerEntry>,
    pub source_digest: Digest,
    pub destination_digest: Digest,
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}\n\
            sha256: {}",
            &self.summary, &self.destination_digest,
        )
    }
}

/// State shared by all workers of one transfer.
struct Shared {
    plan: TransferPlan,
    settings: Settings,
    fs: Arc<dyn Filesystem>,
    digests: Arc<dyn DigestProvider>,
    writer: tokio::sync::Mutex<BoxedStream>,
    ledger: TransferLedger,
    read_gate: throttle::ReadGate,
    progress: &'static progress::Progress,
}

#[derive(Copy, Clone, Debug)]
enum ReadBackMode {
    Writer,
    Own,
}

#[instrument(skip(shared), fields(start = region.start, end = region.end))]
async fn transfer_region(shared: &Shared, region: Region, mode: ReadBackMode) -> Result<Summary, Error> {
    let plan = &shared.plan;
    let mut summary = Summary::default();
    // one permit covers both handles of a worker, so workers never wait while holding a permit
    let _open_file_guard = throttle::open_file_permit().await;
    let mut source = shared
        .fs
        .open_read(&plan.source)
        .await
        .map_err(|err| Error::new(err, summary))?;
    let mut reader = match mode {
        ReadBackMode::Writer => None,
        ReadBackMode::Own => Some(
            shared
                .fs
                .open_read(&plan.destination)
                .await
                .map_err(|err| Error::new(err, summary))?,
        ),
    };
    let transfer = ChunkTransfer {
        digests: shared.digests.as_ref(),
        ledger: &shared.ledger,
        read_gate: &shared.read_gate,
        progress: shared.progress,
        max_attempts: shared.settings.max_attempts,
    };
    for index in planner::region_chunks(&region, plan.chunk_size) {
        let _chunk_guard = shared.progress.chunks.guard();
        let bounds = planner::chunk_bounds(index, plan.file_size, plan.chunk_size)
            .map_err(|err| Error::new(err.into(), summary))?;
        let chunk = transfer
            .read_source(source.as_mut(), bounds)
            .await
            .map_err(|err| Error::new(err, summary))?;
        let read_back = match reader.as_mut() {
            Some(reader) => ReadBack::Own(reader.as_mut()),
            None => ReadBack::Writer,
        };
        let verified = transfer
            .write_and_verify(&chunk, &shared.writer, read_back)
            .await
            .map_err(|err| Error::new(err, summary))?;
        summary = summary + Summary::chunk(bounds.length, verified.attempts);
    }
    Ok(summary)
}

/// Runs every non-empty region in its own task, stopping all of them on the first failure.
async fn transfer_regions(shared: Arc<Shared>) -> Result<Summary, Error> {
    let plan = &shared.plan;
    let mut join_set = tokio::task::JoinSet::new();
    for region in planner::split_regions(plan.file_size, shared.settings.region_count) {
        if planner::region_chunks(&region, plan.chunk_size).is_empty() {
            tracing::debug!("region {:?} holds no chunk starts, skipping", region);
            continue;
        }
        let shared = shared.clone();
        join_set.spawn(async move { transfer_region(&shared, region, ReadBackMode::Own).await });
    }
    let mut summary = Summary::default();
    while let Some(res) = join_set.join_next().await {
        let error = match res {
            Ok(Ok(region_summary)) => {
                summary = summary + region_summary;
                continue;
            }
            Ok(Err(error)) => Error::new(error.source, summary + error.summary),
            Err(join_error) => Error::new(
                anyhow::Error::new(join_error).context("region worker failed"),
                summary,
            ),
        };
        tracing::debug!("cancelling {} remaining region(s)", join_set.len());
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        return Err(error);
    }
    Ok(summary)
}

/// Drives verified transfers using the given filesystem and digest capabilities.
pub struct Transferer {
    fs: Arc<dyn Filesystem>,
    digests: Arc<dyn DigestProvider>,
    settings: Settings,
    progress: &'static progress::Progress,
}

impl Transferer {
    pub fn new(
        fs: Arc<dyn Filesystem>,
        digests: Arc<dyn DigestProvider>,
        settings: Settings,
        progress: &'static progress::Progress,
    ) -> Self {
        Self {
            fs,
            digests,
            settings,
            progress,
        }
    }

    /// Copies `source` into `destination_dir`, keeping its file name.
    pub async fn transfer_file(
        &self,
        source: &std::path::Path,
        destination_dir: &std::path::Path,
    ) -> Result<Report, Error> {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow!("source path {:?} has no file name", source))
            .map_err(|err| Error::new(err, Default::default()))?;
        self.transfer(source, &destination_dir.join(file_name)).await
    }

    /// Copies `source` to the exact `destination` path, overwriting it.
    #[instrument(skip(self))]
    pub async fn transfer(
        &self,
        source: &std::path::Path,
        destination: &std::path::Path,
    ) -> Result<Report, Error> {
        self.settings
            .validate()
            .map_err(|err| Error::new(err, Default::default()))?;
        let file_size = self
            .fs
            .file_size(source)
            .await
            .map_err(|err| Error::new(err, Default::default()))?;
        let plan = TransferPlan::new(source, destination, file_size, &self.settings);
        tracing::info!(
            "transferring {:?} -> {:?}: {} in {} chunk(s) of {}, {} mode",
            &plan.source,
            &plan.destination,
            bytesize::ByteSize(plan.file_size),
            plan.total_chunks,
            bytesize::ByteSize(plan.chunk_size),
            if plan.concurrent { "concurrent" } else { "sequential" },
        );
        self.progress.bytes_total.add(plan.file_size);
        let _open_file_guard = throttle::open_file_permit().await;
        let writer = self
            .fs
            .create(&plan.destination, plan.file_size)
            .await
            .map_err(|err| Error::new(err, Default::default()))?;
        match self.run(plan.clone(), writer).await {
            Ok(report) => {
                tracing::info!(
                    verified = true,
                    "{:?} verified, {} chunk(s), sha256 {}",
                    &report.plan.destination,
                    report.ledger.len(),
                    &report.destination_digest
                );
                Ok(report)
            }
            Err(error) => {
                tracing::error!("transfer of {:?} failed: {:#}", &plan.source, &error.source);
                self.remove_destination(&plan.destination).await;
                Err(error)
            }
        }
    }

    async fn run(&self, plan: TransferPlan, writer: BoxedStream) -> Result<Report, Error> {
        let shared = Arc::new(Shared {
            plan,
            settings: self.settings,
            fs: self.fs.clone(),
            digests: self.digests.clone(),
            writer: tokio::sync::Mutex::new(writer),
            ledger: TransferLedger::new(),
            read_gate: throttle::ReadGate::new(self.settings.max_concurrent_reads),
            progress: self.progress,
        });
        let plan = &shared.plan;
        let summary = if plan.total_chunks == 0 {
            tracing::debug!("empty source, no chunks to transfer");
            Summary::default()
        } else if plan.concurrent {
            transfer_regions(shared.clone()).await?
        } else {
            let whole_file = Region {
                start: 0,
                end: plan.file_size,
            };
            transfer_region(&shared, whole_file, ReadBackMode::Writer).await?
        };
        let ledger = shared.ledger.sorted_entries();
        debug_assert!(crate::ledger::covers_file(
            &ledger,
            plan.file_size,
            plan.chunk_size
        ));
        let (source_digest, destination_digest) = self
            .verify_whole_file(plan)
            .await
            .map_err(|err| Error::new(err, summary))?;
        Ok(Report {
            plan: plan.clone(),
            summary,
            ledger,
            source_digest,
            destination_digest,
        })
    }

    #[instrument(skip(self, plan))]
    async fn verify_whole_file(&self, plan: &TransferPlan) -> anyhow::Result<(Digest, Digest)> {
        tracing::debug!("computing whole-file digests");
        let _open_file_guard = throttle::open_file_permit().await;
        let mut source = self.fs.open_read(&plan.source).await?;
        let mut destination = self.fs.open_read(&plan.destination).await?;
        let (source_digest, destination_digest) = tokio::try_join!(
            self.digests.hash_stream(source.as_mut()),
            self.digests.hash_stream(destination.as_mut()),
        )
        .context("failed computing whole-file digests")?;
        if source_digest != destination_digest {
            return Err(TransferError::WholeFileVerificationFailed {
                source_digest,
                destination_digest,
            }
            .into());
        }
        Ok((source_digest, destination_digest))
    }

    async fn remove_destination(&self, destination: &std::path::Path) {
        match self.fs.remove(destination).await {
            Ok(()) => tracing::info!("removed partially written {:?}", destination),
            Err(error) => tracing::warn!(
                "{}",
                TransferError::DestinationCleanupFailed {
                    path: destination.to_path_buf(),
                    reason: format!("{error:#}"),
                }
            ),
        }
    }
}
