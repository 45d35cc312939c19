//! Per-chunk transfer protocol
//!
//! 1. read the chunk from the source and hash it; a short read here is fatal
//! 2. write it to the destination at the same offset and flush
//! 3. read it back, hash it again and compare
//!
//! Steps 2-3 are repeated up to `max_attempts` times. A mismatch rewrites the whole chunk, not
//! only the differing bytes, since the fault may be anywhere on the write path. A short read-back
//! is retried as well and consumes an attempt.

use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

use crate::digest::{Digest, DigestProvider};
use crate::error::{Side, TransferError};
use crate::fs::{BoxedStream, FileStream};
use crate::ledger::TransferLedger;
use crate::planner::ChunkBounds;
use crate::progress;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// A chunk read from the source, together with the digest of its payload.
#[derive(Debug)]
pub struct Chunk {
    pub bounds: ChunkBounds,
    pub payload: Vec<u8>,
    pub source_digest: Digest,
}

/// Outcome of a successfully verified chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Verified {
    pub digest: Digest,
    pub attempts: u32,
}

/// Where the verification read of a chunk is issued.
pub enum ReadBack<'a> {
    /// through the shared destination handle, under the write lock (sequential mode)
    Writer,
    /// through a handle owned by the calling worker
    Own(&'a mut dyn FileStream),
}

/// Reads into `buf` starting at `offset` until it's full or the stream ends.
async fn read_at(stream: &mut dyn FileStream, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
    stream.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Everything needed to move chunks of one file, shared by all chunks of a worker.
pub struct ChunkTransfer<'a> {
    pub digests: &'a dyn DigestProvider,
    pub ledger: &'a TransferLedger,
    pub read_gate: &'a throttle::ReadGate,
    pub progress: &'a progress::Progress,
    pub max_attempts: u32,
}

impl ChunkTransfer<'_> {
    #[instrument(skip(self, source))]
    pub async fn read_source(
        &self,
        source: &mut dyn FileStream,
        bounds: ChunkBounds,
    ) -> anyhow::Result<Chunk> {
        throttle::get_chunk_iops_token().await;
        let _read_permit = self.read_gate.enter().await;
        let mut payload = vec![0u8; bounds.length as usize];
        let n = read_at(source, bounds.offset, &mut payload)
            .await
            .with_context(|| format!("failed reading source chunk at offset {}", bounds.offset))?;
        if (n as u64) < bounds.length {
            return Err(TransferError::ShortRead {
                side: Side::Source,
                offset: bounds.offset,
                expected: bounds.length,
                actual: n as u64,
            }
            .into());
        }
        let source_digest = self.digests.hash_bytes(&payload);
        tracing::trace!("source chunk {} hashed to {}", bounds.index, &source_digest);
        Ok(Chunk {
            bounds,
            payload,
            source_digest,
        })
    }

    async fn write(&self, chunk: &Chunk, writer: &tokio::sync::Mutex<BoxedStream>) -> anyhow::Result<()> {
        let offset = chunk.bounds.offset;
        let mut writer = writer.lock().await;
        writer
            .seek(std::io::SeekFrom::Start(offset))
            .await
            .with_context(|| format!("failed seeking destination to offset {offset}"))?;
        writer
            .write_all(&chunk.payload)
            .await
            .with_context(|| format!("failed writing chunk at offset {offset}"))?;
        writer
            .flush()
            .await
            .with_context(|| format!("failed flushing chunk at offset {offset}"))?;
        Ok(())
    }

    /// Writes `chunk` and confirms it can be read back intact, recording it in the ledger.
    #[instrument(skip(self, chunk, writer, read_back), fields(offset = chunk.bounds.offset, length = chunk.bounds.length))]
    pub async fn write_and_verify(
        &self,
        chunk: &Chunk,
        writer: &tokio::sync::Mutex<BoxedStream>,
        mut read_back: ReadBack<'_>,
    ) -> anyhow::Result<Verified> {
        let offset = chunk.bounds.offset;
        let mut buffer = vec![0u8; chunk.payload.len()];
        let mut last_seen = None;
        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                self.progress.chunk_retries.inc();
            }
            self.write(chunk, writer).await?;
            let n = match &mut read_back {
                ReadBack::Writer => {
                    let mut writer = writer.lock().await;
                    read_at(writer.as_mut(), offset, &mut buffer).await
                }
                ReadBack::Own(reader) => read_at(&mut **reader, offset, &mut buffer).await,
            }
            .with_context(|| format!("failed reading back chunk at offset {offset}"))?;
            if n < buffer.len() {
                tracing::warn!(
                    "{} (attempt {}/{})",
                    TransferError::ShortRead {
                        side: Side::Destination,
                        offset,
                        expected: buffer.len() as u64,
                        actual: n as u64,
                    },
                    attempt,
                    self.max_attempts
                );
                last_seen = None;
                continue;
            }
            let digest = self.digests.hash_bytes(&buffer);
            if digest == chunk.source_digest {
                self.ledger.record(offset, digest.clone());
                self.progress.chunks_verified.inc();
                self.progress.bytes_copied.add(chunk.bounds.length);
                tracing::debug!(verified = true, "chunk at offset {} verified: {}", offset, &digest);
                return Ok(Verified {
                    digest,
                    attempts: attempt,
                });
            }
            tracing::warn!(
                "checksum mismatch at offset {}: source {} != destination {} (attempt {}/{})",
                offset,
                &chunk.source_digest,
                &digest,
                attempt,
                self.max_attempts
            );
            last_seen = Some(digest);
        }
        Err(TransferError::ChunkVerificationFailed {
            offset,
            attempts: self.max_attempts,
            expected: chunk.source_digest.clone(),
            last_seen,
        }
        .into())
    }
}
