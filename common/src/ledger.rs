//! Record of verified chunks, collected from every worker of a transfer

use crate::digest::Digest;

/// One verified chunk: where it starts and what it hashed to after read-back.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LedgerEntry {
    pub offset: u64,
    pub digest: Digest,
}

impl std::fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:>16} {}", self.offset, self.digest)
    }
}

/// Append-only record of verified chunks, shared by all workers of a transfer.
///
/// Entries arrive in no particular order; [`TransferLedger::sorted_entries`] orders them by offset
/// once every worker is done.
#[derive(Debug, Default)]
pub struct TransferLedger {
    entries: std::sync::Mutex<Vec<LedgerEntry>>,
}

impl TransferLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, offset: u64, digest: Digest) {
        self.lock().push(LedgerEntry { offset, digest });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn sorted_entries(&self) -> Vec<LedgerEntry> {
        let mut entries = self.lock().clone();
        entries.sort_by_key(|entry| entry.offset);
        entries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<LedgerEntry>> {
        // entries are only ever pushed, a panicking writer cannot leave them half-updated
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Checks that `entries` (sorted) cover every chunk boundary of the file exactly once.
#[must_use]
pub fn covers_file(entries: &[LedgerEntry], file_size: u64, chunk_size: u64) -> bool {
    let expected = crate::planner::chunks(file_size, chunk_size);
    entries.len() as u64 == crate::planner::total_chunks(file_size, chunk_size)
        && entries
            .iter()
            .zip(expected)
            .all(|(entry, chunk)| entry.offset == chunk.offset)
}
