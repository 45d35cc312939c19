use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::ReadBuf;

use crate::fs::{BoxedStream, Filesystem};

pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("vcp_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

/// Deterministic payload where every 1 KiB block differs from its neighbours.
pub fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 1024) as u8).wrapping_mul(31) ^ (i % 251) as u8)
        .collect()
}

#[derive(Debug, Default)]
struct MemFile {
    data: Vec<u8>,
    writes: u32,
    // every read and write first returns Pending once, so callers interleave
    yield_io: bool,
    reads_in_flight: u32,
    peak_reads: u32,
    // a write stays in flight until the following flush
    writes_in_flight: u32,
    peak_writes: u32,
    // the next N non-empty reads get their first byte flipped
    corrupt_reads: u32,
    // the next N reads return no data at all
    empty_reads: u32,
}

/// In-memory [`Filesystem`] with fault injection on reads and in-flight I/O accounting.
///
/// All handles of one path share the same contents, just like handles to a real file.
#[derive(Debug, Default)]
pub struct MemoryFs {
    files: Mutex<HashMap<std::path::PathBuf, Arc<Mutex<MemFile>>>>,
    refuse_removal: std::sync::atomic::AtomicBool,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, path: &std::path::Path) -> Arc<Mutex<MemFile>> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .clone()
    }

    fn get(&self, path: &std::path::Path) -> Option<Arc<Mutex<MemFile>>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn insert(&self, path: &std::path::Path, data: Vec<u8>) {
        self.entry(path).lock().unwrap().data = data;
    }

    pub fn contents(&self, path: &std::path::Path) -> Option<Vec<u8>> {
        self.get(path).map(|file| file.lock().unwrap().data.clone())
    }

    pub fn exists(&self, path: &std::path::Path) -> bool {
        self.get(path).is_some()
    }

    /// Number of write calls issued against `path`.
    pub fn writes(&self, path: &std::path::Path) -> u32 {
        self.get(path).map_or(0, |file| file.lock().unwrap().writes)
    }

    /// Makes every read and write on `path` yield to the scheduler once before it completes.
    pub fn yield_io(&self, path: &std::path::Path) {
        self.entry(path).lock().unwrap().yield_io = true;
    }

    /// Highest number of reads on `path` that were in progress at the same time.
    pub fn peak_reads(&self, path: &std::path::Path) -> u32 {
        self.get(path).map_or(0, |file| file.lock().unwrap().peak_reads)
    }

    /// Highest number of write+flush sequences on `path` that were in progress at the same time.
    pub fn peak_writes(&self, path: &std::path::Path) -> u32 {
        self.get(path).map_or(0, |file| file.lock().unwrap().peak_writes)
    }

    pub fn corrupt_reads(&self, path: &std::path::Path, count: u32) {
        self.entry(path).lock().unwrap().corrupt_reads = count;
    }

    pub fn empty_reads(&self, path: &std::path::Path, count: u32) {
        self.entry(path).lock().unwrap().empty_reads = count;
    }

    pub fn refuse_removal(&self) {
        self.refuse_removal
            .store(true, std::sync::atomic::Ordering::Release);
    }

    fn handle(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream> {
        let file = self
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", path))?;
        Ok(Box::new(MemHandle {
            file,
            pos: 0,
            read_yielded: false,
            write_yielded: false,
            writing: false,
        }))
    }
}

#[async_trait]
impl Filesystem for MemoryFs {
    async fn file_size(&self, path: &std::path::Path) -> anyhow::Result<u64> {
        let file = self
            .get(path)
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", path))?;
        Ok(file.lock().unwrap().data.len() as u64)
    }

    async fn open_read(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream> {
        self.handle(path)
    }

    async fn open_write(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream> {
        self.handle(path)
    }

    async fn create(&self, path: &std::path::Path, len: u64) -> anyhow::Result<BoxedStream> {
        self.entry(path).lock().unwrap().data = vec![0u8; len as usize];
        self.handle(path)
    }

    async fn remove(&self, path: &std::path::Path) -> anyhow::Result<()> {
        if self
            .refuse_removal
            .load(std::sync::atomic::Ordering::Acquire)
        {
            anyhow::bail!("removal of {:?} refused", path);
        }
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", path))
    }
}

struct MemHandle {
    file: Arc<Mutex<MemFile>>,
    pos: u64,
    read_yielded: bool,
    write_yielded: bool,
    writing: bool,
}

impl tokio::io::AsyncRead for MemHandle {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let mut file = this.file.lock().unwrap();
        if file.yield_io && !this.read_yielded {
            this.read_yielded = true;
            file.reads_in_flight += 1;
            file.peak_reads = std::cmp::max(file.peak_reads, file.reads_in_flight);
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        if this.read_yielded {
            this.read_yielded = false;
            file.reads_in_flight -= 1;
        }
        if file.empty_reads > 0 {
            file.empty_reads -= 1;
            return Poll::Ready(Ok(()));
        }
        let pos = std::cmp::min(this.pos as usize, file.data.len());
        let n = std::cmp::min(buf.remaining(), file.data.len() - pos);
        let start = buf.filled().len();
        buf.put_slice(&file.data[pos..pos + n]);
        if n > 0 && file.corrupt_reads > 0 {
            file.corrupt_reads -= 1;
            buf.filled_mut()[start] ^= 0xff;
        }
        this.pos += n as u64;
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncWrite for MemHandle {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        let mut file = this.file.lock().unwrap();
        if file.yield_io && !this.write_yielded {
            this.write_yielded = true;
            if !this.writing {
                this.writing = true;
                file.writes_in_flight += 1;
                file.peak_writes = std::cmp::max(file.peak_writes, file.writes_in_flight);
            }
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        this.write_yielded = false;
        file.writes += 1;
        let pos = this.pos as usize;
        if file.data.len() < pos + data.len() {
            file.data.resize(pos + data.len(), 0);
        }
        file.data[pos..pos + data.len()].copy_from_slice(data);
        this.pos += data.len() as u64;
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.writing {
            this.writing = false;
            this.file.lock().unwrap().writes_in_flight -= 1;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncSeek for MemHandle {
    fn start_seek(self: Pin<&mut Self>, position: std::io::SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let len = this.file.lock().unwrap().data.len() as i64;
        let target = match position {
            std::io::SeekFrom::Start(offset) => offset as i64,
            std::io::SeekFrom::End(delta) => len + delta,
            std::io::SeekFrom::Current(delta) => this.pos as i64 + delta,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        this.pos = target as u64;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}
