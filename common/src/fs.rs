//! Filesystem capability used by the transfer engine
//!
//! The engine never touches `tokio::fs` directly; it goes through [`Filesystem`] so that tests
//! can run it against an in-memory filesystem with injected faults.

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

/// An open file handle: readable, writable and seekable.
pub trait FileStream: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send> FileStream for T {}

pub type BoxedStream = Box<dyn FileStream>;

#[async_trait]
pub trait Filesystem: Send + Sync {
    async fn file_size(&self, path: &std::path::Path) -> anyhow::Result<u64>;

    /// Opens an existing file for reading.
    async fn open_read(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream>;

    /// Opens an existing file for reading and writing without truncating it.
    async fn open_write(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream>;

    /// Creates (or truncates) a file and sets its length to `len` before returning it.
    async fn create(&self, path: &std::path::Path, len: u64) -> anyhow::Result<BoxedStream>;

    async fn remove(&self, path: &std::path::Path) -> anyhow::Result<()>;
}

/// Local disk through `tokio::fs`.
#[derive(Copy, Clone, Debug, Default)]
pub struct TokioFilesystem;

#[async_trait]
impl Filesystem for TokioFilesystem {
    async fn file_size(&self, path: &std::path::Path) -> anyhow::Result<u64> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", &path))?;
        Ok(metadata.len())
    }

    async fn open_read(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|| format!("cannot open {:?} for reading", &path))?;
        Ok(Box::new(file))
    }

    async fn open_write(&self, path: &std::path::Path) -> anyhow::Result<BoxedStream> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .with_context(|| format!("cannot open {:?} for writing", &path))?;
        Ok(Box::new(file))
    }

    async fn create(&self, path: &std::path::Path, len: u64) -> anyhow::Result<BoxedStream> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .await
            .with_context(|| format!("cannot create {:?}", &path))?;
        file.set_len(len)
            .await
            .with_context(|| format!("failed setting length of {:?} to {}", &path, len))?;
        Ok(Box::new(file))
    }

    async fn remove(&self, path: &std::path::Path) -> anyhow::Result<()> {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("failed removing {:?}", &path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

    use crate::testutils;

    #[tokio::test]
    async fn create_preallocates_and_truncates() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("file.bin");
        tokio::fs::write(&path, vec![1u8; 100]).await?;
        let fs = TokioFilesystem;
        let mut stream = fs.create(&path, 10).await?;
        assert_eq!(fs.file_size(&path).await?, 10);
        let mut contents = Vec::new();
        stream.read_to_end(&mut contents).await?;
        assert_eq!(contents, vec![0u8; 10]);
        fs.remove(&path).await?;
        assert!(!path.exists());
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn write_handle_does_not_truncate() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("file.bin");
        tokio::fs::write(&path, b"0123456789").await?;
        let fs = TokioFilesystem;
        let mut stream = fs.open_write(&path).await?;
        stream.seek(std::io::SeekFrom::Start(4)).await?;
        stream.write_all(b"xy").await?;
        stream.flush().await?;
        drop(stream);
        assert_eq!(tokio::fs::read(&path).await?, b"0123xy6789");
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_error_names_path() -> anyhow::Result<()> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let path = tmp_dir.join("missing.bin");
        let error = match TokioFilesystem.open_read(&path).await {
            Ok(_) => panic!("expected opening a missing file to fail"),
            Err(error) => error,
        };
        assert!(format!("{error:#}").contains("missing.bin"));
        tokio::fs::remove_dir_all(&tmp_dir).await?;
        Ok(())
    }
}
