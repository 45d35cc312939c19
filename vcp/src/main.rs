use anyhow::{anyhow, Context, Result};
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vcp",
    version,
    about = "Copy a file chunk by chunk, verifying every chunk as it is written",
    long_about = "`vcp` copies a single file into a destination directory. Every chunk is written, read back \
and compared with the source before the copy moves on; a chunk that doesn't match is rewritten a limited \
number of times. Once all chunks are verified, SHA-256 of the whole source and the whole destination must \
match.

Any failure removes the partially written destination file.

EXAMPLES:
    # Copy a file into /backup, verifying every 1 MiB chunk
    vcp /data/disk.img /backup --summary

    # Replace an existing copy using 4 concurrent workers and print the chunk ledger
    vcp /data/disk.img /backup --overwrite --concurrent --ledger

    # Smaller chunks, more verification attempts, JSON report
    vcp /data/disk.img /backup --chunk-size 256KiB --max-attempts 5 --ledger-json"
)]
struct Args {
    // Transfer options
    /// Overwrite the destination file if it already exists
    #[arg(short = 'o', long, help_heading = "Transfer options")]
    overwrite: bool,

    /// Split the file into regions and transfer them concurrently
    #[arg(long, help_heading = "Transfer options")]
    concurrent: bool,

    /// Number of regions (and workers) in concurrent mode
    #[arg(
        long,
        default_value_t = common::transfer::DEFAULT_REGION_COUNT,
        value_name = "N",
        help_heading = "Transfer options"
    )]
    regions: usize,

    /// Size of a verified chunk, e.g. "1MiB", "256KiB"
    #[arg(
        long,
        default_value = "1MiB",
        value_name = "SIZE",
        help_heading = "Transfer options"
    )]
    chunk_size: bytesize::ByteSize,

    /// Number of source chunk reads in flight at once, 0 means no limit
    #[arg(
        long,
        default_value_t = common::transfer::DEFAULT_MAX_CONCURRENT_READS,
        value_name = "N",
        help_heading = "Transfer options"
    )]
    max_concurrent_reads: usize,

    /// Write+verify attempts per chunk before the copy is abandoned
    #[arg(
        long,
        default_value_t = common::chunk::MAX_RETRY_ATTEMPTS,
        value_name = "N",
        help_heading = "Transfer options"
    )]
    max_attempts: u32,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Set the type of progress display
    ///
    /// If specified, --progress flag is implied.
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Set delay between progress updates
    ///
    /// Default is 200ms for interactive mode (`ProgressBar`) and 10s for non-interactive mode (`TextUpdates`). If specified, --progress flag is implied. Accepts human-readable durations like "200ms", "10s", "5min".
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Print the offset and digest of every verified chunk
    #[arg(long, conflicts_with = "ledger_json", help_heading = "Progress & output")]
    ledger: bool,

    /// Print the full transfer report, including the chunk ledger, as JSON
    #[arg(long, help_heading = "Progress & output")]
    ledger_json: bool,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Performance & throttling
    /// Maximum number of open files, 0 means no limit, leaving unspecified means using 80% of max open files system limit
    #[arg(long, value_name = "N", help_heading = "Performance & throttling")]
    max_open_files: Option<usize>,

    /// Throttle the number of chunk reads per second, 0 means no throttle
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Performance & throttling"
    )]
    iops_throttle: usize,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// File to copy
    #[arg()]
    src: std::path::PathBuf,

    /// Directory to copy the file into
    #[arg()]
    dst_dir: std::path::PathBuf,
}

fn same_path(lhs: &std::path::Path, rhs: &std::path::Path) -> bool {
    lhs.to_string_lossy().to_lowercase() == rhs.to_string_lossy().to_lowercase()
}

fn same_file(lhs: &std::fs::Metadata, rhs: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    lhs.dev() == rhs.dev() && lhs.ino() == rhs.ino()
}

/// Checks that the copy can start and returns the destination file path.
async fn check_paths(
    src: &std::path::Path,
    dst_dir: &std::path::Path,
    overwrite: bool,
) -> Result<std::path::PathBuf> {
    let src_metadata = tokio::fs::metadata(src)
        .await
        .with_context(|| format!("cannot access source {:?}", src))?;
    if !src_metadata.is_file() {
        return Err(anyhow!("source {:?} is not a regular file", src));
    }
    tokio::fs::File::open(src)
        .await
        .with_context(|| format!("source {:?} is not readable", src))?;
    let dst_metadata = tokio::fs::metadata(dst_dir)
        .await
        .with_context(|| format!("cannot access destination directory {:?}", dst_dir))?;
    if !dst_metadata.is_dir() {
        return Err(anyhow!("destination {:?} is not a directory", dst_dir));
    }
    let file_name = src
        .file_name()
        .ok_or_else(|| anyhow!("source {:?} has no file name", src))?;
    let dst = dst_dir.join(file_name);
    let canonical_src = tokio::fs::canonicalize(src)
        .await
        .with_context(|| format!("cannot resolve {:?}", src))?;
    let canonical_dst = tokio::fs::canonicalize(dst_dir)
        .await
        .with_context(|| format!("cannot resolve {:?}", dst_dir))?
        .join(file_name);
    if same_path(&canonical_src, &canonical_dst) {
        return Err(anyhow!(
            "source and destination are the same file: {:?}",
            canonical_src
        ));
    }
    // a symlink or hard link at the destination would be truncated together with the source
    let dst_exists = match tokio::fs::symlink_metadata(&dst).await {
        Ok(_) => true,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
        Err(error) => {
            return Err(error).with_context(|| format!("cannot access destination {:?}", &dst));
        }
    };
    let resolved_dst = if dst_exists {
        tokio::fs::metadata(&dst).await.ok()
    } else {
        None
    };
    if resolved_dst.is_some_and(|metadata| same_file(&src_metadata, &metadata)) {
        return Err(anyhow!(
            "source and destination are the same file: {:?} -> {:?}",
            &dst,
            canonical_src
        ));
    }
    if dst_exists && !overwrite {
        return Err(anyhow!(
            "destination {:?} already exists, use --overwrite to replace it",
            &dst
        ));
    }
    Ok(dst)
}

async fn async_main(args: Args) -> Result<common::Report> {
    let settings = common::transfer::Settings {
        chunk_size: args.chunk_size.as_u64(),
        concurrent: args.concurrent,
        region_count: args.regions,
        max_concurrent_reads: args.max_concurrent_reads,
        max_attempts: args.max_attempts,
    };
    settings.validate()?;
    let dst = check_paths(&args.src, &args.dst_dir, args.overwrite).await?;
    tracing::debug!("destination file: {:?}", &dst);
    let report = match common::transfer_file(&args.src, &args.dst_dir, &settings).await {
        Ok(report) => report,
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            return Err(anyhow!("{}", error));
        }
    };
    if args.ledger {
        for entry in &report.ledger {
            println!("{entry}");
        }
    }
    if args.ledger_json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("failed serializing the report")?
        );
    }
    Ok(report)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let throttle = common::ThrottleConfig {
        max_open_files: args.max_open_files,
        iops_throttle: args.iops_throttle,
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        throttle,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_compare_case_insensitively() {
        assert!(same_path(
            std::path::Path::new("/Data/File.BIN"),
            std::path::Path::new("/data/file.bin")
        ));
        assert!(!same_path(
            std::path::Path::new("/data/a.bin"),
            std::path::Path::new("/data/b.bin")
        ));
    }

    #[tokio::test]
    async fn existing_destination_requires_overwrite() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src_dir = tmp_dir.path().join("src");
        let dst_dir = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&src_dir).await?;
        tokio::fs::create_dir(&dst_dir).await?;
        tokio::fs::write(src_dir.join("a.bin"), b"payload").await?;
        assert_eq!(
            check_paths(&src_dir.join("a.bin"), &dst_dir, false).await?,
            dst_dir.join("a.bin")
        );
        tokio::fs::write(dst_dir.join("a.bin"), b"old").await?;
        let error = check_paths(&src_dir.join("a.bin"), &dst_dir, false)
            .await
            .expect_err("existing destination must be refused");
        assert!(format!("{error:#}").contains("--overwrite"));
        assert!(check_paths(&src_dir.join("a.bin"), &dst_dir, true).await.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn copying_onto_itself_is_refused() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        tokio::fs::write(tmp_dir.path().join("a.bin"), b"payload").await?;
        let error = check_paths(&tmp_dir.path().join("a.bin"), tmp_dir.path(), true)
            .await
            .expect_err("self copy must be refused");
        assert!(format!("{error:#}").contains("same file"));
        Ok(())
    }

    #[tokio::test]
    async fn destination_linked_to_source_is_refused() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let src_dir = tmp_dir.path().join("src");
        let symlink_dir = tmp_dir.path().join("symlinked");
        let hardlink_dir = tmp_dir.path().join("hardlinked");
        for dir in [&src_dir, &symlink_dir, &hardlink_dir] {
            tokio::fs::create_dir(dir).await?;
        }
        let src = src_dir.join("a.bin");
        tokio::fs::write(&src, b"payload").await?;
        tokio::fs::symlink(&src, symlink_dir.join("a.bin")).await?;
        tokio::fs::hard_link(&src, hardlink_dir.join("a.bin")).await?;
        for dst_dir in [&symlink_dir, &hardlink_dir] {
            let error = check_paths(&src, dst_dir, true)
                .await
                .expect_err("linked destination must be refused");
            assert!(format!("{error:#}").contains("same file"));
        }
        assert_eq!(tokio::fs::read(&src).await?, b"payload");
        Ok(())
    }

    #[tokio::test]
    async fn dangling_symlink_destination_requires_overwrite() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst_dir = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst_dir).await?;
        let src = tmp_dir.path().join("a.bin");
        tokio::fs::write(&src, b"payload").await?;
        tokio::fs::symlink(tmp_dir.path().join("missing"), dst_dir.join("a.bin")).await?;
        assert!(check_paths(&src, &dst_dir, false).await.is_err());
        assert_eq!(check_paths(&src, &dst_dir, true).await?, dst_dir.join("a.bin"));
        Ok(())
    }

    #[tokio::test]
    async fn source_must_be_a_regular_file() -> Result<()> {
        let tmp_dir = tempfile::tempdir()?;
        let dst_dir = tmp_dir.path().join("dst");
        tokio::fs::create_dir(&dst_dir).await?;
        assert!(check_paths(tmp_dir.path(), &dst_dir, false).await.is_err());
        assert!(
            check_paths(&tmp_dir.path().join("missing"), &dst_dir, false)
                .await
                .is_err()
        );
        Ok(())
    }
}
