//! Configuration types for runtime and execution settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Throttling configuration for resource control
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Maximum number of open files (None = 80% of system limit, 0 = no limit)
    pub max_open_files: Option<usize>,
    /// Chunk reads per second (0 = no throttle)
    pub iops_throttle: usize,
}

/// Open file permits a transfer needs to make progress: the destination writer plus one worker.
pub const MIN_OPEN_FILES: usize = 2;

impl ThrottleConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        match self.max_open_files {
            Some(max_open_files) if max_open_files > 0 && max_open_files < MIN_OPEN_FILES => Err(
                format!("max_open_files must be 0 (no limit) or at least {MIN_OPEN_FILES}"),
            ),
            _ => Ok(()),
        }
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default log filter directive for the configured verbosity.
    #[must_use]
    pub fn level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
