//! Configuration types for runtime and output settings

/// Port used when none is configured or the configured value does not parse.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=WARN, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default filter directive for the configured verbosity
    #[must_use]
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "off";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Parses an SSH port, falling back to [`DEFAULT_SSH_PORT`] when the value is missing or invalid.
#[must_use]
pub fn parse_port(value: Option<&str>) -> u16 {
    let Some(value) = value else {
        return DEFAULT_SSH_PORT;
    };
    match value.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        Ok(_) => {
            tracing::warn!("port 0 is not usable, using {}", DEFAULT_SSH_PORT);
            DEFAULT_SSH_PORT
        }
        Err(error) => {
            tracing::warn!(
                "invalid port {:?} ({}), using {}",
                value,
                error,
                DEFAULT_SSH_PORT
            );
            DEFAULT_SSH_PORT
        }
    }
}

/// Parses a human readable duration such as "30s" or "2min".
pub fn parse_duration(value: &str) -> anyhow::Result<std::time::Duration> {
    humantime::parse_duration(value)
        .map_err(|err| anyhow::anyhow!("invalid duration {value:?}: {err}"))
}
