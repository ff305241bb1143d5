//! Download pipeline shared by the `sfetch` tools.
//!
//! The pipeline lists a remote directory, selects the most recently modified files and copies
//! them to local storage on a fixed-size worker pool:
//!
//! - [`listing`] - enumerate and order remote files, cap the selection
//! - [`pool`] - fan jobs out to a bounded number of concurrent workers
//! - [`transfer`] - copy a single file (open, create, pre-allocate, buffered copy)
//! - [`report`] - fold per-file outcomes into a [`BatchReport`]
//! - [`download`] - the above, end to end, for one directory
//!
//! The remote side is reached through the [`RemoteFs`] trait, implemented over SFTP by the
//! `remote` crate.

pub mod config;
pub mod download;
pub mod listing;
pub mod pool;
pub mod remote_fs;
pub mod report;
pub mod transfer;

#[cfg(test)]
mod testutils;

pub use config::{OutputConfig, RuntimeConfig};
pub use download::download_files;
pub use remote_fs::{FileKind, RemoteFile, RemoteFileDescriptor, RemoteFs};
pub use report::BatchReport;

fn init_tracing(output: &OutputConfig) -> anyhow::Result<()> {
    let filter = if output.quiet {
        tracing_subscriber::EnvFilter::new("off")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(output.log_level()))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to initialize logging: {err}"))
}

/// Installs logging, builds the tokio runtime and runs `func` to completion.
///
/// Logging is set up exactly once, before the runtime exists, so every task spawned by `func`
/// sees the same subscriber. Returns `None` if `func` failed; the error has been logged and the
/// caller is expected to exit with a non-zero status.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    if let Err(error) = init_tracing(&output) {
        eprintln!("{error:#}");
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {}", error);
            return None;
        }
    };
    let start = std::time::Instant::now();
    let res = tokio_runtime.block_on(func());
    let walltime = std::time::Duration::from_millis(start.elapsed().as_millis() as u64);
    tracing::info!(
        "total execution time: {}",
        humantime::format_duration(walltime)
    );
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}\nwalltime: {}", humantime::format_duration(walltime));
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}
