use std::sync::Arc;

use tracing::instrument;

use crate::listing::{self, ListError};
use crate::pool;
use crate::remote_fs::{RemoteFileDescriptor, RemoteFs};
use crate::report::{self, BatchReport};
use crate::transfer;

/// Default remote directory to download from.
pub const DEFAULT_REMOTE_DIR: &str = "/upload";
/// Default cap on the number of files downloaded per run.
pub const DEFAULT_MAX_FILES: usize = 10;

#[derive(Debug, Clone)]
pub struct Settings {
    pub remote_dir: String,
    /// Only the `max_files` most recently modified files are downloaded
    pub max_files: usize,
    /// Number of concurrent transfers
    pub workers: usize,
    pub transfer: transfer::Settings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            remote_dir: DEFAULT_REMOTE_DIR.to_string(),
            max_files: DEFAULT_MAX_FILES,
            workers: pool::DEFAULT_WORKERS,
            transfer: transfer::Settings::default(),
        }
    }
}

impl Settings {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_files == 0 {
            return Err("max_files must be a positive number".to_string());
        }
        if self.workers == 0 {
            return Err("workers must be a positive number".to_string());
        }
        if self.transfer.buffer_size == 0 {
            return Err("buffer_size must be a positive number".to_string());
        }
        if self.transfer.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err("transfer timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Downloads the most recently modified files of the remote directory.
///
/// Only a failure to list the directory is fatal; individual file failures are logged and
/// counted in the returned report.
#[instrument(skip(fs, settings), fields(remote_dir = %settings.remote_dir))]
pub async fn download_files(
    fs: Arc<dyn RemoteFs>,
    settings: &Settings,
) -> Result<BatchReport, ListError> {
    let files = listing::list_directory(fs.as_ref(), &settings.remote_dir).await?;
    let jobs = listing::select_top(files, settings.max_files);
    if jobs.is_empty() {
        tracing::warn!("no files found in {:?}", &settings.remote_dir);
        return Ok(BatchReport::default());
    }
    let dispatched = jobs.len();
    tracing::info!(
        "downloading {} files using {} workers",
        dispatched,
        settings.workers
    );
    let remote_dir: Arc<str> = Arc::from(settings.remote_dir.as_str());
    let transfer_settings = Arc::new(settings.transfer.clone());
    let transfer = move |_worker: usize, job: RemoteFileDescriptor| {
        let fs = fs.clone();
        let remote_dir = remote_dir.clone();
        let transfer_settings = transfer_settings.clone();
        async move { transfer::transfer(fs.as_ref(), &remote_dir, &job, &transfer_settings).await }
    };
    let outcomes = pool::run(jobs, settings.workers, transfer).await;
    Ok(report::aggregate(dispatched, outcomes))
}
