use anyhow::Context;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::remote_fs::{RemoteFile, RemoteFileDescriptor, RemoteFs, join_remote_path};

/// Size of the intermediate buffer used to copy each file.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// Per-file failure; recorded in that file's outcome and never fatal to the batch.
///
/// Like the other error types here, Display includes the source chain so it can be logged with
/// any format specifier.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed opening remote file {path:?}: {source:#}")]
    OpenRemote {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed creating local file {path:?}: {source:#}")]
    CreateLocal {
        path: std::path::PathBuf,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed copying into {path:?} after {bytes_written} bytes: {source:#}")]
    Copy {
        path: std::path::PathBuf,
        bytes_written: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("transfer did not finish within {timeout:?}")]
    Timeout { timeout: std::time::Duration },
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Directory the files are written to
    pub dest_dir: std::path::PathBuf,
    pub buffer_size: usize,
    /// Size the local file up front before copying
    pub preallocate: bool,
    /// Upper bound for a single file (None = no limit)
    pub timeout: Option<std::time::Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            dest_dir: std::path::PathBuf::from("."),
            buffer_size: DEFAULT_BUFFER_SIZE,
            preallocate: true,
            timeout: None,
        }
    }
}

/// Result of transferring one file, produced exactly once per job.
#[derive(Debug)]
pub struct TransferOutcome {
    pub name: String,
    /// Size reported by the listing
    pub expected_size: u64,
    /// Number of bytes written on success
    pub result: Result<u64, Error>,
}

impl TransferOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

fn local_path(dest_dir: &std::path::Path, name: &str) -> Result<std::path::PathBuf, Error> {
    let mut components = std::path::Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(dest_dir.join(name)),
        _ => Err(Error::CreateLocal {
            path: dest_dir.join(name),
            source: anyhow::anyhow!("{name:?} is not a plain file name"),
        }),
    }
}

/// Sizes `file` to `size` bytes. Returns false if the filesystem refused, which is not an error.
async fn preallocate(file: &tokio::fs::File, size: u64, path: &std::path::Path) -> bool {
    match file.set_len(size).await {
        Ok(()) => true,
        Err(error) if error.kind() == std::io::ErrorKind::Unsupported => {
            tracing::debug!("pre-allocation not supported for {:?}", path);
            false
        }
        Err(error) => {
            tracing::warn!(
                "failed pre-allocating {} for {:?}, continuing without: {}",
                bytesize::ByteSize(size),
                path,
                error
            );
            false
        }
    }
}

async fn copy_to_local(
    remote: &mut dyn RemoteFile,
    job: &RemoteFileDescriptor,
    settings: &Settings,
) -> Result<u64, Error> {
    let path = local_path(&settings.dest_dir, &job.name)?;
    let mut local = tokio::fs::File::create(&path)
        .await
        .map_err(|err| Error::CreateLocal {
            path: path.clone(),
            source: err.into(),
        })?;
    let preallocated =
        settings.preallocate && job.size > 0 && preallocate(&local, job.size, &path).await;
    let mut buffer = vec![0u8; settings.buffer_size];
    let mut bytes_written = 0u64;
    let copy_error = |bytes_written: u64, source: anyhow::Error| Error::Copy {
        path: path.clone(),
        bytes_written,
        source,
    };
    loop {
        let count = remote
            .read(&mut buffer)
            .await
            .context("failed reading from remote")
            .map_err(|err| copy_error(bytes_written, err))?;
        if count == 0 {
            break;
        }
        local
            .write_all(&buffer[..count])
            .await
            .context("failed writing to local file")
            .map_err(|err| copy_error(bytes_written, err))?;
        bytes_written += count as u64;
    }
    local
        .flush()
        .await
        .context("failed flushing local file")
        .map_err(|err| copy_error(bytes_written, err))?;
    if preallocated && bytes_written < job.size {
        // the server reported more than it sent, drop the pre-allocated tail
        local
            .set_len(bytes_written)
            .await
            .context("failed trimming pre-allocated local file")
            .map_err(|err| copy_error(bytes_written, err))?;
    }
    Ok(bytes_written)
}

async fn transfer_file(
    fs: &dyn RemoteFs,
    remote_dir: &str,
    job: &RemoteFileDescriptor,
    settings: &Settings,
) -> Result<u64, Error> {
    let remote_path = join_remote_path(remote_dir, &job.name);
    tracing::debug!("opening {:?}", &remote_path);
    let mut remote = fs
        .open(&remote_path)
        .await
        .map_err(|source| Error::OpenRemote {
            path: remote_path.clone(),
            source,
        })?;
    let result = copy_to_local(remote.as_mut(), job, settings).await;
    if let Err(error) = remote.close().await {
        tracing::warn!("failed closing remote file {:?}: {:#}", &remote_path, error);
    }
    let bytes_written = result?;
    if bytes_written != job.size {
        tracing::warn!(
            "{:?}: listing reported {} bytes but {} were written",
            &remote_path,
            job.size,
            bytes_written
        );
    }
    Ok(bytes_written)
}

/// Downloads one file from `remote_dir` into the destination directory.
///
/// Both the remote and the local handle are released on every path, including when the
/// per-file timeout fires and the in-flight copy is dropped.
#[instrument(skip(fs, job, settings), fields(file = %job.name))]
pub async fn transfer(
    fs: &dyn RemoteFs,
    remote_dir: &str,
    job: &RemoteFileDescriptor,
    settings: &Settings,
) -> TransferOutcome {
    let result = match settings.timeout {
        Some(timeout) => {
            match tokio::time::timeout(timeout, transfer_file(fs, remote_dir, job, settings)).await
            {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout { timeout }),
            }
        }
        None => transfer_file(fs, remote_dir, job, settings).await,
    };
    if let Ok(bytes_written) = &result {
        tracing::info!(
            "downloaded {:?} ({})",
            &job.name,
            bytesize::ByteSize(*bytes_written)
        );
    }
    TransferOutcome {
        name: job.name.clone(),
        expected_size: job.size,
        result,
    }
}
