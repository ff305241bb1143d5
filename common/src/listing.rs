use tracing::instrument;

use crate::remote_fs::{RemoteFileDescriptor, RemoteFs};

/// Enumerating the remote directory failed; nothing can be downloaded.
#[derive(Debug, thiserror::Error)]
#[error("failed listing remote directory {path:?}: {source:#}")]
pub struct ListError {
    pub path: String,
    #[source]
    pub source: anyhow::Error,
}

/// Sorts most recently modified first. The sort is stable so entries with equal timestamps keep
/// their listing order.
pub fn sort_by_modified(files: &mut [RemoteFileDescriptor]) {
    files.sort_by(|a, b| b.modified.cmp(&a.modified));
}

/// Keeps the first `max_files` entries.
#[must_use]
pub fn select_top(
    mut files: Vec<RemoteFileDescriptor>,
    max_files: usize,
) -> Vec<RemoteFileDescriptor> {
    files.truncate(max_files);
    files
}

/// Lists the regular files of `path`, most recently modified first.
#[instrument(skip(fs))]
pub async fn list_directory(
    fs: &dyn RemoteFs,
    path: &str,
) -> Result<Vec<RemoteFileDescriptor>, ListError> {
    let entries = fs.read_dir(path).await.map_err(|source| ListError {
        path: path.to_string(),
        source,
    })?;
    let total = entries.len();
    let mut files: Vec<_> = entries
        .into_iter()
        .filter(|entry| entry.name != "." && entry.name != "..")
        .filter(|entry| {
            if !entry.is_regular() {
                tracing::debug!("skipping {:?}: not a regular file ({:?})", entry.name, entry.kind);
            }
            entry.is_regular()
        })
        .collect();
    sort_by_modified(&mut files);
    tracing::info!(
        "{} entries in {:?}, {} regular files",
        total,
        path,
        files.len()
    );
    for file in &files {
        tracing::debug!(
            "{} - {} ({})",
            file.name,
            file.modified.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            bytesize::ByteSize(file.size)
        );
    }
    Ok(files)
}
