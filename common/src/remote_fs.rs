//! Abstraction over the remote filesystem the download pipeline reads from.
//!
//! The pipeline only needs two remote operations: listing a directory and opening a file for
//! reading. Keeping them behind a trait lets the SFTP client live in the `remote` crate while
//! listing, transfer and the worker pool are tested against an in-memory implementation.

/// Kind of a remote directory entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Other,
}

/// Snapshot of a remote file as returned by a single directory listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFileDescriptor {
    /// Base name of the entry within its directory
    pub name: String,
    /// Size in bytes as reported by the server (0 if unknown)
    pub size: u64,
    /// Last modification time (UNIX epoch if unknown)
    pub modified: chrono::DateTime<chrono::Utc>,
    /// Mode bits as reported by the server (0 if unknown)
    pub permissions: u32,
    pub kind: FileKind,
}

impl RemoteFileDescriptor {
    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.kind == FileKind::Regular
    }
}

/// A remote file opened for reading.
///
/// Dropping the handle must release it on the server; [`RemoteFile::close`] does so explicitly
/// and reports failures.
#[async_trait::async_trait]
pub trait RemoteFile: tokio::io::AsyncRead + Send + Unpin {
    async fn close(&mut self) -> anyhow::Result<()>;
}

/// Remote filesystem operations shared read-only by the listing stage and all workers.
#[async_trait::async_trait]
pub trait RemoteFs: Send + Sync {
    /// Returns every entry of `path`, in server order.
    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<RemoteFileDescriptor>>;

    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn RemoteFile>>;
}

/// Joins a remote directory and an entry name using `/` regardless of the local platform.
#[must_use]
pub fn join_remote_path(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        return name.to_string();
    }
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        format!("/{name}")
    } else {
        format!("{trimmed}/{name}")
    }
}
