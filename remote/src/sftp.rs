//! [`common::RemoteFs`] over an SFTP session.

use std::sync::Arc;

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use common::{FileKind, RemoteFile, RemoteFileDescriptor, RemoteFs};

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

/// File kind from POSIX mode bits. Servers that omit the mode are assumed to list plain files.
#[must_use]
pub fn kind_from_mode(mode: Option<u32>) -> FileKind {
    match mode.map(|mode| mode & S_IFMT) {
        None | Some(S_IFREG) => FileKind::Regular,
        Some(S_IFDIR) => FileKind::Directory,
        Some(S_IFLNK) => FileKind::Symlink,
        Some(_) => FileKind::Other,
    }
}

#[must_use]
pub fn modified_from_mtime(mtime: Option<u32>) -> chrono::DateTime<chrono::Utc> {
    mtime
        .and_then(|secs| chrono::DateTime::<chrono::Utc>::from_timestamp(i64::from(secs), 0))
        .unwrap_or_default()
}

fn descriptor(name: String, attributes: &russh_sftp::protocol::FileAttributes) -> RemoteFileDescriptor {
    RemoteFileDescriptor {
        name,
        size: attributes.size.unwrap_or(0),
        modified: modified_from_mtime(attributes.mtime),
        permissions: attributes.permissions.unwrap_or(0),
        kind: kind_from_mode(attributes.permissions),
    }
}

/// Remote filesystem backed by one SFTP session shared by all callers.
pub struct SftpFs {
    session: Arc<russh_sftp::client::SftpSession>,
}

impl SftpFs {
    pub fn new(session: Arc<russh_sftp::client::SftpSession>) -> Self {
        Self { session }
    }
}

#[async_trait::async_trait]
impl RemoteFs for SftpFs {
    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<RemoteFileDescriptor>> {
        let entries = self
            .session
            .read_dir(path)
            .await
            .with_context(|| format!("SFTP readdir of {path:?} failed"))?;
        Ok(entries
            .map(|entry| descriptor(entry.file_name(), &entry.metadata()))
            .collect())
    }

    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn RemoteFile>> {
        let file = self
            .session
            .open(path)
            .await
            .with_context(|| format!("SFTP open of {path:?} failed"))?;
        Ok(Box::new(SftpFile(file)))
    }
}

/// Remote file handle; dropping it closes the handle in the background.
struct SftpFile(russh_sftp::client::fs::File);

impl tokio::io::AsyncRead for SftpFile {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

#[async_trait::async_trait]
impl RemoteFile for SftpFile {
    async fn close(&mut self) -> anyhow::Result<()> {
        self.0
            .shutdown()
            .await
            .context("failed closing SFTP file handle")
    }
}
