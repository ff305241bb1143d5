//! In-memory [`RemoteFs`] with failure injection and open-handle accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::remote_fs::{FileKind, RemoteFile, RemoteFileDescriptor, RemoteFs};

#[derive(Clone, Debug, Default)]
struct Failures {
    open: bool,
    read_after: Option<usize>,
    stall: bool,
}

#[derive(Clone, Debug)]
struct Entry {
    descriptor: RemoteFileDescriptor,
    contents: Vec<u8>,
    failures: Failures,
}

#[derive(Debug, Default)]
pub struct MemoryFs {
    entries: Vec<Entry>,
    fail_listing: bool,
    open_handles: Arc<AtomicUsize>,
    max_open_handles: Arc<AtomicUsize>,
    opened_paths: Mutex<Vec<String>>,
}

pub fn timestamp(secs: i64) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(secs, 0).unwrap()
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&mut self, name: &str, contents: &[u8], modified: i64) -> &mut Self {
        self.entries.push(Entry {
            descriptor: RemoteFileDescriptor {
                name: name.to_string(),
                size: contents.len() as u64,
                modified: timestamp(modified),
                permissions: 0o100_644,
                kind: FileKind::Regular,
            },
            contents: contents.to_vec(),
            failures: Failures::default(),
        });
        self
    }

    pub fn add_dir(&mut self, name: &str, modified: i64) -> &mut Self {
        self.entries.push(Entry {
            descriptor: RemoteFileDescriptor {
                name: name.to_string(),
                size: 4096,
                modified: timestamp(modified),
                permissions: 0o040_755,
                kind: FileKind::Directory,
            },
            contents: vec![],
            failures: Failures::default(),
        });
        self
    }

    fn entry_mut(&mut self, name: &str) -> &mut Entry {
        self.entries
            .iter_mut()
            .find(|entry| entry.descriptor.name == name)
            .unwrap_or_else(|| panic!("no such test file: {name}"))
    }

    pub fn fail_open(&mut self, name: &str) -> &mut Self {
        self.entry_mut(name).failures.open = true;
        self
    }

    /// Reads of `name` fail once `bytes` bytes have been returned.
    pub fn fail_read_after(&mut self, name: &str, bytes: usize) -> &mut Self {
        self.entry_mut(name).failures.read_after = Some(bytes);
        self
    }

    /// Reads of `name` never complete.
    pub fn stall_reads(&mut self, name: &str) -> &mut Self {
        self.entry_mut(name).failures.stall = true;
        self
    }

    /// Makes the listing report `size` for `name` regardless of its contents.
    pub fn report_size(&mut self, name: &str, size: u64) -> &mut Self {
        self.entry_mut(name).descriptor.size = size;
        self
    }

    pub fn fail_listing(&mut self) -> &mut Self {
        self.fail_listing = true;
        self
    }

    /// Number of remote handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Highest number of remote handles that were open at the same time.
    pub fn max_open_handles(&self) -> usize {
        self.max_open_handles.load(Ordering::SeqCst)
    }

    pub fn opened_paths(&self) -> Vec<String> {
        self.opened_paths.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl RemoteFs for MemoryFs {
    async fn read_dir(&self, path: &str) -> anyhow::Result<Vec<RemoteFileDescriptor>> {
        if self.fail_listing {
            anyhow::bail!("permission denied listing {path}");
        }
        Ok(self
            .entries
            .iter()
            .map(|entry| entry.descriptor.clone())
            .collect())
    }

    async fn open(&self, path: &str) -> anyhow::Result<Box<dyn RemoteFile>> {
        self.opened_paths.lock().unwrap().push(path.to_string());
        let name = path.rsplit('/').next().unwrap_or(path);
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.descriptor.name == name)
            .ok_or_else(|| anyhow::anyhow!("no such file: {path}"))?;
        if entry.failures.open {
            anyhow::bail!("permission denied opening {path}");
        }
        let open = self.open_handles.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_handles.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MemoryFile {
            contents: entry.contents.clone(),
            position: 0,
            failures: entry.failures.clone(),
            yielded: false,
            closed: false,
            open_handles: self.open_handles.clone(),
        }))
    }
}

struct MemoryFile {
    contents: Vec<u8>,
    position: usize,
    failures: Failures,
    yielded: bool,
    closed: bool,
    open_handles: Arc<AtomicUsize>,
}

impl MemoryFile {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.open_handles.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl tokio::io::AsyncRead for MemoryFile {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        if self.failures.stall {
            return std::task::Poll::Pending;
        }
        // every other read yields so that workers interleave like they would on a network
        if !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            return std::task::Poll::Pending;
        }
        self.yielded = false;
        let mut limit = self.contents.len();
        if let Some(fail_after) = self.failures.read_after {
            if self.position >= fail_after {
                return std::task::Poll::Ready(Err(std::io::Error::other(
                    "injected read failure",
                )));
            }
            limit = limit.min(fail_after);
        }
        let available = limit.saturating_sub(self.position);
        let count = available.min(buf.remaining());
        let start = self.position;
        buf.put_slice(&self.contents[start..start + count]);
        self.position += count;
        std::task::Poll::Ready(Ok(()))
    }
}

#[async_trait::async_trait]
impl RemoteFile for MemoryFile {
    async fn close(&mut self) -> anyhow::Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryFile {
    fn drop(&mut self) {
        self.release();
    }
}
