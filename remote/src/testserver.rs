//! In-process SSH server with a read-only SFTP subsystem over one fixed directory.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use russh::server::{Auth, Msg, Session};
use russh::{Channel, ChannelId};
use russh_sftp::protocol::{
    Data, File, FileAttributes, Handle, Name, OpenFlags, Status, StatusCode, Version,
};

pub const USER: &str = "tester";
pub const PASSWORD: &str = "secret";
pub const HOME: &str = "/home/tester";
pub const DIR: &str = "/upload";

#[derive(Debug, Clone)]
pub struct TestFile {
    pub name: String,
    pub data: Vec<u8>,
    pub mtime: u32,
}

impl TestFile {
    pub fn new(name: &str, data: &[u8], mtime: u32) -> Self {
        Self {
            name: name.to_string(),
            data: data.to_vec(),
            mtime,
        }
    }
}

/// What the server exposes and how it behaves.
#[derive(Debug, Clone, Default)]
pub struct Fixture {
    pub files: Vec<TestFile>,
    pub subdirs: Vec<String>,
    /// Answer the sftp subsystem request with a failure
    pub refuse_sftp: bool,
}

pub struct TestServer {
    pub port: u16,
    /// SHA-256 fingerprint of the server key, without the `SHA256:` prefix
    pub fingerprint: String,
    pub public_key: russh_keys::key::PublicKey,
    closed_files: Arc<AtomicUsize>,
}

impl TestServer {
    /// Number of file (not directory) handles the client closed.
    pub fn closed_files(&self) -> usize {
        self.closed_files.load(Ordering::SeqCst)
    }
}

/// Listens on an ephemeral localhost port and serves every accepted connection.
pub async fn start(fixture: Fixture) -> TestServer {
    let key = russh_keys::key::KeyPair::generate_ed25519().unwrap();
    let public_key = key.clone_public_key().unwrap();
    let config = Arc::new(russh::server::Config {
        keys: vec![key],
        auth_rejection_time: std::time::Duration::from_millis(10),
        auth_rejection_time_initial: Some(std::time::Duration::ZERO),
        ..Default::default()
    });
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let fixture = Arc::new(fixture);
    let closed_files = Arc::new(AtomicUsize::new(0));
    {
        let closed_files = closed_files.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let handler = SshSession {
                    fixture: fixture.clone(),
                    closed_files: closed_files.clone(),
                    channels: HashMap::new(),
                };
                let config = config.clone();
                tokio::spawn(async move {
                    match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => {
                            if let Err(error) = session.await {
                                tracing::debug!("test session ended: {:#}", error);
                            }
                        }
                        Err(error) => tracing::debug!("test handshake failed: {:#}", error),
                    }
                });
            }
        });
    }
    TestServer {
        port,
        fingerprint: public_key.fingerprint(),
        public_key,
        closed_files,
    }
}

struct SshSession {
    fixture: Arc<Fixture>,
    closed_files: Arc<AtomicUsize>,
    channels: HashMap<ChannelId, Channel<Msg>>,
}

#[async_trait::async_trait]
impl russh::server::Handler for SshSession {
    type Error = anyhow::Error;

    async fn auth_password(self, user: &str, password: &str) -> Result<(Self, Auth), Self::Error> {
        let auth = if user == USER && password == PASSWORD {
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
            }
        };
        Ok((self, auth))
    }

    async fn channel_open_session(
        mut self,
        channel: Channel<Msg>,
        session: Session,
    ) -> Result<(Self, bool, Session), Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok((self, true, session))
    }

    async fn subsystem_request(
        mut self,
        channel_id: ChannelId,
        name: &str,
        mut session: Session,
    ) -> Result<(Self, Session), Self::Error> {
        match self.channels.remove(&channel_id) {
            Some(channel) if name == "sftp" && !self.fixture.refuse_sftp => {
                session.channel_success(channel_id);
                let handler = SftpServer {
                    fixture: self.fixture.clone(),
                    closed_files: self.closed_files.clone(),
                    listed: false,
                };
                russh_sftp::server::run(channel.into_stream(), handler).await;
            }
            _ => session.channel_failure(channel_id),
        }
        Ok((self, session))
    }
}

struct SftpServer {
    fixture: Arc<Fixture>,
    closed_files: Arc<AtomicUsize>,
    listed: bool,
}

impl SftpServer {
    fn file(&self, name: &str) -> Result<&TestFile, StatusCode> {
        self.fixture
            .files
            .iter()
            .find(|file| file.name == name)
            .ok_or(StatusCode::NoSuchFile)
    }

    fn entries(&self) -> Vec<File> {
        let dir = |mtime| FileAttributes {
            permissions: Some(0o040_755),
            mtime: Some(mtime),
            ..Default::default()
        };
        let mut entries = vec![File::new(".", dir(0)), File::new("..", dir(0))];
        entries.extend(
            self.fixture
                .subdirs
                .iter()
                .map(|name| File::new(name.as_str(), dir(1))),
        );
        entries.extend(self.fixture.files.iter().map(|file| {
            File::new(
                file.name.as_str(),
                FileAttributes {
                    size: Some(file.data.len() as u64),
                    permissions: Some(0o100_644),
                    mtime: Some(file.mtime),
                    ..Default::default()
                },
            )
        }));
        entries
    }
}

impl russh_sftp::server::Handler for SftpServer {
    type Error = StatusCode;

    fn unimplemented(&self) -> Self::Error {
        StatusCode::OpUnsupported
    }

    async fn init(
        &mut self,
        _version: u32,
        _extensions: HashMap<String, String>,
    ) -> Result<Version, Self::Error> {
        Ok(Version::new())
    }

    async fn realpath(&mut self, id: u32, _path: String) -> Result<Name, Self::Error> {
        Ok(Name {
            id,
            files: vec![File::dummy(HOME)],
        })
    }

    async fn opendir(&mut self, id: u32, path: String) -> Result<Handle, Self::Error> {
        if path != DIR {
            return Err(StatusCode::NoSuchFile);
        }
        self.listed = false;
        Ok(Handle { id, handle: path })
    }

    async fn readdir(&mut self, id: u32, _handle: String) -> Result<Name, Self::Error> {
        if self.listed {
            return Err(StatusCode::Eof);
        }
        self.listed = true;
        Ok(Name {
            id,
            files: self.entries(),
        })
    }

    async fn open(
        &mut self,
        id: u32,
        filename: String,
        _pflags: OpenFlags,
        _attrs: FileAttributes,
    ) -> Result<Handle, Self::Error> {
        let name = filename
            .strip_prefix(DIR)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or(StatusCode::NoSuchFile)?;
        self.file(name)?;
        Ok(Handle {
            id,
            handle: name.to_string(),
        })
    }

    async fn read(
        &mut self,
        id: u32,
        handle: String,
        offset: u64,
        len: u32,
    ) -> Result<Data, Self::Error> {
        let data = &self.file(&handle)?.data;
        let start = usize::try_from(offset).map_err(|_| StatusCode::Failure)?;
        if start >= data.len() {
            return Err(StatusCode::Eof);
        }
        let end = data.len().min(start + len as usize);
        Ok(Data {
            id,
            data: data[start..end].to_vec(),
        })
    }

    async fn close(&mut self, id: u32, handle: String) -> Result<Status, Self::Error> {
        if handle != DIR {
            self.closed_files.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Status {
            id,
            status_code: StatusCode::Ok,
            error_message: "Ok".to_string(),
            language_tag: "en-US".to_string(),
        })
    }
}
