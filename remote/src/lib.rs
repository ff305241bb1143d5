//! SSH connection management and SFTP access for `sfetch`.
//!
//! [`connect`] performs the whole handshake (TCP, SSH key exchange, host key check,
//! authentication, SFTP subsystem) under one deadline and returns a [`Connection`] whose
//! [`Connection::fs`] plugs into the download pipeline in `common`.

use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use tracing::instrument;

pub mod host_key;
pub mod sftp;

pub use host_key::HostKeyPolicy;

#[cfg(test)]
mod testserver;

/// Error raised while establishing a connection.
///
/// `Transport` covers everything up to an authenticated SSH session: name resolution, TCP,
/// key exchange, host key verification and authentication. `Protocol` means the SSH session
/// was up but the SFTP subsystem could not be started.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("SSH connection to {address} failed: {source:#}")]
    Transport {
        address: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("SFTP session on {address} failed: {source:#}")]
    Protocol {
        address: String,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Clone)]
pub enum Credential {
    Password(String),
    PrivateKey {
        path: std::path::PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PrivateKey { path, passphrase } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: Credential,
    /// Deadline for the whole handshake, not per step
    pub timeout: std::time::Duration,
    pub host_key_policy: HostKeyPolicy,
}

impl ConnectSettings {
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type SshHandle = russh::client::Handle<host_key::Client>;

/// An authenticated SSH session with an SFTP subsystem on top.
pub struct Connection {
    address: String,
    session: Option<SshHandle>,
    sftp: Option<Arc<russh_sftp::client::SftpSession>>,
}

impl Connection {
    /// Remote filesystem view over this connection's SFTP session.
    pub fn fs(&self) -> anyhow::Result<Arc<dyn common::RemoteFs>> {
        let session = self
            .sftp
            .as_ref()
            .ok_or_else(|| anyhow!("connection to {} is closed", self.address))?;
        Ok(Arc::new(sftp::SftpFs::new(session.clone())))
    }

    /// Directory the server starts the SFTP session in.
    pub async fn working_dir(&self) -> anyhow::Result<String> {
        let session = self
            .sftp
            .as_ref()
            .ok_or_else(|| anyhow!("connection to {} is closed", self.address))?;
        session
            .canonicalize(".")
            .await
            .context("failed resolving remote working directory")
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.session.is_none() && self.sftp.is_none()
    }

    /// Ends the SFTP session, then the SSH session. Safe to call more than once; failures are
    /// logged and otherwise ignored.
    #[instrument(skip(self), fields(address = %self.address))]
    pub async fn close(&mut self) {
        if let Some(sftp) = self.sftp.take() {
            let result = sftp.close().await;
            if let Err(error) = result {
                tracing::warn!("failed closing SFTP session: {}", error);
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(error) = session
                .disconnect(russh::Disconnect::ByApplication, "", "English")
                .await
            {
                tracing::warn!("failed closing SSH session: {}", error);
            }
            tracing::debug!("disconnected");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::debug!("connection to {} dropped without close", self.address);
        }
    }
}

async fn open_session(settings: &ConnectSettings) -> anyhow::Result<SshHandle> {
    let config = Arc::new(russh::client::Config::default());
    let handler = host_key::Client::new(
        settings.host_key_policy.clone(),
        &settings.host,
        settings.port,
    );
    tracing::debug!("connecting to {}", settings.address());
    let mut session =
        russh::client::connect(config, (settings.host.as_str(), settings.port), handler)
            .await
            .context("SSH handshake failed")?;
    let authenticated = match &settings.credential {
        Credential::Password(password) => session
            .authenticate_password(settings.user.as_str(), password.as_str())
            .await
            .context("password authentication failed")?,
        Credential::PrivateKey { path, passphrase } => {
            let key = russh_keys::load_secret_key(path, passphrase.as_deref())
                .with_context(|| format!("failed loading private key {path:?}"))?;
            session
                .authenticate_publickey(settings.user.as_str(), Arc::new(key))
                .await
                .context("public key authentication failed")?
        }
    };
    if !authenticated {
        if let Err(error) = session
            .disconnect(russh::Disconnect::ByApplication, "", "English")
            .await
        {
            tracing::debug!("disconnect after rejected authentication failed: {}", error);
        }
        return Err(anyhow!(
            "server rejected credentials for user {:?}",
            settings.user
        ));
    }
    tracing::debug!("authenticated as {:?}", settings.user);
    Ok(session)
}

async fn start_sftp(session: &SshHandle) -> anyhow::Result<russh_sftp::client::SftpSession> {
    let mut channel = session
        .channel_open_session()
        .await
        .context("failed opening session channel")?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .context("failed requesting sftp subsystem")?;
    loop {
        match channel.wait().await {
            Some(russh::ChannelMsg::Success) => break,
            Some(russh::ChannelMsg::Failure) => bail!("server refused the sftp subsystem"),
            Some(russh::ChannelMsg::Eof | russh::ChannelMsg::Close) | None => {
                bail!("channel closed before the sftp subsystem started")
            }
            Some(msg) => tracing::trace!("ignoring {:?} while starting sftp", msg),
        }
    }
    russh_sftp::client::SftpSession::new(channel.into_stream())
        .await
        .context("SFTP version negotiation failed")
}

fn timed_out(timeout: std::time::Duration) -> anyhow::Error {
    anyhow!("timed out after {}", humantime::format_duration(timeout))
}

/// Establishes an authenticated SSH session and starts SFTP on it.
///
/// The whole sequence shares the deadline in [`ConnectSettings::timeout`]. A failure after the
/// SSH session is up closes that session before returning.
#[instrument(skip(settings), fields(address = %settings.address(), user = %settings.user))]
pub async fn connect(settings: &ConnectSettings) -> Result<Connection, ConnectError> {
    let address = settings.address();
    let deadline = tokio::time::Instant::now() + settings.timeout;
    let session = match tokio::time::timeout_at(deadline, open_session(settings)).await {
        Ok(session) => session,
        Err(_) => Err(timed_out(settings.timeout)),
    }
    .map_err(|source| ConnectError::Transport {
        address: address.clone(),
        source,
    })?;
    let mut connection = Connection {
        address: address.clone(),
        session: Some(session),
        sftp: None,
    };
    let sftp = {
        let Some(session) = connection.session.as_ref() else {
            return Err(ConnectError::Transport {
                address,
                source: anyhow!("SSH session closed during setup"),
            });
        };
        match tokio::time::timeout_at(deadline, start_sftp(session)).await {
            Ok(sftp) => sftp,
            Err(_) => Err(timed_out(settings.timeout)),
        }
    };
    match sftp {
        Ok(sftp) => {
            connection.sftp = Some(Arc::new(sftp));
            tracing::info!("connected to {} as {:?}", address, settings.user);
            Ok(connection)
        }
        Err(source) => {
            connection.close().await;
            Err(ConnectError::Protocol { address, source })
        }
    }
}
