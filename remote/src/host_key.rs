//! Server identity verification for the SSH handshake.

/// How the server's host key is verified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Key must be listed for the host in a known_hosts file (`~/.ssh/known_hosts` if `None`)
    KnownHosts(Option<std::path::PathBuf>),
    /// Key must have this SHA-256 fingerprint, with or without the `SHA256:` prefix
    Fingerprint(String),
    /// Any key is accepted; the connection is open to man-in-the-middle attacks
    AcceptAny,
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        HostKeyPolicy::KnownHosts(None)
    }
}

fn normalize_fingerprint(fingerprint: &str) -> &str {
    let fingerprint = fingerprint.trim();
    fingerprint
        .strip_prefix("SHA256:")
        .unwrap_or(fingerprint)
        .trim_end_matches('=')
}

/// Compares two base64 SHA-256 fingerprints ignoring the `SHA256:` prefix and padding.
#[must_use]
pub fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let expected = normalize_fingerprint(expected);
    !expected.is_empty() && expected == normalize_fingerprint(actual)
}

/// russh client handler enforcing a [`HostKeyPolicy`].
pub struct Client {
    policy: HostKeyPolicy,
    host: String,
    port: u16,
}

impl Client {
    pub fn new(policy: HostKeyPolicy, host: &str, port: u16) -> Self {
        Self {
            policy,
            host: host.to_string(),
            port,
        }
    }

    /// Applies the policy to the key the server presented. A rejected key is an error naming
    /// the reason, so the caller sees more than a bare "unknown key".
    fn verify(&self, server_public_key: &russh_keys::key::PublicKey) -> anyhow::Result<()> {
        let fingerprint = server_public_key.fingerprint();
        match &self.policy {
            HostKeyPolicy::AcceptAny => {
                tracing::warn!(
                    "accepting unverified host key SHA256:{} for {}:{}",
                    fingerprint,
                    self.host,
                    self.port
                );
                Ok(())
            }
            HostKeyPolicy::Fingerprint(expected) => {
                if fingerprint_matches(expected, &fingerprint) {
                    tracing::debug!("host key SHA256:{} matches", fingerprint);
                    Ok(())
                } else {
                    Err(anyhow::anyhow!(
                        "host key SHA256:{} of {}:{} does not match the expected fingerprint {}",
                        fingerprint,
                        self.host,
                        self.port,
                        expected
                    ))
                }
            }
            HostKeyPolicy::KnownHosts(path) => {
                let known = match path {
                    Some(path) => russh_keys::check_known_hosts_path(
                        &self.host,
                        self.port,
                        server_public_key,
                        path,
                    ),
                    None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
                };
                match known {
                    Ok(true) => {
                        tracing::debug!("host key SHA256:{} found in known_hosts", fingerprint);
                        Ok(())
                    }
                    Ok(false) => Err(anyhow::anyhow!(
                        "host key SHA256:{} of {}:{} is not in known_hosts, add it or pass its fingerprint explicitly",
                        fingerprint,
                        self.host,
                        self.port
                    )),
                    Err(error) => Err(anyhow::anyhow!(
                        "known_hosts check for {}:{} failed: {}",
                        self.host,
                        self.port,
                        error
                    )),
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl russh::client::Handler for Client {
    type Error = anyhow::Error;

    async fn check_server_key(
        self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<(Self, bool), Self::Error> {
        self.verify(server_public_key)?;
        Ok((self, true))
    }
}
