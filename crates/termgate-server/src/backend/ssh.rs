//! SSH backend using russh.
//!
//! Authenticates with the request's password or uploaded private key, checks
//! the server's host key against known_hosts files under a configurable
//! policy, and opens an interactive shell on a PTY. The shell channel's byte
//! stream is the backend session.

use super::block_on;
use crate::config::HostKeyPolicy;
use russh::client::{self, Handle};
use russh::keys::{self, HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::Disconnect;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use termgate_core::{BoxedSession, ConnectFailure, Connector, Target};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, info, warn};

const DEFAULT_COLS: u32 = 80;
const DEFAULT_ROWS: u32 = 24;

const BAD_KEY_MATERIAL: &str =
    "Not a valid private key file or wrong password for decrypting the private key.";

/// Opens an interactive SSH shell per connect request.
pub struct SshConnector {
    term: String,
    host_keys: HostKeyStore,
}

impl SshConnector {
    pub fn new(
        term: String,
        policy: HostKeyPolicy,
        known_hosts: PathBuf,
        system_known_hosts: PathBuf,
    ) -> Self {
        Self {
            term,
            host_keys: HostKeyStore {
                policy,
                known_hosts,
                system_known_hosts,
            },
        }
    }

    async fn open_shell(&self, target: &Target) -> Result<SshSession, ConnectFailure> {
        // Validate key material before touching the network.
        let key = match &target.credentials.private_key {
            Some(pem) => Some(
                keys::decode_secret_key(pem, target.credentials.password.as_deref()).map_err(|e| {
                    debug!(error = %e, "private key rejected");
                    ConnectFailure::InvalidCredentialMaterial(BAD_KEY_MATERIAL.into())
                })?,
            ),
            None => None,
        };

        let checker = HostKeyCheck {
            host: target.host.clone(),
            port: target.port,
            store: self.host_keys.clone(),
        };
        let config = Arc::new(client::Config::default());
        let mut handle = client::connect(config, (target.host.as_str(), target.port), checker)
            .await
            .map_err(|e| match e {
                russh::Error::UnknownKey => ConnectFailure::UntrustedHostKey,
                other => {
                    debug!(target = %target.authority(), error = %other, "ssh handshake failed");
                    ConnectFailure::unreachable(target)
                }
            })?;

        authenticate(&mut handle, target, key).await?;

        let channel_failed = |e: russh::Error| {
            debug!(target = %target.authority(), error = %e, "ssh shell setup failed");
            ConnectFailure::unreachable(target)
        };
        let channel = handle.channel_open_session().await.map_err(channel_failed)?;
        channel
            .request_pty(true, &self.term, DEFAULT_COLS, DEFAULT_ROWS, 0, 0, &[])
            .await
            .map_err(channel_failed)?;
        channel.request_shell(true).await.map_err(channel_failed)?;

        info!(target = %target.authority(), user = %target.credentials.username, "ssh shell opened");
        Ok(SshSession {
            stream: Box::pin(channel.into_stream()),
            handle: Some(handle),
        })
    }
}

impl Connector for SshConnector {
    fn connect(&self, target: &Target, timeout: Duration) -> Result<BoxedSession, ConnectFailure> {
        let opened = block_on(tokio::time::timeout(timeout, self.open_shell(target)));
        match opened {
            Ok(Ok(Ok(session))) => Ok(Box::new(session)),
            Ok(Ok(Err(failure))) => Err(failure),
            Ok(Err(_elapsed)) => {
                debug!(target = %target.authority(), "ssh connect timed out");
                Err(ConnectFailure::unreachable(target))
            }
            Err(e) => {
                debug!(error = %e, "could not start ssh runtime");
                Err(ConnectFailure::unreachable(target))
            }
        }
    }
}

async fn authenticate(
    handle: &mut Handle<HostKeyCheck>,
    target: &Target,
    key: Option<keys::PrivateKey>,
) -> Result<(), ConnectFailure> {
    let user = target.credentials.username.clone();
    let result = match (key, &target.credentials.password) {
        (Some(key), _) => {
            let hash_alg = handle.best_supported_rsa_hash().await.ok().flatten().flatten();
            handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
                .await
        }
        (None, Some(password)) => handle.authenticate_password(user, password.clone()).await,
        (None, None) => handle.authenticate_none(user).await,
    };

    match result {
        Ok(auth) if auth.success() => Ok(()),
        Ok(_) => Err(ConnectFailure::AuthenticationFailed),
        Err(e) => {
            debug!(target = %target.authority(), error = %e, "ssh authentication error");
            Err(ConnectFailure::unreachable(target))
        }
    }
}

/// Where host keys are looked up and learned.
#[derive(Debug, Clone)]
struct HostKeyStore {
    policy: HostKeyPolicy,
    /// Writable file for keys learned under [`HostKeyPolicy::AutoAdd`].
    known_hosts: PathBuf,
    /// The user's OpenSSH known_hosts, read only.
    system_known_hosts: PathBuf,
}

impl HostKeyStore {
    /// Decide whether to trust `key` for `host:port`.
    ///
    /// A key that contradicts a recorded one is always refused. Unknown keys
    /// are handled by the policy.
    fn verify(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        for path in [&self.system_known_hosts, &self.known_hosts] {
            if !path.exists() {
                continue;
            }
            match keys::check_known_hosts_path(host, port, key, path) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => {
                    warn!(host, port, path = %path.display(), error = %e, "host key does not match known_hosts");
                    return false;
                }
            }
        }

        let fingerprint = key.fingerprint(HashAlg::Sha256);
        match self.policy {
            HostKeyPolicy::Reject => {
                warn!(host, port, %fingerprint, "unknown host key rejected");
                false
            }
            HostKeyPolicy::Warning => {
                warn!(host, port, %fingerprint, "accepting unknown host key");
                true
            }
            HostKeyPolicy::AutoAdd => {
                match learn(host, port, key, &self.known_hosts) {
                    Ok(()) => info!(host, port, %fingerprint, "recorded new host key"),
                    Err(e) => warn!(host, port, error = %e, "could not record host key"),
                }
                true
            }
        }
    }
}

fn learn(host: &str, port: u16, key: &PublicKey, path: &Path) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    keys::known_hosts::learn_known_hosts_path(host, port, key, path).map_err(io::Error::other)
}

/// russh client handler: only the host key check matters here.
struct HostKeyCheck {
    host: String,
    port: u16,
    store: HostKeyStore,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(self.store.verify(&self.host, self.port, server_public_key))
    }
}

trait ShellStream: AsyncRead + AsyncWrite + Send {}

impl<T> ShellStream for T where T: AsyncRead + AsyncWrite + Send {}

/// An interactive shell channel, plus the connection that carries it.
pub struct SshSession {
    stream: Pin<Box<dyn ShellStream>>,
    handle: Option<Handle<HostKeyCheck>>,
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                    debug!(error = %e, "ssh disconnect failed");
                }
            });
        }
    }
}

impl AsyncRead for SshSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_read(cx, buf)
    }
}

impl AsyncWrite for SshSession {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.stream.as_mut().poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.stream.as_mut().poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::{ConnectorPool, Credentials};

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOZbqm1JBR7tXh0U+UWpTuc3a+j+ducctIfwbOJ4BQpa";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIG7yEKMrHwyskv/3s0cilcyRdOBsebDa/T8sZLocGxnQ";

    fn key(text: &str) -> PublicKey {
        PublicKey::from_openssh(text).unwrap()
    }

    fn store(dir: &Path, policy: HostKeyPolicy) -> HostKeyStore {
        HostKeyStore {
            policy,
            known_hosts: dir.join("termgate").join("known_hosts"),
            system_known_hosts: dir.join("ssh_known_hosts"),
        }
    }

    fn target(port: u16) -> Target {
        Target {
            host: "127.0.0.1".into(),
            port,
            credentials: Credentials {
                username: "alice".into(),
                password: Some("pw".into()),
                private_key: None,
            },
        }
    }

    #[test]
    fn unknown_keys_follow_policy() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!store(dir.path(), HostKeyPolicy::Reject).verify("10.0.0.1", 22, &key(KEY_A)));
        assert!(store(dir.path(), HostKeyPolicy::Warning).verify("10.0.0.1", 22, &key(KEY_A)));
        assert!(!dir.path().join("termgate").join("known_hosts").exists());
    }

    #[test]
    fn auto_add_learns_keys() {
        let dir = tempfile::tempdir().unwrap();
        assert!(store(dir.path(), HostKeyPolicy::AutoAdd).verify("10.0.0.1", 2222, &key(KEY_A)));

        // Learned: trusted even under the strict policy, and a swapped key is refused.
        let strict = store(dir.path(), HostKeyPolicy::Reject);
        assert!(strict.verify("10.0.0.1", 2222, &key(KEY_A)));
        assert!(!strict.verify("10.0.0.1", 2222, &key(KEY_B)));
    }

    #[test]
    fn changed_key_is_refused_under_any_policy() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ssh_known_hosts"), format!("10.0.0.1 {KEY_A}\n")).unwrap();

        for policy in [HostKeyPolicy::Reject, HostKeyPolicy::Warning, HostKeyPolicy::AutoAdd] {
            let hosts = store(dir.path(), policy);
            assert!(hosts.verify("10.0.0.1", 22, &key(KEY_A)));
            assert!(!hosts.verify("10.0.0.1", 22, &key(KEY_B)));
        }
    }

    fn connector(dir: &Path) -> Arc<SshConnector> {
        Arc::new(SshConnector::new(
            "xterm".into(),
            HostKeyPolicy::Reject,
            dir.join("known_hosts"),
            dir.join("ssh_known_hosts"),
        ))
    }

    #[tokio::test]
    async fn bad_private_key_is_invalid_material() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = target(1);
        t.credentials.private_key = Some("not a key".into());
        let pool = ConnectorPool::new(connector(dir.path()), 1, Duration::from_secs(2));
        let err = pool.connect(t).await.err().unwrap();
        assert_eq!(err, ConnectFailure::InvalidCredentialMaterial(BAD_KEY_MATERIAL.into()));
    }

    #[tokio::test]
    async fn refused_port_is_unreachable() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectorPool::new(connector(dir.path()), 1, Duration::from_secs(2));
        let err = pool.connect(target(port)).await.err().unwrap();
        assert!(matches!(err, ConnectFailure::Unreachable { .. }));
    }

    #[tokio::test]
    async fn silent_server_hits_the_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hold = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(sock);
        });

        let dir = tempfile::tempdir().unwrap();
        let pool = ConnectorPool::new(connector(dir.path()), 1, Duration::from_millis(500));
        let started = std::time::Instant::now();
        let err = pool.connect(target(port)).await.err().unwrap();
        assert!(matches!(err, ConnectFailure::Unreachable { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        hold.abort();
    }
}
