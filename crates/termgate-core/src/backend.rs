//! Backend session and connector abstractions.
//!
//! A backend session is the live, already-authenticated shell channel. The
//! core only needs to read it without blocking, write to it without blocking,
//! learn when either is possible, and shut it down. tokio's `AsyncRead` /
//! `AsyncWrite` poll interface is exactly that contract: `Poll::Pending`
//! registers interest with the reactor, a zero-length read is EOF, and
//! `poll_shutdown` plus drop closes the channel. Any socket or fd wrapper that
//! implements them can be bridged.
//!
//! Connectors are the opposite: their handshake is blocking, so they are only
//! ever invoked from a worker thread (see [`crate::pool::ConnectorPool`]).

use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A live backend shell channel.
pub trait BackendSession: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BackendSession for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased backend session, as produced by a [`Connector`].
pub type BoxedSession = Box<dyn BackendSession>;

/// Credentials supplied with a connect request.
///
/// Interpreting them (key formats, password policy) is the connector's job.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
    /// Raw private key material, if the client uploaded one.
    pub private_key: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Where to connect and as whom.
#[derive(Debug, Clone)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl Target {
    /// `host:port` form, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Why a backend connection could not be established.
///
/// The `Display` text is what the requester sees as its status message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectFailure {
    #[error("Unable to connect to {host}:{port}")]
    Unreachable { host: String, port: u16 },

    #[error("Authentication failed.")]
    AuthenticationFailed,

    #[error("Bad host key.")]
    UntrustedHostKey,

    #[error("{0}")]
    InvalidCredentialMaterial(String),

    /// The worker went away before answering, or the pool is shutting down.
    #[error("Connection request cancelled.")]
    Cancelled,
}

impl ConnectFailure {
    /// Shorthand for an `Unreachable` failure against `target`.
    pub fn unreachable(target: &Target) -> Self {
        ConnectFailure::Unreachable {
            host: target.host.clone(),
            port: target.port,
        }
    }
}

/// Performs the blocking handshake against a backend host.
///
/// Implementations must enforce `timeout` themselves and must not retry; one
/// call is one connection attempt.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, target: &Target, timeout: Duration) -> Result<BoxedSession, ConnectFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_secrets() {
        let creds = Credentials {
            username: "alice".into(),
            password: Some("hunter2".into()),
            private_key: Some("-----BEGIN KEY-----".into()),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("alice"));
        assert!(!shown.contains("hunter2"));
        assert!(!shown.contains("BEGIN KEY"));
    }

    #[test]
    fn status_messages() {
        let target = Target {
            host: "10.0.0.1".into(),
            port: 22,
            credentials: Credentials::default(),
        };
        assert_eq!(
            ConnectFailure::unreachable(&target).to_string(),
            "Unable to connect to 10.0.0.1:22"
        );
        assert_eq!(ConnectFailure::AuthenticationFailed.to_string(), "Authentication failed.");
        assert_eq!(ConnectFailure::UntrustedHostKey.to_string(), "Bad host key.");
    }

    #[test]
    fn authority_brackets_ipv6() {
        let target = Target {
            host: "::1".into(),
            port: 2222,
            credentials: Credentials::default(),
        };
        assert_eq!(target.authority(), "[::1]:2222");
    }

    #[tokio::test]
    async fn duplex_stream_is_a_backend_session() {
        let (a, _b) = tokio::io::duplex(64);
        let _boxed: BoxedSession = Box::new(a);
    }
}
