//! Concrete backend connectors.
//!
//! - [`ssh`]: interactive shell over SSH.
//! - [`tcp`]: raw TCP stream to the requested host and port.
//! - [`pty`]: local shell on a pseudo-terminal, for loopback targets.
//!
//! All are blocking and run on the connector pool's workers.

#[cfg(unix)]
pub mod pty;
pub mod ssh;
pub mod tcp;

use crate::config::{BackendConfig, BackendKind};
use std::future::Future;
use std::sync::Arc;
use termgate_core::{ConnectFailure, Connector, GateError, GateResult, Target};

/// Build the connector selected by `config`.
pub fn build_connector(config: &BackendConfig) -> GateResult<Arc<dyn Connector>> {
    match config.kind {
        BackendKind::Ssh => Ok(Arc::new(ssh::SshConnector::new(
            config.term.clone(),
            config.host_key_policy,
            config.known_hosts.clone(),
            config.system_known_hosts.clone(),
        ))),
        BackendKind::Tcp => Ok(Arc::new(tcp::TcpConnector)),
        #[cfg(unix)]
        BackendKind::Pty => {
            let password = config
                .password
                .clone()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| GateError::Config("the pty backend requires backend.password".into()))?;
            let user = config.allow_user.clone().ok_or_else(|| {
                GateError::Config("the pty backend requires backend.allow_user (or $USER)".into())
            })?;
            Ok(Arc::new(pty::PtyConnector::new(
                config.shell.clone(),
                config.term.clone(),
                user,
                password,
            )))
        }
        #[cfg(not(unix))]
        BackendKind::Pty => Err(GateError::Config(
            "the pty backend is only available on unix".into(),
        )),
    }
}

/// Reject uploaded key material for backends that cannot use it.
pub(crate) fn reject_private_key(target: &Target, backend: &str) -> Result<(), ConnectFailure> {
    if target.credentials.private_key.is_some() {
        return Err(ConnectFailure::InvalidCredentialMaterial(format!(
            "Private keys are not supported by the {backend} backend."
        )));
    }
    Ok(())
}

/// Drive an async handshake to completion from a connector.
///
/// Connectors run on blocking worker threads, where the runtime handle is
/// available but no task is executing. Outside a runtime a throwaway
/// current-thread runtime is used. Must not be called from async code.
pub(crate) fn block_on<F: Future>(fut: F) -> std::io::Result<F::Output> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            Ok(runtime.block_on(fut))
        }
    }
}

/// Compare secrets without short-circuiting on the first differing byte.
pub(crate) fn secrets_match(given: &str, expected: &str) -> bool {
    let (a, b) = (given.as_bytes(), expected.as_bytes());
    let mut diff = a.len() ^ b.len();
    for (i, byte) in b.iter().enumerate() {
        diff |= usize::from(a.get(i).copied().unwrap_or(0) ^ byte);
    }
    diff == 0
}
