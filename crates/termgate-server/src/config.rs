//! Server configuration: TOML file + CLI overrides.

use clap::ValueEnum;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termgate_core::{GateError, GateResult};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSection,
}

/// `[server]` section of the config TOML. Durations are in seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_recycle_delay")]
    pub recycle_delay: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_max_pending_connects")]
    pub max_pending_connects: usize,
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    #[serde(default)]
    pub trust_proxy_headers: bool,
    /// Bound on the WebSocket upgrade and on reading a `/connect` request.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            recycle_delay: default_recycle_delay(),
            sweep_interval: default_sweep_interval(),
            connect_timeout: default_connect_timeout(),
            max_pending_connects: default_max_pending_connects(),
            max_buffered_bytes: default_max_buffered_bytes(),
            trust_proxy_headers: false,
            handshake_timeout: default_handshake_timeout(),
        }
    }
}

/// Which connector produces backend sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Interactive shell over SSH.
    #[default]
    Ssh,
    /// Raw TCP stream to the requested host and port.
    Tcp,
    /// Local shell on a pseudo-terminal (loopback targets only).
    Pty,
}

/// What the `ssh` backend does with a host key it has never seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyPolicy {
    /// Refuse the connection.
    Reject,
    /// Trust the key and record it in `known_hosts`.
    AutoAdd,
    /// Trust the key for this connection only, logging a warning.
    #[default]
    Warning,
}

/// `[backend]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,
    /// Shell for the `pty` backend. Defaults to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    /// Username a `pty` connect request must present. Defaults to `$USER`.
    #[serde(default)]
    pub allow_user: Option<String>,
    /// Password a `pty` connect request must present. Required for `pty`.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
    /// Where learned host keys are stored. Defaults to `~/.termgate/known_hosts`.
    #[serde(default)]
    pub known_hosts: Option<String>,
    /// OpenSSH known_hosts consulted read-only. Defaults to `~/.ssh/known_hosts`.
    #[serde(default)]
    pub system_known_hosts: Option<String>,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            shell: None,
            term: default_term(),
            allow_user: None,
            password: None,
            host_key_policy: HostKeyPolicy::default(),
            known_hosts: None,
            system_known_hosts: None,
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8888
}
fn default_recycle_delay() -> u64 {
    3
}
fn default_sweep_interval() -> u64 {
    1
}
fn default_connect_timeout() -> u64 {
    6
}
fn default_max_pending_connects() -> usize {
    32
}
fn default_max_buffered_bytes() -> usize {
    1024 * 1024
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_term() -> String {
    "xterm".to_string()
}

/// CLI flags that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub recycle_delay: Option<u64>,
    pub backend: Option<BackendKind>,
    pub trust_proxy_headers: bool,
}

/// Resolved backend settings.
#[derive(Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub shell: String,
    pub term: String,
    pub allow_user: Option<String>,
    pub password: Option<String>,
    pub host_key_policy: HostKeyPolicy,
    pub known_hosts: PathBuf,
    pub system_known_hosts: PathBuf,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("kind", &self.kind)
            .field("shell", &self.shell)
            .field("term", &self.term)
            .field("allow_user", &self.allow_user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("host_key_policy", &self.host_key_policy)
            .field("known_hosts", &self.known_hosts)
            .field("system_known_hosts", &self.system_known_hosts)
            .finish()
    }
}

/// Resolved server configuration (CLI overrides applied, values validated).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub recycle_delay: Duration,
    pub sweep_interval: Duration,
    pub connect_timeout: Duration,
    pub max_pending_connects: usize,
    pub max_buffered_bytes: usize,
    pub trust_proxy_headers: bool,
    pub handshake_timeout: Duration,
    pub backend: BackendConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> GateResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| GateError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge a parsed config file with CLI overrides.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> GateResult<Self> {
        let server = file.server;
        let listen_host = cli.listen.clone().unwrap_or(server.listen);
        let port = cli.port.unwrap_or(server.port);
        let listen = format!("{listen_host}:{port}")
            .parse::<SocketAddr>()
            .or_else(|_| format!("[{listen_host}]:{port}").parse::<SocketAddr>())
            .map_err(|e| GateError::Config(format!("invalid listen address {listen_host}: {e}")))?;

        let recycle_delay = cli.recycle_delay.unwrap_or(server.recycle_delay);
        if recycle_delay == 0 {
            return Err(GateError::Config("recycle_delay must be at least 1 second".into()));
        }
        if server.sweep_interval == 0 {
            return Err(GateError::Config("sweep_interval must be at least 1 second".into()));
        }
        if server.max_buffered_bytes == 0 {
            return Err(GateError::Config("max_buffered_bytes must be positive".into()));
        }

        let shell = file
            .backend
            .shell
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());
        let allow_user = file
            .backend
            .allow_user
            .or_else(|| std::env::var("USER").ok())
            .or_else(|| std::env::var("LOGNAME").ok());
        let known_hosts = expand_tilde(Path::new(
            file.backend.known_hosts.as_deref().unwrap_or("~/.termgate/known_hosts"),
        ));
        let system_known_hosts = expand_tilde(Path::new(
            file.backend.system_known_hosts.as_deref().unwrap_or("~/.ssh/known_hosts"),
        ));

        Ok(Self {
            listen,
            recycle_delay: Duration::from_secs(recycle_delay),
            sweep_interval: Duration::from_secs(server.sweep_interval),
            connect_timeout: Duration::from_secs(server.connect_timeout.max(1)),
            max_pending_connects: server.max_pending_connects.max(1),
            max_buffered_bytes: server.max_buffered_bytes,
            trust_proxy_headers: cli.trust_proxy_headers || server.trust_proxy_headers,
            handshake_timeout: Duration::from_secs(server.handshake_timeout.max(1)),
            backend: BackendConfig {
                kind: cli.backend.unwrap_or(file.backend.kind),
                shell,
                term: file.backend.term,
                allow_user,
                password: file.backend.password,
                host_key_policy: file.backend.host_key_policy,
                known_hosts,
                system_known_hosts,
            },
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = ServerConfig::resolve(ConfigFile::default(), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:8888".parse().unwrap());
        assert_eq!(cfg.recycle_delay, Duration::from_secs(3));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(6));
        assert_eq!(cfg.max_buffered_bytes, 1024 * 1024);
        assert!(!cfg.trust_proxy_headers);
        assert_eq!(cfg.handshake_timeout, Duration::from_secs(10));
        assert_eq!(cfg.backend.kind, BackendKind::Ssh);
        assert_eq!(cfg.backend.term, "xterm");
        assert_eq!(cfg.backend.host_key_policy, HostKeyPolicy::Warning);
        assert!(cfg.backend.known_hosts.ends_with(".termgate/known_hosts"));
        assert!(cfg.backend.system_known_hosts.ends_with(".ssh/known_hosts"));
    }

    #[test]
    fn parses_file_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
listen = "0.0.0.0"
port = 9000
recycle_delay = 10
trust_proxy_headers = true

[backend]
kind = "pty"
shell = "/bin/bash"
allow_user = "alice"
password = "s3cret"
host_key_policy = "autoadd"
known_hosts = "/var/lib/termgate/known_hosts"
"#
        )
        .unwrap();

        let cfg = ServerConfig::load(Some(file.path()), &CliOverrides::default()).unwrap();
        assert_eq!(cfg.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(cfg.recycle_delay, Duration::from_secs(10));
        assert!(cfg.trust_proxy_headers);
        assert_eq!(cfg.backend.kind, BackendKind::Pty);
        assert_eq!(cfg.backend.shell, "/bin/bash");
        assert_eq!(cfg.backend.allow_user.as_deref(), Some("alice"));
        assert_eq!(cfg.backend.password.as_deref(), Some("s3cret"));
        assert_eq!(cfg.backend.host_key_policy, HostKeyPolicy::AutoAdd);
        assert_eq!(cfg.backend.known_hosts, Path::new("/var/lib/termgate/known_hosts"));
        assert!(!format!("{:?}", cfg.backend).contains("s3cret"));
    }

    #[test]
    fn cli_overrides_file() {
        let file: ConfigFile = toml::from_str("[server]\nport = 9000\nrecycle_delay = 10\n").unwrap();
        let cli = CliOverrides {
            listen: Some("::1".into()),
            port: Some(7000),
            recycle_delay: Some(5),
            backend: Some(BackendKind::Pty),
            trust_proxy_headers: true,
        };
        let cfg = ServerConfig::resolve(file, &cli).unwrap();
        assert_eq!(cfg.listen, "[::1]:7000".parse().unwrap());
        assert_eq!(cfg.recycle_delay, Duration::from_secs(5));
        assert_eq!(cfg.backend.kind, BackendKind::Pty);
        assert!(cfg.trust_proxy_headers);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let cfg = ServerConfig::load(
            Some(Path::new("/nonexistent/termgate/config.toml")),
            &CliOverrides::default(),
        )
        .unwrap();
        assert_eq!(cfg.listen.port(), 8888);
    }

    #[test]
    fn rejects_zero_recycle_delay() {
        let file: ConfigFile = toml::from_str("[server]\nrecycle_delay = 0\n").unwrap();
        assert!(ServerConfig::resolve(file, &CliOverrides::default()).is_err());
    }

    #[test]
    fn rejects_bad_listen_address() {
        let cli = CliOverrides {
            listen: Some("not an address".into()),
            ..CliOverrides::default()
        };
        assert!(ServerConfig::resolve(ConfigFile::default(), &cli).is_err());
    }

    #[test]
    fn rejects_unknown_backend_kind() {
        assert!(toml::from_str::<ConfigFile>("[backend]\nkind = \"telnet\"\n").is_err());
    }

    #[test]
    fn rejects_unknown_host_key_policy() {
        assert!(toml::from_str::<ConfigFile>("[backend]\nhost_key_policy = \"trust\"\n").is_err());
    }
}
