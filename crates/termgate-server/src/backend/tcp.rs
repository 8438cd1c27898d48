//! Raw TCP backend: the shell is whatever speaks on `host:port`.

use super::{block_on, reject_private_key};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use termgate_core::{BoxedSession, ConnectFailure, Connector, Target};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Opens a plain TCP connection to the target.
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, target: &Target, timeout: Duration) -> Result<BoxedSession, ConnectFailure> {
        reject_private_key(target, "tcp")?;

        let opened = block_on(async {
            let deadline = Instant::now() + timeout;
            let addrs = timeout_at(deadline, tokio::net::lookup_host((target.host.as_str(), target.port)))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "address resolution timed out"))??;
            connect_any(addrs, deadline).await
        });

        match opened {
            Ok(Ok(stream)) => Ok(Box::new(stream)),
            Ok(Err(e)) | Err(e) => {
                debug!(target = %target.authority(), error = %e, "tcp backend connect failed");
                Err(ConnectFailure::unreachable(target))
            }
        }
    }
}

/// Try each address in turn until one connects. All attempts share
/// `deadline`; once it passes, no further address is tried.
async fn connect_any(
    addrs: impl IntoIterator<Item = SocketAddr>,
    deadline: Instant,
) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match timeout_at(deadline, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(addr = %addr, "tcp backend connected");
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Ok(Err(e)) => {
                debug!(addr = %addr, error = %e, "tcp connect attempt failed");
                last_err = Some(e);
            }
            Err(_) => {
                debug!(addr = %addr, "tcp connect deadline reached");
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved")))
}
