//! Bounded worker pool for blocking backend handshakes.
//!
//! Each request runs on tokio's blocking thread pool and hands its result back
//! through a `oneshot` channel, so the requesting task suspends without tying
//! up the event loop. A semaphore caps the number of handshakes in flight;
//! requests beyond the cap wait their turn.

use crate::backend::{BoxedSession, ConnectFailure, Connector, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

/// Runs [`Connector::connect`] off the event loop, at most `capacity` at a time.
pub struct ConnectorPool {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    capacity: u32,
    timeout: Duration,
}

impl ConnectorPool {
    /// Create a pool around `connector`.
    ///
    /// * `capacity` - Maximum concurrent handshakes (at least 1).
    /// * `timeout` - Connect timeout passed to every handshake.
    pub fn new(connector: Arc<dyn Connector>, capacity: usize, timeout: Duration) -> Self {
        let capacity = capacity.clamp(1, u32::MAX as usize) as u32;
        Self {
            connector,
            permits: Arc::new(Semaphore::new(capacity as usize)),
            capacity,
            timeout,
        }
    }

    /// Establish a backend session for `target`.
    ///
    /// Resolves exactly once: with the session, or with the connector's typed
    /// failure. [`ConnectFailure::Cancelled`] means the pool is shut down or
    /// the worker died without answering.
    pub async fn connect(&self, target: Target) -> Result<BoxedSession, ConnectFailure> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ConnectFailure::Cancelled)?;

        let (tx, rx) = oneshot::channel();
        let connector = self.connector.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            info!(target = %target.authority(), "connecting to backend");
            let result = connector.connect(&target, timeout);
            if let Err(e) = &result {
                warn!(target = %target.authority(), error = %e, "backend connect failed");
            }
            // A dropped receiver means the requester left; the session (if
            // any) is dropped and therefore closed here.
            if tx.send(result).is_err() {
                debug!(target = %target.authority(), "connect requester went away");
            }
        });

        rx.await.map_err(|_| ConnectFailure::Cancelled)?
    }

    /// Number of handshakes currently in flight.
    pub fn in_flight(&self) -> usize {
        self.capacity as usize - self.permits.available_permits()
    }

    /// Wait for in-flight handshakes to finish, then refuse new ones.
    ///
    /// Requests queued behind the drain resolve with `Cancelled`.
    pub async fn shutdown(&self) {
        if let Ok(all) = self.permits.acquire_many(self.capacity).await {
            all.forget();
        }
        self.permits.close();
        debug!("connector pool drained");
    }
}
