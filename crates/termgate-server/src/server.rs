//! Core server: accepts WebSocket connections and runs the handoff flow.
//!
//! Owns the connector pool, the handoff registry and the set of live bridges.
//! A `/connect` request yields a backend session parked under a token; a
//! `/ws?id=<token>` connection from the same host claims it and is bridged to
//! it until either side goes away.

use crate::config::ServerConfig;
use crate::protocol::{ConnectRequest, ConnectResponse};
use crate::transport::websocket::{self, Listener, Route, WebSocketConnection, WsStream};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use termgate_core::{
    short_token, BoxedSession, Bridge, BridgeCloser, ClientLink, Connector, ConnectorPool, GateResult,
    HandoffRegistry, OriginAddr,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Frames queued per direction between a bridge and its WebSocket.
const CLIENT_QUEUE_DEPTH: usize = 64;

/// How long connection tasks get to wind down once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The termgate server instance.
pub struct TermgateServer {
    config: ServerConfig,
    /// Backend sessions waiting to be claimed.
    registry: Arc<Mutex<HandoffRegistry<BoxedSession>>>,
    /// Runs blocking backend handshakes.
    pool: Arc<ConnectorPool>,
    /// Live bridges by connection id, so shutdown can close them.
    bridges: Mutex<HashMap<u64, BridgeCloser>>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
    /// Broadcast sender for server shutdown notification.
    shutdown_tx: broadcast::Sender<()>,
}

impl TermgateServer {
    /// Create a server that opens backend sessions through `connector`.
    pub fn new(config: ServerConfig, connector: Arc<dyn Connector>) -> Self {
        let pool = Arc::new(ConnectorPool::new(
            connector,
            config.max_pending_connects,
            config.connect_timeout,
        ));
        let registry = Arc::new(Mutex::new(HandoffRegistry::new(config.recycle_delay)));

        Self {
            config,
            registry,
            pool,
            bridges: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Listen on the configured address until `shutdown` resolves.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> GateResult<()> {
        let listener = websocket::start_listener(
            self.config.listen,
            self.config.trust_proxy_headers,
            self.config.handshake_timeout,
        )
        .await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already started listener until `shutdown`
    /// resolves or the listener stops.
    pub async fn serve(self, listener: Listener, shutdown: impl Future<Output = ()>) -> GateResult<()> {
        let server = Arc::new(self);
        let Listener {
            local_addr,
            mut incoming,
        } = listener;

        let sweeper = server.spawn_sweeper();

        info!(
            addr = %local_addr,
            recycle_delay_secs = server.config.recycle_delay.as_secs(),
            backend = ?server.config.backend.kind,
            "termgate-server ready"
        );

        let mut tasks: JoinSet<GateResult<()>> = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
                conn = incoming.recv() => match conn {
                    Some(conn) => {
                        let srv = server.clone();
                        tasks.spawn(async move { srv.handle_websocket(conn).await });
                    }
                    None => {
                        info!("listener closed, shutting down");
                        break;
                    }
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_task_result(joined);
                }
            }
        }

        drop(incoming);
        server.shutdown(&mut tasks).await;
        let _ = sweeper.await;
        Ok(())
    }

    /// Evict unclaimed sessions every sweep interval.
    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let period = self.config.sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        registry.lock().await.sweep(Instant::now());
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    async fn shutdown(&self, tasks: &mut JoinSet<GateResult<()>>) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        {
            let bridges = self.bridges.lock().await;
            info!(count = bridges.len(), "closing live bridges");
            for closer in bridges.values() {
                closer.close();
            }
        }

        let drain_budget = self.config.connect_timeout + Duration::from_secs(1);
        if tokio::time::timeout(drain_budget, self.pool.shutdown()).await.is_err() {
            warn!("backend handshakes still running at shutdown");
        }

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = tasks.join_next().await {
                log_task_result(joined);
            }
        })
        .await;
        if joined.is_err() {
            warn!(remaining = tasks.len(), "aborting connections that did not finish");
            tasks.shutdown().await;
        }

        let drained = self.registry.lock().await.drain();
        if drained > 0 {
            info!(count = drained, "closed unclaimed sessions");
        }
        info!("termgate-server stopped");
    }

    async fn handle_websocket(&self, conn: WebSocketConnection) -> GateResult<()> {
        let WebSocketConnection {
            ws_stream,
            remote_addr,
            client,
            route,
        } = conn;
        debug!(remote = %remote_addr, client = %client, "handling WebSocket connection");

        match route {
            Route::Connect => self.handle_connect(ws_stream, client).await,
            Route::Attach { token } => self.handle_attach(ws_stream, client, token).await,
        }
    }

    /// Read one connect request, open the backend session and answer with its
    /// token (or the reason it could not be opened).
    async fn handle_connect(&self, mut ws: WsStream, client: OriginAddr) -> GateResult<()> {
        let received = tokio::time::timeout(self.config.handshake_timeout, websocket::recv_payload(&mut ws)).await;
        let Ok(received) = received else {
            info!(client = %client, "no connect request in time, closing");
            let _ = ws.close(None).await;
            return Ok(());
        };
        let Some(payload) = received? else {
            debug!(client = %client, "client left before sending a connect request");
            return Ok(());
        };

        let response = match ConnectRequest::parse(&payload).and_then(ConnectRequest::into_target) {
            Err(status) => {
                info!(client = %client, status = %status, "connect request rejected");
                ConnectResponse::failed(status)
            }
            Ok(target) => {
                let authority = target.authority();
                match self.pool.connect(target).await {
                    Ok(session) => {
                        let token = self.registry.lock().await.register(session, client.clone());
                        info!(client = %client, target = %authority, token = %short_token(&token), "backend session ready");
                        ConnectResponse::ok(token)
                    }
                    Err(failure) => ConnectResponse::failed(failure.to_string()),
                }
            }
        };

        websocket::send_text(&mut ws, response.to_json()).await?;
        let _ = ws.close(None).await;
        Ok(())
    }

    /// Claim the session parked under `token` and bridge it to this client.
    async fn handle_attach(&self, mut ws: WsStream, client: OriginAddr, token: String) -> GateResult<()> {
        let claimed = self.registry.lock().await.claim(&token, &client);
        let session = match claimed {
            Ok(session) => session,
            Err(reason) => {
                info!(client = %client, token = %short_token(&token), reason = %reason, "attach refused");
                let _ = ws.close(None).await;
                return Ok(());
            }
        };

        if let Err(e) = ws.get_ref().set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY on client socket");
        }

        let (link, peer) = ClientLink::pair(CLIENT_QUEUE_DEPTH);
        let mut bridge = Bridge::new(session, link, client.clone(), self.config.max_buffered_bytes);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let closer = bridge.closer();
        self.bridges.lock().await.insert(conn_id, closer.clone());
        if self.shutting_down.load(Ordering::SeqCst) {
            closer.close();
        }

        info!(conn_id, client = %client, token = %short_token(&token), "session attached");
        let (reason, ()) = tokio::join!(bridge.run(), websocket::pump_client(ws, peer));

        self.bridges.lock().await.remove(&conn_id);
        info!(conn_id, client = %client, reason = %reason, "session detached");
        Ok(())
    }
}

fn log_task_result(joined: Result<GateResult<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "WebSocket connection error"),
        Err(e) => warn!(error = %e, "connection task failed"),
    }
}
