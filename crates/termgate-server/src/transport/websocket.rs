//! WebSocket listener using tokio-tungstenite.
//!
//! Every accepted connection is routed by its request path during the
//! upgrade handshake:
//!
//! - `/connect`: one JSON connect request in, one JSON response out.
//! - `/ws?id=<token>`: claim a parked session and start bridging.
//!
//! Anything else is refused with `404` before the upgrade completes.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use termgate_core::{ClientEvent, ClientPeer, GateError, GateResult, OriginAddr, ToClient};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub type WsStream = WebSocketStream<TcpStream>;

/// Maximum accepted client message (1 MiB).
const MAX_WS_FRAME_SIZE: usize = 1_048_576;

/// How long the writer may keep draining after the client stopped sending.
const CLIENT_CLOSE_GRACE: Duration = Duration::from_secs(2);

const REAL_IP_HEADER: &str = "X-Real-Ip";
const REAL_PORT_HEADER: &str = "X-Real-Port";

/// Which endpoint a connection asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Connect,
    Attach { token: String },
}

impl Route {
    /// Map a request path and query string onto a route.
    pub fn parse(path: &str, query: Option<&str>) -> Option<Route> {
        match path.trim_end_matches('/') {
            "/connect" => Some(Route::Connect),
            "/ws" => {
                let token = query
                    .into_iter()
                    .flat_map(|q| q.split('&'))
                    .find_map(|pair| pair.strip_prefix("id="))
                    .unwrap_or_default();
                Some(Route::Attach {
                    token: token.to_string(),
                })
            }
            _ => None,
        }
    }
}

/// A handle to an accepted WebSocket connection.
pub struct WebSocketConnection {
    pub ws_stream: WsStream,
    /// TCP peer address.
    pub remote_addr: SocketAddr,
    /// Address the connection is attributed to (proxy headers applied).
    pub client: OriginAddr,
    pub route: Route,
}

/// A running listener.
pub struct Listener {
    pub local_addr: SocketAddr,
    pub incoming: mpsc::Receiver<WebSocketConnection>,
}

/// Headers captured during the upgrade.
#[derive(Default)]
struct UpgradeInfo {
    route: Option<Route>,
    real_ip: Option<String>,
    real_port: Option<String>,
}

/// Start the WebSocket listener.
///
/// Accepted, routed connections are delivered on the returned receiver. The
/// accept task exits once the receiver is dropped. A peer that has not
/// completed the upgrade within `handshake_timeout` is dropped.
pub async fn start_listener(
    bind_addr: SocketAddr,
    trust_proxy_headers: bool,
    handshake_timeout: Duration,
) -> GateResult<Listener> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))?;
    let local_addr = tcp_listener
        .local_addr()
        .map_err(|e| GateError::Transport(format!("WS bind failed: {e}")))?;

    info!(addr = %local_addr, "WebSocket listener started");

    let (tx, rx) = mpsc::channel::<WebSocketConnection>(64);

    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                accepted = tcp_listener.accept() => accepted,
                _ = tx.closed() => break,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let upgraded =
                            tokio::time::timeout(handshake_timeout, upgrade(stream, addr, trust_proxy_headers));
                        let conn = match upgraded.await {
                            Ok(conn) => conn,
                            Err(_) => {
                                debug!(remote = %addr, "WebSocket handshake timed out");
                                None
                            }
                        };
                        if let Some(conn) = conn {
                            if tx.send(conn).await.is_err() {
                                debug!(remote = %addr, "listener closed, dropping connection");
                            }
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
        debug!("WebSocket listener stopped");
    });

    Ok(Listener {
        local_addr,
        incoming: rx,
    })
}

async fn upgrade(stream: TcpStream, addr: SocketAddr, trust_proxy_headers: bool) -> Option<WebSocketConnection> {
    let mut info = UpgradeInfo::default();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        let header = |name: &str| {
            req.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        info.real_ip = header(REAL_IP_HEADER);
        info.real_port = header(REAL_PORT_HEADER);
        info.route = Route::parse(req.uri().path(), req.uri().query());
        if info.route.is_none() {
            let mut refusal = ErrorResponse::new(Some("Not Found".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            return Err(refusal);
        }
        Ok(resp)
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(remote = %addr, error = %e, "WebSocket handshake failed");
            return None;
        }
    };

    let route = info.route?;
    let client = client_addr(
        addr,
        info.real_ip.as_deref(),
        info.real_port.as_deref(),
        trust_proxy_headers,
    );
    debug!(remote = %addr, client = %client, route = ?route, "WebSocket connection accepted");
    Some(WebSocketConnection {
        ws_stream,
        remote_addr: addr,
        client,
        route,
    })
}

/// Attribute a connection to a client address.
///
/// With `trust_proxy_headers`, a fronting proxy's `X-Real-Ip`/`X-Real-Port`
/// pair replaces the TCP peer. A lone header is a proxy misconfiguration and
/// is ignored.
pub fn client_addr(
    peer: SocketAddr,
    real_ip: Option<&str>,
    real_port: Option<&str>,
    trust_proxy_headers: bool,
) -> OriginAddr {
    if !trust_proxy_headers {
        return peer.into();
    }
    match (real_ip.map(str::trim), real_port.map(str::trim)) {
        (Some(ip), Some(port)) if !ip.is_empty() => OriginAddr::new(ip, port.parse().ok()),
        (None, None) => peer.into(),
        _ => {
            warn!(remote = %peer, "wrong proxy configuration: expected both X-Real-Ip and X-Real-Port");
            peer.into()
        }
    }
}

/// Receive the next data message (text or binary) as raw bytes.
///
/// Returns `None` once the connection is closed.
pub async fn recv_payload(ws: &mut WsStream) -> GateResult<Option<Vec<u8>>> {
    loop {
        let data = match ws.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(GateError::Transport(format!("WS recv failed: {e}"))),
        };
        if data.len() > MAX_WS_FRAME_SIZE {
            return Err(GateError::InvalidMessage(format!(
                "WS frame too large: {} bytes (max {})",
                data.len(),
                MAX_WS_FRAME_SIZE
            )));
        }
        return Ok(Some(data));
    }
}

/// Send a text message.
pub async fn send_text(ws: &mut WsStream, text: String) -> GateResult<()> {
    ws.send(Message::Text(text.into()))
        .await
        .map_err(|e| GateError::Transport(format!("WS send failed: {e}")))
}

/// Pump a WebSocket against a bridge's [`ClientPeer`] until both directions
/// are done.
///
/// Incoming data messages become [`ClientEvent::Message`]; the end of the
/// stream becomes [`ClientEvent::Closed`]. Outgoing [`ToClient::Data`] is sent
/// as binary, byte-exact; [`ToClient::Close`] closes the socket.
pub async fn pump_client(ws: WsStream, peer: ClientPeer) {
    let (sink, stream) = ws.split();
    let reader = read_client(stream, peer.events);
    let writer = write_client(sink, peer.frames);
    tokio::pin!(reader, writer);

    tokio::select! {
        _ = &mut writer => {}
        _ = &mut reader => {
            if tokio::time::timeout(CLIENT_CLOSE_GRACE, &mut writer).await.is_err() {
                debug!("client writer did not finish after client closed");
            }
        }
    }
}

async fn read_client(mut stream: SplitStream<WsStream>, events: mpsc::Sender<ClientEvent>) {
    loop {
        let data = match stream.next().await {
            Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(error = %e, "WS recv failed");
                break;
            }
        };
        if data.len() > MAX_WS_FRAME_SIZE {
            warn!(len = data.len(), max = MAX_WS_FRAME_SIZE, "WS frame too large, closing");
            break;
        }
        if events.send(ClientEvent::Message(data)).await.is_err() {
            return;
        }
    }
    let _ = events.send(ClientEvent::Closed).await;
}

async fn write_client(mut sink: SplitSink<WsStream, Message>, mut frames: mpsc::Receiver<ToClient>) {
    while let Some(frame) = frames.recv().await {
        match frame {
            ToClient::Data(data) => {
                if let Err(e) = sink.send(Message::Binary(data.into())).await {
                    debug!(error = %e, "WS send failed");
                    return;
                }
            }
            ToClient::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes() {
        assert_eq!(Route::parse("/connect", None), Some(Route::Connect));
        assert_eq!(
            Route::parse("/ws", Some("id=abc123")),
            Some(Route::Attach {
                token: "abc123".into()
            })
        );
        assert_eq!(
            Route::parse("/ws/", Some("foo=1&id=abc123")),
            Some(Route::Attach {
                token: "abc123".into()
            })
        );
        assert_eq!(
            Route::parse("/ws", None),
            Some(Route::Attach { token: String::new() })
        );
        assert_eq!(Route::parse("/", None), None);
        assert_eq!(Route::parse("/admin", Some("id=abc")), None);
    }

    fn peer() -> SocketAddr {
        "192.168.1.20:41000".parse().unwrap()
    }

    #[test]
    fn proxy_headers_ignored_unless_trusted() {
        let addr = client_addr(peer(), Some("203.0.113.7"), Some("5555"), false);
        assert_eq!(addr.host(), "192.168.1.20");
        assert_eq!(addr.port(), Some(41000));
    }

    #[test]
    fn trusted_proxy_headers_replace_peer() {
        let addr = client_addr(peer(), Some("203.0.113.7"), Some("5555"), true);
        assert_eq!(addr.host(), "203.0.113.7");
        assert_eq!(addr.port(), Some(5555));
    }

    #[test]
    fn lone_proxy_header_falls_back_to_peer() {
        let addr = client_addr(peer(), Some("203.0.113.7"), None, true);
        assert_eq!(addr.host(), "192.168.1.20");
        let addr = client_addr(peer(), None, Some("5555"), true);
        assert_eq!(addr.host(), "192.168.1.20");
        let addr = client_addr(peer(), None, None, true);
        assert_eq!(addr.port(), Some(41000));
    }
}
