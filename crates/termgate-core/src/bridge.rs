//! Session bridge: pumps bytes between one backend session and one client.
//!
//! # State machine
//!
//! ```text
//! Attached ──(client close | backend EOF/error | overflow | close())──▶ Closing ──▶ Closed
//! ```
//!
//! While `Attached`, the bridge waits on three readiness sources at once:
//!
//! - **Client → backend**: messages from the client are appended to an
//!   outbound buffer, which is flushed whenever the backend accepts writes.
//!   Partial writes leave the remainder buffered, in order.
//! - **Backend → client**: whatever the backend has available is forwarded as
//!   one client message, byte-exact and in order. No reframing.
//! - **Close request**: a [`BridgeCloser`] held by the owner.
//!
//! Any terminal condition moves to `Closing`; teardown then sends the client
//! a close notification, shuts the backend down and lands in `Closed`. Teardown
//! runs at most once however many times or from wherever it is requested.
//!
//! Readiness registration is implicit: the backend's fd is registered with the
//! tokio reactor when the session is created and deregistered when the bridge
//! drops it.

use crate::addr::OriginAddr;
use crate::backend::BackendSession;
use std::collections::VecDeque;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// Size of a single backend read.
const READ_CHUNK: usize = 8192;

/// Upper bound on each teardown step (client notification, backend shutdown).
const TEARDOWN_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle state of a [`Bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Attached,
    Closing,
    Closed,
}

/// What ended a bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client disconnected (or its link was dropped).
    ClientClosed,
    /// The backend reached end of stream.
    BackendEof,
    /// Reading from or writing to the backend failed.
    BackendError,
    /// The client sent more than the outbound buffer may hold.
    BufferOverflow,
    /// The owner asked the bridge to close.
    Requested,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::BackendEof => "backend eof",
            CloseReason::BackendError => "backend error",
            CloseReason::BufferOverflow => "buffer overflow",
            CloseReason::Requested => "close requested",
        };
        f.write_str(s)
    }
}

/// Lifecycle event from the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Raw payload to forward to the backend.
    Message(Vec<u8>),
    /// The client connection closed, locally or remotely.
    Closed,
}

/// Instruction for the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToClient {
    /// Raw backend output to deliver as one message.
    Data(Vec<u8>),
    /// Close the connection.
    Close,
}

/// The bridge's side of a client connection.
pub struct ClientLink {
    inbound: mpsc::Receiver<ClientEvent>,
    outbound: mpsc::Sender<ToClient>,
}

/// The transport's side of a client connection: feeds events in, drains
/// outgoing frames.
pub struct ClientPeer {
    pub events: mpsc::Sender<ClientEvent>,
    pub frames: mpsc::Receiver<ToClient>,
}

impl ClientLink {
    /// Create a connected link/peer pair with `capacity` slots per direction.
    pub fn pair(capacity: usize) -> (ClientLink, ClientPeer) {
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (frames_tx, frames_rx) = mpsc::channel(capacity);
        (
            ClientLink {
                inbound: events_rx,
                outbound: frames_tx,
            },
            ClientPeer {
                events: events_tx,
                frames: frames_rx,
            },
        )
    }
}

struct CloseSignal {
    requested: AtomicBool,
    notify: Notify,
}

/// Cloneable handle that asks a bridge to close.
#[derive(Clone)]
pub struct BridgeCloser {
    signal: Arc<CloseSignal>,
}

impl BridgeCloser {
    fn new() -> Self {
        Self {
            signal: Arc::new(CloseSignal {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Request teardown. Repeated calls are no-ops.
    pub fn close(&self) {
        if !self.signal.requested.swap(true, Ordering::SeqCst) {
            self.signal.notify.notify_one();
        }
    }
}

/// A single readiness outcome, produced by [`Bridge::poll_event`].
enum Event {
    ClientMessage(Vec<u8>),
    ClientClosed,
    BackendData(Vec<u8>),
    BackendEof,
    BackendFailed(io::Error),
}

/// Owns one backend session and one client link, and moves bytes between them.
pub struct Bridge<S> {
    session: S,
    client: ClientLink,
    origin: OriginAddr,
    outbound: VecDeque<u8>,
    max_buffered: usize,
    state: BridgeState,
    reason: Option<CloseReason>,
    closer: BridgeCloser,
    /// Alternates which side is polled first, so neither starves the other.
    favor_backend: bool,
}

impl<S: BackendSession> Bridge<S> {
    /// Attach `session` to `client`. The bridge starts `Attached`.
    ///
    /// `max_buffered` caps client bytes waiting for the backend; exceeding it
    /// force-closes the session.
    pub fn new(session: S, client: ClientLink, origin: OriginAddr, max_buffered: usize) -> Self {
        Self {
            session,
            client,
            origin,
            outbound: VecDeque::new(),
            max_buffered,
            state: BridgeState::Attached,
            reason: None,
            closer: BridgeCloser::new(),
            favor_backend: false,
        }
    }

    /// Handle for requesting teardown from outside the bridge's task.
    pub fn closer(&self) -> BridgeCloser {
        self.closer.clone()
    }

    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Client bytes not yet accepted by the backend.
    pub fn buffered(&self) -> usize {
        self.outbound.len()
    }

    /// Queue a client payload for the backend. Dropped unless `Attached`.
    pub fn on_client_message(&mut self, data: &[u8]) {
        if self.state != BridgeState::Attached {
            debug!(origin = %self.origin, len = data.len(), "dropping message for closing bridge");
            return;
        }
        if self.outbound.len() + data.len() > self.max_buffered {
            warn!(
                origin = %self.origin,
                buffered = self.outbound.len(),
                incoming = data.len(),
                limit = self.max_buffered,
                "outbound buffer limit exceeded"
            );
            self.begin_close(CloseReason::BufferOverflow);
            return;
        }
        self.outbound.extend(data);
    }

    /// Pump until either side ends, then tear down. Returns what ended it.
    pub async fn run(&mut self) -> CloseReason {
        if self.state == BridgeState::Attached {
            info!(origin = %self.origin, "bridge attached");
        }
        let signal = self.closer.signal.clone();
        let mut read_buf = vec![0u8; READ_CHUNK];

        while self.state == BridgeState::Attached {
            tokio::select! {
                _ = signal.notify.notified() => {
                    self.begin_close(CloseReason::Requested);
                }
                event = poll_fn(|cx| self.poll_event(cx, &mut read_buf)) => {
                    self.handle_event(event).await;
                }
            }
        }

        self.close().await;
        self.reason.unwrap_or(CloseReason::Requested)
    }

    /// Tear down both sides. Idempotent: only the first call does anything.
    pub async fn close(&mut self) {
        if self.state == BridgeState::Closed {
            return;
        }
        self.begin_close(CloseReason::Requested);
        self.closer.close();

        // Stop accepting client input; anything still queued is dropped.
        self.client.inbound.close();
        if tokio::time::timeout(TEARDOWN_GRACE, self.client.outbound.send(ToClient::Close))
            .await
            .is_err()
        {
            debug!(origin = %self.origin, "client did not take close notification");
        }

        match tokio::time::timeout(TEARDOWN_GRACE, self.session.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(origin = %self.origin, error = %e, "backend shutdown error"),
            Err(_) => debug!(origin = %self.origin, "backend shutdown timed out"),
        }

        let dropped = self.outbound.len();
        self.outbound.clear();
        self.state = BridgeState::Closed;
        info!(
            origin = %self.origin,
            reason = %self.reason.unwrap_or(CloseReason::Requested),
            dropped_bytes = dropped,
            "bridge closed"
        );
    }

    fn begin_close(&mut self, reason: CloseReason) {
        if self.state == BridgeState::Attached {
            debug!(origin = %self.origin, reason = %reason, "bridge closing");
            self.state = BridgeState::Closing;
            self.reason = Some(reason);
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientMessage(data) => self.on_client_message(&data),
            Event::ClientClosed => {
                debug!(origin = %self.origin, "client closed");
                self.begin_close(CloseReason::ClientClosed);
            }
            Event::BackendData(data) => {
                if self.client.outbound.send(ToClient::Data(data)).await.is_err() {
                    self.begin_close(CloseReason::ClientClosed);
                }
            }
            Event::BackendEof => {
                debug!(origin = %self.origin, "backend reached eof");
                self.begin_close(CloseReason::BackendEof);
            }
            Event::BackendFailed(e) => {
                warn!(origin = %self.origin, error = %e, "backend i/o error");
                self.begin_close(CloseReason::BackendError);
            }
        }
    }

    /// Flush what the backend will take, then wait for the next event from
    /// either side.
    fn poll_event(&mut self, cx: &mut Context<'_>, read_buf: &mut [u8]) -> Poll<Event> {
        if !self.outbound.is_empty() {
            if let Poll::Ready(Err(e)) = self.poll_flush_outbound(cx) {
                return Poll::Ready(Event::BackendFailed(e));
            }
        }

        self.favor_backend = !self.favor_backend;
        if self.favor_backend {
            if let Poll::Ready(event) = self.poll_backend(cx, read_buf) {
                return Poll::Ready(event);
            }
            self.poll_client(cx)
        } else {
            if let Poll::Ready(event) = self.poll_client(cx) {
                return Poll::Ready(event);
            }
            self.poll_backend(cx, read_buf)
        }
    }

    /// Write buffered client bytes until the buffer is empty or the backend
    /// stops accepting.
    fn poll_flush_outbound(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.outbound.is_empty() {
            let (head, _) = self.outbound.as_slices();
            match Pin::new(&mut self.session).poll_write(cx, head) {
                Poll::Ready(Ok(0)) => return Poll::Ready(Err(io::ErrorKind::WriteZero.into())),
                Poll::Ready(Ok(n)) => {
                    self.outbound.drain(..n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Pin::new(&mut self.session).poll_flush(cx)
    }

    fn poll_backend(&mut self, cx: &mut Context<'_>, read_buf: &mut [u8]) -> Poll<Event> {
        let mut buf = ReadBuf::new(read_buf);
        match Pin::new(&mut self.session).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) if buf.filled().is_empty() => Poll::Ready(Event::BackendEof),
            Poll::Ready(Ok(())) => Poll::Ready(Event::BackendData(buf.filled().to_vec())),
            Poll::Ready(Err(e)) => Poll::Ready(Event::BackendFailed(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_client(&mut self, cx: &mut Context<'_>) -> Poll<Event> {
        match self.client.inbound.poll_recv(cx) {
            Poll::Ready(Some(ClientEvent::Message(data))) => Poll::Ready(Event::ClientMessage(data)),
            Poll::Ready(Some(ClientEvent::Closed)) | Poll::Ready(None) => {
                Poll::Ready(Event::ClientClosed)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
