//! Client-facing transport.
//!
//! Browsers reach termgate over plain WebSocket; TLS is expected to be
//! terminated by a fronting proxy.

pub mod websocket;
