//! termgate-core: session handoff and bridging for the termgate web terminal.
//!
//! Provides the backend session abstraction, the bounded connector worker pool,
//! the one-time-token handoff registry, and the bidirectional session bridge.

pub mod addr;
pub mod backend;
pub mod bridge;
pub mod error;
pub mod pool;
pub mod registry;
pub mod token;

// Re-export commonly used items at crate root.
pub use addr::OriginAddr;
pub use backend::{BackendSession, BoxedSession, ConnectFailure, Connector, Credentials, Target};
pub use bridge::{
    Bridge, BridgeCloser, BridgeState, ClientEvent, ClientLink, ClientPeer, CloseReason, ToClient,
};
pub use error::{GateError, GateResult};
pub use pool::ConnectorPool;
pub use registry::{ClaimRejected, HandoffRegistry};
pub use token::{generate_token, short_token};
