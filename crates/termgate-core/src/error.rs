use thiserror::Error;

/// Errors produced by termgate plumbing (configuration, transport, protocol).
///
/// Backend connect failures have their own type, [`crate::ConnectFailure`],
/// since they are reported to the requester rather than propagated.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type GateResult<T> = Result<T, GateError>;
