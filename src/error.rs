//! Error types shared by the messaging, proxy and lifecycle layers.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Bridge error taxonomy.
///
/// Transport and protocol failures are fatal to a messaging session; every
/// pending request is rejected with a copy of the failure. Application errors
/// only fail the request whose response carried them.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Pipe read/write failure, end of stream, or a closed interface.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed line, unknown discriminant or unexpected payload shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered the request with an `err` text.
    #[error("Server error: {0}")]
    Application(String),

    /// Remote function used before registration succeeded or after disposal.
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// Child process spawn/exit problems, or an operation in the wrong state.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Local filesystem failure (FIFO creation or removal).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Protocol(err.to_string())
    }
}

impl BridgeError {
    /// Copy of this error suitable for handing to another waiter.
    ///
    /// `Io` is flattened into `Transport` since `std::io::Error` is not `Clone`.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            BridgeError::Transport(msg) => BridgeError::Transport(msg.clone()),
            BridgeError::Protocol(msg) => BridgeError::Protocol(msg.clone()),
            BridgeError::Application(msg) => BridgeError::Application(msg.clone()),
            BridgeError::Initialization(msg) => BridgeError::Initialization(msg.clone()),
            BridgeError::Lifecycle(msg) => BridgeError::Lifecycle(msg.clone()),
            BridgeError::Io(err) => BridgeError::Transport(err.to_string()),
        }
    }
}
