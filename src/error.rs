//! Typed errors for the bridge, mapped onto the exit codes in the
//! configuration surface: 0 normal/already-running, 1 configuration error,
//! 2 missing required host executable.

use std::io;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Missing required option, unparseable value, or a pre-existing
    /// non-socket file at a canonical socket path.
    #[error("configuration error: {0}")]
    Config(String),

    /// The outer bridge's interpreter/binary could not be found, or the
    /// subsystem-to-host path translation failed.
    #[error("failed to spawn outer bridge: {0}")]
    Spawn(String),

    /// Wrong or short pairing nonce on an accepted connection.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Assuan descriptor missing, truncated, or carrying a nonce of the
    /// wrong length.
    #[error("invalid Assuan descriptor: {0}")]
    Descriptor(String),

    /// Connect timeout, reset, broken pipe, and other transport failures.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Windows message-copy send/reply failure, classified by platform
    /// error code.
    #[error("agent RPC failed: {0}")]
    AgentRpc(String),
}

impl BridgeError {
    /// Process exit code for a *startup* failure of this kind. Only
    /// `Config`, `Spawn` and a subset of `Io` are expected to surface here;
    /// per-connection variants (`Auth`, `Descriptor`, `AgentRpc`) are
    /// recovered locally and never reach `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            BridgeError::Config(_) => 1,
            BridgeError::Spawn(_) => 2,
            BridgeError::Auth(_) | BridgeError::Descriptor(_) | BridgeError::AgentRpc(_) => 1,
            BridgeError::Io(_) => 1,
        }
    }
}
