//! Error types for the tunnel.
//!
//! Every failure is tagged with the fault class that decides how the session
//! loops react to it: configuration faults abort startup, transport and
//! protocol faults end one session, interface faults stop the client.

use thiserror::Error;

use crate::tunnel::FrameError;

/// Result type alias for tunnel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running the tunnel.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad certificate material, unparseable address, unusable local bind
    #[error("configuration error: {0}")]
    Config(String),

    /// Network I/O error on the secure stream
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// A bounded operation ran out of time
    #[error("{phase} timed out after {millis}ms")]
    Timeout {
        /// What was being waited on
        phase: &'static str,
        /// Elapsed limit
        millis: u64,
    },

    /// TLS handshake failed
    #[error("handshake error: {0}")]
    Handshake(String),

    /// Invalid or truncated frame from the peer
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// The local virtual interface or its scripts failed
    #[error("interface error: {0}")]
    Interface(String),

    /// Decoy response could not be produced or delivered
    #[error("decoy error: {0}")]
    Decoy(String),

    /// The global shutdown signal fired
    #[error("shutdown requested")]
    Cancelled,
}

/// Fault class of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fatal before any session starts
    Config,
    /// Dial, handshake, stream I/O, timeouts, peer disconnect
    Transport,
    /// Invalid frame length or short frame
    Protocol,
    /// Local interface or script failure
    Interface,
    /// Cooperative shutdown, not a failure
    Cancelled,
}

impl Error {
    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new handshake error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Error::Handshake(msg.into())
    }

    /// Create a new interface error
    pub fn interface(msg: impl Into<String>) -> Self {
        Error::Interface(msg.into())
    }

    /// Create a new decoy error
    pub fn decoy(msg: impl Into<String>) -> Self {
        Error::Decoy(msg.into())
    }

    /// Create a timeout error for the given phase
    pub fn timeout(phase: &'static str, after: std::time::Duration) -> Self {
        Error::Timeout {
            phase,
            millis: after.as_millis() as u64,
        }
    }

    /// Classify this error.
    pub fn fault(&self) -> Fault {
        match self {
            Error::Config(_) => Fault::Config,
            Error::Transport(_) | Error::Timeout { .. } | Error::Handshake(_) | Error::Decoy(_) => {
                Fault::Transport
            }
            Error::Protocol(_) => Fault::Protocol,
            Error::Interface(_) => Fault::Interface,
            Error::Cancelled => Fault::Cancelled,
        }
    }

    /// Check if this error originates from the local interface
    pub fn is_interface_fault(&self) -> bool {
        self.fault() == Fault::Interface
    }

    /// Check if another connection attempt can fix this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self.fault(), Fault::Transport | Fault::Protocol)
    }
}
