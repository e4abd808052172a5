//! Per-connection session bookkeeping.
//!
//! A [`Session`] covers one secure connection from handshake to close. It is
//! owned by the task that drives the connection and never shared.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::iface::InterfaceManager;
use crate::tls::PeerVerdict;
use crate::tunnel::{run_relay, TunnelStream};

/// Which end of the tunnel a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the remote and reconnects forever
    Client,
    /// Accepts connections and gates them
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// TLS handshake in progress
    Handshaking,
    /// Peer is a tunnel partner, interface not up yet
    Authenticated,
    /// Prober being served the decoy
    Decoy,
    /// Frames flowing
    Relaying,
    /// Connection finished
    Closed,
}

/// One attempt to run a tunnel over one connection.
#[derive(Debug)]
pub struct Session {
    role: Role,
    remote: String,
    state: SessionState,
    verdict: Option<PeerVerdict>,
    started: Instant,
}

impl Session {
    /// New session in [`SessionState::Handshaking`].
    pub fn new(role: Role, remote: impl Into<String>) -> Self {
        Self {
            role,
            remote: remote.into(),
            state: SessionState::Handshaking,
            verdict: None,
            started: Instant::now(),
        }
    }

    /// Which end this session runs on.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Peer address.
    pub fn remote(&self) -> &str {
        &self.remote
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Gate verdict, once recorded.
    pub fn verdict(&self) -> Option<PeerVerdict> {
        self.verdict
    }

    /// Time since the connection was accepted or dialed.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Record the gate's verdict. The first verdict sticks.
    pub fn set_verdict(&mut self, verdict: PeerVerdict) -> SessionState {
        if self.verdict.is_some() || self.state != SessionState::Handshaking {
            return self.state;
        }

        self.verdict = Some(verdict);
        self.state = match verdict {
            PeerVerdict::Authenticated => SessionState::Authenticated,
            PeerVerdict::Unauthenticated => SessionState::Decoy,
        };
        self.state
    }

    /// Only authenticated sessions may own an interface.
    pub fn may_open_interface(&self) -> bool {
        self.verdict.is_some_and(|v| v.is_authenticated())
    }

    /// Move to [`SessionState::Relaying`]; returns false if not authenticated.
    pub fn begin_relay(&mut self) -> bool {
        if self.state != SessionState::Authenticated {
            return false;
        }
        self.state = SessionState::Relaying;
        true
    }

    /// Mark the session closed. Idempotent.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::debug!(
                role = %self.role,
                peer = %self.remote,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "session closed"
            );
        }
        self.state = SessionState::Closed;
    }
}

/// Bring up the interface, relay until the relay ends, then tear the
/// interface down.
///
/// The interface is closed on every path once opened. When the relay was
/// cancelled the result is [`Error::Cancelled`] even if closing failed;
/// otherwise a close failure takes precedence over the relay's error.
pub async fn run_tunnel<S>(
    session: &mut Session,
    stream: S,
    interfaces: &InterfaceManager,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: TunnelStream,
{
    if !session.may_open_interface() {
        return Err(Error::handshake(format!(
            "{} is not authenticated",
            session.remote()
        )));
    }

    let iface = interfaces.open(session.remote()).await?;
    session.begin_relay();

    let relayed = run_relay(stream, iface.device(), read_timeout, session.remote(), cancel).await;
    let closed = iface.close().await;

    match (relayed, closed) {
        (Err(Error::Cancelled), Err(e)) => {
            tracing::error!(peer = %session.remote(), error = %e, "interface teardown failed");
            Err(Error::Cancelled)
        }
        (relayed, Err(e)) => {
            if let Err(r) = relayed {
                tracing::warn!(peer = %session.remote(), error = %r, "relay ended");
            }
            Err(e)
        }
        (relayed, Ok(())) => relayed,
    }
}
