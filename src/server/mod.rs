//! Server role.
//!
//! ```text
//! ┌──────────────┐   ┌───────────────┐   ┌──────────────┐
//! │ TCP listener │──►│ TLS handshake │──►│  Auth gate   │
//! └──────────────┘   │ (cert asked,  │   └──────┬───────┘
//!                    │  not required)│          │
//!                    └───────────────┘    ┌─────┴──────┐
//!                                         ▼            ▼
//!                               ┌──────────────┐ ┌──────────────────┐
//!                               │    Decoy     │ │ interface + relay│
//!                               │ (unverified) │ │   (verified)     │
//!                               └──────────────┘ └──────────────────┘
//! ```
//!
//! Every accepted connection gets its own task. Sessions share nothing but
//! the counters in [`ServerMetrics`].

mod metrics;

pub use metrics::{MetricsSnapshot, ServerMetrics};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::bind_listener;
use crate::decoy::Decoy;
use crate::error::{Error, Fault, Result};
use crate::iface::InterfaceManager;
use crate::retry::{RetryTimer, ACCEPT_RETRY_INTERVAL};
use crate::session::{run_tunnel, Role, Session};
use crate::tls::{AuthGate, PeerVerdict, HANDSHAKE_TIMEOUT};
use crate::tunnel::tune_socket;

/// Main server instance.
#[derive(Clone)]
pub struct Server {
    acceptor: TlsAcceptor,
    gate: AuthGate,
    decoy: Decoy,
    interfaces: InterfaceManager,
    read_timeout: Duration,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Assemble a server; `tls` must request client certificates through
    /// [`AuthGate::handshake_verifier`].
    pub fn new(
        tls: Arc<rustls::ServerConfig>,
        gate: AuthGate,
        decoy: Decoy,
        interfaces: InterfaceManager,
        read_timeout: Duration,
    ) -> Self {
        Self {
            acceptor: TlsAcceptor::from(tls),
            gate,
            decoy,
            interfaces,
            read_timeout,
            metrics: Arc::new(ServerMetrics::new()),
        }
    }

    /// Bind `addr` and serve until `cancel` fires.
    pub async fn run(&self, addr: &str, cancel: &CancellationToken) -> Result<()> {
        let listener = bind_listener(addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// Accept loop on an already bound listener.
    ///
    /// On shutdown the listener is dropped and the call returns once every
    /// session task has unwound.
    pub async fn serve(&self, listener: TcpListener, cancel: &CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let retry = RetryTimer::new(ACCEPT_RETRY_INTERVAL);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer_addr)) => {
                    self.metrics.increment_connections();
                    let server = self.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        server.handle_connection(stream, peer_addr, cancel).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept error: {}", e);
                    if !retry.wait(cancel).await {
                        break;
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        if !tracker.is_empty() {
            tracing::info!(sessions = tracker.len(), "waiting for sessions to finish");
        }
        tracker.wait().await;

        tracing::info!("server stopped: {}", self.metrics.snapshot());
        Ok(())
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        cancel: CancellationToken,
    ) {
        let mut session = Session::new(Role::Server, peer_addr.to_string());

        let result = self.serve_session(&mut session, stream, &cancel).await;
        session.close();
        self.metrics.decrement_connections();

        match result {
            Ok(()) | Err(Error::Cancelled) => {}
            Err(e) => {
                self.metrics.increment_session_faults();
                match e.fault() {
                    Fault::Interface => {
                        tracing::error!(peer = %peer_addr, error = %e, "session failed")
                    }
                    _ => tracing::warn!(peer = %peer_addr, error = %e, "session ended"),
                }
            }
        }
    }

    async fn serve_session(
        &self,
        session: &mut Session,
        stream: TcpStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        tune_socket(&stream)?;

        let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.acceptor.accept(stream));
        let tls = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = handshake => match res {
                Ok(Ok(tls)) => tls,
                Ok(Err(e)) => {
                    self.metrics.increment_handshake_failures();
                    tracing::debug!(peer = %session.remote(), error = %e, "handshake failed");
                    return Ok(());
                }
                Err(_) => {
                    self.metrics.increment_handshake_failures();
                    return Err(Error::timeout("tls handshake", HANDSHAKE_TIMEOUT));
                }
            },
        };

        let verdict = self.gate.evaluate(tls.get_ref().1.peer_certificates());
        session.set_verdict(verdict);

        match verdict {
            PeerVerdict::Unauthenticated => {
                self.metrics.increment_decoyed();
                tracing::debug!(peer = %session.remote(), "unauthenticated peer, serving decoy");

                let served = tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    res = self.decoy.respond(tls) => res,
                };
                if let Err(e) = served {
                    tracing::debug!(peer = %session.remote(), error = %e, "decoy aborted");
                }
                Ok(())
            }
            PeerVerdict::Authenticated => {
                self.metrics.increment_authenticated();
                tracing::info!("Client connected from {}", session.remote());

                run_tunnel(session, tls, &self.interfaces, self.read_timeout, cancel).await
            }
        }
    }

    /// Get server metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }
}
