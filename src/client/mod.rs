//! Client role: dial, run the tunnel, reconnect.
//!
//! ```text
//!   ┌──────────► dial + TLS ──► interface up ──► relay ──► interface down ─┐
//!   │                                                                      │
//!   └──────────── wait retry interval ◄── transport / protocol fault ◄─────┘
//!                                        interface / config fault ──► stop
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use tokio::net::TcpSocket;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Fault, Result};
use crate::iface::InterfaceManager;
use crate::retry::RetryTimer;
use crate::session::{run_tunnel, Role, Session};
use crate::tls::{PeerVerdict, HANDSHAKE_TIMEOUT};
use crate::tunnel::{tune_socket, BoxedStream};

/// Timeout for establishing the TCP connection.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces secure connections to the remote server.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the handshake. Returns the stream and the
    /// address it is connected to.
    async fn connect(&self) -> Result<(BoxedStream, String)>;
}

/// Dials over TCP and runs a mutually authenticated TLS handshake.
pub struct TlsConnector {
    remote: String,
    local: Option<SocketAddr>,
    server_name: ServerName<'static>,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Build a connector for `remote`, optionally dialing from `local`.
    ///
    /// `local` is parsed and test-bound here so that a bad bind address is
    /// reported before any session starts.
    pub fn new(
        remote: impl Into<String>,
        local: Option<&str>,
        server_name: &str,
        config: Arc<rustls::ClientConfig>,
    ) -> Result<Self> {
        let local = local
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::config(format!("invalid bind address {}: {}", addr, e)))
            })
            .transpose()?;
        if let Some(local) = local {
            check_bindable(local)
                .map_err(|e| Error::config(format!("failed to bind {}: {}", local, e)))?;
        }

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::config(format!("invalid server name {}: {}", server_name, e)))?;

        Ok(Self {
            remote: remote.into(),
            local,
            server_name,
            tls: tokio_rustls::TlsConnector::from(config),
        })
    }

    async fn dial(&self) -> Result<tokio::net::TcpStream> {
        let addr = tokio::net::lookup_host(self.remote.as_str())
            .await?
            .next()
            .ok_or_else(|| {
                Error::Transport(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address for {}", self.remote),
                ))
            })?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        if let Some(local) = self.local {
            // The previous connection from this port may still be in TIME_WAIT.
            socket.set_reuseaddr(true)?;
            socket.bind(local).map_err(|e| {
                Error::Transport(std::io::Error::new(
                    e.kind(),
                    format!("failed to bind {}: {}", local, e),
                ))
            })?;
        }

        match tokio::time::timeout(DIAL_TIMEOUT, socket.connect(addr)).await {
            Ok(stream) => Ok(stream?),
            Err(_) => Err(Error::timeout("dial", DIAL_TIMEOUT)),
        }
    }
}

fn check_bindable(addr: SocketAddr) -> std::io::Result<()> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self) -> Result<(BoxedStream, String)> {
        let tcp = self.dial().await?;
        tune_socket(&tcp)?;
        let peer = tcp.peer_addr()?.to_string();

        let handshake = self.tls.connect(self.server_name.clone(), tcp);
        let stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::handshake(format!("{}: {}", self.remote, e)));
            }
            Err(_) => return Err(Error::timeout("tls handshake", HANDSHAKE_TIMEOUT)),
        };

        Ok((Box::new(stream), peer))
    }
}

/// The client reconnect loop.
pub struct Client {
    connector: Arc<dyn Connector>,
    interfaces: InterfaceManager,
    read_timeout: Duration,
    retry: RetryTimer,
}

impl Client {
    /// `retry` paces reconnects after recoverable faults.
    pub fn new(
        connector: Arc<dyn Connector>,
        interfaces: InterfaceManager,
        read_timeout: Duration,
        retry: RetryTimer,
    ) -> Self {
        Self {
            connector,
            interfaces,
            read_timeout,
            retry,
        }
    }

    /// Run until shutdown (`Ok`) or a fault that retrying cannot fix.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            match self.run_once(cancel).await {
                Ok(()) => {}
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_interface_fault() || e.fault() == Fault::Config => {
                    tracing::error!(error = %e, "giving up");
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(error = %e, retry_in = ?self.retry.interval(), "session ended");
                }
            }

            if !self.retry.wait(cancel).await {
                return Ok(());
            }
        }
    }

    async fn run_once(&self, cancel: &CancellationToken) -> Result<()> {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            res = self.connector.connect() => res?,
        };
        tracing::info!("Connected to {}", peer);

        // The handshake already verified the server; the client does not
        // gate its own sessions.
        let mut session = Session::new(Role::Client, peer);
        session.set_verdict(PeerVerdict::Authenticated);

        let result = run_tunnel(
            &mut session,
            stream,
            &self.interfaces,
            self.read_timeout,
            cancel,
        )
        .await;
        session.close();
        result
    }
}
