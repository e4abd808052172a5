//! Tunnel configuration.
//!
//! Values come from command-line flags / environment (see the `obftun`
//! binary) or from a TOML file with the same keys.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::iface::DEFAULT_IFACE_PATTERN;
use crate::session::Role;

/// Up/down script timeout.
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 15;
/// Relay inactivity timeout.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;
/// Client reconnect interval.
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 5;
/// Own certificate chain (PEM).
pub const DEFAULT_CERTIFICATE: &str = "cert.crt";
/// Own private key (PEM).
pub const DEFAULT_KEY: &str = "key.pem";
/// Trusted CA bundle (PEM).
pub const DEFAULT_CA: &str = "ca.crt";

/// Runtime configuration for either role.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TunnelConfig {
    /// Server listen address, or client local bind address
    pub bind: Option<String>,
    /// Remote server address; presence selects the client role
    pub dial: Option<String>,
    /// Interface name or pattern (`%d` expanded by the kernel)
    pub iface: String,
    /// Up/down script
    pub script: Option<PathBuf>,
    /// Up/down script timeout
    pub script_timeout_secs: u64,
    /// Relay inactivity timeout
    pub read_timeout_secs: u64,
    /// Decoy reference origin (server) or TLS server name (client)
    pub fake: Option<String>,
    /// Own certificate chain
    pub certificate: PathBuf,
    /// Own private key
    pub key: PathBuf,
    /// Trusted roots for the peer
    pub ca: PathBuf,
    /// Client reconnect interval
    pub retry_interval_secs: u64,
    /// Per-packet trace logging
    pub verbose: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind: None,
            dial: None,
            iface: DEFAULT_IFACE_PATTERN.to_string(),
            script: None,
            script_timeout_secs: DEFAULT_SCRIPT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            fake: None,
            certificate: PathBuf::from(DEFAULT_CERTIFICATE),
            key: PathBuf::from(DEFAULT_KEY),
            ca: PathBuf::from(DEFAULT_CA),
            retry_interval_secs: DEFAULT_RETRY_INTERVAL_SECS,
            verbose: false,
        }
    }
}

impl TunnelConfig {
    /// Load from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml(&text)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))
    }

    /// Parse a TOML document.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    /// Client when a remote is configured, server otherwise.
    pub fn role(&self) -> Role {
        if self.dial.is_some() {
            Role::Client
        } else {
            Role::Server
        }
    }

    /// Check role requirements and value ranges.
    pub fn validate(&self) -> Result<()> {
        match self.role() {
            Role::Client => {
                if self.dial.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::config("dial address cannot be empty"));
                }
            }
            Role::Server => {
                if self.bind.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::config("either --dial or --bind must be specified"));
                }
                if self.fake.as_deref().map_or(true, str::is_empty) {
                    return Err(Error::config("server requires --fake <origin>"));
                }
            }
        }

        if self.script_timeout_secs == 0 {
            return Err(Error::config("script timeout must be positive"));
        }
        if self.read_timeout_secs == 0 {
            return Err(Error::config("read timeout must be positive"));
        }
        if self.retry_interval_secs == 0 {
            return Err(Error::config("retry interval must be positive"));
        }
        Ok(())
    }

    /// Up/down script timeout.
    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    /// Relay inactivity timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Client reconnect interval.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// TLS server name the client sends: `fake` if set, else the dial host.
    pub fn server_name(&self) -> Option<String> {
        if let Some(fake) = self.fake.as_deref().filter(|f| !f.is_empty()) {
            return Some(fake.to_string());
        }
        self.dial.as_deref().map(|d| host_of(d).to_string())
    }
}

/// Expand a bare `:port` to the IPv6 wildcard address.
pub fn listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("[::]{}", addr)
    } else {
        addr.to_string()
    }
}

/// Bind a listener on `addr`.
///
/// The IPv6 wildcard (including a bare `:port`) accepts IPv4 clients too;
/// hosts without IPv6 fall back to `0.0.0.0`.
pub async fn bind_listener(addr: &str) -> Result<TcpListener> {
    let addr = listen_addr(addr);
    let bound = match addr.parse::<SocketAddr>() {
        Ok(any) if any.is_ipv6() && any.ip().is_unspecified() => match bind_dual_stack(any) {
            Ok(listener) => Ok(listener),
            Err(e) => {
                tracing::debug!("IPv6 listen failed ({}), falling back to IPv4", e);
                TcpListener::bind((Ipv4Addr::UNSPECIFIED, any.port())).await
            }
        },
        _ => TcpListener::bind(&addr).await,
    };
    bound.map_err(|e| Error::config(format!("failed to listen on {}: {}", addr, e)))
}

fn bind_dual_stack(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(false)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    TcpListener::from_std(socket.into())
}

/// Host part of `host:port`, without IPv6 brackets.
fn host_of(addr: &str) -> &str {
    let host = match addr.rsplit_once(':') {
        Some((host, port)) if !port.contains(']') => host,
        _ => addr,
    };
    host.trim_start_matches('[').trim_end_matches(']')
}
