//! Virtual interface lifecycle.
//!
//! An [`Interface`] is created per authenticated session and walks
//! `Unopened → Open → ScriptUp → Active → ScriptDown → Closed`:
//!
//! ```text
//!   open device ──► up script ──► relay runs ──► down script ──► close device
//!        │              │ fails
//!        │              └──► close device, report error
//!        └ fails ──► report error
//! ```
//!
//! The down script always runs before the device is released, and its error
//! is reported together with any close error.

mod script;
mod tap;

pub use script::{Script, ScriptAction, ScriptError, ScriptRunner};
pub use tap::{TapDevice, TapOpener};

use std::io;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// Default interface name pattern; the kernel replaces `%d`.
pub const DEFAULT_IFACE_PATTERN: &str = "tap%d";

/// A packet-oriented local network device.
///
/// One `recv` yields exactly one packet and one `send` writes exactly one.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    /// Name assigned by the OS.
    fn name(&self) -> &str;

    /// Read one packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    async fn send(&self, packet: &[u8]) -> io::Result<()>;

    /// Release the OS resource.
    fn close(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }
}

/// Creates packet devices.
pub trait DeviceOpener: Send + Sync {
    /// Acquire a device, optionally honouring a name or `%d` pattern.
    fn open(&self, name: &str) -> io::Result<Box<dyn PacketDevice>>;
}

/// Lifecycle state of an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    /// No device yet
    Unopened,
    /// Device created, up script not run
    Open,
    /// Up script running
    ScriptUp,
    /// Up and relaying
    Active,
    /// Down script running
    ScriptDown,
    /// Device released
    Closed,
}

/// Opens interfaces for sessions and wires in the optional script.
#[derive(Clone)]
pub struct InterfaceManager {
    opener: Arc<dyn DeviceOpener>,
    script: Option<Arc<dyn ScriptRunner>>,
    name: String,
}

impl InterfaceManager {
    /// Create a manager that requests `name` from `opener`.
    pub fn new(opener: Arc<dyn DeviceOpener>, name: impl Into<String>) -> Self {
        Self {
            opener,
            script: None,
            name: name.into(),
        }
    }

    /// Run `script` around every interface lifetime.
    pub fn with_script(mut self, script: Arc<dyn ScriptRunner>) -> Self {
        self.script = Some(script);
        self
    }

    /// Open an interface for the session with `peer` and bring it to `Active`.
    ///
    /// Nothing is retried. If the up script fails the device is closed before
    /// the error is returned.
    pub async fn open(&self, peer: &str) -> Result<Interface> {
        let device = self.opener.open(&self.name).map_err(|e| {
            Error::interface(format!(
                "failed to create tunnel interface {}: {}",
                self.name, e
            ))
        })?;
        let name = device.name().to_string();
        tracing::debug!(iface = %name, state = ?InterfaceState::Open, "interface opened");

        if let Some(script) = &self.script {
            tracing::debug!(iface = %name, state = ?InterfaceState::ScriptUp, "running up script");
            if let Err(script_err) = script.run(&name, ScriptAction::Up, peer).await {
                let msg = match device.close() {
                    Ok(()) => format!("up script failed on {}: {}", name, script_err),
                    Err(close_err) => format!(
                        "up script failed on {}: {}; closing interface failed: {}",
                        name, script_err, close_err
                    ),
                };
                return Err(Error::interface(msg));
            }
        }

        tracing::info!(iface = %name, %peer, "interface active");

        Ok(Interface {
            device,
            name,
            peer: peer.to_string(),
            script: self.script.clone(),
            state: InterfaceState::Active,
        })
    }
}

/// A live interface owned by exactly one session.
pub struct Interface {
    device: Box<dyn PacketDevice>,
    name: String,
    peer: String,
    script: Option<Arc<dyn ScriptRunner>>,
    state: InterfaceState,
}

impl Interface {
    /// Name assigned by the OS.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> InterfaceState {
        self.state
    }

    /// The underlying device for the relay.
    pub fn device(&self) -> &dyn PacketDevice {
        self.device.as_ref()
    }

    /// Run the down script, then close the device regardless of its outcome.
    pub async fn close(mut self) -> Result<()> {
        self.state = InterfaceState::ScriptDown;
        let script_err = match &self.script {
            Some(script) => script
                .run(&self.name, ScriptAction::Down, &self.peer)
                .await
                .err(),
            None => None,
        };

        let close_err = self.device.close().err();
        tracing::debug!(iface = %self.name, state = ?InterfaceState::Closed, "interface closed");

        match (script_err, close_err) {
            (None, None) => Ok(()),
            (Some(s), None) => Err(Error::interface(format!(
                "down script failed on {}: {}",
                self.name, s
            ))),
            (None, Some(c)) => Err(Error::interface(format!(
                "failed to close {}: {}",
                self.name, c
            ))),
            (Some(s), Some(c)) => Err(Error::interface(format!(
                "down script failed on {}: {}; failed to close {}: {}",
                self.name, s, self.name, c
            ))),
        }
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
