//! External up/down script invocation.
//!
//! The script is called as `script <iface> <up|down> <peer>`; its combined
//! output is logged and a non-zero exit or a timeout is a failure.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Which side of the interface lifetime the script runs for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptAction {
    /// After the interface was opened
    Up,
    /// Before the interface is closed
    Down,
}

impl ScriptAction {
    /// Literal argument passed to the script.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptAction::Up => "up",
            ScriptAction::Down => "down",
        }
    }
}

impl std::fmt::Display for ScriptAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Script execution failures.
#[derive(Error, Debug)]
pub enum ScriptError {
    /// The script could not be started
    #[error("failed to execute script {script} with action {action}: {source}")]
    Spawn {
        /// Script path
        script: String,
        /// Requested action
        action: ScriptAction,
        /// Spawn or wait error
        #[source]
        source: std::io::Error,
    },

    /// The script did not finish in time and was killed
    #[error("script {script} with action {action} timed out after {after:?}")]
    Timeout {
        /// Script path
        script: String,
        /// Requested action
        action: ScriptAction,
        /// Configured timeout
        after: Duration,
    },

    /// The script exited unsuccessfully
    #[error("script {script} with action {action} and peer addr {peer} failed: {status}")]
    Failed {
        /// Script path
        script: String,
        /// Requested action
        action: ScriptAction,
        /// Peer address passed to the script
        peer: String,
        /// Exit status
        status: ExitStatus,
    },
}

/// Runs the interface setup/teardown hook.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    /// Run the hook for `iface` and wait for it to finish.
    async fn run(&self, iface: &str, action: ScriptAction, peer: &str) -> Result<(), ScriptError>;
}

/// An executable on disk.
#[derive(Debug, Clone)]
pub struct Script {
    path: PathBuf,
    timeout: Duration,
}

impl Script {
    /// Create a runner for the executable at `path`.
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ScriptRunner for Script {
    async fn run(&self, iface: &str, action: ScriptAction, peer: &str) -> Result<(), ScriptError> {
        let script = self.path.display().to_string();

        let mut cmd = Command::new(&self.path);
        cmd.arg(iface)
            .arg(action.as_str())
            .arg(peer)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        tracing::debug!(%script, %iface, %action, %peer, "running interface script");

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ScriptError::Spawn {
                    script,
                    action,
                    source,
                })
            }
            Err(_) => {
                return Err(ScriptError::Timeout {
                    script,
                    action,
                    after: self.timeout,
                })
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim();
        if !combined.is_empty() {
            tracing::info!(%script, %action, "{}", combined);
        }

        if !output.status.success() {
            return Err(ScriptError::Failed {
                script,
                action,
                peer: peer.to_string(),
                status: output.status,
            });
        }

        Ok(())
    }
}
