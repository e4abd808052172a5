//! obftun: TAP tunnel over mutually authenticated TLS.
//!
//! Client: `obftun -d server:443 -f www.example.com`
//! Server: `obftun -b :443 -f www.example.com`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use obftun::client::{Client, TlsConnector};
use obftun::config::{
    TunnelConfig, DEFAULT_CA, DEFAULT_CERTIFICATE, DEFAULT_KEY, DEFAULT_READ_TIMEOUT_SECS,
    DEFAULT_RETRY_INTERVAL_SECS, DEFAULT_SCRIPT_TIMEOUT_SECS,
};
use obftun::decoy::{Decoy, HttpsOrigin};
use obftun::iface::{InterfaceManager, Script, TapOpener, DEFAULT_IFACE_PATTERN};
use obftun::retry::RetryTimer;
use obftun::server::Server;
use obftun::tls::TlsMaterial;
use obftun::Role;

#[derive(Parser, Debug)]
#[command(name = "obftun", version, about = "TAP tunnel disguised as an HTTPS site")]
struct Args {
    /// Bind address (required for server, optional local address for client)
    #[arg(short = 'b', long, env = "OBFTUN_BIND")]
    bind: Option<String>,

    /// Connect to remote server (selects client mode)
    #[arg(short = 'd', long, env = "OBFTUN_DIAL")]
    dial: Option<String>,

    /// Interface name pattern
    #[arg(short = 'i', long, env = "OBFTUN_IFACE", default_value = DEFAULT_IFACE_PATTERN)]
    iface: String,

    /// Script run as `<script> <iface> up|down <peer>`
    #[arg(short = 's', long, env = "OBFTUN_SCRIPT")]
    script: Option<PathBuf>,

    /// Script execution timeout in seconds
    #[arg(short = 't', long, env = "OBFTUN_SCRIPT_TIMEOUT", default_value_t = DEFAULT_SCRIPT_TIMEOUT_SECS)]
    script_timeout: u64,

    /// Connection read timeout in seconds
    #[arg(short = 'r', long, env = "OBFTUN_READ_TIMEOUT", default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    read_timeout: u64,

    /// Site mirrored for unauthenticated visitors (server) or TLS server name (client)
    #[arg(short = 'f', long, env = "OBFTUN_FAKE")]
    fake: Option<String>,

    /// Certificate chain (PEM)
    #[arg(short = 'c', long, env = "OBFTUN_CERTIFICATE", default_value = DEFAULT_CERTIFICATE)]
    certificate: PathBuf,

    /// Private key (PEM)
    #[arg(short = 'k', long, env = "OBFTUN_KEY", default_value = DEFAULT_KEY)]
    key: PathBuf,

    /// CA certificate(s) trusted for the peer (PEM)
    #[arg(short = 'a', long, env = "OBFTUN_CA", default_value = DEFAULT_CA)]
    ca: PathBuf,

    /// Seconds between client reconnect attempts
    #[arg(long, env = "OBFTUN_RETRY_INTERVAL", default_value_t = DEFAULT_RETRY_INTERVAL_SECS)]
    retry_interval: u64,

    /// Verbose output (per-packet logging)
    #[arg(short = 'v', long, env = "OBFTUN_VERBOSE")]
    verbose: bool,

    /// TOML configuration file; replaces the other options
    #[arg(long, env = "OBFTUN_CONFIG")]
    config: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<TunnelConfig> {
        if let Some(path) = &self.config {
            let mut config = TunnelConfig::from_file(path)?;
            config.verbose |= self.verbose;
            return Ok(config);
        }

        Ok(TunnelConfig {
            bind: self.bind,
            dial: self.dial,
            iface: self.iface,
            script: self.script,
            script_timeout_secs: self.script_timeout,
            read_timeout_secs: self.read_timeout,
            fake: self.fake,
            certificate: self.certificate,
            key: self.key,
            ca: self.ca,
            retry_interval_secs: self.retry_interval,
            verbose: self.verbose,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    // RUST_LOG wins over --verbose
    let default_level = if config.verbose { "trace" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    config.validate()?;

    let material = TlsMaterial::load(&config.certificate, &config.key, &config.ca)
        .context("Failed to configure TLS")?;

    let mut interfaces = InterfaceManager::new(Arc::new(TapOpener), config.iface.clone());
    if let Some(script) = &config.script {
        interfaces = interfaces.with_script(Arc::new(Script::new(script, config.script_timeout())));
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match config.role() {
        Role::Client => run_client(&config, &material, interfaces, &cancel).await?,
        Role::Server => run_server(&config, &material, interfaces, &cancel).await?,
    }

    tracing::info!("Bye bye!");
    Ok(())
}

async fn run_client(
    config: &TunnelConfig,
    material: &TlsMaterial,
    interfaces: InterfaceManager,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let dial = config.dial.as_deref().context("client requires --dial")?;
    let server_name = config
        .server_name()
        .context("cannot derive TLS server name")?;

    if let Some(bind) = &config.bind {
        tracing::info!("Binding to {}", bind);
    }

    let connector = TlsConnector::new(
        dial,
        config.bind.as_deref(),
        &server_name,
        material.client_config()?,
    )?;

    let client = Client::new(
        Arc::new(connector),
        interfaces,
        config.read_timeout(),
        RetryTimer::new(config.retry_interval()),
    );
    client.run(cancel).await?;
    Ok(())
}

async fn run_server(
    config: &TunnelConfig,
    material: &TlsMaterial,
    interfaces: InterfaceManager,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let bind = config.bind.as_deref().context("server requires --bind")?;
    let fake = config.fake.as_deref().context("server requires --fake")?;

    let gate = material.auth_gate()?;
    let tls = material.server_config(&gate)?;
    let origin = HttpsOrigin::new(fake)?;
    tracing::info!("Decoy origin: {}", origin.url());

    let server = Server::new(
        tls,
        gate,
        Decoy::new(Arc::new(origin)),
        interfaces,
        config.read_timeout(),
    );
    server.run(bind, cancel).await?;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => {}
                res = tokio::signal::ctrl_c() => {
                    if let Err(e) = res {
                        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                        sigterm.recv().await;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
