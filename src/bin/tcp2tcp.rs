//! tcp2tcp: forward a TCP port to a fixed target.
//!
//! Usage: `tcp2tcp -b :443 -t 10.0.0.2:9443`

use clap::Parser;
use tokio_util::sync::CancellationToken;

use obftun::forward::{Forwarder, DEFAULT_BIND};

#[derive(Parser, Debug)]
#[command(name = "tcp2tcp", version, about = "Plain TCP port forwarder")]
struct Args {
    /// Bind address
    #[arg(short = 'b', long, env = "TCP2TCP_BIND", default_value = DEFAULT_BIND)]
    bind: String,

    /// Target server address
    #[arg(short = 't', long, env = "TCP2TCP_TARGET")]
    target: String,

    /// Verbose logging
    #[arg(short = 'v', long, env = "TCP2TCP_VERBOSE")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received shutdown signal");
                    cancel.cancel();
                }
                Err(e) => tracing::warn!("Failed to listen for Ctrl-C: {}", e),
            }
        });
    }
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sigterm.recv().await;
            tracing::info!("Received SIGTERM");
            cancel.cancel();
        });
    }

    let forwarder = Forwarder::new(args.target);
    tracing::info!("Forwarding to {}", forwarder.target());
    forwarder.run(&args.bind, &cancel).await?;

    tracing::info!("Bye bye!");
    Ok(())
}
