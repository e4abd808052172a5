//! Plain TCP port forwarder.
//!
//! Fronts the tunnel server from another address: every accepted client is
//! connected to a fixed target and bytes are copied both ways. Both
//! connections are closed as soon as either direction ends.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::bind_listener;
use crate::error::Result;
use crate::retry::{RetryTimer, ACCEPT_RETRY_INTERVAL};

/// Default listen address of the forwarder.
pub const DEFAULT_BIND: &str = ":443";

/// Timeout for connecting to the target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwards accepted connections to one target.
#[derive(Debug, Clone)]
pub struct Forwarder {
    target: String,
}

impl Forwarder {
    /// Forward to `target` (`host:port`).
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Target address.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Bind `addr` and forward until `cancel` fires.
    pub async fn run(&self, addr: &str, cancel: &CancellationToken) -> Result<()> {
        let listener = bind_listener(addr).await?;
        tracing::info!("Listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// Forward connections from `listener` until `cancel` fires, then wait
    /// for open connections to finish.
    pub async fn serve(&self, listener: TcpListener, cancel: &CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();
        let retry = RetryTimer::new(ACCEPT_RETRY_INTERVAL);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((client, client_addr)) => {
                    let target = self.target.clone();
                    let cancel = cancel.clone();
                    tracker.spawn(async move {
                        forward(client, client_addr, &target, &cancel).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    if !retry.wait(cancel).await {
                        break;
                    }
                }
            }
        }

        drop(listener);
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

async fn forward(
    mut client: TcpStream,
    client_addr: SocketAddr,
    target: &str,
    cancel: &CancellationToken,
) {
    tracing::debug!("Client {} connected", client_addr);

    let dialed = tokio::select! {
        _ = cancel.cancelled() => return,
        res = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(target)) => res,
    };
    let mut server = match dialed {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!("Client {} failed to connect to target: {}", client_addr, e);
            return;
        }
        Err(_) => {
            tracing::warn!("Client {} timed out connecting to target {}", client_addr, target);
            return;
        }
    };

    tracing::info!("{} <-> {}", client_addr, target);

    let (mut client_rd, mut client_wr) = client.split();
    let (mut server_rd, mut server_wr) = server.split();

    tokio::select! {
        _ = cancel.cancelled() => {}
        res = tokio::io::copy(&mut client_rd, &mut server_wr) => match res {
            Ok(n) => tracing::debug!("{} [{}]-> {}", client_addr, n, target),
            Err(e) => tracing::debug!("Client {} copy to target ended: {}", client_addr, e),
        },
        res = tokio::io::copy(&mut server_rd, &mut client_wr) => match res {
            Ok(n) => tracing::debug!("{} [{}]-> {}", target, n, client_addr),
            Err(e) => tracing::debug!("Client {} copy from target ended: {}", client_addr, e),
        },
    }

    tracing::debug!("Client {} disconnected", client_addr);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start(target: String) -> (SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { Forwarder::new(target).serve(listener, &cancel).await })
        };
        (addr, cancel, task)
    }

    #[tokio::test]
    async fn test_bytes_flow_both_ways() {
        let target = echo_server().await;
        let (addr, cancel, task) = start(target.to_string()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        drop(client);
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_target_closes_client() {
        // Bind then drop to get a port with nothing listening.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);

        let (addr, cancel, task) = start(target.to_string()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap_or(0);
        assert_eq!(n, 0);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_target_half_close_closes_both_sides() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let (addr, cancel, task) = start(target.to_string()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut upstream, _) = listener.accept().await.unwrap();
        upstream.write_all(b"bye").await.unwrap();
        upstream.shutdown().await.unwrap();

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"bye");

        // The client never closed; the forwarder must drop the target anyway.
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(
            Duration::from_secs(5),
            upstream.read_to_end(&mut rest),
        )
        .await;
        assert!(matches!(closed, Ok(Ok(0))));

        drop(client);
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_ends_open_connections() {
        let target = echo_server().await;
        let (addr, cancel, task) = start(target.to_string()).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"x").await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
