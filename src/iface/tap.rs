//! Linux TAP device backed by `tokio-tun`.

use std::io;

use async_trait::async_trait;
use tokio_tun::{Tun, TunBuilder};

use super::{DeviceOpener, PacketDevice};

/// Opens layer-2 TAP devices.
#[derive(Debug, Clone, Default)]
pub struct TapOpener;

impl DeviceOpener for TapOpener {
    fn open(&self, name: &str) -> io::Result<Box<dyn PacketDevice>> {
        // Empty name lets the kernel pick one.
        let tun = TunBuilder::new()
            .name(name)
            .tap(true)
            .packet_info(false)
            .up()
            .try_build()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let name = tun.name().to_string();
        tracing::info!(iface = %name, "TAP device created");

        Ok(Box::new(TapDevice { name, tun }))
    }
}

/// A TAP device; each read or write is one Ethernet frame.
pub struct TapDevice {
    name: String,
    tun: Tun,
}

#[async_trait]
impl PacketDevice for TapDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.tun.recv(buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} closed", self.name),
            ));
        }
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.tun.send(packet).await?;
        Ok(())
    }
}
