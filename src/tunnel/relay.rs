//! Bidirectional frame relay between the secure stream and the interface.
//!
//! Each direction relays in strict receipt order. The relay ends as soon as
//! either direction fails or shutdown is requested; the other direction is
//! dropped with it. Device failures are reported as interface faults so the
//! caller can tell a broken local device from a broken connection.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::iface::PacketDevice;
use crate::tunnel::frame::{FrameReader, FrameWriter, MAX_FRAME_LEN};

/// Pipe frames between `stream` and `device` until something fails.
///
/// Always returns an error: [`Error::Cancelled`] on shutdown, an interface
/// fault when the device fails, otherwise a transport or protocol fault.
pub async fn run_relay<S>(
    stream: S,
    device: &dyn PacketDevice,
    read_timeout: Duration,
    peer: &str,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);

    tracing::info!("Piping {} <-> {}", device.name(), peer);

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        res = stream_to_device(&mut reader, device, read_timeout, peer) => res,
        res = device_to_stream(device, &mut writer, peer) => res,
    }
}

async fn stream_to_device<R>(
    reader: &mut FrameReader<R>,
    device: &dyn PacketDevice,
    read_timeout: Duration,
    peer: &str,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let packet = match tokio::time::timeout(read_timeout, reader.read_frame()).await {
            Ok(frame) => frame?,
            Err(_) => return Err(Error::timeout("read from peer", read_timeout)),
        };

        device.send(packet).await.map_err(|e| {
            Error::interface(format!(
                "failed to write packet to {}: {}",
                device.name(),
                e
            ))
        })?;

        tracing::trace!("{} [{}]-> {}", peer, packet.len(), device.name());
    }
}

async fn device_to_stream<W>(
    device: &dyn PacketDevice,
    writer: &mut FrameWriter<W>,
    peer: &str,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let n = device.recv(&mut buf).await.map_err(|e| {
            Error::interface(format!(
                "failed to read packet from {}: {}",
                device.name(),
                e
            ))
        })?;
        if n == 0 {
            return Err(Error::interface(format!(
                "empty read from {}",
                device.name()
            )));
        }

        writer.write_frame(&buf[..n]).await?;

        tracing::trace!("{} [{}]-> {}", device.name(), n, peer);
    }
}
