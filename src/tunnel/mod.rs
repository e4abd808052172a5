//! Tunnel data plane.
//!
//! ```text
//! ┌────────────┐   frames (len BE u32 + payload)   ┌────────────────┐
//! │ TLS stream │ ◄───────────────────────────────► │ PacketDevice   │
//! └────────────┘        relay::run_relay           └────────────────┘
//! ```
//!
//! The framing is not versioned or negotiated; both ends must agree.

pub mod frame;
pub mod relay;

pub use frame::{FrameError, FrameReader, FrameWriter, LEN_PREFIX_SIZE, MAX_FRAME_LEN};
pub use relay::run_relay;

use tokio::io::{AsyncRead, AsyncWrite};

/// Any byte stream a tunnel can run over.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// Type-erased tunnel stream.
pub type BoxedStream = Box<dyn TunnelStream>;

/// TCP keep-alive period for tunnel connections.
pub const KEEPALIVE_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Disable Nagle and enable keep-alive on a tunnel socket.
pub fn tune_socket(stream: &tokio::net::TcpStream) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
