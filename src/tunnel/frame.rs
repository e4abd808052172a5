//! Length-prefixed frame codec.
//!
//! Wire format, one frame per interface packet:
//!
//! ```text
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ Length (4, u32 BE)       │ Payload (Length bytes)       │
//! └──────────────────────────┴──────────────────────────────┘
//! ```
//!
//! `Length` must lie in `1..=65535`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the length prefix.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Largest payload a frame may carry.
pub const MAX_FRAME_LEN: usize = 65535;

/// Frame format violations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Length prefix outside `1..=65535`
    #[error("bad frame length {0}")]
    InvalidLength(u64),

    /// Stream ended in the middle of a frame
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes announced by the length prefix
        expected: usize,
        /// Bytes read before end of stream
        actual: usize,
    },
}

fn check_len(len: u64) -> std::result::Result<usize, FrameError> {
    if len == 0 || len > MAX_FRAME_LEN as u64 {
        return Err(FrameError::InvalidLength(len));
    }
    Ok(len as usize)
}

/// Append one encoded frame to `dst`.
pub fn encode(payload: &[u8], dst: &mut BytesMut) -> std::result::Result<(), FrameError> {
    let len = check_len(payload.len() as u64)?;
    dst.reserve(LEN_PREFIX_SIZE + len);
    dst.put_u32(len as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Take one complete frame off the front of `src`.
///
/// Returns `Ok(None)` when more bytes are needed. An invalid length prefix is
/// rejected as soon as the prefix is available.
pub fn decode(src: &mut BytesMut) -> std::result::Result<Option<Bytes>, FrameError> {
    if src.len() < LEN_PREFIX_SIZE {
        return Ok(None);
    }

    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
    let len = check_len(len as u64)?;

    if src.len() < LEN_PREFIX_SIZE + len {
        src.reserve(LEN_PREFIX_SIZE + len - src.len());
        return Ok(None);
    }

    src.advance(LEN_PREFIX_SIZE);
    Ok(Some(src.split_to(len).freeze()))
}

/// Reads frames off the secure stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Box<[u8]>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a stream.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: vec![0u8; MAX_FRAME_LEN].into_boxed_slice(),
        }
    }

    /// Read exactly one frame and return its payload.
    ///
    /// A clean end of stream before the first prefix byte is reported as a
    /// transport error (peer closed). Anything shorter than a whole frame, or
    /// a bad length, is a protocol error and nothing is returned.
    pub async fn read_frame(&mut self) -> Result<&[u8]> {
        let mut prefix = [0u8; LEN_PREFIX_SIZE];
        let got = read_full(&mut self.inner, &mut prefix).await?;
        if got == 0 {
            return Err(Error::Transport(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )));
        }
        if got < LEN_PREFIX_SIZE {
            return Err(FrameError::Truncated {
                expected: LEN_PREFIX_SIZE,
                actual: got,
            }
            .into());
        }

        let len = check_len(u32::from_be_bytes(prefix) as u64)?;
        let got = read_full(&mut self.inner, &mut self.buf[..len]).await?;
        if got < len {
            return Err(FrameError::Truncated {
                expected: len,
                actual: got,
            }
            .into());
        }

        Ok(&self.buf[..len])
    }
}

/// Writes frames onto the secure stream.
pub struct FrameWriter<W> {
    inner: W,
    buf: BytesMut,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a stream.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(LEN_PREFIX_SIZE + MAX_FRAME_LEN),
        }
    }

    /// Write one frame and flush it immediately.
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.buf.clear();
        encode(payload, &mut self.buf)?;
        self.inner.write_all(&self.buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Fill `buf` until it is full or the stream ends; returns bytes read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Fault;

    #[test]
    fn test_frame_roundtrip() {
        for len in [1usize, 5, 1500, MAX_FRAME_LEN] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut buf = BytesMut::new();
            encode(&payload, &mut buf).unwrap();
            assert_eq!(buf.len(), LEN_PREFIX_SIZE + len);

            let decoded = decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded.as_ref(), payload.as_slice());
            assert!(buf.is_empty());
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn any_valid_payload_roundtrips(
                payload in prop::collection::vec(any::<u8>(), 1..=MAX_FRAME_LEN),
            ) {
                let mut buf = BytesMut::new();
                encode(&payload, &mut buf).unwrap();
                prop_assert_eq!(buf.len(), LEN_PREFIX_SIZE + payload.len());
                prop_assert_eq!(&buf[..LEN_PREFIX_SIZE], &(payload.len() as u32).to_be_bytes()[..]);

                let decoded = decode(&mut buf).unwrap().unwrap();
                prop_assert_eq!(decoded.as_ref(), payload.as_slice());
                prop_assert!(buf.is_empty());
            }

            #[test]
            fn decode_never_yields_out_of_range_frames(
                wire in prop::collection::vec(any::<u8>(), 0..64),
            ) {
                let mut src = BytesMut::from(&wire[..]);
                match decode(&mut src) {
                    Ok(Some(frame)) => {
                        prop_assert!((1..=MAX_FRAME_LEN).contains(&frame.len()));
                    }
                    Ok(None) => prop_assert_eq!(src.len(), wire.len()),
                    Err(FrameError::InvalidLength(len)) => {
                        prop_assert!(len == 0 || len as usize > MAX_FRAME_LEN);
                    }
                    Err(e) => prop_assert!(false, "unexpected {:?}", e),
                }
            }
        }
    }

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        encode(b"hello", &mut buf).unwrap();
        assert_eq!(&buf[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn test_decode_rejects_bad_lengths() {
        let mut zero = BytesMut::from(&[0u8, 0, 0, 0][..]);
        assert_eq!(decode(&mut zero), Err(FrameError::InvalidLength(0)));

        let mut too_big = BytesMut::new();
        too_big.put_u32(65536);
        too_big.put_slice(&[0u8; 16]);
        assert_eq!(decode(&mut too_big), Err(FrameError::InvalidLength(65536)));
    }

    #[test]
    fn test_encode_rejects_bad_lengths() {
        let mut buf = BytesMut::new();
        assert!(encode(&[], &mut buf).is_err());
        assert!(encode(&vec![0u8; MAX_FRAME_LEN + 1], &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut buf = BytesMut::new();
        encode(b"partial", &mut buf).unwrap();
        let mut head = buf.split_to(6);
        assert_eq!(decode(&mut head), Ok(None));
    }

    #[tokio::test]
    async fn test_reader_reads_consecutive_frames() {
        let mut wire = BytesMut::new();
        encode(b"one", &mut wire).unwrap();
        encode(b"two", &mut wire).unwrap();

        let mut reader = FrameReader::new(&wire[..]);
        assert_eq!(reader.read_frame().await.unwrap(), b"one");
        assert_eq!(reader.read_frame().await.unwrap(), b"two");

        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.fault(), Fault::Transport);
    }

    #[tokio::test]
    async fn test_reader_short_payload_is_protocol_fault() {
        let wire = b"\x00\x00\x00\x0ahello".to_vec();
        let mut reader = FrameReader::new(&wire[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.fault(), Fault::Protocol);
        assert!(matches!(
            err,
            Error::Protocol(FrameError::Truncated { expected: 10, actual: 5 })
        ));
    }

    #[tokio::test]
    async fn test_reader_short_prefix_is_protocol_fault() {
        let wire = [0u8, 0];
        let mut reader = FrameReader::new(&wire[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.fault(), Fault::Protocol);
    }

    #[tokio::test]
    async fn test_reader_zero_length_is_protocol_fault() {
        let wire = b"\x00\x00\x00\x00abc".to_vec();
        let mut reader = FrameReader::new(&wire[..]);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(FrameError::InvalidLength(0))));
    }

    #[tokio::test]
    async fn test_writer_emits_prefixed_frame() {
        let mut out = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut out);
            writer.write_frame(b"hello").await.unwrap();
        }
        assert_eq!(out, b"\x00\x00\x00\x05hello");
    }
}
