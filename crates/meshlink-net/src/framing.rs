//! Message framing for network transport
//!
//! Every frame is an opaque payload prefixed with its length encoded as an
//! unsigned protobuf varint, which solves TCP's message-boundary problem.
//!
//! ```text
//! +---------------------------+------------------+
//! | Length (varint, 1-10 B)   | Payload (N bytes)|
//! +---------------------------+------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Longest possible encoding of a u64 varint
pub const MAX_VARINT_LEN: usize = 10;

/// Default maximum payload size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {1})")]
    TooLarge(u64, usize),
    #[error("malformed varint length prefix")]
    MalformedLength,
    #[error("stream ended inside a frame ({0} bytes buffered)")]
    Truncated(usize),
    #[error("stream closed")]
    Closed,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Number of bytes `value` occupies as a varint
pub fn uvarint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append the minimal varint encoding of `value`
pub fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Parse a varint from the front of `src` without consuming it.
///
/// Returns the value and the number of prefix bytes, or `None` when more
/// bytes are needed.
pub fn read_uvarint(src: &[u8]) -> Result<Option<(u64, usize)>, FrameError> {
    let mut value = 0u64;
    for (i, &byte) in src.iter().take(MAX_VARINT_LEN).enumerate() {
        // The tenth byte may only carry the top bit of a u64
        if i == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(FrameError::MalformedLength);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(FrameError::MalformedLength);
    }
    Ok(None)
}

/// Codec for varint length-prefixed frames
#[derive(Debug, Clone)]
pub struct VarintCodec {
    max_frame_size: usize,
}

impl VarintCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom payload limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for VarintCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for VarintCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((length, prefix_len)) = read_uvarint(src)? else {
            return Ok(None);
        };

        if length > self.max_frame_size as u64 {
            return Err(FrameError::TooLarge(length, self.max_frame_size));
        }

        let frame_len = prefix_len + length as usize;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        Ok(Some(src.split_to(length as usize).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::Truncated(src.len())),
        }
    }
}

impl<'a> Encoder<&'a [u8]> for VarintCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: &'a [u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::TooLarge(
                payload.len() as u64,
                self.max_frame_size,
            ));
        }

        dst.reserve(MAX_VARINT_LEN + payload.len());
        put_uvarint(dst, payload.len() as u64);
        dst.put_slice(payload);
        Ok(())
    }
}

/// Reads and writes one frame at a time over a byte stream.
///
/// The read buffer lives as long as the framer, so bytes pulled from the
/// stream for one frame stay available for the next call.
pub struct Framer<S> {
    inner: Framed<S, VarintCodec>,
}

impl<S> Framer<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a framer with the default codec
    pub fn new(io: S) -> Self {
        Self::with_codec(io, VarintCodec::new())
    }

    /// Create a framer with a specific codec
    pub fn with_codec(io: S, codec: VarintCodec) -> Self {
        Self {
            inner: Framed::new(io, codec),
        }
    }

    /// Read the next frame, waiting until it is complete.
    ///
    /// End of stream is an error: [`FrameError::Closed`] between frames,
    /// [`FrameError::Truncated`] inside one.
    pub async fn read_frame(&mut self) -> Result<Bytes, FrameError> {
        match self.inner.next().await {
            Some(frame) => frame,
            None => Err(FrameError::Closed),
        }
    }

    /// Write one frame and flush it, returning the bytes put on the wire
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        self.inner.send(payload).await?;
        Ok(uvarint_len(payload.len() as u64) + payload.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[test]
    fn test_varint_encoding() {
        let mut buf = BytesMut::new();
        put_uvarint(&mut buf, 300);
        assert_eq!(&buf[..], &[0xac, 0x02]);
        assert_eq!(uvarint_len(300), 2);
        assert_eq!(read_uvarint(&buf).unwrap(), Some((300, 2)));

        buf.clear();
        put_uvarint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), MAX_VARINT_LEN);
        assert_eq!(read_uvarint(&buf).unwrap(), Some((u64::MAX, MAX_VARINT_LEN)));
    }

    #[test]
    fn test_varint_overflow() {
        let bytes = [0xffu8; 11];
        assert!(matches!(
            read_uvarint(&bytes),
            Err(FrameError::MalformedLength)
        ));
        assert_eq!(read_uvarint(&[0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn test_codec_partial_frame() {
        let mut codec = VarintCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(&b"hello"[..], &mut buf).unwrap();

        let mut partial = buf.split_to(3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), "hello");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_rejects_oversized() {
        let mut codec = VarintCodec::with_max_frame_size(4);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(&b"hello"[..], &mut buf),
            Err(FrameError::TooLarge(5, 4))
        ));

        put_uvarint(&mut buf, 5);
        buf.put_slice(b"hello");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge(5, 4))
        ));
    }

    #[tokio::test]
    async fn test_framer_roundtrip() {
        let (a, b) = duplex(1024);
        let mut writer = Framer::new(a);
        let mut reader = Framer::new(b);

        let n = writer.write_frame(b"hello").await.unwrap();
        assert_eq!(n, 6);
        assert_eq!(reader.read_frame().await.unwrap(), "hello");

        let n = writer.write_frame(b"").await.unwrap();
        assert_eq!(n, 1);
        assert!(reader.read_frame().await.unwrap().is_empty());

        let n = writer.write_frame(b"xyz").await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(reader.read_frame().await.unwrap(), "xyz");
    }

    #[tokio::test]
    async fn test_frames_split_across_one_read() {
        let (a, mut b) = duplex(1024);
        let mut framer = Framer::new(a);

        let mut codec = VarintCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(&b"first"[..], &mut wire).unwrap();
        codec.encode(&b""[..], &mut wire).unwrap();
        codec.encode(&b"second"[..], &mut wire).unwrap();
        b.write_all(&wire).await.unwrap();

        assert_eq!(framer.read_frame().await.unwrap(), "first");
        assert!(framer.read_frame().await.unwrap().is_empty());
        assert_eq!(framer.read_frame().await.unwrap(), "second");

        // A frame trickling in byte by byte still decodes once complete
        let mut slow = BytesMut::new();
        codec.encode(&b"third"[..], &mut slow).unwrap();
        for byte in slow.iter() {
            b.write_all(&[*byte]).await.unwrap();
        }
        assert_eq!(framer.read_frame().await.unwrap(), "third");
    }

    #[tokio::test]
    async fn test_truncated_payload_is_error() {
        let (a, mut b) = duplex(1024);
        let mut framer = Framer::new(a);

        b.write_all(&[5, b'h', b'e']).await.unwrap();
        drop(b);

        assert!(matches!(
            framer.read_frame().await,
            Err(FrameError::Truncated(3))
        ));
    }

    #[tokio::test]
    async fn test_truncated_prefix_and_clean_close() {
        let (a, mut b) = duplex(1024);
        let mut framer = Framer::new(a);
        b.write_all(&[0x80]).await.unwrap();
        drop(b);
        assert!(matches!(
            framer.read_frame().await,
            Err(FrameError::Truncated(1))
        ));

        let (a, b) = duplex(1024);
        let mut framer = Framer::new(a);
        drop(b);
        assert!(matches!(framer.read_frame().await, Err(FrameError::Closed)));
    }
}
