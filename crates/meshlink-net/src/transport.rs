//! Encrypted transport
//!
//! Wraps a raw connection so that every write is sealed with
//! ChaCha20-Poly1305 and every read is authenticated before any plaintext is
//! released. The wrapped stream keeps the `AsyncRead + AsyncWrite` contract of
//! the connection it wraps, so the layers above cannot tell the difference.
//!
//! Handshake:
//! 1. both sides send a random salt and read the peer's salt;
//! 2. direction keys are derived from the shared secret and both salts;
//! 3. both sides send a sealed confirmation record and check the peer's.

use crate::crypto::{
    random_salt, CryptoError, Role, SealCodec, SessionKeys, SharedSecret, MAX_RECORD_PLAINTEXT,
    SALT_LEN,
};
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::io::poll_read_buf;
use tracing::debug;

const CONFIRMATION: &[u8] = b"meshlink key confirmation v1";

/// Buffered ciphertext above which writes wait for the socket
const WRITE_HIGH_WATER: usize = 64 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("peer does not hold the shared secret")]
    SecretMismatch,
}

/// Wrap `conn` with authenticated encryption keyed by `secret`.
///
/// `is_initiator` must be true on the dialing side and false on the accepting
/// side.
pub async fn wrap<S>(
    conn: S,
    secret: &SharedSecret,
    is_initiator: bool,
) -> Result<EncryptedStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    EncryptedStream::handshake(conn, secret, Role::from_initiator(is_initiator)).await
}

/// A connection whose traffic is sealed record by record
pub struct EncryptedStream<S> {
    inner: S,
    codec: SealCodec,
    read_buf: BytesMut,
    plaintext: Bytes,
    write_buf: BytesMut,
    eof: bool,
    /// First read failure; every later read repeats it
    read_err: Option<(io::ErrorKind, String)>,
}

impl<S> EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the handshake over `conn` in the given role
    pub async fn handshake(
        mut conn: S,
        secret: &SharedSecret,
        role: Role,
    ) -> Result<Self, TransportError> {
        let ours = random_salt();
        conn.write_all(&ours).await?;
        conn.flush().await?;

        let mut theirs = [0u8; SALT_LEN];
        conn.read_exact(&mut theirs).await?;

        let (initiator_salt, responder_salt) = match role {
            Role::Initiator => (ours, theirs),
            Role::Responder => (theirs, ours),
        };
        let keys = SessionKeys::derive(secret, &initiator_salt, &responder_salt, role)?;
        let mut stream = Self::new(conn, SealCodec::new(keys));

        stream.write_all(CONFIRMATION).await?;
        stream.flush().await?;

        let mut confirmation = [0u8; CONFIRMATION.len()];
        match stream.read_exact(&mut confirmation).await {
            Ok(_) if confirmation == CONFIRMATION => {}
            Ok(_) => return Err(TransportError::SecretMismatch),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                return Err(TransportError::SecretMismatch)
            }
            Err(e) => return Err(e.into()),
        }

        debug!(?role, "encrypted handshake complete");
        Ok(stream)
    }

    fn new(inner: S, codec: SealCodec) -> Self {
        Self {
            inner,
            codec,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            plaintext: Bytes::new(),
            write_buf: BytesMut::new(),
            eof: false,
            read_err: None,
        }
    }

    fn fail_read(&mut self, err: io::Error) -> io::Error {
        self.read_err = Some((err.kind(), err.to_string()));
        err
    }

    fn poll_write_buffered(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.write_buf.is_empty() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_buf.advance(n);
        }
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some((kind, msg)) = &this.read_err {
            return Poll::Ready(Err(io::Error::new(*kind, msg.clone())));
        }
        loop {
            if !this.plaintext.is_empty() {
                let n = this.plaintext.len().min(buf.remaining());
                buf.put_slice(&this.plaintext.split_to(n));
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match this.codec.decode(&mut this.read_buf) {
                Ok(Some(record)) => {
                    this.plaintext = record;
                    continue;
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(this.fail_read(e.into()))),
            }

            if this.read_buf.capacity() - this.read_buf.len() < READ_CHUNK {
                this.read_buf.reserve(READ_CHUNK);
            }
            let n = match ready!(poll_read_buf(
                Pin::new(&mut this.inner),
                cx,
                &mut this.read_buf
            )) {
                Ok(n) => n,
                Err(e) => return Poll::Ready(Err(this.fail_read(e))),
            };
            if n == 0 {
                if !this.read_buf.is_empty() {
                    let err = io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed inside an encrypted record",
                    );
                    return Poll::Ready(Err(this.fail_read(err)));
                }
                this.eof = true;
            }
        }
    }
}

impl<S> AsyncWrite for EncryptedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if this.write_buf.len() >= WRITE_HIGH_WATER {
            ready!(this.poll_write_buffered(cx))?;
        }

        let n = buf.len().min(MAX_RECORD_PLAINTEXT);
        this.codec.encode(&buf[..n], &mut this.write_buf)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_buffered(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_write_buffered(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
