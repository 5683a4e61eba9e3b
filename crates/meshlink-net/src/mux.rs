//! Stream multiplexing over one connection
//!
//! Runs an HTTP/2 session over an (encrypted) connection. Every logical
//! stream is one request: the request path names its purpose, the request
//! body carries the opener's bytes and the response body carries the
//! acceptor's bytes. Both ends see an ordinary `AsyncRead + AsyncWrite`.
//!
//! Bodies are fed through a bounded in-memory pipe ([`PipeBody`]). When the
//! session has pulled the last chunk of a pipe it fires a drain
//! acknowledgment, which [`ClientStream::close`] waits on.

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Request, Response, StatusCode, Uri};
use hyper::body::{Body, Frame, Incoming};
use hyper::client::conn::http2 as client;
use hyper::server::conn::http2 as server;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::debug;

/// Chunks a pipe holds before writers wait
pub const PIPE_CAPACITY: usize = 16;

/// Largest chunk handed to the session per write
pub const MAX_CHUNK: usize = 16 * 1024;

/// Default bound on [`ClientStream::close`]
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("http/2 error: {0}")]
    Http(#[from] hyper::Error),
    #[error("invalid stream path {0:?}")]
    InvalidPath(String),
    #[error("peer answered with status {0}")]
    Status(StatusCode),
    #[error("request dispatch was abandoned")]
    Abandoned,
    #[error("timed out waiting for the peer to finish the stream")]
    CloseTimeout,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Future that drives a session's connection until it terminates
pub type SessionDriver = BoxFuture<'static, Result<(), MuxError>>;

/// Body fed by a [`PipeWriter`]
pub struct PipeBody {
    rx: mpsc::Receiver<Bytes>,
    drained: Option<oneshot::Sender<()>>,
}

impl Body for PipeBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        match ready!(self.rx.poll_recv(cx)) {
            Some(chunk) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            None => {
                if let Some(drained) = self.drained.take() {
                    let _ = drained.send(());
                }
                Poll::Ready(None)
            }
        }
    }
}

/// Write half of a pipe
struct PipeWriter {
    tx: Option<PollSender<Bytes>>,
}

impl PipeWriter {
    fn poll_write(&mut self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let Some(tx) = self.tx.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream closed for writing",
            )));
        };

        let reserved = ready!(tx.poll_reserve(cx));
        let sent = reserved.and_then(|()| {
            let n = buf.len().min(MAX_CHUNK);
            tx.send_item(Bytes::copy_from_slice(&buf[..n])).map(|()| n)
        });
        match sent {
            Ok(n) => Poll::Ready(Ok(n)),
            Err(_) => {
                self.tx = None;
                Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "peer stopped reading the stream",
                )))
            }
        }
    }

    /// Close the write half; the body ends once buffered chunks are pulled
    fn close(&mut self) {
        self.tx = None;
    }
}

fn pipe() -> (PipeWriter, PipeBody, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel(PIPE_CAPACITY);
    let (drained_tx, drained_rx) = oneshot::channel();
    let writer = PipeWriter {
        tx: Some(PollSender::new(tx)),
    };
    let body = PipeBody {
        rx,
        drained: Some(drained_tx),
    };
    (writer, body, drained_rx)
}

/// Copy the next data out of `body` into `buf`, keeping the remainder
fn poll_read_body(
    body: &mut Incoming,
    chunk: &mut Bytes,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<bool>> {
    loop {
        if !chunk.is_empty() {
            let n = chunk.len().min(buf.remaining());
            buf.put_slice(&chunk.split_to(n));
            return Poll::Ready(Ok(true));
        }
        match ready!(Pin::new(&mut *body).poll_frame(cx)) {
            Some(Ok(frame)) => {
                // Trailers carry nothing for us
                if let Ok(data) = frame.into_data() {
                    *chunk = data;
                }
            }
            Some(Err(e)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            None => return Poll::Ready(Ok(false)),
        }
    }
}

/// Client half of a session: opens streams
#[derive(Clone)]
pub struct ClientSession {
    sender: client::SendRequest<PipeBody>,
    close_timeout: Duration,
}

impl ClientSession {
    /// Start a client session over `io`.
    ///
    /// The returned driver must be polled (usually spawned) for streams to
    /// make progress; it resolves when the connection terminates.
    pub async fn handshake<S>(io: S) -> Result<(Self, SessionDriver), MuxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sender, connection) =
            client::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
        let driver: SessionDriver = Box::pin(async move { connection.await.map_err(MuxError::from) });
        let session = Self {
            sender,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        };
        Ok((session, driver))
    }

    /// Set the bound on [`ClientStream::close`]
    pub fn with_close_timeout(mut self, close_timeout: Duration) -> Self {
        self.close_timeout = close_timeout;
        self
    }

    /// Open a new stream addressed to `path`.
    ///
    /// The request is dispatched in the background; reads wait for the
    /// response headers and a dispatch failure is reported by the next read
    /// or write.
    pub fn open_stream(&self, path: &str) -> Result<ClientStream, MuxError> {
        let uri: Uri = format!("http://meshlink/{}", path.trim_start_matches('/'))
            .parse()
            .map_err(|_| MuxError::InvalidPath(path.to_owned()))?;

        let (writer, body, drained) = pipe();
        let request = Request::post(uri)
            .body(body)
            .map_err(|_| MuxError::InvalidPath(path.to_owned()))?;

        let mut sender = self.sender.clone();
        let (response_tx, response_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = async {
                sender.ready().await?;
                let response = sender.send_request(request).await?;
                match response.status() {
                    status if status.is_success() => Ok(response),
                    status => Err(MuxError::Status(status)),
                }
            }
            .await;
            if let Err(e) = &result {
                debug!("stream dispatch failed: {}", e);
            }
            let _ = response_tx.send(result);
        });

        Ok(ClientStream {
            writer,
            response: ResponseState::Pending(response_rx),
            drained: Some(drained),
            chunk: Bytes::new(),
            close_timeout: self.close_timeout,
        })
    }
}

enum ResponseState {
    Pending(oneshot::Receiver<Result<Response<Incoming>, MuxError>>),
    Open(Incoming),
    Finished,
    Failed(io::ErrorKind, String),
}

/// Stream opened by a [`ClientSession`]
pub struct ClientStream {
    writer: PipeWriter,
    response: ResponseState,
    drained: Option<oneshot::Receiver<()>>,
    chunk: Bytes,
    close_timeout: Duration,
}

impl ClientStream {
    /// Resolve the dispatch, closing the write half if it failed
    fn poll_response(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let ResponseState::Pending(rx) = &mut self.response {
            let next = match ready!(Pin::new(rx).poll(cx)) {
                Ok(Ok(response)) => ResponseState::Open(response.into_body()),
                Ok(Err(e @ MuxError::Status(_))) => {
                    ResponseState::Failed(io::ErrorKind::Other, e.to_string())
                }
                Ok(Err(e)) => ResponseState::Failed(io::ErrorKind::ConnectionAborted, e.to_string()),
                Err(_) => ResponseState::Failed(
                    io::ErrorKind::ConnectionAborted,
                    MuxError::Abandoned.to_string(),
                ),
            };
            if matches!(next, ResponseState::Failed(..)) {
                self.writer.close();
            }
            self.response = next;
        }

        match &self.response {
            ResponseState::Failed(kind, message) => {
                Poll::Ready(Err(io::Error::new(*kind, message.clone())))
            }
            _ => Poll::Ready(Ok(())),
        }
    }

    /// Close the stream.
    ///
    /// Closes the write half, waits until the session has pulled every
    /// written byte, then waits for the peer to finish its response, which
    /// it only does after consuming our half. Bounded by the close timeout.
    pub async fn close(mut self) -> Result<(), MuxError> {
        self.writer.close();
        let close_timeout = self.close_timeout;
        tokio::time::timeout(close_timeout, self.linger())
            .await
            .map_err(|_| MuxError::CloseTimeout)?
    }

    async fn linger(&mut self) -> Result<(), MuxError> {
        if let Some(drained) = self.drained.take() {
            // An error means the body was dropped unsent; the dispatch
            // failure surfaces from the read below.
            let _ = drained.await;
        }
        tokio::io::copy(self, &mut tokio::io::sink()).await?;
        Ok(())
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_response(cx))?;

        let ResponseState::Open(body) = &mut this.response else {
            return Poll::Ready(Ok(()));
        };
        if !ready!(poll_read_body(body, &mut this.chunk, cx, buf))? {
            this.response = ResponseState::Finished;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(Err(e)) = this.poll_response(cx) {
            return Poll::Ready(Err(e));
        }
        this.writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.close();
        Poll::Ready(Ok(()))
    }
}

/// Stream accepted from an incoming request
pub struct ServerStream {
    path: String,
    body: Incoming,
    chunk: Bytes,
    body_done: bool,
    writer: PipeWriter,
}

impl ServerStream {
    /// Request path without its leading slash
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl AsyncRead for ServerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.body_done {
            return Poll::Ready(Ok(()));
        }
        if !ready!(poll_read_body(&mut this.body, &mut this.chunk, cx, buf))? {
            this.body_done = true;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ServerStream {
    /// Every write goes to the session as its own data frame; nothing is
    /// held back waiting for a flush.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().writer.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().writer.close();
        Poll::Ready(Ok(()))
    }
}

/// Turn an incoming request into a stream plus the response body to return.
///
/// The request body is released by the session once the response is done.
pub fn accept_stream(request: Request<Incoming>) -> (ServerStream, PipeBody) {
    let path = request.uri().path().trim_start_matches('/').to_owned();
    let (writer, body, _drained) = pipe();
    let stream = ServerStream {
        path,
        body: request.into_body(),
        chunk: Bytes::new(),
        body_done: false,
        writer,
    };
    (stream, body)
}

/// Serve the server half of a session over `io`.
///
/// Each incoming stream is handed to `handler` on its own task. Resolves
/// when the connection terminates. Handlers still running then, or when this
/// future is dropped, are cancelled.
pub async fn serve_connection<S, H, F>(io: S, handler: H) -> Result<(), MuxError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Fn(ServerStream) -> F + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let handler = Arc::new(handler);
    let token = CancellationToken::new();
    let _cancel_handlers = token.clone().drop_guard();

    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let token = token.clone();
        async move {
            let (stream, body) = accept_stream(request);
            debug!("accepted stream {:?}", stream.path());
            let handle = (*handler)(stream);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = handle => {}
                }
            });
            Ok::<_, Infallible>(Response::new(body))
        }
    });

    server::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), service)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    async fn client_over(io: DuplexStream) -> ClientSession {
        let (session, driver) = ClientSession::handshake(io).await.unwrap();
        tokio::spawn(driver);
        session
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let (a, b) = duplex(64 * 1024);
        tokio::spawn(serve_connection(b, |mut s: ServerStream| async move {
            assert_eq!(s.path(), "yes");
            let mut bs = [0u8; 10];
            let n = s.read(&mut bs).await.unwrap();
            assert_eq!(&bs[..n], b"hello");
            let n = s.write(b"hello2").await.unwrap();
            assert_eq!(n, 6);
        }));

        let session = client_over(a).await;
        let mut cs = session.open_stream("yes").unwrap();
        let n = cs.write(b"hello").await.unwrap();
        assert_eq!(n, 5);

        let mut bs = [0u8; 10];
        let n = cs.read(&mut bs).await.unwrap();
        assert_eq!(&bs[..n], b"hello2");
        cs.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_server_write_reaches_peer_without_stream_end() {
        let (a, b) = duplex(64 * 1024);
        tokio::spawn(serve_connection(b, |mut s: ServerStream| async move {
            s.write_all(b"early").await.unwrap();
            // Keep the response open until the client is done
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
        }));

        let session = client_over(a).await;
        let mut cs = session.open_stream("flush").unwrap();
        let mut bs = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), cs.read_exact(&mut bs))
            .await
            .expect("server write was never flushed")
            .unwrap();
        assert_eq!(&bs, b"early");
        cs.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_failure_unblocks_writer() {
        let (a, b) = duplex(64 * 1024);
        let session = client_over(a).await;
        drop(b);

        let mut cs = session.open_stream("H").unwrap();
        let chunk = vec![7u8; MAX_CHUNK];
        let write_err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = cs.write(&chunk).await {
                    return e;
                }
            }
        })
        .await
        .expect("writer hung after dispatch failure");
        assert!(matches!(
            write_err.kind(),
            io::ErrorKind::ConnectionAborted | io::ErrorKind::BrokenPipe
        ));

        let mut bs = [0u8; 4];
        let read_err = cs.read(&mut bs).await.unwrap_err();
        assert_eq!(read_err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn test_write_then_close_delivers_everything() {
        let (a, b) = duplex(64 * 1024);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        tokio::spawn(serve_connection(b, move |mut s: ServerStream| {
            let seen_tx = seen_tx.clone();
            async move {
                let mut received = Vec::new();
                s.read_to_end(&mut received).await.unwrap();
                seen_tx.send(received).unwrap();
            }
        }));

        let session = client_over(a).await;
        let mut cs = session.open_stream("bulk").unwrap();
        let payload: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
        cs.write_all(&payload).await.unwrap();
        cs.close().await.unwrap();

        // The peer has everything by the time close returns
        let received = seen_rx.try_recv().unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_close_times_out_on_endless_response() {
        let (a, b) = duplex(64 * 1024);
        tokio::spawn(serve_connection(b, |mut s: ServerStream| async move {
            let mut rest = Vec::new();
            let _ = s.read_to_end(&mut rest).await;
            // Never finish the response
            std::future::pending::<()>().await;
        }));

        let session = client_over(a).await.with_close_timeout(Duration::from_millis(200));
        let cs = session.open_stream("stuck").unwrap();
        assert!(matches!(cs.close().await, Err(MuxError::CloseTimeout)));
    }

    #[tokio::test]
    async fn test_handlers_end_with_connection() {
        let (a, b) = duplex(64 * 1024);
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (held_tx, held_rx) = oneshot::channel::<()>();
        let slot = Arc::new(std::sync::Mutex::new(Some((started_tx, held_tx))));

        let serve = tokio::spawn(serve_connection(b, move |_s: ServerStream| {
            let taken = slot.lock().unwrap().take();
            async move {
                if let Some((started, _held)) = taken {
                    let _ = started.send(());
                    std::future::pending::<()>().await;
                }
            }
        }));

        let session = client_over(a).await;
        let _cs = session.open_stream("hang").unwrap();
        started_rx.await.unwrap();

        serve.abort();
        let held = tokio::time::timeout(Duration::from_secs(5), held_rx)
            .await
            .expect("handler outlived its connection");
        assert!(held.is_err());
    }

    #[tokio::test]
    async fn test_invalid_path_rejected() {
        let (a, _b) = duplex(1024);
        let session = client_over(a).await;
        assert!(matches!(
            session.open_stream("bad path"),
            Err(MuxError::InvalidPath(_))
        ));
    }
}
