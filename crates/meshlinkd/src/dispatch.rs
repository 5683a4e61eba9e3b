//! Request dispatch by stream path

use crate::node::{respond_heartbeat, Node, HEARTBEAT_PATH};
use futures::future::BoxFuture;
use meshlink_net::framing::FrameError;
use meshlink_net::mux::ServerStream;
use meshlink_net::seq::SeqError;
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Path of the (not yet implemented) node listing
pub const NODES_PATH: &str = "api/nodes";

/// Handler errors
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("heartbeat: {0}")]
    Heartbeat(#[from] SeqError),
    #[error("framing: {0}")]
    Frame(#[from] FrameError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Handles one accepted stream
pub trait Handler: Send + Sync + 'static {
    fn call(&self, node: Arc<Node>, stream: ServerStream) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Arc<Node>, ServerStream) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn call(&self, node: Arc<Node>, stream: ServerStream) -> HandlerFuture {
        Box::pin(self(node, stream))
    }
}

/// Maps stream paths to handlers
pub struct Router {
    routes: HashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn Handler>,
}

impl Router {
    /// Router with no routes; every path gets `invalid request`
    pub fn new() -> Self {
        Self {
            routes: HashMap::new(),
            fallback: Arc::new(|node: Arc<Node>, stream: ServerStream| {
                reply(node, stream, b"invalid request")
            }),
        }
    }

    /// Router answering heartbeats and the node listing stub
    pub fn with_defaults() -> Self {
        Self::new()
            .route(HEARTBEAT_PATH, handle_heartbeat)
            .route(NODES_PATH, |node: Arc<Node>, stream: ServerStream| {
                reply(node, stream, b"unimplemented")
            })
    }

    /// Register `handler` for `path` (without leading slash)
    pub fn route(mut self, path: &str, handler: impl Handler) -> Self {
        self.routes
            .insert(path.trim_start_matches('/').to_owned(), Arc::new(handler));
        self
    }

    /// Handler for paths without a route
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    /// Run the handler for `stream`'s path. Errors are logged and stay
    /// scoped to the stream.
    pub async fn dispatch(&self, node: Arc<Node>, stream: ServerStream) {
        let path = stream.path().to_owned();
        let handler = self.routes.get(&path).unwrap_or(&self.fallback);
        debug!(peer = %node.id(), path = %path, "new request");

        let peer = node.id();
        if let Err(e) = handler.call(node, stream).await {
            warn!(peer = %peer, path = %path, "handle request: {}", e);
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::with_defaults()
    }
}

async fn handle_heartbeat(node: Arc<Node>, mut stream: ServerStream) -> Result<(), HandlerError> {
    let sample = respond_heartbeat(&mut stream).await?;
    // Recorded before the stream ends, so the prober never outruns it
    node.record(sample);
    Ok(())
}

async fn reply(_node: Arc<Node>, mut stream: ServerStream, body: &'static [u8]) -> Result<(), HandlerError> {
    stream.write_all(body).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_net::mux::ClientSession;
    use meshlink_net::peer::PeerId;
    use tokio::io::{duplex, AsyncReadExt};

    async fn session_with(router: Router) -> ClientSession {
        let (a, b) = duplex(64 * 1024);
        let node = Node::inbound(PeerId(([127, 0, 0, 1], 9).into()));
        tokio::spawn(node.serve(b, Arc::new(router)));

        let (session, driver) = ClientSession::handshake(a).await.unwrap();
        tokio::spawn(driver);
        session
    }

    async fn fetch(session: &ClientSession, path: &str) -> String {
        let mut stream = session.open_stream(path).unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        stream.close().await.unwrap();
        body
    }

    #[tokio::test]
    async fn test_default_routes() {
        let session = session_with(Router::with_defaults()).await;
        assert_eq!(fetch(&session, NODES_PATH).await, "unimplemented");
        assert_eq!(fetch(&session, "/api/nodes").await, "unimplemented");
        assert_eq!(fetch(&session, "nope").await, "invalid request");
    }

    #[tokio::test]
    async fn test_custom_route_and_fallback() {
        let router = Router::new()
            .route("echo", |_node: Arc<Node>, mut stream: ServerStream| async move {
                let mut buf = Vec::new();
                stream.read_to_end(&mut buf).await?;
                stream.write_all(&buf).await?;
                Ok::<(), HandlerError>(())
            })
            .fallback(|node: Arc<Node>, stream: ServerStream| reply(node, stream, b"gone"));
        let session = session_with(router).await;

        let mut stream = session.open_stream("echo").unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut body = Vec::new();
        stream.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"ping");

        assert_eq!(fetch(&session, HEARTBEAT_PATH).await, "gone");
    }
}
