//! meshlinkd server - acceptance loop and peer table

use crate::config::{Config, ConfigError};
use crate::dispatch::Router;
use crate::node::{HeartbeatConfig, HeartbeatError, Node};
use crate::table::PeerTable;
use meshlink_net::crypto::SharedSecret;
use meshlink_net::mux::MuxError;
use meshlink_net::peer::PeerId;
use meshlink_net::transport::{self, TransportError};
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("bind {0}: {1}")]
    Bind(String, #[source] std::io::Error),
    #[error("accept: {0}")]
    Accept(#[source] std::io::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encrypted handshake: {0}")]
    Transport(#[from] TransportError),
    #[error("encrypted handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("session: {0}")]
    Mux(#[from] MuxError),
    #[error("first heartbeat: {0}")]
    FirstHeartbeat(#[from] HeartbeatError),
}

/// Peer server. Cheap to clone; clones share one server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    secret: SharedSecret,
    heartbeat: HeartbeatConfig,
    handshake_timeout: Duration,
    router: Arc<Router>,
    peers: Arc<PeerTable>,
    local_addr: RwLock<Option<SocketAddr>>,
    stop: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Create a server with the default routes
    pub fn new(config: Config) -> Result<Self, ServerError> {
        Self::with_router(config, Router::with_defaults())
    }

    /// Create a server dispatching inbound streams through `router`
    pub fn with_router(config: Config, router: Router) -> Result<Self, ServerError> {
        config.validate()?;
        let secret = config.shared_secret()?;

        Ok(Self {
            inner: Arc::new(Inner {
                secret,
                heartbeat: config.heartbeat_config(),
                handshake_timeout: config.handshake_timeout(),
                config,
                router: Arc::new(router),
                peers: Arc::new(PeerTable::new()),
                local_addr: RwLock::new(None),
                stop: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    /// Live peers
    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.inner.peers
    }

    /// Address the server is listening on, once serving
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Bind the configured address and serve until stopped
    pub async fn start(&self) -> Result<(), ServerError> {
        let listen = self.inner.config.listen.clone();
        let listener = TcpListener::bind(&listen)
            .await
            .map_err(|e| ServerError::Bind(listen, e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    ///
    /// Returns once [`Server::stop`] was called or accepting failed, after
    /// every connection task has finished.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let inner = &self.inner;
        let addr = listener.local_addr()?;
        *inner.local_addr.write() = Some(addr);
        info!("meshlinkd listening on {}", addr);

        for peer in &inner.config.peers {
            let task = Arc::clone(inner).dial(peer.clone());
            inner.tracker.spawn(task);
        }
        if let Some(every) = inner.config.debug_nodes_interval() {
            inner.tracker.spawn(Arc::clone(inner).debug_nodes(every));
        }

        let result = loop {
            tokio::select! {
                biased;
                _ = inner.stop.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(peer = %remote, "accepted connection");
                        inner.tracker.spawn(Arc::clone(inner).handle_inbound(stream, remote));
                    }
                    Err(e) => {
                        error!("accept failed: {}", e);
                        break Err(ServerError::Accept(e));
                    }
                }
            }
        };

        drop(listener);
        self.stop().await;
        result
    }

    /// Stop the server and wait for every connection task. Safe to call
    /// more than once and from several tasks.
    pub async fn stop(&self) {
        if !self.inner.stop.is_cancelled() {
            info!("shutting down");
        }
        self.inner.stop.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl Inner {
    fn register(&self, node: &Arc<Node>) {
        if let Some(displaced) = self.peers.insert(Arc::clone(node)) {
            if displaced.mark_offline() {
                info!(peer = %node.id(), "replaced existing node");
            }
        }
    }

    fn unregister(&self, node: &Arc<Node>) {
        node.mark_offline();
        self.peers.remove_node(node);
        info!(peer = %node.id(), "node offline");
    }

    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let id = PeerId::from(remote);
        let handshake = tokio::time::timeout(
            self.handshake_timeout,
            transport::wrap(stream, &self.secret, false),
        );
        let conn = tokio::select! {
            _ = self.stop.cancelled() => return,
            wrapped = handshake => match wrapped {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => {
                    warn!(peer = %id, "encrypted handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    warn!(peer = %id, "encrypted handshake timed out");
                    return;
                }
            },
        };

        let node = Node::inbound(id);
        self.register(&node);
        info!(peer = %id, "inbound node active");

        // Dropping the session future closes the connection
        tokio::select! {
            served = Arc::clone(&node).serve(conn, Arc::clone(&self.router)) => {
                if let Err(e) = served {
                    debug!(peer = %id, "connection ended: {}", e);
                }
            }
            _ = node.offline() => {}
            _ = self.stop.cancelled() => {}
        }
        self.unregister(&node);
    }

    /// Dial `addr` once; on success keep probing it until it goes offline
    async fn dial(self: Arc<Self>, addr: String) {
        let node = tokio::select! {
            _ = self.stop.cancelled() => return,
            connected = Arc::clone(&self).connect(&addr) => match connected {
                Ok(node) => node,
                Err(e) => {
                    warn!(peer = %addr, "failed to add node: {}", e);
                    return;
                }
            },
        };

        self.register(&node);
        info!(peer = %node.id(), latency = ?node.latency(), "outbound node active");

        Arc::clone(&node)
            .run_heartbeat_loop(self.heartbeat.clone(), self.stop.clone())
            .await;
        self.unregister(&node);
    }

    async fn connect(self: Arc<Self>, addr: &str) -> Result<Arc<Node>, ServerError> {
        let stream = TcpStream::connect(addr).await?;
        let id = PeerId::from(stream.peer_addr()?);

        let conn = tokio::time::timeout(
            self.handshake_timeout,
            transport::wrap(stream, &self.secret, true),
        )
        .await
        .map_err(|_| ServerError::HandshakeTimeout(self.handshake_timeout))??;

        let (node, driver) = Node::connect(id, conn).await?;
        let session_node = Arc::clone(&node);
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                ended = driver => {
                    if let Err(e) = ended {
                        debug!(peer = %id, "session ended: {}", e);
                    }
                }
                _ = session_node.offline() => {}
                _ = stop.cancelled() => {}
            }
            session_node.mark_offline();
        });

        if let Err(e) = node.heartbeat(self.heartbeat.timeout).await {
            node.mark_offline();
            return Err(e.into());
        }
        node.activate();
        Ok(node)
    }

    async fn debug_nodes(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let nodes = self.peers.snapshot();
                    let list = serde_json::to_string(&nodes).unwrap_or_default();
                    debug!(count = nodes.len(), list = %list, "nodes info");
                }
                _ = self.stop.cancelled() => break,
            }
        }
    }
}
