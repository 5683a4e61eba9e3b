//! Peer node: liveness state machine and heartbeats
//!
//! A node is one peer connection. Outbound nodes hold the client half of a
//! multiplexed session and probe the peer on [`HEARTBEAT_PATH`] every
//! interval; inbound nodes serve the peer's streams and answer its probes.
//!
//! ```text
//! Connecting --first heartbeat ok--> Active --failures / conn lost--> Offline
//! ```
//!
//! `Offline` is terminal and is entered at most once.

use crate::dispatch::Router;
use meshlink_net::framing::Framer;
use meshlink_net::mux::{self, ClientSession, MuxError, ServerStream, SessionDriver};
use meshlink_net::peer::{unix_millis, PeerId};
use meshlink_net::seq::{SeqError, SeqFramer};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Stream path of the heartbeat exchange
pub const HEARTBEAT_PATH: &str = "H";

const HELLO: &[u8] = b"hello";
const HELLO2: &[u8] = b"hello2";
const OK: &[u8] = b"ok";

/// Heartbeat timing
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Pause between rounds
    pub interval: Duration,
    /// Bound on one round, stream open to stream close
    pub timeout: Duration,
    /// Consecutive failed rounds that take the node offline
    pub max_failures: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(6),
            timeout: Duration::from_secs(9),
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Connecting,
    Active,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The peer dialed us
    Inbound,
    /// We dialed the peer
    Outbound,
}

/// Outcome of one successful heartbeat exchange
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatSample {
    /// One-way latency estimate (half the measured round trip)
    pub latency: Duration,
    pub at: SystemTime,
}

#[derive(Debug, Default)]
struct HeartbeatStats {
    latency: Option<Duration>,
    last_heartbeat: Option<SystemTime>,
    consecutive_failures: u32,
}

/// Point-in-time view of a node, for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub id: PeerId,
    pub direction: Direction,
    pub state: NodeState,
    pub latency_ms: Option<f64>,
    pub last_heartbeat_unix_ms: Option<u64>,
    pub consecutive_failures: u32,
}

/// Heartbeat errors
#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("node has no outbound session")]
    NotOutbound,
    #[error("open stream: {0}")]
    Open(#[source] MuxError),
    #[error(transparent)]
    Exchange(#[from] SeqError),
    #[error("close stream: {0}")]
    Close(#[source] MuxError),
    #[error("{exchange}; close stream: {close}")]
    CloseAfter { exchange: SeqError, close: MuxError },
    #[error("heartbeat timed out after {0:?}")]
    Timeout(Duration),
}

impl HeartbeatError {
    /// True when the peer answered with the wrong bytes
    pub fn is_protocol_mismatch(&self) -> bool {
        match self {
            Self::Exchange(e) | Self::CloseAfter { exchange: e, .. } => e.is_mismatch(),
            _ => false,
        }
    }
}

/// One peer
pub struct Node {
    id: PeerId,
    direction: Direction,
    state: watch::Sender<NodeState>,
    stats: RwLock<HeartbeatStats>,
    session: Option<ClientSession>,
}

impl Node {
    /// Node for a connection the peer dialed; active once the encrypted
    /// handshake is done
    pub fn inbound(id: PeerId) -> Arc<Self> {
        Arc::new(Self::new(id, Direction::Inbound, NodeState::Active, None))
    }

    /// Start a client session over a dialed connection.
    ///
    /// The node stays `Connecting` until [`Node::activate`]. The returned
    /// driver must run for the session to make progress.
    pub async fn connect<S>(id: PeerId, io: S) -> Result<(Arc<Self>, SessionDriver), MuxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (session, driver) = ClientSession::handshake(io).await?;
        let node = Self::new(id, Direction::Outbound, NodeState::Connecting, Some(session));
        Ok((Arc::new(node), driver))
    }

    fn new(
        id: PeerId,
        direction: Direction,
        state: NodeState,
        session: Option<ClientSession>,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            id,
            direction,
            state,
            stats: RwLock::new(HeartbeatStats::default()),
            session,
        }
    }

    /// Remote address of the peer
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Which side dialed
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Current state
    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Round-trip time of the last successful heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.stats.read().latency
    }

    /// When the last successful heartbeat completed
    pub fn last_heartbeat(&self) -> Option<SystemTime> {
        self.stats.read().last_heartbeat
    }

    /// Failed heartbeat rounds since the last success
    pub fn consecutive_failures(&self) -> u32 {
        self.stats.read().consecutive_failures
    }

    /// `Connecting -> Active`; no effect in any other state
    pub fn activate(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == NodeState::Connecting {
                *state = NodeState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Take the node offline. Returns true only for the call that made the
    /// transition.
    pub fn mark_offline(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == NodeState::Offline {
                false
            } else {
                *state = NodeState::Offline;
                true
            }
        })
    }

    /// Resolves once the node is offline
    pub async fn offline(&self) {
        let mut state = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close under us
        let _ = state.wait_for(|s| *s == NodeState::Offline).await;
    }

    /// Store a successful exchange and reset the failure count
    pub fn record(&self, sample: HeartbeatSample) {
        let mut stats = self.stats.write();
        stats.latency = Some(sample.latency);
        stats.last_heartbeat = Some(sample.at);
        stats.consecutive_failures = 0;
    }

    fn record_failure(&self) -> u32 {
        let mut stats = self.stats.write();
        stats.consecutive_failures += 1;
        stats.consecutive_failures
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let stats = self.stats.read();
        NodeSnapshot {
            id: self.id,
            direction: self.direction,
            state: self.state(),
            latency_ms: stats.latency.map(|l| l.as_secs_f64() * 1000.0),
            last_heartbeat_unix_ms: stats.last_heartbeat.map(unix_millis),
            consecutive_failures: stats.consecutive_failures,
        }
    }

    /// Run one heartbeat round bounded by `timeout`, recording the sample on
    /// success. Failures are not counted here.
    pub async fn heartbeat(&self, timeout: Duration) -> Result<HeartbeatSample, HeartbeatError> {
        let session = self.session.as_ref().ok_or(HeartbeatError::NotOutbound)?;
        let sample = tokio::time::timeout(timeout, heartbeat_round(session))
            .await
            .map_err(|_| HeartbeatError::Timeout(timeout))??;
        self.record(sample);
        Ok(sample)
    }

    /// Probe the peer every interval until stopped, or until
    /// `max_failures` consecutive rounds fail, which takes the node offline.
    pub async fn run_heartbeat_loop(self: Arc<Self>, config: HeartbeatConfig, stop: CancellationToken) {
        debug!(peer = %self.id, "heartbeat loop started");
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = self.offline() => break,
                _ = tokio::time::sleep(config.interval) => {}
            }

            let round = tokio::select! {
                _ = stop.cancelled() => break,
                round = self.heartbeat(config.timeout) => round,
            };
            match round {
                Ok(sample) => {
                    debug!(peer = %self.id, latency = ?sample.latency, "heartbeat ok");
                }
                Err(e) => {
                    let failures = self.record_failure();
                    warn!(peer = %self.id, failures, "heartbeat failed: {}", e);
                    if failures >= config.max_failures {
                        if self.mark_offline() {
                            info!(peer = %self.id, "too many failed heartbeats, node offline");
                        }
                        break;
                    }
                }
            }
        }
        debug!(peer = %self.id, "heartbeat loop done");
    }

    /// Serve the peer's streams over `io` through `router` until the
    /// connection terminates
    pub async fn serve<S>(self: Arc<Self>, io: S, router: Arc<Router>) -> Result<(), MuxError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        mux::serve_connection(io, move |stream: ServerStream| {
            let node = Arc::clone(&self);
            let router = Arc::clone(&router);
            async move { router.dispatch(node, stream).await }
        })
        .await
    }
}

async fn heartbeat_round(session: &ClientSession) -> Result<HeartbeatSample, HeartbeatError> {
    let mut stream = session
        .open_stream(HEARTBEAT_PATH)
        .map_err(HeartbeatError::Open)?;
    let exchange = initiate_heartbeat(&mut stream).await;
    let closed = stream.close().await;
    match (exchange, closed) {
        (Ok(sample), Ok(())) => Ok(sample),
        (Ok(_), Err(close)) => Err(HeartbeatError::Close(close)),
        (Err(exchange), Ok(())) => Err(HeartbeatError::Exchange(exchange)),
        (Err(exchange), Err(close)) => Err(HeartbeatError::CloseAfter { exchange, close }),
    }
}

/// Probe side of the exchange: send `hello`, expect `hello2`, send `ok`.
///
/// Latency is half the time from sending `hello` to receiving `hello2`.
pub async fn initiate_heartbeat<S>(io: S) -> Result<HeartbeatSample, SeqError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sf = SeqFramer::new(Framer::new(io));
    let start = Instant::now();
    sf.send_frame(HELLO, "write hello").await;
    sf.expect_frame(HELLO2, "read hello2").await;
    let end = Instant::now();
    let at = SystemTime::now();
    sf.send_frame(OK, "write ok").await;
    sf.finish()?;

    Ok(HeartbeatSample {
        latency: end.duration_since(start) / 2,
        at,
    })
}

/// Answer side of the exchange: expect `hello`, send `hello2`, expect `ok`.
///
/// Latency is half the time from sending `hello2` to receiving `ok`.
pub async fn respond_heartbeat<S>(io: S) -> Result<HeartbeatSample, SeqError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut sf = SeqFramer::new(Framer::new(io));
    sf.expect_frame(HELLO, "read hello").await;
    let start = Instant::now();
    sf.send_frame(HELLO2, "write hello2").await;
    sf.expect_frame(OK, "read ok").await;
    sf.finish()?;

    let end = Instant::now();
    Ok(HeartbeatSample {
        latency: end.duration_since(start) / 2,
        at: SystemTime::now(),
    })
}
