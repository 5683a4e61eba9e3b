//! Peer identity

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Peer identifier: the remote socket address of the connection.
///
/// Two connections from the same host but different source ports are two
/// different peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub SocketAddr);

impl PeerId {
    pub fn addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for PeerId {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current wall-clock time in unix milliseconds
pub fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display_and_serde() {
        let id = PeerId::from("127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(id.to_string(), "127.0.0.1:7000");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"127.0.0.1:7000\"");
    }

    #[test]
    fn test_unix_millis_epoch() {
        assert_eq!(unix_millis(UNIX_EPOCH), 0);
        assert!(unix_millis(SystemTime::now()) > 0);
    }
}
