//! meshlinkd - meshlink peer daemon
//!
//! This daemon provides:
//! - Encrypted, multiplexed links to a static set of peers
//! - Heartbeat liveness and latency tracking per peer
//! - Path-routed request streams
//! - A live peer table

pub mod config;
pub mod dispatch;
pub mod node;
pub mod server;
pub mod table;

pub use config::{Cli, Config};
pub use dispatch::Router;
pub use node::Node;
pub use server::Server;
pub use table::PeerTable;
