//! Networking primitives for the meshlink overlay
//!
//! This crate provides:
//! - Varint length-prefixed framing
//! - A short-circuiting send/expect helper for scripted exchanges
//! - Shared-secret authenticated encryption of a connection
//! - HTTP/2 stream multiplexing over one connection

pub mod crypto;
pub mod framing;
pub mod mux;
pub mod peer;
pub mod seq;
pub mod transport;

pub use crypto::{CryptoError, SharedSecret, SECRET_LEN};
pub use framing::{FrameError, Framer, VarintCodec};
pub use mux::{ClientSession, ClientStream, MuxError, ServerStream, SessionDriver};
pub use peer::PeerId;
pub use seq::{SeqError, SeqFramer};
pub use transport::{wrap, EncryptedStream, TransportError};
