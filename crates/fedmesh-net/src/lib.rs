//! Networking primitives for fedmesh peers
//!
//! This crate provides:
//! - The cipher capability (X25519 key agreement, block-aligned session cipher)
//! - The connection handshake and reachability probe
//! - A stream decoder for partial and collapsed reads
//! - Per-neighbor connections with a receive task and a queued writer task

pub mod connection;
pub mod crypto;
pub mod events;
pub mod framing;
pub mod handshake;

pub use connection::{Connection, ConnectionError, ConnectionSettings, ConnectionState, ConnectionTasks};
pub use crypto::{CryptoError, KeyExchange, SessionCipher, Side, SymmetricCipher};
pub use events::{ConnectionEvent, LearningEvent};
pub use framing::{FrameAligner, FrameError, Segment};
pub use handshake::{Established, HandshakeError, HandshakeStream};
