//! fedmesh Core Library
//!
//! This crate provides the wire protocol shared by every fedmesh node: the
//! hybrid line/binary message format, the typed command set, and the bounded
//! dedup cache that keeps gossiped commands idempotent.
//!
//! # Modules
//!
//! - [`types`]: Node addresses, roles and dedup tokens
//! - [`command`]: Typed protocol commands
//! - [`wire`]: Message builders, frame detectors and PARAMS fragmentation
//! - [`parse`]: Tokenizer and per-command argument parsing
//! - [`protocol`]: Batch processing with dedup and partial-failure semantics
//! - [`cache`]: Bounded recent-message cache
//! - [`error`]: Error types

pub mod cache;
pub mod command;
pub mod error;
pub mod parse;
pub mod protocol;
pub mod types;
pub mod wire;

pub use cache::MessageCache;
pub use command::{Command, Handshake};
pub use error::{ProtocolError, Result};
pub use protocol::{CommunicationProtocol, ProcessOutcome};
pub use types::*;
pub use wire::WireMessage;
