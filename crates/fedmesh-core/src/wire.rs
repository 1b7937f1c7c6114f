//! Wire format for the fedmesh control plane
//!
//! Text messages are space-delimited ASCII tokens terminated by `\n`.
//! Gossiped messages end with a [`DedupToken`]. `PARAMS` is the single binary
//! message: it carries raw model bytes and is always sent as fixed
//! `block_size` frames.
//!
//! ```text
//! CONNECT <ip> <port> <full:0|1> <force:0|1>
//! CONNECT_TO <ip> <port>
//! STOP
//! BEAT <node> <hash>
//! ROLE <node> <role> <hash>
//! START_LEARNING <rounds> <epochs> <hash>
//! STOP_LEARNING <hash>
//! MODELS_READY <round>
//! METRICS <node> <round> <loss> <metric> <hash>
//! VOTE_TRAIN_SET <node> (<node> <score>)* \VOTE_TRAIN_SET <hash>
//! MODELS_AGGREGATED <node>* \MODELS_AGGREGATED
//! MODEL_INITIALIZED
//! TRANSFER_LEADERSHIP
//! PARAMS<raw bytes>[\PARAMS][zero padding to block size]
//! ```

use crate::error::{ProtocolError, Result};
use crate::types::{DedupToken, NodeAddress, Role};

/// Command header tokens
pub mod headers {
    pub const BEAT: &str = "BEAT";
    pub const ROLE: &str = "ROLE";
    pub const STOP: &str = "STOP";
    pub const CONNECT: &str = "CONNECT";
    pub const CONNECT_TO: &str = "CONNECT_TO";
    pub const START_LEARNING: &str = "START_LEARNING";
    pub const STOP_LEARNING: &str = "STOP_LEARNING";
    pub const PARAMS: &str = "PARAMS";
    pub const MODELS_READY: &str = "MODELS_READY";
    pub const METRICS: &str = "METRICS";
    pub const VOTE_TRAIN_SET: &str = "VOTE_TRAIN_SET";
    pub const VOTE_TRAIN_SET_CLOSE: &str = "\\VOTE_TRAIN_SET";
    pub const MODELS_AGGREGATED: &str = "MODELS_AGGREGATED";
    pub const MODELS_AGGREGATED_CLOSE: &str = "\\MODELS_AGGREGATED";
    pub const MODEL_INITIALIZED: &str = "MODEL_INITIALIZED";
    pub const TRANSFER_LEADERSHIP: &str = "TRANSFER_LEADERSHIP";
}

/// Leading bytes of every binary frame
pub const PARAMS_HEADER: &[u8] = b"PARAMS";

/// Marks the frame carrying the last payload bytes
pub const PARAMS_TRAILER: &[u8] = b"\\PARAMS";

/// Encoded message ready to be sent
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    /// Dedup token for gossiped messages
    pub token: Option<DedupToken>,
    /// Encoded bytes including the trailing newline
    pub bytes: Vec<u8>,
}

impl WireMessage {
    fn plain(body: String) -> Self {
        Self {
            token: None,
            bytes: format!("{body}\n").into_bytes(),
        }
    }

    fn hashed(body: String) -> Self {
        let token = DedupToken::generate(&body);
        let bytes = format!("{body} {token}\n").into_bytes();
        Self {
            token: Some(token),
            bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

/// `CONNECT` handshake line. Never hashed, never encrypted.
pub fn build_connect(addr: &NodeAddress, full: bool, force: bool) -> WireMessage {
    WireMessage::plain(format!(
        "{} {} {} {} {}",
        headers::CONNECT,
        addr.host,
        addr.port,
        u8::from(full),
        u8::from(force)
    ))
}

pub fn build_connect_to(addr: &NodeAddress) -> WireMessage {
    WireMessage::plain(format!("{} {} {}", headers::CONNECT_TO, addr.host, addr.port))
}

pub fn build_stop() -> WireMessage {
    WireMessage::plain(headers::STOP.to_string())
}

pub fn build_beat(node: &str) -> WireMessage {
    WireMessage::hashed(format!("{} {}", headers::BEAT, node))
}

pub fn build_role(node: &str, role: Role) -> WireMessage {
    WireMessage::hashed(format!("{} {} {}", headers::ROLE, node, role))
}

pub fn build_start_learning(rounds: u32, epochs: u32) -> WireMessage {
    WireMessage::hashed(format!("{} {} {}", headers::START_LEARNING, rounds, epochs))
}

pub fn build_stop_learning() -> WireMessage {
    WireMessage::hashed(headers::STOP_LEARNING.to_string())
}

pub fn build_models_ready(round: u32) -> WireMessage {
    WireMessage::plain(format!("{} {}", headers::MODELS_READY, round))
}

pub fn build_metrics(node: &str, round: u32, loss: f64, metric: f64) -> WireMessage {
    WireMessage::hashed(format!(
        "{} {} {} {} {}",
        headers::METRICS,
        node,
        round,
        loss,
        metric
    ))
}

pub fn build_vote_train_set(node: &str, votes: &[(String, i64)]) -> WireMessage {
    let mut body = format!("{} {}", headers::VOTE_TRAIN_SET, node);
    for (candidate, score) in votes {
        body.push_str(&format!(" {candidate} {score}"));
    }
    body.push(' ');
    body.push_str(headers::VOTE_TRAIN_SET_CLOSE);
    WireMessage::hashed(body)
}

pub fn build_models_aggregated(nodes: &[String]) -> WireMessage {
    let mut body = headers::MODELS_AGGREGATED.to_string();
    for node in nodes {
        body.push(' ');
        body.push_str(node);
    }
    body.push(' ');
    body.push_str(headers::MODELS_AGGREGATED_CLOSE);
    WireMessage::plain(body)
}

pub fn build_model_initialized() -> WireMessage {
    WireMessage::plain(headers::MODEL_INITIALIZED.to_string())
}

pub fn build_transfer_leadership() -> WireMessage {
    WireMessage::plain(headers::TRANSFER_LEADERSHIP.to_string())
}

/// Split a binary payload into `PARAMS` frames of exactly `block_size` bytes.
///
/// Each frame starts with [`PARAMS_HEADER`]. The frame carrying the last
/// payload bytes ends with [`PARAMS_TRAILER`] and zero padding. When the
/// trailer does not fit, it travels in an extra header+trailer frame, padded
/// the same way so every binary frame on the wire has the same length.
pub fn build_params(data: &[u8], block_size: usize) -> Result<Vec<Vec<u8>>> {
    if block_size < PARAMS_HEADER.len() + PARAMS_TRAILER.len() + 1 {
        return Err(ProtocolError::BlockTooSmall(block_size));
    }
    let chunk_size = block_size - PARAMS_HEADER.len();

    let mut frames: Vec<Vec<u8>> = data
        .chunks(chunk_size)
        .map(|chunk| {
            let mut frame = Vec::with_capacity(block_size);
            frame.extend_from_slice(PARAMS_HEADER);
            frame.extend_from_slice(chunk);
            frame
        })
        .collect();

    match frames.last_mut() {
        Some(last) if last.len() + PARAMS_TRAILER.len() <= block_size => {
            last.extend_from_slice(PARAMS_TRAILER);
            last.resize(block_size, 0);
        }
        _ => {
            let mut closing = Vec::with_capacity(block_size);
            closing.extend_from_slice(PARAMS_HEADER);
            closing.extend_from_slice(PARAMS_TRAILER);
            closing.resize(block_size, 0);
            frames.push(closing);
        }
    }

    Ok(frames)
}

// =============================================================================
// FRAME DETECTORS
// =============================================================================

/// Position of `needle` inside `haystack`
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Whether the buffer begins with a binary frame
pub fn is_params_frame(buf: &[u8]) -> bool {
    buf.starts_with(PARAMS_HEADER)
}

/// Offset of a `PARAMS` header that follows text in the same buffer.
///
/// A non-zero result means a text message and a binary frame collapsed into
/// one read and must be split at the returned offset. Returns 0 when the
/// buffer starts with the header or contains none.
pub fn check_collapse(buf: &[u8]) -> usize {
    if is_params_frame(buf) {
        return 0;
    }
    find_bytes(buf, PARAMS_HEADER).unwrap_or(0)
}

/// Bytes still owed before a binary frame reaches `block_size`.
///
/// Returns 0 for text buffers and for complete frames.
pub fn check_params_incomplete(buf: &[u8], block_size: usize) -> usize {
    if is_params_frame(buf) && buf.len() < block_size {
        block_size - buf.len()
    } else {
        0
    }
}
