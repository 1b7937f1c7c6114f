//! Typed protocol commands
//!
//! Every message a connection can receive after the handshake parses into one
//! [`Command`]. Handlers match on the variant instead of looking up a handler
//! object by header string.

use crate::types::{NodeAddress, Role};

/// A parsed protocol command with typed arguments
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Liveness announcement of `node` (gossiped)
    Beat { node: String },
    /// Role announcement of `node` (gossiped)
    Role { node: String, role: Role },
    /// Peer is closing the connection
    Stop,
    /// Instruction to dial another node
    ConnectTo { addr: NodeAddress },
    /// Start a training run (gossiped)
    StartLearning { rounds: u32, epochs: u32 },
    /// Abort the training run (gossiped)
    StopLearning,
    /// One fragment of serialized model parameters; `done` marks the last one
    Params { data: Vec<u8>, done: bool },
    /// Peer finished the given round
    ModelsReady { round: u32 },
    /// Evaluation metrics of `node` for a round (gossiped)
    Metrics {
        node: String,
        round: u32,
        loss: f64,
        metric: f64,
    },
    /// Train-set votes cast by `node` (gossiped)
    VoteTrainSet {
        node: String,
        votes: Vec<(String, i64)>,
    },
    /// Contributors already folded into the peer's aggregate
    ModelsAggregated { nodes: Vec<String> },
    /// Peer has an initialized model
    ModelInitialized,
    /// Peer hands the aggregator role to us
    TransferLeadership,
}

impl Command {
    /// Wire header of this command
    pub fn name(&self) -> &'static str {
        use crate::wire::headers::*;
        match self {
            Command::Beat { .. } => BEAT,
            Command::Role { .. } => ROLE,
            Command::Stop => STOP,
            Command::ConnectTo { .. } => CONNECT_TO,
            Command::StartLearning { .. } => START_LEARNING,
            Command::StopLearning => STOP_LEARNING,
            Command::Params { .. } => PARAMS,
            Command::ModelsReady { .. } => MODELS_READY,
            Command::Metrics { .. } => METRICS,
            Command::VoteTrainSet { .. } => VOTE_TRAIN_SET,
            Command::ModelsAggregated { .. } => MODELS_AGGREGATED,
            Command::ModelInitialized => MODEL_INITIALIZED,
            Command::TransferLeadership => TRANSFER_LEADERSHIP,
        }
    }

    /// Whether the command carries a dedup token and is flooded network-wide
    pub fn is_gossiped(&self) -> bool {
        matches!(
            self,
            Command::Beat { .. }
                | Command::Role { .. }
                | Command::StartLearning { .. }
                | Command::StopLearning
                | Command::Metrics { .. }
                | Command::VoteTrainSet { .. }
        )
    }
}

/// Decoded `CONNECT` handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Handshake {
    /// Address the requester listens on
    pub addr: NodeAddress,
    /// Ask the acceptor to introduce the requester to all its neighbors
    pub full: bool,
    /// Keep the connection alive even if it would otherwise be pruned
    pub force: bool,
}
