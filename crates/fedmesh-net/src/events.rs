//! Events emitted by connections
//!
//! Connections never call back into the node. They push [`ConnectionEvent`]s
//! onto a channel that the node drains in a single handler.

use fedmesh_core::{DedupToken, NodeAddress, Role};

/// Event from a connection to the owning node
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    /// Receive loop exited; the connection must be dropped
    Ended { addr: NodeAddress, id: u64 },
    /// `BEAT` from `node`
    BeatReceived { node: String },
    /// `ROLE` announcement
    RoleReceived { node: String, role: Role },
    /// Peer asked us to dial `addr`
    ConnectTo { addr: NodeAddress },
    /// Gossiped commands executed for the first time on this connection
    MessagesProcessed {
        from: NodeAddress,
        executed: Vec<(DedupToken, Vec<u8>)>,
    },
    /// Peer handed us the aggregator role
    TransferLeadership { from: NodeAddress },
    /// Training-related command for the orchestration layer
    Learning(LearningEvent),
}

/// Event delivered to the training orchestration layer
#[derive(Clone, Debug, PartialEq)]
pub enum LearningEvent {
    StartLearning {
        rounds: u32,
        epochs: u32,
    },
    StopLearning,
    /// A complete reassembled parameter payload
    Params {
        from: NodeAddress,
        data: Vec<u8>,
    },
    ModelsReady {
        from: NodeAddress,
        round: u32,
    },
    Metrics {
        node: String,
        round: u32,
        loss: f64,
        metric: f64,
    },
    VoteTrainSet {
        node: String,
        votes: Vec<(String, i64)>,
    },
    ModelsAggregated {
        from: NodeAddress,
        nodes: Vec<String>,
    },
    ModelInitialized {
        from: NodeAddress,
    },
    TransferLeadership {
        from: NodeAddress,
    },
    Role {
        node: String,
        role: Role,
    },
    /// Periodic snapshot of the local node
    StatusReport {
        name: String,
        role: Role,
        neighbors: Vec<NodeAddress>,
        network_nodes: Vec<String>,
    },
}
