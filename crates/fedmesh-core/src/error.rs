//! Error types for the fedmesh wire protocol

use thiserror::Error;

/// Result type alias using [`ProtocolError`]
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Protocol violations and codec failures
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// Header token that names no known command
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Command ran out of tokens before its fixed arity was satisfied
    #[error("{command}: expected {expected} tokens, found {found}")]
    MissingArguments {
        command: &'static str,
        expected: usize,
        found: usize,
    },

    /// A field did not parse into its typed value
    #[error("{command}: invalid {field} {value:?}")]
    InvalidField {
        command: &'static str,
        field: &'static str,
        value: String,
    },

    /// Variable-length command without its close token
    #[error("{command}: missing close token {close}")]
    MissingCloseToken {
        command: &'static str,
        close: &'static str,
    },

    /// Vote list that does not alternate node/score
    #[error("vote list has odd length {0}")]
    OddVoteList(usize),

    /// Text batch that is not valid UTF-8
    #[error("message is not valid utf-8")]
    InvalidUtf8,

    /// Malformed CONNECT handshake line
    #[error("invalid handshake: {0}")]
    InvalidHandshake(String),

    /// Block size too small to carry a PARAMS header and trailer
    #[error("block size {0} cannot hold a PARAMS frame")]
    BlockTooSmall(usize),

    /// Command side effect failed
    #[error("command execution failed: {0}")]
    Execution(String),
}
