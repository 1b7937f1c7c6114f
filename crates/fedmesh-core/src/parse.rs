//! Tokenizer and command parsing for text batches

use crate::command::{Command, Handshake};
use crate::error::{ProtocolError, Result};
use crate::types::{DedupToken, NodeAddress, Role};
use crate::wire::headers::*;
use std::net::IpAddr;
use std::str::FromStr;

/// One command consumed from the front of a token stream
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedCommand {
    pub command: Command,
    /// Dedup token for gossiped commands
    pub token: Option<DedupToken>,
    /// Number of tokens the command occupied
    pub consumed: usize,
}

impl ParsedCommand {
    fn plain(command: Command, consumed: usize) -> Self {
        Self {
            command,
            token: None,
            consumed,
        }
    }

    fn hashed(command: Command, token: &str, consumed: usize) -> Self {
        Self {
            command,
            token: Some(DedupToken::from_wire(token)),
            consumed,
        }
    }
}

/// Parse the command at the front of `tokens`
pub fn parse_next(tokens: &[&str]) -> Result<ParsedCommand> {
    let header = match tokens.first() {
        Some(h) => *h,
        None => return Err(ProtocolError::UnknownCommand(String::new())),
    };

    match header {
        BEAT => {
            require(BEAT, tokens, 3)?;
            Ok(ParsedCommand::hashed(
                Command::Beat {
                    node: tokens[1].to_string(),
                },
                tokens[2],
                3,
            ))
        }
        ROLE => {
            require(ROLE, tokens, 4)?;
            let role: Role = tokens[2].parse()?;
            Ok(ParsedCommand::hashed(
                Command::Role {
                    node: tokens[1].to_string(),
                    role,
                },
                tokens[3],
                4,
            ))
        }
        STOP => Ok(ParsedCommand::plain(Command::Stop, 1)),
        CONNECT_TO => {
            require(CONNECT_TO, tokens, 3)?;
            let host: IpAddr = field(CONNECT_TO, "host", tokens[1])?;
            let port: u16 = field(CONNECT_TO, "port", tokens[2])?;
            Ok(ParsedCommand::plain(
                Command::ConnectTo {
                    addr: NodeAddress::new(host, port),
                },
                3,
            ))
        }
        START_LEARNING => {
            require(START_LEARNING, tokens, 4)?;
            let rounds = field(START_LEARNING, "rounds", tokens[1])?;
            let epochs = field(START_LEARNING, "epochs", tokens[2])?;
            Ok(ParsedCommand::hashed(
                Command::StartLearning { rounds, epochs },
                tokens[3],
                4,
            ))
        }
        STOP_LEARNING => {
            require(STOP_LEARNING, tokens, 2)?;
            Ok(ParsedCommand::hashed(Command::StopLearning, tokens[1], 2))
        }
        MODELS_READY => {
            require(MODELS_READY, tokens, 2)?;
            let round = field(MODELS_READY, "round", tokens[1])?;
            Ok(ParsedCommand::plain(Command::ModelsReady { round }, 2))
        }
        METRICS => {
            require(METRICS, tokens, 6)?;
            let round = field(METRICS, "round", tokens[2])?;
            let loss = field(METRICS, "loss", tokens[3])?;
            let metric = field(METRICS, "metric", tokens[4])?;
            Ok(ParsedCommand::hashed(
                Command::Metrics {
                    node: tokens[1].to_string(),
                    round,
                    loss,
                    metric,
                },
                tokens[5],
                6,
            ))
        }
        VOTE_TRAIN_SET => {
            let close = close_position(VOTE_TRAIN_SET, VOTE_TRAIN_SET_CLOSE, tokens)?;
            // header, voter, close and hash at minimum
            if close < 2 || tokens.len() < close + 2 {
                return Err(ProtocolError::MissingArguments {
                    command: VOTE_TRAIN_SET,
                    expected: (close + 2).max(4),
                    found: tokens.len(),
                });
            }
            let raw_votes = &tokens[2..close];
            if raw_votes.len() % 2 != 0 {
                return Err(ProtocolError::OddVoteList(raw_votes.len()));
            }
            let votes = raw_votes
                .chunks(2)
                .map(|pair| Ok((pair[0].to_string(), field::<i64>(VOTE_TRAIN_SET, "score", pair[1])?)))
                .collect::<Result<Vec<_>>>()?;

            Ok(ParsedCommand::hashed(
                Command::VoteTrainSet {
                    node: tokens[1].to_string(),
                    votes,
                },
                tokens[close + 1],
                close + 2,
            ))
        }
        MODELS_AGGREGATED => {
            let close = close_position(MODELS_AGGREGATED, MODELS_AGGREGATED_CLOSE, tokens)?;
            let nodes = tokens[1..close].iter().map(|n| n.to_string()).collect();
            Ok(ParsedCommand::plain(
                Command::ModelsAggregated { nodes },
                close + 1,
            ))
        }
        MODEL_INITIALIZED => Ok(ParsedCommand::plain(Command::ModelInitialized, 1)),
        TRANSFER_LEADERSHIP => Ok(ParsedCommand::plain(Command::TransferLeadership, 1)),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

/// Parse a `CONNECT <ip> <port> <full> <force>` handshake line
pub fn parse_handshake(line: &str) -> Result<Handshake> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return Err(ProtocolError::InvalidHandshake(line.trim().to_string()));
    }
    if tokens[0] != CONNECT {
        return Err(ProtocolError::InvalidHandshake(format!(
            "expected {CONNECT}, got {}",
            tokens[0]
        )));
    }
    let host: IpAddr = field(CONNECT, "host", tokens[1])?;
    let port: u16 = field(CONNECT, "port", tokens[2])?;

    Ok(Handshake {
        addr: NodeAddress::new(host, port),
        full: tokens[3] == "1",
        force: tokens[4] == "1",
    })
}

fn require(command: &'static str, tokens: &[&str], expected: usize) -> Result<()> {
    if tokens.len() < expected {
        return Err(ProtocolError::MissingArguments {
            command,
            expected,
            found: tokens.len(),
        });
    }
    Ok(())
}

fn field<T: FromStr>(command: &'static str, name: &'static str, value: &str) -> Result<T> {
    value.parse().map_err(|_| ProtocolError::InvalidField {
        command,
        field: name,
        value: value.to_string(),
    })
}

fn close_position(command: &'static str, close: &'static str, tokens: &[&str]) -> Result<usize> {
    tokens
        .iter()
        .position(|t| *t == close)
        .ok_or(ProtocolError::MissingCloseToken { command, close })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(s: &str) -> Vec<&str> {
        s.split_whitespace().collect()
    }

    #[test]
    fn test_parse_beat() {
        let parsed = parse_next(&tokens("BEAT 127.0.0.1:6000 abcd STOP")).unwrap();
        assert_eq!(parsed.consumed, 3);
        assert_eq!(parsed.token.unwrap().as_str(), "abcd");
        assert!(matches!(parsed.command, Command::Beat { node } if node == "127.0.0.1:6000"));
    }

    #[test]
    fn test_parse_metrics() {
        let parsed = parse_next(&tokens("METRICS n:1 3 0.25 0.9 ff")).unwrap();
        assert_eq!(
            parsed.command,
            Command::Metrics {
                node: "n:1".into(),
                round: 3,
                loss: 0.25,
                metric: 0.9
            }
        );
    }

    #[test]
    fn test_parse_vote_train_set() {
        let parsed =
            parse_next(&tokens("VOTE_TRAIN_SET a:1 b:2 7 c:3 1 \\VOTE_TRAIN_SET h1 BEAT")).unwrap();
        assert_eq!(parsed.consumed, 8);
        assert_eq!(
            parsed.command,
            Command::VoteTrainSet {
                node: "a:1".into(),
                votes: vec![("b:2".into(), 7), ("c:3".into(), 1)],
            }
        );
    }

    #[test]
    fn test_vote_train_set_odd_list() {
        let err = parse_next(&tokens("VOTE_TRAIN_SET a:1 b:2 \\VOTE_TRAIN_SET h1")).unwrap_err();
        assert_eq!(err, ProtocolError::OddVoteList(1));
    }

    #[test]
    fn test_vote_train_set_missing_hash() {
        assert!(parse_next(&tokens("VOTE_TRAIN_SET a:1 \\VOTE_TRAIN_SET")).is_err());
    }

    #[test]
    fn test_parse_models_aggregated() {
        let parsed = parse_next(&tokens("MODELS_AGGREGATED a:1 b:2 \\MODELS_AGGREGATED STOP")).unwrap();
        assert_eq!(parsed.consumed, 4);
        assert_eq!(
            parsed.command,
            Command::ModelsAggregated {
                nodes: vec!["a:1".into(), "b:2".into()]
            }
        );
        assert!(parse_next(&tokens("MODELS_AGGREGATED a:1")).is_err());
    }

    #[test]
    fn test_non_numeric_fields() {
        assert!(matches!(
            parse_next(&tokens("START_LEARNING ten 1 h")),
            Err(ProtocolError::InvalidField { field: "rounds", .. })
        ));
        assert!(parse_next(&tokens("CONNECT_TO 10.0.0.1 port")).is_err());
        assert!(parse_next(&tokens("MODELS_READY -1")).is_err());
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            parse_next(&tokens("HELLO")).unwrap_err(),
            ProtocolError::UnknownCommand("HELLO".into())
        );
    }

    #[test]
    fn test_parse_handshake() {
        let hs = parse_handshake("CONNECT 127.0.0.1 6001 1 0\n").unwrap();
        assert_eq!(hs.addr.to_string(), "127.0.0.1:6001");
        assert!(hs.full);
        assert!(!hs.force);

        assert!(parse_handshake("CONNECT 127.0.0.1 6001").is_err());
        assert!(parse_handshake("BEAT 127.0.0.1 6001 1 0").is_err());
        assert!(parse_handshake("CONNECT localhost 6001 1 0").is_err());
    }
}
