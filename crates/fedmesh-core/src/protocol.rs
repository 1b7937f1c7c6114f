//! Batch processing with dedup and partial-failure semantics
//!
//! A connection hands every aligned segment it receives to
//! [`CommunicationProtocol::process_message`]. Text segments are tokenized
//! once and consumed command by command; the first malformed command aborts
//! the rest of the batch, but commands already executed stay executed.

use crate::cache::MessageCache;
use crate::command::Command;
use crate::error::ProtocolError;
use crate::parse::parse_next;
use crate::types::DedupToken;
use crate::wire::{find_bytes, is_params_frame, PARAMS_HEADER, PARAMS_TRAILER};
use tracing::debug;

/// Result of processing one received segment
#[derive(Debug, Default)]
pub struct ProcessOutcome {
    /// Gossiped commands executed for the first time, with their encoded text
    pub executed: Vec<(DedupToken, Vec<u8>)>,
    /// Set when the batch stopped at a malformed or failing command
    pub error: Option<ProtocolError>,
}

impl ProcessOutcome {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    fn failed(mut self, error: ProtocolError) -> Self {
        self.error = Some(error);
        self
    }
}

/// Per-connection protocol state: the dedup cache for gossiped commands
pub struct CommunicationProtocol {
    cache: MessageCache,
}

impl CommunicationProtocol {
    /// Create a processor remembering up to `amount_last_messages_saved` tokens
    pub fn new(amount_last_messages_saved: usize) -> Self {
        Self {
            cache: MessageCache::new(amount_last_messages_saved),
        }
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Record tokens executed through another connection
    pub fn add_processed_messages<I>(&self, tokens: I)
    where
        I: IntoIterator<Item = DedupToken>,
    {
        self.cache.extend(tokens);
    }

    /// Parse and execute every command in `msg`.
    ///
    /// `exec` performs the side effect of one command. Gossiped commands whose
    /// token is already cached are skipped but still count as success.
    pub fn process_message<F>(&self, msg: &[u8], mut exec: F) -> ProcessOutcome
    where
        F: FnMut(Command) -> Result<(), ProtocolError>,
    {
        let outcome = ProcessOutcome::default();

        if is_params_frame(msg) {
            let body = &msg[PARAMS_HEADER.len()..];
            let command = match find_bytes(body, PARAMS_TRAILER) {
                Some(end) => Command::Params {
                    data: body[..end].to_vec(),
                    done: true,
                },
                None => Command::Params {
                    data: body.to_vec(),
                    done: false,
                },
            };
            return match exec(command) {
                Ok(()) => outcome,
                Err(e) => outcome.failed(e),
            };
        }

        let text = match std::str::from_utf8(msg) {
            Ok(text) => text,
            Err(_) => return outcome.failed(ProtocolError::InvalidUtf8),
        };
        let tokens: Vec<&str> = text.split_whitespace().collect();

        self.run_batch(&tokens, outcome, &mut exec)
    }

    fn run_batch<F>(&self, tokens: &[&str], mut outcome: ProcessOutcome, exec: &mut F) -> ProcessOutcome
    where
        F: FnMut(Command) -> Result<(), ProtocolError>,
    {
        let mut pos = 0;
        while pos < tokens.len() {
            let parsed = match parse_next(&tokens[pos..]) {
                Ok(parsed) => parsed,
                Err(e) => {
                    debug!("Batch aborted at token {}: {}", pos, e);
                    return outcome.failed(e);
                }
            };
            let encoded = format!("{}\n", tokens[pos..pos + parsed.consumed].join(" ")).into_bytes();
            pos += parsed.consumed;

            match parsed.token {
                Some(token) if self.cache.contains(&token) => {
                    debug!("Skipping already processed {} ({})", parsed.command.name(), token);
                }
                Some(token) => {
                    if let Err(e) = exec(parsed.command) {
                        return outcome.failed(e);
                    }
                    self.cache.insert(token.clone(), encoded.clone());
                    outcome.executed.push((token, encoded));
                }
                None => {
                    if let Err(e) = exec(parsed.command) {
                        return outcome.failed(e);
                    }
                }
            }
        }
        outcome
    }
}
