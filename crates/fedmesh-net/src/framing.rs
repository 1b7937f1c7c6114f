//! Frame alignment for the hybrid text/binary stream
//!
//! TCP reads do not respect message boundaries. A read may end mid-line, end
//! mid-PARAMS-frame, or carry a text message immediately followed by a binary
//! frame. [`FrameAligner`] buffers plaintext and hands out only complete
//! segments: newline-terminated text or whole `block_size` PARAMS frames.

use crate::crypto::{CryptoError, SymmetricCipher};
use bytes::BytesMut;
use fedmesh_core::wire::{check_collapse, check_params_incomplete, is_params_frame, PARAMS_HEADER};
use thiserror::Error;
use tokio_util::codec::Decoder;
use tracing::debug;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A complete unit ready for the protocol processor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Segment {
    /// One or more newline-terminated commands
    Text(Vec<u8>),
    /// One binary frame of exactly `block_size` bytes
    Params(Vec<u8>),
}

impl Segment {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Segment::Text(b) | Segment::Params(b) => b,
        }
    }
}

/// Stream decoder for one connection.
///
/// With a cipher, only whole cipher blocks are taken from the read buffer and
/// decrypted; the unaligned tail waits for the next read.
pub struct FrameAligner {
    block_size: usize,
    cipher: Option<Box<dyn SymmetricCipher>>,
    /// Plaintext not yet emitted
    pending: BytesMut,
}

impl FrameAligner {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            cipher: None,
            pending: BytesMut::with_capacity(block_size),
        }
    }

    pub fn with_cipher(block_size: usize, cipher: Box<dyn SymmetricCipher>) -> Self {
        Self {
            cipher: Some(cipher),
            ..Self::new(block_size)
        }
    }

    /// Bytes still missing from a partially received PARAMS frame
    pub fn bytes_owed(&self) -> usize {
        check_params_incomplete(&self.pending, self.block_size)
    }

    /// Plaintext buffered but not yet emitted
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn next_segment(&mut self) -> Option<Segment> {
        loop {
            if self.pending.is_empty() {
                return None;
            }

            if is_params_frame(&self.pending) {
                if self.pending.len() < self.block_size {
                    return None;
                }
                let frame = self.pending.split_to(self.block_size);
                return Some(Segment::Params(frame.to_vec()));
            }

            if PARAMS_HEADER.starts_with(&self.pending) {
                // could still become a PARAMS header
                return None;
            }

            let collapse = check_collapse(&self.pending);
            let limit = if collapse > 0 {
                debug!("Text and PARAMS collapsed in one read at offset {}", collapse);
                collapse
            } else {
                self.pending.len()
            };

            let cut = match self.pending[..limit].iter().rposition(|b| *b == b'\n') {
                Some(nl) => nl + 1,
                None if collapse > 0 => collapse,
                None => {
                    if is_filler(&self.pending) {
                        self.pending.clear();
                    }
                    return None;
                }
            };

            let text = self.pending.split_to(cut);
            if !is_filler(&text) {
                return Some(Segment::Text(text.to_vec()));
            }
        }
    }
}

impl Decoder for FrameAligner {
    type Item = Segment;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Segment>, FrameError> {
        match self.cipher.as_mut() {
            Some(cipher) => {
                let aligned = src.len() - src.len() % cipher.block_size();
                if aligned > 0 {
                    let mut blocks = src.split_to(aligned);
                    cipher.decrypt(&mut blocks)?;
                    self.pending.extend_from_slice(&blocks);
                }
            }
            None => {
                if !src.is_empty() {
                    let chunk = src.split();
                    self.pending.extend_from_slice(&chunk);
                }
            }
        }
        Ok(self.next_segment())
    }
}

/// Cipher padding and frame zero fill carry no commands
fn is_filler(buf: &[u8]) -> bool {
    buf.iter().all(|b| b.is_ascii_whitespace() || *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SessionCipher, Side};
    use fedmesh_core::wire::build_params;

    const BLOCK: usize = 64;

    /// Feed one read and collect every segment it completes
    fn feed(aligner: &mut FrameAligner, buf: &mut BytesMut, read: &[u8]) -> Vec<Segment> {
        buf.extend_from_slice(read);
        let mut out = Vec::new();
        while let Some(segment) = aligner.decode(buf).unwrap() {
            out.push(segment);
        }
        out
    }

    #[test]
    fn test_text_split_across_reads() {
        let mut aligner = FrameAligner::new(BLOCK);
        let mut buf = BytesMut::new();
        assert!(feed(&mut aligner, &mut buf, b"BEAT 127.0.0.1:6000 ab").is_empty());
        assert_eq!(aligner.buffered(), 22);

        let out = feed(&mut aligner, &mut buf, b"cd\nSTOP\nMODELS_");
        assert_eq!(out, vec![Segment::Text(b"BEAT 127.0.0.1:6000 abcd\nSTOP\n".to_vec())]);
        assert_eq!(aligner.buffered(), 7);
    }

    #[test]
    fn test_params_frame_waits_for_full_block() {
        let mut aligner = FrameAligner::new(BLOCK);
        let mut buf = BytesMut::new();
        let frame = build_params(&[5u8; 20], BLOCK).unwrap().remove(0);

        assert!(feed(&mut aligner, &mut buf, &frame[..30]).is_empty());
        assert_eq!(aligner.bytes_owed(), BLOCK - 30);

        let out = feed(&mut aligner, &mut buf, &frame[30..]);
        assert_eq!(out, vec![Segment::Params(frame)]);
        assert_eq!(aligner.bytes_owed(), 0);
    }

    #[test]
    fn test_collapsed_text_and_params() {
        let mut aligner = FrameAligner::new(BLOCK);
        let mut buf = BytesMut::new();
        let frame = build_params(b"weights", BLOCK).unwrap().remove(0);

        let mut read = b"MODELS_READY 3\n".to_vec();
        read.extend_from_slice(&frame);
        read.extend_from_slice(b"STOP\n");

        let out = feed(&mut aligner, &mut buf, &read);
        assert_eq!(
            out,
            vec![
                Segment::Text(b"MODELS_READY 3\n".to_vec()),
                Segment::Params(frame),
                Segment::Text(b"STOP\n".to_vec()),
            ]
        );
    }

    #[test]
    fn test_partial_header_is_kept() {
        let mut aligner = FrameAligner::new(BLOCK);
        let mut buf = BytesMut::new();
        assert!(feed(&mut aligner, &mut buf, b"PAR").is_empty());
        assert_eq!(aligner.buffered(), 3);

        let mut rest = b"AMS".to_vec();
        rest.resize(BLOCK - 3, 1);
        let out = feed(&mut aligner, &mut buf, &rest);
        assert!(matches!(&out[..], [Segment::Params(f)] if f.len() == BLOCK));
    }

    #[test]
    fn test_padding_is_discarded() {
        let mut aligner = FrameAligner::new(BLOCK);
        let mut buf = BytesMut::new();
        let out = feed(&mut aligner, &mut buf, b"STOP\n           ");
        assert_eq!(out, vec![Segment::Text(b"STOP\n".to_vec())]);
        assert_eq!(aligner.buffered(), 0);

        // padding between a text message and a following frame
        let frame = build_params(b"x", BLOCK).unwrap().remove(0);
        let mut read = b"STOP\n   ".to_vec();
        read.extend_from_slice(&frame);
        let out = feed(&mut aligner, &mut buf, &read);
        assert_eq!(out, vec![Segment::Text(b"STOP\n".to_vec()), Segment::Params(frame)]);
    }

    #[test]
    fn test_ciphertext_decrypted_in_whole_blocks() {
        let key = [9u8; 32];
        let mut sender = SessionCipher::new(&key, Side::Dialer).unwrap().outbound;
        let receiver = SessionCipher::new(&key, Side::Acceptor).unwrap().inbound;
        let mut aligner = FrameAligner::with_cipher(BLOCK, receiver);
        let mut buf = BytesMut::new();

        let mut wire = b"MODELS_READY 7\n".to_vec();
        wire.resize(32, b' ');
        sender.encrypt(&mut wire).unwrap();

        // 20 bytes: one whole block decrypts, 4 bytes wait
        assert!(feed(&mut aligner, &mut buf, &wire[..20]).is_empty());
        assert_eq!(buf.len(), 4);
        assert_eq!(aligner.buffered(), 16);

        let out = feed(&mut aligner, &mut buf, &wire[20..]);
        assert_eq!(out, vec![Segment::Text(b"MODELS_READY 7\n".to_vec())]);
        assert!(buf.is_empty());
    }
}
