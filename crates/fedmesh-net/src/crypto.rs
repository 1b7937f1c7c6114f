//! Cipher capability for peer connections
//!
//! Key agreement is X25519. Public keys travel as base64 of their DER
//! SubjectPublicKeyInfo. The acceptor picks a fresh 32-byte session key and
//! sends it wrapped with ChaCha20-Poly1305 under a key derived (HKDF-SHA256)
//! from the agreement. After the handshake each direction runs its own
//! ChaCha20 keystream over 16-byte aligned blocks.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{EphemeralSecret, PublicKey};

/// Alignment required by the session cipher
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Length of the session key chosen by the acceptor
pub const SESSION_KEY_LEN: usize = 32;

/// Session key plus Poly1305 tag as sent during the handshake
pub const WRAPPED_KEY_LEN: usize = SESSION_KEY_LEN + 16;

/// DER SubjectPublicKeyInfo prefix for an X25519 key (OID 1.3.101.110)
const X25519_SPKI_PREFIX: [u8; 12] = [
    0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x6e, 0x03, 0x21, 0x00,
];

const KEY_WRAP_INFO: &[u8] = b"fedmesh key wrap v1";
const ACCEPTOR_TO_DIALER: [u8; 12] = *b"fedmesh-a2d\0";
const DIALER_TO_ACCEPTOR: [u8; 12] = *b"fedmesh-d2a\0";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Malformed public key: {0}")]
    MalformedPublicKey(String),
    #[error("Input of {0} bytes is not block aligned")]
    Unaligned(usize),
    #[error("Key wrap failed")]
    WrapFailed,
    #[error("Key unwrap failed")]
    UnwrapFailed,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
}

/// Symmetric cipher operating in place on block-aligned buffers
pub trait SymmetricCipher: Send {
    /// Required input alignment in bytes
    fn block_size(&self) -> usize;

    fn encrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError>;

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError>;
}

/// ChaCha20 keystream restricted to whole 16-byte blocks
pub struct ChaChaBlockCipher {
    stream: ChaCha20,
}

impl ChaChaBlockCipher {
    pub fn new(key: &[u8; SESSION_KEY_LEN], nonce: &[u8; 12]) -> Result<Self, CryptoError> {
        let stream =
            ChaCha20::new_from_slices(key, nonce).map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self { stream })
    }

    fn apply(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        if buf.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(CryptoError::Unaligned(buf.len()));
        }
        self.stream.apply_keystream(buf);
        Ok(())
    }
}

impl SymmetricCipher for ChaChaBlockCipher {
    fn block_size(&self) -> usize {
        CIPHER_BLOCK_SIZE
    }

    fn encrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.apply(buf)
    }

    fn decrypt(&mut self, buf: &mut [u8]) -> Result<(), CryptoError> {
        self.apply(buf)
    }
}

/// Which end of the handshake this side played
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Acceptor,
    Dialer,
}

/// Pair of directional ciphers for one connection
pub struct SessionCipher {
    pub outbound: Box<dyn SymmetricCipher>,
    pub inbound: Box<dyn SymmetricCipher>,
}

impl SessionCipher {
    /// Build both directions from the shared session key
    pub fn new(key: &[u8; SESSION_KEY_LEN], side: Side) -> Result<Self, CryptoError> {
        let (out_nonce, in_nonce) = match side {
            Side::Acceptor => (ACCEPTOR_TO_DIALER, DIALER_TO_ACCEPTOR),
            Side::Dialer => (DIALER_TO_ACCEPTOR, ACCEPTOR_TO_DIALER),
        };
        Ok(Self {
            outbound: Box::new(ChaChaBlockCipher::new(key, &out_nonce)?),
            inbound: Box::new(ChaChaBlockCipher::new(key, &in_nonce)?),
        })
    }

    pub fn split(self) -> (Box<dyn SymmetricCipher>, Box<dyn SymmetricCipher>) {
        (self.outbound, self.inbound)
    }
}

/// Space-pad `buf` up to a multiple of `block`
pub fn add_padding(buf: &mut Vec<u8>, block: usize) {
    let rem = buf.len() % block;
    if rem != 0 {
        buf.resize(buf.len() + block - rem, b' ');
    }
}

/// Fresh random session key
pub fn generate_session_key() -> [u8; SESSION_KEY_LEN] {
    let mut key = [0u8; SESSION_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    key
}

/// X25519 ephemeral key exchange
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: PublicKey,
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Our public key as base64 DER, the form sent on the wire
    pub fn public_key_der_base64(&self) -> String {
        let mut der = Vec::with_capacity(X25519_SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&X25519_SPKI_PREFIX);
        der.extend_from_slice(self.public.as_bytes());
        STANDARD.encode(der)
    }

    /// Decode a peer public key received on the wire
    pub fn decode_public_key(encoded: &str) -> Result<PublicKey, CryptoError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::MalformedPublicKey(e.to_string()))?;
        if der.len() != X25519_SPKI_PREFIX.len() + 32 || !der.starts_with(&X25519_SPKI_PREFIX) {
            return Err(CryptoError::MalformedPublicKey(format!(
                "unexpected DER of {} bytes",
                der.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&der[X25519_SPKI_PREFIX.len()..]);
        Ok(PublicKey::from(key))
    }

    /// Agree with `peer` and encrypt `session_key` for it (acceptor side)
    pub fn wrap_key(
        self,
        peer: &PublicKey,
        session_key: &[u8; SESSION_KEY_LEN],
    ) -> Result<[u8; WRAPPED_KEY_LEN], CryptoError> {
        let aead = self.key_wrap_cipher(peer)?;
        let sealed = aead
            .encrypt(Nonce::from_slice(&[0u8; 12]), session_key.as_slice())
            .map_err(|_| CryptoError::WrapFailed)?;

        let mut wrapped = [0u8; WRAPPED_KEY_LEN];
        if sealed.len() != WRAPPED_KEY_LEN {
            return Err(CryptoError::WrapFailed);
        }
        wrapped.copy_from_slice(&sealed);
        Ok(wrapped)
    }

    /// Agree with `peer` and recover the session key it sent (dialer side)
    pub fn unwrap_key(
        self,
        peer: &PublicKey,
        wrapped: &[u8],
    ) -> Result<[u8; SESSION_KEY_LEN], CryptoError> {
        let aead = self.key_wrap_cipher(peer)?;
        let opened = aead
            .decrypt(Nonce::from_slice(&[0u8; 12]), wrapped)
            .map_err(|_| CryptoError::UnwrapFailed)?;

        if opened.len() != SESSION_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength);
        }
        let mut key = [0u8; SESSION_KEY_LEN];
        key.copy_from_slice(&opened);
        Ok(key)
    }

    // The wrap key is single use, so a fixed nonce is fine
    fn key_wrap_cipher(self, peer: &PublicKey) -> Result<ChaCha20Poly1305, CryptoError> {
        let shared = self.secret.diffie_hellman(peer);
        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut wrap_key = [0u8; 32];
        hkdf.expand(KEY_WRAP_INFO, &mut wrap_key)
            .map_err(|_| CryptoError::KeyDerivationFailed)?;
        ChaCha20Poly1305::new_from_slice(&wrap_key).map_err(|_| CryptoError::InvalidKeyLength)
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_encoding() {
        let kx = KeyExchange::new();
        let encoded = kx.public_key_der_base64();
        assert_eq!(encoded.len(), 60);

        let decoded = KeyExchange::decode_public_key(&encoded).unwrap();
        assert_eq!(decoded.as_bytes(), kx.public.as_bytes());
        assert!(KeyExchange::decode_public_key("not base64!").is_err());
        assert!(KeyExchange::decode_public_key(&STANDARD.encode([0u8; 44])).is_err());
    }

    #[test]
    fn test_key_wrap_unwrap() {
        let acceptor = KeyExchange::new();
        let dialer = KeyExchange::new();
        let acceptor_pub = acceptor.public;
        let dialer_pub = dialer.public;

        let key = generate_session_key();
        let wrapped = acceptor.wrap_key(&dialer_pub, &key).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);

        let recovered = dialer.unwrap_key(&acceptor_pub, &wrapped).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let acceptor = KeyExchange::new();
        let dialer = KeyExchange::new();
        let stranger = KeyExchange::new();
        let dialer_pub = dialer.public;
        let stranger_pub = stranger.public;

        let wrapped = acceptor.wrap_key(&dialer_pub, &[9u8; 32]).unwrap();
        assert!(matches!(
            dialer.unwrap_key(&stranger_pub, &wrapped),
            Err(CryptoError::UnwrapFailed)
        ));
    }

    #[test]
    fn test_session_directions() {
        let key = [3u8; 32];
        let mut acceptor = SessionCipher::new(&key, Side::Acceptor).unwrap();
        let mut dialer = SessionCipher::new(&key, Side::Dialer).unwrap();

        let mut msg = b"BEAT 127.0.0.1:6000 abc\n".to_vec();
        add_padding(&mut msg, CIPHER_BLOCK_SIZE);
        assert_eq!(msg.len(), 32);
        let plain = msg.clone();

        acceptor.outbound.encrypt(&mut msg).unwrap();
        assert_ne!(msg, plain);
        // decrypting in two aligned pieces matches one pass
        let (a, b) = msg.split_at_mut(16);
        dialer.inbound.decrypt(a).unwrap();
        dialer.inbound.decrypt(b).unwrap();
        assert_eq!(msg, plain);
    }

    #[test]
    fn test_unaligned_rejected() {
        let mut cipher = ChaChaBlockCipher::new(&[1u8; 32], &[0u8; 12]).unwrap();
        let mut buf = vec![0u8; 17];
        assert!(matches!(cipher.encrypt(&mut buf), Err(CryptoError::Unaligned(17))));
    }

    #[test]
    fn test_padding() {
        let mut buf = b"STOP\n".to_vec();
        add_padding(&mut buf, 16);
        assert_eq!(buf.len(), 16);
        assert!(buf[5..].iter().all(|b| *b == b' '));

        let mut aligned = vec![1u8; 32];
        add_padding(&mut aligned, 16);
        assert_eq!(aligned.len(), 32);
    }
}
