//! Connection handshake
//!
//! ```text
//! dialer                                   acceptor
//!   CONNECT <ip> <port> <full> <force>\n ->
//!                                          (reachability probe)
//!                      <- <base64 DER public key>\n     (encrypted mode only)
//!   <base64 DER public key>\n           ->
//!                      <- 48-byte wrapped session key
//! ```
//!
//! Handshake reads are buffered; bytes that arrive behind the last handshake
//! field belong to the session and are handed to the connection as leftover.

use crate::crypto::{
    generate_session_key, CryptoError, KeyExchange, SessionCipher, Side, WRAPPED_KEY_LEN,
};
use bytes::BytesMut;
use fedmesh_core::parse::parse_handshake;
use fedmesh_core::wire::build_connect;
use fedmesh_core::{Handshake, NodeAddress, ProtocolError};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Longest handshake line accepted (a CONNECT line or a base64 key)
const MAX_LINE: usize = 512;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Peer closed the connection during handshake")]
    Closed,
    #[error("Handshake timed out")]
    Timeout,
    #[error("Handshake line exceeds {MAX_LINE} bytes")]
    LineTooLong,
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Stream with a read-ahead buffer used until the session starts
pub struct HandshakeStream {
    stream: TcpStream,
    buffer: BytesMut,
}

impl HandshakeStream {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(MAX_LINE),
        }
    }

    /// Read one `\n`-terminated line (terminator stripped)
    pub async fn read_line(&mut self) -> Result<String, HandshakeError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line = self.buffer.split_to(pos + 1);
                return Ok(String::from_utf8_lossy(&line[..pos]).trim().to_string());
            }
            if self.buffer.len() > MAX_LINE {
                return Err(HandshakeError::LineTooLong);
            }
            self.fill().await?;
        }
    }

    /// Read exactly `n` bytes
    pub async fn read_exact(&mut self, n: usize) -> Result<Vec<u8>, HandshakeError> {
        while self.buffer.len() < n {
            self.fill().await?;
        }
        Ok(self.buffer.split_to(n).to_vec())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), HandshakeError> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    /// Hand over the socket and any bytes read past the handshake
    pub fn into_parts(self) -> (TcpStream, Vec<u8>) {
        (self.stream, self.buffer.to_vec())
    }

    async fn fill(&mut self) -> Result<(), HandshakeError> {
        let mut chunk = [0u8; MAX_LINE];
        let n = self.stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        self.buffer.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// Socket ready to become a [`crate::Connection`]
pub struct Established {
    pub stream: TcpStream,
    pub cipher: Option<SessionCipher>,
    /// Session bytes that arrived together with the handshake
    pub leftover: Vec<u8>,
}

/// Open a TCP connection, optionally sizing the socket buffers first
pub async fn dial(addr: &NodeAddress, buffer_size: Option<u32>) -> io::Result<TcpStream> {
    let target = addr.socket_addr();
    let socket = if target.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(size) = buffer_size {
        socket.set_recv_buffer_size(size)?;
        socket.set_send_buffer_size(size)?;
    }
    socket.connect(target).await
}

/// Check that something accepts connections at `addr`
pub async fn probe(addr: &NodeAddress, timeout: Duration) -> Result<(), HandshakeError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr.socket_addr())).await {
        Ok(Ok(_stream)) => Ok(()),
        Ok(Err(e)) => Err(HandshakeError::Io(e)),
        Err(_) => Err(HandshakeError::Timeout),
    }
}

/// Dialer side: announce ourselves and, if enabled, receive the session key
pub async fn initiate(
    stream: TcpStream,
    local: &NodeAddress,
    full: bool,
    force: bool,
    encrypt: bool,
) -> Result<Established, HandshakeError> {
    let mut hs = HandshakeStream::new(stream);
    hs.write_all(&build_connect(local, full, force).bytes).await?;

    let cipher = if encrypt {
        Some(dialer_key_exchange(&mut hs).await?)
    } else {
        None
    };

    let (stream, leftover) = hs.into_parts();
    Ok(Established {
        stream,
        cipher,
        leftover,
    })
}

/// Acceptor side: decode the CONNECT line
pub async fn read_connect(hs: &mut HandshakeStream) -> Result<Handshake, HandshakeError> {
    let line = hs.read_line().await?;
    Ok(parse_handshake(&line)?)
}

/// Acceptor side: send our key, read the dialer's, send the wrapped session key
pub async fn acceptor_key_exchange(hs: &mut HandshakeStream) -> Result<SessionCipher, HandshakeError> {
    let kx = KeyExchange::new();
    hs.write_all(format!("{}\n", kx.public_key_der_base64()).as_bytes())
        .await?;

    let peer = KeyExchange::decode_public_key(&hs.read_line().await?)?;
    let session_key = generate_session_key();
    let wrapped = kx.wrap_key(&peer, &session_key)?;
    hs.write_all(&wrapped).await?;

    debug!("Session key sent");
    Ok(SessionCipher::new(&session_key, Side::Acceptor)?)
}

/// Dialer side: read the acceptor's key, send ours, unwrap the session key
pub async fn dialer_key_exchange(hs: &mut HandshakeStream) -> Result<SessionCipher, HandshakeError> {
    let peer = KeyExchange::decode_public_key(&hs.read_line().await?)?;

    let kx = KeyExchange::new();
    hs.write_all(format!("{}\n", kx.public_key_der_base64()).as_bytes())
        .await?;

    let wrapped = hs.read_exact(WRAPPED_KEY_LEN).await?;
    let session_key = kx.unwrap_key(&peer, &wrapped)?;

    debug!("Session key received");
    Ok(SessionCipher::new(&session_key, Side::Dialer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (dialed.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_plain_handshake_keeps_leftover() {
        let (dialer, acceptor) = pair().await;
        let local: NodeAddress = "127.0.0.1:7001".parse().unwrap();

        let dial = async {
            let mut est = initiate(dialer, &local, true, false, false).await.unwrap();
            est.stream.write_all(b"STOP\n").await.unwrap();
            est
        };
        let accept = async {
            let mut hs = HandshakeStream::new(acceptor);
            let handshake = read_connect(&mut hs).await.unwrap();
            // the trailing STOP may or may not be in the same read
            let mut rest = Vec::new();
            let (mut stream, leftover) = hs.into_parts();
            rest.extend_from_slice(&leftover);
            while rest.len() < 5 {
                let mut buf = [0u8; 16];
                let n = stream.read(&mut buf).await.unwrap();
                rest.extend_from_slice(&buf[..n]);
            }
            (handshake, rest)
        };

        let (_est, (handshake, rest)) = tokio::join!(dial, accept);
        assert_eq!(handshake.addr, local);
        assert!(handshake.full);
        assert!(!handshake.force);
        assert_eq!(rest, b"STOP\n");
    }

    #[tokio::test]
    async fn test_encrypted_handshake_agrees_on_key() {
        let (dialer, acceptor) = pair().await;
        let local: NodeAddress = "127.0.0.1:7002".parse().unwrap();

        let dial = initiate(dialer, &local, false, true, true);
        let accept = async {
            let mut hs = HandshakeStream::new(acceptor);
            let handshake = read_connect(&mut hs).await.unwrap();
            let cipher = acceptor_key_exchange(&mut hs).await.unwrap();
            (handshake, cipher)
        };

        let (dialed, (handshake, acceptor_cipher)) = tokio::join!(dial, accept);
        let dialer_cipher = dialed.unwrap().cipher.unwrap();
        assert!(handshake.force);

        let (mut out, _) = acceptor_cipher.split();
        let (_, mut inbound) = dialer_cipher.split();
        let mut msg = *b"BEAT a:1 h\n     ";
        out.encrypt(&mut msg).unwrap();
        inbound.decrypt(&mut msg).unwrap();
        assert_eq!(&msg, b"BEAT a:1 h\n     ");
    }

    #[tokio::test]
    async fn test_rejects_bad_connect_line() {
        let (mut dialer, acceptor) = pair().await;
        dialer.write_all(b"HELLO there\n").await.unwrap();

        let mut hs = HandshakeStream::new(acceptor);
        assert!(matches!(
            read_connect(&mut hs).await,
            Err(HandshakeError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_during_handshake() {
        let (dialer, acceptor) = pair().await;
        drop(dialer);

        let mut hs = HandshakeStream::new(acceptor);
        assert!(matches!(read_connect(&mut hs).await, Err(HandshakeError::Closed)));
    }

    #[tokio::test]
    async fn test_reachability_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = NodeAddress::from(listener.local_addr().unwrap());
        assert!(probe(&addr, Duration::from_secs(1)).await.is_ok());

        drop(listener);
        assert!(probe(&addr, Duration::from_secs(1)).await.is_err());
    }
}
