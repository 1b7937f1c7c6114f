//! Connection to a single neighbor
//!
//! A [`Connection`] owns the per-peer state the orchestration layer reads
//! (model round markers, aggregated contributors) and an outbound queue.
//! Sending only enqueues. A writer task drains the queue in order, pads and
//! encrypts, and gives every socket write `node_timeout` to complete. The read
//! half is driven through a [`FrameAligner`] codec by the receive task, which
//! parses, executes, and reports to the node through [`ConnectionEvent`]s.

use crate::crypto::{add_padding, CryptoError, SymmetricCipher};
use crate::events::{ConnectionEvent, LearningEvent};
use crate::framing::{FrameAligner, FrameError, Segment};
use crate::handshake::Established;
use bytes::BytesMut;
use fedmesh_core::wire::{build_params, build_stop};
use fedmesh_core::{Command, CommunicationProtocol, DedupToken, NodeAddress, ProtocolError};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    Closed,
    #[error("No data received for {0:?}")]
    Timeout(Duration),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),
    #[error("Write to peer stalled for {0:?}")]
    WriteTimeout(Duration),
}

/// Lifecycle of a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but the receive loop has not started
    Handshaking,
    Active,
    /// Stop requested, receive loop winding down
    Terminating,
    Closed,
}

/// Tuning shared by every connection of a node
#[derive(Clone, Debug)]
pub struct ConnectionSettings {
    pub block_size: usize,
    /// Read timeout, and the limit for each socket write
    pub node_timeout: Duration,
    /// Dedup cache capacity
    pub amount_last_messages_saved: usize,
}

#[derive(Debug, Default)]
struct PeerLearningState {
    models_ready: Option<u32>,
    model_initialized: bool,
    models_aggregated: HashSet<String>,
    params: Vec<u8>,
}

struct Writer {
    half: OwnedWriteHalf,
    cipher: Option<Box<dyn SymmetricCipher>>,
    block_size: usize,
    write_timeout: Duration,
}

impl Writer {
    /// Pad, encrypt and write one message, `block_size` bytes per write call
    async fn write(&mut self, mut data: Vec<u8>) -> Result<(), ConnectionError> {
        if let Some(cipher) = self.cipher.as_mut() {
            add_padding(&mut data, cipher.block_size());
            cipher.encrypt(&mut data)?;
        }
        for chunk in data.chunks(self.block_size) {
            tokio::time::timeout(self.write_timeout, self.half.write_all(chunk))
                .await
                .map_err(|_| ConnectionError::WriteTimeout(self.write_timeout))??;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = tokio::time::timeout(self.write_timeout, self.half.shutdown()).await;
    }
}

/// A live link to one neighbor
pub struct Connection {
    id: u64,
    addr: NodeAddress,
    force: bool,
    settings: ConnectionSettings,
    /// Closed (set to `None`) once the connection stops accepting sends
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Flips to true when the writer task has finished
    writer_done: watch::Receiver<bool>,
    protocol: CommunicationProtocol,
    state: Mutex<ConnectionState>,
    peer_state: Mutex<PeerLearningState>,
    terminate: AtomicBool,
    wake: Notify,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

/// The receive and writer tasks of a connection, not yet running
pub struct ConnectionTasks {
    conn: Arc<Connection>,
    reader: OwnedReadHalf,
    aligner: FrameAligner,
    initial: Vec<u8>,
    writer: Writer,
    queue: mpsc::UnboundedReceiver<Vec<u8>>,
    writer_done: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an established socket. The tasks are returned unstarted so the
    /// caller can register the connection before any event is emitted.
    pub fn new(
        established: Established,
        addr: NodeAddress,
        force: bool,
        settings: ConnectionSettings,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> (Arc<Self>, ConnectionTasks) {
        let (reader, half) = established.stream.into_split();
        let (outbound, inbound) = match established.cipher {
            Some(cipher) => {
                let (out, inb) = cipher.split();
                (Some(out), Some(inb))
            }
            None => (None, None),
        };
        let aligner = match inbound {
            Some(cipher) => FrameAligner::with_cipher(settings.block_size, cipher),
            None => FrameAligner::new(settings.block_size),
        };
        let writer = Writer {
            half,
            cipher: outbound,
            block_size: settings.block_size,
            write_timeout: settings.node_timeout,
        };
        let (queue_tx, queue) = mpsc::unbounded_channel();
        let (writer_done, done_rx) = watch::channel(false);

        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            force,
            protocol: CommunicationProtocol::new(settings.amount_last_messages_saved),
            settings,
            outbound: Mutex::new(Some(queue_tx)),
            writer_done: done_rx,
            state: Mutex::new(ConnectionState::Handshaking),
            peer_state: Mutex::new(PeerLearningState::default()),
            terminate: AtomicBool::new(false),
            wake: Notify::new(),
            events,
        });

        let tasks = ConnectionTasks {
            conn: conn.clone(),
            reader,
            aligner,
            initial: established.leftover,
            writer,
            queue,
            writer_done,
        };
        (conn, tasks)
    }

    /// Process-unique id, distinguishes reconnects to the same address
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> NodeAddress {
        self.addr
    }

    /// Whether the peer asked to be kept alive
    pub fn is_forced(&self) -> bool {
        self.force
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active && !self.is_terminating()
    }

    fn is_terminating(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    // =========================================================================
    // PEER LEARNING STATE
    // =========================================================================

    /// Last round the peer reported ready
    pub fn models_ready(&self) -> Option<u32> {
        self.peer_state.lock().models_ready
    }

    pub fn set_models_ready(&self, round: Option<u32>) {
        self.peer_state.lock().models_ready = round;
    }

    pub fn model_initialized(&self) -> bool {
        self.peer_state.lock().model_initialized
    }

    pub fn set_model_initialized(&self, initialized: bool) {
        self.peer_state.lock().model_initialized = initialized;
    }

    /// Contributors the peer has already aggregated, sorted
    pub fn models_aggregated(&self) -> Vec<String> {
        let mut nodes: Vec<String> = self.peer_state.lock().models_aggregated.iter().cloned().collect();
        nodes.sort();
        nodes
    }

    pub fn add_models_aggregated(&self, nodes: &[String]) {
        self.peer_state.lock().models_aggregated.extend(nodes.iter().cloned());
    }

    pub fn clear_models_aggregated(&self) {
        self.peer_state.lock().models_aggregated.clear();
    }

    /// Mark tokens executed elsewhere so they are ignored here
    pub fn add_processed_messages<I>(&self, tokens: I)
    where
        I: IntoIterator<Item = DedupToken>,
    {
        self.protocol.add_processed_messages(tokens);
    }

    // =========================================================================
    // SEND PATH
    // =========================================================================

    /// Queue one encoded message. Never waits on the socket.
    pub fn send(&self, data: &[u8]) -> Result<(), ConnectionError> {
        self.enqueue(data.to_vec())
    }

    /// Fragment a binary payload into PARAMS frames and queue them contiguously
    pub fn send_params(&self, data: &[u8]) -> Result<(), ConnectionError> {
        let frames = build_params(data, self.settings.block_size)?;
        debug!("Sending {} parameter bytes to {} in {} frames", data.len(), self.addr, frames.len());
        self.enqueue(frames.concat())
    }

    fn enqueue(&self, data: Vec<u8>) -> Result<(), ConnectionError> {
        if self.is_terminating() {
            return Err(ConnectionError::Closed);
        }
        match self.outbound.lock().as_ref() {
            Some(queue) => queue.send(data).map_err(|_| ConnectionError::Closed),
            None => Err(ConnectionError::Closed),
        }
    }

    /// Stop the connection. With `notify_peer` a `STOP` is queued first.
    ///
    /// Returns at once; the writer flushes what is queued and then shuts the
    /// socket down. See [`Connection::closed`].
    pub fn stop(&self, notify_peer: bool) {
        if notify_peer {
            if let Err(e) = self.send(&build_stop().bytes) {
                debug!("Could not send STOP to {}: {}", self.addr, e);
            }
        }
        self.request_termination();
        self.outbound.lock().take();
    }

    /// Wait until the writer task has flushed its queue and closed the socket
    pub async fn closed(&self) {
        let mut done = self.writer_done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    fn request_termination(&self) {
        if !self.terminate.swap(true, Ordering::SeqCst) {
            let mut state = self.state.lock();
            if *state != ConnectionState::Closed {
                *state = ConnectionState::Terminating;
            }
        }
        self.wake.notify_one();
    }

    // =========================================================================
    // RECEIVE PATH
    // =========================================================================

    fn process_segment(&self, segment: Segment) -> Result<(), ConnectionError> {
        let outcome = self
            .protocol
            .process_message(segment.as_bytes(), |command| self.execute(command));

        if !outcome.executed.is_empty() {
            self.emit(ConnectionEvent::MessagesProcessed {
                from: self.addr,
                executed: outcome.executed,
            })?;
        }

        match outcome.error {
            Some(e) => {
                match &segment {
                    Segment::Text(text) => warn!(
                        "Protocol violation from {}: {} (batch {:?})",
                        self.addr,
                        e,
                        String::from_utf8_lossy(text).trim()
                    ),
                    Segment::Params(frame) => warn!(
                        "Protocol violation from {}: {} ({} byte frame)",
                        self.addr,
                        e,
                        frame.len()
                    ),
                }
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    fn execute(&self, command: Command) -> Result<(), ProtocolError> {
        match command {
            Command::Beat { node } => self.emit(ConnectionEvent::BeatReceived { node }),
            Command::Role { node, role } => self.emit(ConnectionEvent::RoleReceived { node, role }),
            Command::Stop => {
                debug!("{} sent STOP", self.addr);
                self.request_termination();
                Ok(())
            }
            Command::ConnectTo { addr } => self.emit(ConnectionEvent::ConnectTo { addr }),
            Command::StartLearning { rounds, epochs } => {
                self.emit_learning(LearningEvent::StartLearning { rounds, epochs })
            }
            Command::StopLearning => self.emit_learning(LearningEvent::StopLearning),
            Command::Params { data, done } => {
                let payload = {
                    let mut state = self.peer_state.lock();
                    state.params.extend_from_slice(&data);
                    if !done {
                        return Ok(());
                    }
                    std::mem::take(&mut state.params)
                };
                debug!("Received {} parameter bytes from {}", payload.len(), self.addr);
                self.emit_learning(LearningEvent::Params {
                    from: self.addr,
                    data: payload,
                })
            }
            Command::ModelsReady { round } => {
                self.set_models_ready(Some(round));
                self.emit_learning(LearningEvent::ModelsReady {
                    from: self.addr,
                    round,
                })
            }
            Command::Metrics {
                node,
                round,
                loss,
                metric,
            } => self.emit_learning(LearningEvent::Metrics {
                node,
                round,
                loss,
                metric,
            }),
            Command::VoteTrainSet { node, votes } => {
                self.emit_learning(LearningEvent::VoteTrainSet { node, votes })
            }
            Command::ModelsAggregated { nodes } => {
                self.add_models_aggregated(&nodes);
                self.emit_learning(LearningEvent::ModelsAggregated {
                    from: self.addr,
                    nodes,
                })
            }
            Command::ModelInitialized => {
                self.set_model_initialized(true);
                self.emit_learning(LearningEvent::ModelInitialized { from: self.addr })
            }
            Command::TransferLeadership => {
                self.emit(ConnectionEvent::TransferLeadership { from: self.addr })
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) -> Result<(), ProtocolError> {
        self.events
            .send(event)
            .map_err(|_| ProtocolError::Execution("node event channel closed".into()))
    }

    fn emit_learning(&self, event: LearningEvent) -> Result<(), ProtocolError> {
        self.emit(ConnectionEvent::Learning(event))
    }
}

impl ConnectionTasks {
    /// Start the writer and receive tasks
    pub fn spawn(self) {
        let ConnectionTasks {
            conn,
            reader,
            aligner,
            initial,
            writer,
            queue,
            writer_done,
        } = self;
        tokio::spawn(write_loop(conn.clone(), writer, queue, writer_done));
        tokio::spawn(receive_loop(conn, reader, aligner, initial));
    }
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: Writer,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    done: watch::Sender<bool>,
) {
    while let Some(data) = queue.recv().await {
        if let Err(e) = writer.write(data).await {
            info!("Send to {} failed: {}", conn.addr, e);
            conn.request_termination();
            conn.outbound.lock().take();
            break;
        }
    }
    writer.shutdown().await;
    let _ = done.send(true);
}

async fn receive_loop(
    conn: Arc<Connection>,
    reader: OwnedReadHalf,
    mut aligner: FrameAligner,
    initial: Vec<u8>,
) {
    conn.set_state(ConnectionState::Active);
    let node_timeout = conn.settings.node_timeout;

    // bytes that arrived with the handshake are decoded before the first read
    let mut result = Ok(());
    let mut carry = BytesMut::from(&initial[..]);
    loop {
        match aligner.decode(&mut carry) {
            Ok(Some(segment)) => {
                result = conn.process_segment(segment);
                if result.is_err() || conn.is_terminating() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                result = Err(e.into());
                break;
            }
        }
    }

    let mut frames = FramedRead::with_capacity(reader, aligner, conn.settings.block_size);
    frames.read_buffer_mut().extend_from_slice(&carry);

    while result.is_ok() && !conn.is_terminating() {
        tokio::select! {
            _ = conn.wake.notified() => break,
            next = tokio::time::timeout(node_timeout, frames.next()) => {
                result = match next {
                    Err(_) => Err(ConnectionError::Timeout(node_timeout)),
                    Ok(None) => Err(ConnectionError::Closed),
                    Ok(Some(Ok(segment))) => conn.process_segment(segment),
                    Ok(Some(Err(e))) => Err(e.into()),
                };
            }
        }
    }

    match result {
        Ok(()) => debug!("Connection to {} stopped", conn.addr),
        Err(ConnectionError::Closed) => debug!("Connection to {} closed by peer", conn.addr),
        Err(e) => info!("Connection to {} terminated: {}", conn.addr, e),
    }

    conn.terminate.store(true, Ordering::SeqCst);
    conn.outbound.lock().take();
    conn.set_state(ConnectionState::Closed);
    let _ = conn.events.send(ConnectionEvent::Ended {
        addr: conn.addr,
        id: conn.id,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{SessionCipher, Side};
    use fedmesh_core::wire::{build_beat, build_models_aggregated, build_models_ready};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    type Peer = (Arc<Connection>, UnboundedReceiver<ConnectionEvent>);

    fn settings(node_timeout: Duration) -> ConnectionSettings {
        ConnectionSettings {
            block_size: 64,
            node_timeout,
            amount_last_messages_saved: 10,
        }
    }

    async fn connected_pair(encrypt: bool, node_timeout: Duration) -> (Peer, Peer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());

        let key = [7u8; 32];
        let make = |stream: TcpStream, side: Side, port: u16| {
            let (tx, rx) = mpsc::unbounded_channel();
            let established = Established {
                stream,
                cipher: encrypt.then(|| SessionCipher::new(&key, side).unwrap()),
                leftover: Vec::new(),
            };
            let peer = NodeAddress::new("127.0.0.1".parse().unwrap(), port);
            // the dialing side asks to be kept alive
            let force = port == 7100;
            let (conn, tasks) = Connection::new(established, peer, force, settings(node_timeout), tx);
            tasks.spawn();
            (conn, rx)
        };

        let a = make(dialed.unwrap(), Side::Dialer, 7100);
        let b = make(accepted.unwrap().0, Side::Acceptor, 7200);
        (a, b)
    }

    async fn next_event(rx: &mut UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_beat_is_executed_once() {
        let ((a, _a_rx), (b, mut b_rx)) = connected_pair(false, Duration::from_secs(5)).await;
        assert!(a.is_forced());
        assert!(!b.is_forced());
        assert_eq!(b.models_ready(), None);

        let beat = build_beat("127.0.0.1:7100");
        a.send(&beat.bytes).unwrap();
        a.send(&beat.bytes).unwrap();
        a.send(&build_models_ready(4).bytes).unwrap();

        // reads may coalesce, so only the set of events is fixed
        let mut events = Vec::new();
        for _ in 0..3 {
            events.push(next_event(&mut b_rx).await);
        }
        let beats = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::BeatReceived { node } if node == "127.0.0.1:7100"))
            .count();
        assert_eq!(beats, 1);

        let executed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ConnectionEvent::MessagesProcessed { executed, .. } => Some(executed.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(executed.len(), 1);
        assert_eq!(Some(&executed[0].0), beat.token.as_ref());

        assert!(events.iter().any(|e| matches!(
            e,
            ConnectionEvent::Learning(LearningEvent::ModelsReady { round: 4, .. })
        )));
        assert_eq!(b.models_ready(), Some(4));
        assert!(tokio::time::timeout(Duration::from_millis(200), b_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_params_reassembled() {
        let ((a, _a_rx), (b, mut b_rx)) = connected_pair(false, Duration::from_secs(5)).await;

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        a.send_params(&payload).unwrap();
        a.send(&build_models_aggregated(&["n:1".into()]).bytes).unwrap();

        match next_event(&mut b_rx).await {
            ConnectionEvent::Learning(LearningEvent::Params { data, .. }) => assert_eq!(data, payload),
            other => panic!("unexpected event {other:?}"),
        }
        next_event(&mut b_rx).await;
        assert_eq!(b.models_aggregated(), vec!["n:1".to_string()]);
        b.clear_models_aggregated();
        assert!(b.models_aggregated().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_traffic() {
        let ((a, _a_rx), (_b, mut b_rx)) = connected_pair(true, Duration::from_secs(5)).await;

        a.send(&build_models_ready(1).bytes).unwrap();
        a.send_params(b"encrypted weights").unwrap();

        assert!(matches!(
            next_event(&mut b_rx).await,
            ConnectionEvent::Learning(LearningEvent::ModelsReady { round: 1, .. })
        ));
        match next_event(&mut b_rx).await {
            ConnectionEvent::Learning(LearningEvent::Params { data, .. }) => {
                assert_eq!(data, b"encrypted weights")
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stop_notifies_peer() {
        let ((a, mut a_rx), (b, mut b_rx)) = connected_pair(false, Duration::from_secs(5)).await;

        a.stop(true);
        assert!(matches!(next_event(&mut a_rx).await, ConnectionEvent::Ended { .. }));
        assert!(matches!(next_event(&mut b_rx).await, ConnectionEvent::Ended { .. }));
        assert_eq!(b.state(), ConnectionState::Closed);
        assert!(a.send(b"STOP\n").is_err());
        tokio::time::timeout(Duration::from_secs(2), a.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_reader_times_out_writes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (mut stalled, _) = accepted.unwrap();

        // keeps talking so the read timeout never fires, but never reads
        let chatter = tokio::spawn(async move {
            loop {
                let beat = build_beat("127.0.0.1:9999");
                if stalled.write_all(&beat.bytes).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel();
        let established = Established {
            stream: dialed.unwrap(),
            cipher: None,
            leftover: Vec::new(),
        };
        let settings = ConnectionSettings {
            block_size: 4096,
            node_timeout: Duration::from_millis(300),
            amount_last_messages_saved: 10,
        };
        let peer = NodeAddress::new("127.0.0.1".parse().unwrap(), 9999);
        let (conn, tasks) = Connection::new(established, peer, false, settings, tx);
        tasks.spawn();

        // queuing never waits on the socket
        conn.send_params(&vec![1u8; 32 << 20]).unwrap();

        loop {
            if let ConnectionEvent::Ended { .. } = next_event(&mut rx).await {
                break;
            }
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        tokio::time::timeout(Duration::from_secs(2), conn.closed()).await.unwrap();
        chatter.abort();
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let ((_a, _a_rx), (_b, mut b_rx)) = connected_pair(false, Duration::from_millis(200)).await;
        assert!(matches!(next_event(&mut b_rx).await, ConnectionEvent::Ended { .. }));
    }

    #[tokio::test]
    async fn test_protocol_violation_terminates_after_partial_batch() {
        let ((a, _a_rx), (_b, mut b_rx)) = connected_pair(false, Duration::from_secs(5)).await;

        a.send(b"MODEL_INITIALIZED\nBOGUS 1 2\nMODELS_READY 2\n").unwrap();

        assert!(matches!(
            next_event(&mut b_rx).await,
            ConnectionEvent::Learning(LearningEvent::ModelInitialized { .. })
        ));
        assert!(matches!(next_event(&mut b_rx).await, ConnectionEvent::Ended { .. }));
    }
}
