//! fedmesh node - membership and control core
//!
//! The node owns the listener, the neighbor registry, the heartbeater and
//! the gossiper. Connections, the heartbeater and the gossiper report through
//! channels; a single event loop applies every resulting side effect.

use crate::config::NodeSettings;
use crate::gossiper::{GossipSend, GossipStats, Gossiper};
use crate::heartbeater::Heartbeater;
use crate::neighbors::NeighborSet;
use fedmesh_core::wire::{self, WireMessage};
use fedmesh_core::{DedupToken, NodeAddress, ProtocolError, Role};
use fedmesh_net::handshake::{self, Established, HandshakeStream};
use fedmesh_net::{
    Connection, ConnectionError, ConnectionEvent, HandshakeError, LearningEvent, SessionCipher,
};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Already connected to {0}")]
    AlreadyConnected(NodeAddress),
    #[error("Refusing to connect to ourselves")]
    SelfConnect,
    #[error("Not connected to {0}")]
    NotConnected(NodeAddress),
    #[error("Connecting to {0} timed out")]
    Timeout(NodeAddress),
    #[error("Node already started")]
    AlreadyStarted,
    #[error("Node stopped")]
    Stopped,
}

/// Everything the node event loop reacts to
#[derive(Debug)]
pub enum NodeEvent {
    /// Reported by a connection
    Connection(ConnectionEvent),
    /// A neighbor was registered
    Connected(NodeAddress),
    /// Heartbeat tick
    SendBeat,
    /// Every second heartbeat tick
    SendRole,
    /// Every second heartbeat tick
    ReportStatus,
    /// Planned by the gossiper
    Gossip(GossipSend),
}

/// State consumed by [`Node::start`]
struct Startup {
    listener: TcpListener,
    events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// A fedmesh peer
pub struct Node {
    addr: NodeAddress,
    name: String,
    settings: NodeSettings,
    encrypt: bool,
    role: RwLock<Role>,
    neighbors: Arc<NeighborSet>,
    heartbeater: Arc<Heartbeater>,
    gossiper: Arc<Gossiper>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    upstream: mpsc::UnboundedSender<LearningEvent>,
    shutdown_tx: broadcast::Sender<()>,
    terminated: AtomicBool,
    startup: Mutex<Option<Startup>>,
    accept_task: Mutex<Option<JoinHandle<TcpListener>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Bind the listener and build the node.
    ///
    /// Returns the node and the receiver of events for the orchestration
    /// layer. Nothing runs until [`Node::start`].
    pub async fn bind(
        listen: SocketAddr,
        host: Option<IpAddr>,
        role: Role,
        encrypt: bool,
        settings: NodeSettings,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<LearningEvent>), NodeError> {
        let socket = if listen.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Some(size) = settings.tcp_buffer_size {
            socket.set_recv_buffer_size(size)?;
            socket.set_send_buffer_size(size)?;
        }
        socket.bind(listen)?;
        let listener = socket.listen(1024)?;
        let local = listener.local_addr()?;

        let host = match host {
            Some(host) => host,
            None if local.ip().is_unspecified() => {
                warn!("Listening on {} without --host, advertising loopback", local);
                if local.is_ipv4() {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    IpAddr::V6(Ipv6Addr::LOCALHOST)
                }
            }
            None => local.ip(),
        };
        let addr = NodeAddress::new(host, local.port());
        let name = addr.to_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let (upstream, upstream_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            addr,
            heartbeater: Arc::new(Heartbeater::new(name.clone(), &settings)),
            gossiper: Arc::new(Gossiper::new(&settings)),
            name,
            settings,
            encrypt,
            role: RwLock::new(role),
            neighbors: Arc::new(NeighborSet::new()),
            events_tx,
            conn_tx,
            upstream,
            shutdown_tx,
            terminated: AtomicBool::new(false),
            startup: Mutex::new(Some(Startup {
                listener,
                events_rx,
                conn_rx,
            })),
            accept_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });
        Ok((node, upstream_rx))
    }

    /// Spawn the accept loop, the event loop, the heartbeater and the gossiper
    pub fn start(self: &Arc<Self>) -> Result<(), NodeError> {
        let startup = self.startup.lock().take().ok_or(NodeError::AlreadyStarted)?;

        let accept = tokio::spawn(
            self.clone()
                .accept_loop(startup.listener, self.shutdown_tx.subscribe()),
        );
        *self.accept_task.lock() = Some(accept);

        let events = tokio::spawn(self.clone().event_loop(
            startup.events_rx,
            startup.conn_rx,
            self.shutdown_tx.subscribe(),
        ));
        let heartbeat = tokio::spawn(
            self.heartbeater
                .clone()
                .run(self.events_tx.clone(), self.shutdown_tx.subscribe()),
        );
        let neighbors = self.neighbors.clone();
        let gossip = tokio::spawn(self.gossiper.clone().run(
            move || neighbors.addresses(),
            self.events_tx.clone(),
            self.shutdown_tx.subscribe(),
        ));
        self.tasks.lock().extend([events, heartbeat, gossip]);

        info!(
            "Node {} started (role: {}, encryption: {})",
            self.name,
            self.role(),
            if self.encrypt { "on" } else { "off" }
        );
        Ok(())
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn addr(&self) -> NodeAddress {
        self.addr
    }

    /// Name used in BEAT and ROLE messages (`ip:port`)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write() = role;
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn heartbeater(&self) -> &Heartbeater {
        &self.heartbeater
    }

    /// Addresses of the direct neighbors
    pub fn neighbors(&self) -> Vec<NodeAddress> {
        self.neighbors.addresses()
    }

    pub fn get_neighbor(&self, addr: &NodeAddress) -> Option<Arc<Connection>> {
        self.neighbors.get(addr)
    }

    /// Every node known through heartbeats, plus this one
    pub fn network_nodes(&self) -> Vec<String> {
        let mut nodes = self.heartbeater.nodes();
        nodes.push(self.name.clone());
        nodes.sort();
        nodes.dedup();
        nodes
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> NodeStats {
        NodeStats {
            neighbor_count: self.neighbors.len(),
            network_size: self.network_nodes().len(),
            gossip: self.gossiper.stats(),
        }
    }

    fn neighbors_string(&self) -> String {
        self.neighbors
            .addresses()
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }

    // =========================================================================
    // ADMISSION
    // =========================================================================

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> TcpListener {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            if self.is_terminated() {
                                break;
                            }
                            let node = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = node.handle_inbound(stream).await {
                                    debug!("Inbound connection from {} rejected: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
        listener
    }

    /// accept -> CONNECT -> not yet a neighbor -> probe -> keys -> register
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream) -> Result<(), NodeError> {
        let mut hs = HandshakeStream::new(stream);
        let handshake = tokio::time::timeout(
            self.settings.node_timeout(),
            handshake::read_connect(&mut hs),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        let addr = handshake.addr;

        if addr == self.addr {
            return Err(NodeError::SelfConnect);
        }
        if self.is_terminated() {
            return Err(NodeError::Stopped);
        }
        if !self.neighbors.reserve(addr) {
            return Err(NodeError::AlreadyConnected(addr));
        }

        let cipher = match self.admit(&mut hs, &addr).await {
            Ok(cipher) => cipher,
            Err(e) => {
                self.neighbors.release(&addr);
                return Err(e);
            }
        };

        let (stream, leftover) = hs.into_parts();
        let established = Established {
            stream,
            cipher,
            leftover,
        };
        self.register(established, addr, handshake.force)?;
        info!("Accepted neighbor {}", addr);

        if handshake.full {
            self.broadcast_connect_to(addr);
        }
        Ok(())
    }

    /// Reachability probe then, if enabled, the acceptor key exchange
    async fn admit(
        &self,
        hs: &mut HandshakeStream,
        addr: &NodeAddress,
    ) -> Result<Option<SessionCipher>, NodeError> {
        handshake::probe(addr, self.settings.probe_timeout()).await?;

        if !self.encrypt {
            return Ok(None);
        }
        let cipher = tokio::time::timeout(
            self.settings.node_timeout(),
            handshake::acceptor_key_exchange(hs),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)??;
        Ok(Some(cipher))
    }

    /// Dial `addr` and register it as a neighbor.
    ///
    /// `full` asks the peer to introduce us to its neighbors; `force` asks it
    /// to keep the connection alive.
    pub async fn connect_to(
        self: &Arc<Self>,
        addr: NodeAddress,
        full: bool,
        force: bool,
    ) -> Result<(), NodeError> {
        if addr == self.addr {
            return Err(NodeError::SelfConnect);
        }
        if self.is_terminated() {
            return Err(NodeError::Stopped);
        }
        if !self.neighbors.reserve(addr) {
            return Err(NodeError::AlreadyConnected(addr));
        }

        let dialed = tokio::time::timeout(self.settings.node_timeout(), self.dial(&addr, full, force))
            .await
            .unwrap_or(Err(NodeError::Timeout(addr)));

        match dialed {
            Ok(established) => {
                self.register(established, addr, force)?;
                info!("Connected to {}", addr);
                Ok(())
            }
            Err(e) => {
                self.neighbors.release(&addr);
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: &NodeAddress, full: bool, force: bool) -> Result<Established, NodeError> {
        let stream = handshake::dial(addr, self.settings.tcp_buffer_size).await?;
        let established = handshake::initiate(stream, &self.addr, full, force, self.encrypt).await?;
        Ok(established)
    }

    /// Publish a reserved neighbor and start its tasks.
    ///
    /// The commit fails once `stop` has closed the neighbor set; the socket is
    /// then dropped without ever being read.
    fn register(
        &self,
        established: Established,
        addr: NodeAddress,
        force: bool,
    ) -> Result<Arc<Connection>, NodeError> {
        let (conn, tasks) = Connection::new(
            established,
            addr,
            force,
            self.settings.connection_settings(),
            self.conn_tx.clone(),
        );
        if !self.neighbors.commit(addr, conn.clone()) {
            return Err(NodeError::Stopped);
        }
        tasks.spawn();
        let _ = self.events_tx.send(NodeEvent::Connected(addr));
        Ok(conn)
    }

    /// Ask every other neighbor to dial the newcomer
    fn broadcast_connect_to(&self, newcomer: NodeAddress) {
        let msg = wire::build_connect_to(&newcomer);
        for (addr, conn) in self.neighbors.others(&newcomer) {
            if let Err(e) = conn.send(&msg.bytes) {
                debug!("CONNECT_TO {} to {} failed: {}", newcomer, addr, e);
            }
        }
    }

    /// Stop the connection to one neighbor
    pub async fn disconnect_from(&self, addr: &NodeAddress) -> Result<(), NodeError> {
        let conn = self
            .neighbors
            .remove(addr)
            .ok_or(NodeError::NotConnected(*addr))?;
        conn.stop(true);
        conn.closed().await;
        info!("Disconnected from {}", addr);
        Ok(())
    }

    // =========================================================================
    // EVENT ROUTING
    // =========================================================================

    async fn event_loop(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<NodeEvent>,
        mut conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let event = tokio::select! {
                Some(event) = conn_rx.recv() => NodeEvent::Connection(event),
                Some(event) = events_rx.recv() => event,
                _ = shutdown.recv() => break,
                else => break,
            };
            self.handle_event(event);
        }
        debug!("Event loop stopped");
    }

    /// Applies one event. Sends only queue on the connections, so this never
    /// waits on a socket.
    fn handle_event(self: &Arc<Self>, event: NodeEvent) {
        match event {
            NodeEvent::Connection(event) => self.handle_connection_event(event),
            NodeEvent::Connected(addr) => {
                let beat = self.originate(wire::build_beat(&self.name));
                if let Err(e) = self.send_to(&addr, &beat) {
                    debug!("Initial heartbeat to {} failed: {}", addr, e);
                }
            }
            NodeEvent::SendBeat => {
                let beat = self.originate(wire::build_beat(&self.name));
                self.broadcast(&beat, &[]);
                self.heartbeater.set_neighbors_view(self.neighbors_string());
            }
            NodeEvent::SendRole => {
                let role = self.originate(wire::build_role(&self.name, self.role()));
                self.broadcast(&role, &[]);
            }
            NodeEvent::ReportStatus => {
                let _ = self.upstream.send(LearningEvent::StatusReport {
                    name: self.name.clone(),
                    role: self.role(),
                    neighbors: self.neighbors(),
                    network_nodes: self.network_nodes(),
                });
            }
            NodeEvent::Gossip(GossipSend { payload, targets }) => {
                self.broadcast_to(&payload, &targets);
            }
        }
    }

    fn handle_connection_event(self: &Arc<Self>, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Ended { addr, id } => {
                if let Some(conn) = self.neighbors.remove_if(&addr, |c| c.id() == id) {
                    info!("Neighbor {} removed", addr);
                    conn.stop(false);
                }
            }
            ConnectionEvent::BeatReceived { node } => self.heartbeater.beat_received(&node),
            ConnectionEvent::RoleReceived { node, role } => {
                self.heartbeater.role_received(&node, role);
                let _ = self.upstream.send(LearningEvent::Role { node, role });
            }
            ConnectionEvent::ConnectTo { addr } => {
                if addr == self.addr || self.neighbors.contains(&addr) {
                    return;
                }
                let node = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.connect_to(addr, false, false).await {
                        debug!("CONNECT_TO {} failed: {}", addr, e);
                    }
                });
            }
            ConnectionEvent::MessagesProcessed { from, executed } => {
                let tokens: Vec<DedupToken> = executed.iter().map(|(t, _)| t.clone()).collect();
                for (_, conn) in self.neighbors.others(&from) {
                    conn.add_processed_messages(tokens.iter().cloned());
                }
                self.gossiper.add_messages(executed, from);
            }
            ConnectionEvent::TransferLeadership { from } => {
                info!("{} transferred leadership to us", from);
                self.set_role(Role::Aggregator);
                let _ = self.upstream.send(LearningEvent::TransferLeadership { from });
            }
            ConnectionEvent::Learning(event) => {
                let _ = self.upstream.send(event);
            }
        }
    }

    /// Record a locally built gossip message in every dedup cache
    fn originate(&self, msg: WireMessage) -> Vec<u8> {
        if let Some(token) = &msg.token {
            for conn in self.neighbors.connections() {
                conn.add_processed_messages([token.clone()]);
            }
        }
        msg.into_bytes()
    }

    // =========================================================================
    // OUTBOUND API
    // =========================================================================

    /// Send raw bytes to every neighbor not in `exclude`. Failures are logged.
    pub fn broadcast(&self, data: &[u8], exclude: &[NodeAddress]) {
        for conn in self.neighbors.connections() {
            if exclude.contains(&conn.addr()) {
                continue;
            }
            if let Err(e) = conn.send(data) {
                debug!("Broadcast to {} failed: {}", conn.addr(), e);
            }
        }
    }

    fn broadcast_to(&self, data: &[u8], targets: &[NodeAddress]) {
        for addr in targets {
            if let Err(e) = self.send_to(addr, data) {
                debug!("Gossip to {} failed: {}", addr, e);
            }
        }
    }

    /// Send raw bytes to one neighbor
    pub fn send_to(&self, addr: &NodeAddress, data: &[u8]) -> Result<(), NodeError> {
        let conn = self.neighbors.get(addr).ok_or(NodeError::NotConnected(*addr))?;
        conn.send(data)?;
        Ok(())
    }

    pub fn set_start_learning(&self, rounds: u32, epochs: u32) {
        info!("Broadcasting START_LEARNING ({} rounds, {} epochs)", rounds, epochs);
        let msg = self.originate(wire::build_start_learning(rounds, epochs));
        self.broadcast(&msg, &[]);
    }

    pub fn set_stop_learning(&self) {
        info!("Broadcasting STOP_LEARNING");
        let msg = self.originate(wire::build_stop_learning());
        self.broadcast(&msg, &[]);
    }

    pub fn broadcast_metrics(&self, round: u32, loss: f64, metric: f64) {
        let msg = self.originate(wire::build_metrics(&self.name, round, loss, metric));
        self.broadcast(&msg, &[]);
    }

    pub fn broadcast_vote_train_set(&self, votes: &[(String, i64)]) {
        let msg = self.originate(wire::build_vote_train_set(&self.name, votes));
        self.broadcast(&msg, &[]);
    }

    pub fn broadcast_models_aggregated(&self, nodes: &[String]) {
        let msg = wire::build_models_aggregated(nodes);
        self.broadcast(&msg.bytes, &[]);
    }

    pub fn broadcast_models_ready(&self, round: u32) {
        let msg = wire::build_models_ready(round);
        self.broadcast(&msg.bytes, &[]);
    }

    pub fn broadcast_model_initialized(&self) {
        let msg = wire::build_model_initialized();
        self.broadcast(&msg.bytes, &[]);
    }

    pub fn send_transfer_leadership(&self, addr: &NodeAddress) -> Result<(), NodeError> {
        self.send_to(addr, &wire::build_transfer_leadership().bytes)
    }

    /// Send a parameter payload to each of `addrs`.
    ///
    /// Every target is attempted; the first failure is returned.
    pub fn send_params(&self, addrs: &[NodeAddress], data: &[u8]) -> Result<(), NodeError> {
        let mut first_error = None;
        for addr in addrs {
            let result = match self.neighbors.get(addr) {
                Some(conn) => conn.send_params(data).map_err(NodeError::from),
                None => Err(NodeError::NotConnected(*addr)),
            };
            if let Err(e) = result {
                warn!("Sending parameters to {} failed: {}", addr, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // =========================================================================
    // SHUTDOWN
    // =========================================================================

    /// Stop the loops, send STOP to every neighbor, then close the listener
    pub async fn stop(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping node {}", self.name);
        let _ = self.shutdown_tx.send(());

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }

        let connections = self.neighbors.close();
        for conn in &connections {
            conn.stop(true);
        }
        // each writer gives up after node_timeout on a stalled peer
        for conn in &connections {
            conn.closed().await;
        }

        let accept = self.accept_task.lock().take();
        if let Some(accept) = accept {
            if let Ok(listener) = accept.await {
                drop(listener);
                debug!("Listener closed");
            }
        }
    }
}

/// Node statistics
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub neighbor_count: usize,
    pub network_size: usize,
    pub gossip: GossipStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings() -> NodeSettings {
        NodeSettings {
            block_size: 1024,
            heartbeat_period: 0.2,
            ..Default::default()
        }
    }

    async fn node() -> Arc<Node> {
        let (node, _rx) = Node::bind(
            "127.0.0.1:0".parse().unwrap(),
            None,
            Role::Trainer,
            false,
            test_settings(),
        )
        .await
        .unwrap();
        node
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let node = node().await;
        assert_ne!(node.addr().port, 0);
        assert_eq!(node.name(), node.addr().to_string());
        assert_eq!(node.network_nodes(), vec![node.name().to_string()]);
        assert_eq!(node.stats().neighbor_count, 0);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let node = node().await;
        node.start().unwrap();
        assert!(matches!(node.start(), Err(NodeError::AlreadyStarted)));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_connect_to_self_rejected() {
        let node = node().await;
        node.start().unwrap();
        assert!(matches!(
            node.connect_to(node.addr(), false, false).await,
            Err(NodeError::SelfConnect)
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_leaves_no_state() {
        let node = node().await;
        node.start().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = NodeAddress::from(listener.local_addr().unwrap());
        drop(listener);

        assert!(node.connect_to(dead, false, false).await.is_err());
        assert!(node.neighbors().is_empty());
        // the reservation was released, a second attempt fails the same way
        assert!(matches!(
            node.connect_to(dead, false, false).await,
            Err(NodeError::Io(_))
        ));
        node.stop().await;
    }

    #[tokio::test]
    async fn test_stopped_node_refuses_connections() {
        let node = node().await;
        node.start().unwrap();
        node.stop().await;
        assert!(node.is_terminated());
        assert!(matches!(
            node.connect_to("127.0.0.1:1".parse().unwrap(), false, false).await,
            Err(NodeError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_handshake_finishing_after_stop_is_dropped() {
        let node = node().await;
        node.start().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = NodeAddress::from(listener.local_addr().unwrap());
        assert!(node.neighbors.reserve(peer));
        let (dialed, accepted) = tokio::join!(TcpStream::connect(peer.socket_addr()), listener.accept());
        let (mut remote, _) = accepted.unwrap();

        // stop wins the race against the in-flight handshake
        node.stop().await;
        let established = Established {
            stream: dialed.unwrap(),
            cipher: None,
            leftover: Vec::new(),
        };
        assert!(matches!(
            node.register(established, peer, false),
            Err(NodeError::Stopped)
        ));
        assert!(node.neighbors().is_empty());

        // the socket was dropped without a word
        let mut buf = [0u8; 16];
        let read = tokio::io::AsyncReadExt::read(&mut remote, &mut buf).await.unwrap();
        assert_eq!(read, 0);
    }
}
