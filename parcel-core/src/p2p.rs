//! P2P networking layer using rust-libp2p
//!
//! One task owns the swarm: TCP and QUIC transports with Noise and Yamux,
//! a relay client for reachability behind NAT, DCUtR hole punching,
//! identify, ping, and the block request-response protocol. Everything
//! else talks to that task through a [`NetworkHandle`].
//!
//! Protocol ID: /parcel/blocks/1.0.0

use cid::Cid;
use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport, ResponseChannel};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{
    dcutr, identify, noise, ping, relay, tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
    SwarmBuilder,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cid_blake3::parse_cid;
use crate::storage::BlockStore;
use crate::ticket::NodeAddr;

pub const PROTOCOL_ID: &str = "/parcel/blocks/1.0.0";

/// How long a single block request may take
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for the first listen address at startup
const LISTEN_TIMEOUT: Duration = Duration::from_secs(10);

const COMMAND_CHANNEL_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum P2PError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Swarm error: {0}")]
    Swarm(String),

    #[error("Request to {peer} failed: {reason}")]
    Request { peer: PeerId, reason: String },

    #[error("Network task stopped")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request for one block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub cid: Vec<u8>,
}

/// Response to a [`BlockRequest`]; `None` when the peer lacks the block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub data: Option<Vec<u8>>,
}

/// Listener and relay settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub listen_ip: Ipv4Addr,
    /// TCP and UDP (QUIC) port; 0 picks a free one
    pub listen_port: u16,
    /// Relay servers to hold reservations on, each ending in `/p2p/<relay id>`
    pub relays: Vec<Multiaddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_ip: Ipv4Addr::UNSPECIFIED,
            listen_port: 0,
            relays: Vec::new(),
        }
    }
}

/// Network behaviour of a Parcel node
#[derive(NetworkBehaviour)]
pub struct Behaviour {
    pub ping: ping::Behaviour,
    pub identify: identify::Behaviour,
    pub relay_client: relay::client::Behaviour,
    pub dcutr: dcutr::Behaviour,
    pub blocks: request_response::cbor::Behaviour<BlockRequest, BlockResponse>,
}

/// Create a new P2P swarm with a fresh identity
pub fn create_swarm() -> Result<Swarm<Behaviour>, P2PError> {
    let keypair = libp2p::identity::Keypair::generate_ed25519();
    let peer_id = PeerId::from(keypair.public());

    info!("Local peer ID: {}", peer_id);

    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_quic()
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| P2PError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| Behaviour {
            ping: ping::Behaviour::new(ping::Config::new()),
            identify: identify::Behaviour::new(
                identify::Config::new("/parcel/id/1.0.0".to_string(), key.public())
                    .with_agent_version(format!("parcel/{}", env!("CARGO_PKG_VERSION"))),
            ),
            relay_client,
            dcutr: dcutr::Behaviour::new(key.public().to_peer_id()),
            blocks: request_response::cbor::Behaviour::new(
                [(StreamProtocol::new(PROTOCOL_ID), ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(REQUEST_TIMEOUT),
            ),
        })
        .map_err(|e| P2PError::Swarm(e.to_string()))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    Ok(swarm)
}

enum Command {
    Fetch {
        peer: NodeAddr,
        cid: Cid,
        reply: oneshot::Sender<Result<Option<Vec<u8>>, P2PError>>,
    },
    Addrs {
        reply: oneshot::Sender<NodeAddr>,
    },
    Shutdown,
}

/// Clonable handle to the swarm task
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<Command>,
}

impl NetworkHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Fetch one block from a peer, dialing it through the given hints if needed
    ///
    /// Returns `Ok(None)` if the peer answered but does not have the block.
    pub async fn fetch_block(&self, peer: &NodeAddr, cid: Cid) -> Result<Option<Vec<u8>>, P2PError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Fetch {
                peer: peer.clone(),
                cid,
                reply,
            })
            .await
            .map_err(|_| P2PError::Shutdown)?;
        rx.await.map_err(|_| P2PError::Shutdown)?
    }

    /// Current addresses of this node
    pub async fn node_addr(&self) -> Result<NodeAddr, P2PError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Addrs { reply })
            .await
            .map_err(|_| P2PError::Shutdown)?;
        rx.await.map_err(|_| P2PError::Shutdown)
    }

    /// Ask the swarm task to stop
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }
}

/// Start listening and spawn the swarm task
///
/// Resolves once the node has at least one listen address, so tickets
/// issued right after startup carry usable hints.
pub async fn spawn_network(
    store: Arc<BlockStore>,
    config: &NetworkConfig,
) -> Result<(NetworkHandle, JoinHandle<()>), P2PError> {
    let mut swarm = create_swarm()?;
    let local_peer_id = *swarm.local_peer_id();

    let tcp_addr = Multiaddr::empty()
        .with(Protocol::Ip4(config.listen_ip))
        .with(Protocol::Tcp(config.listen_port));
    let quic_addr = Multiaddr::empty()
        .with(Protocol::Ip4(config.listen_ip))
        .with(Protocol::Udp(config.listen_port))
        .with(Protocol::QuicV1);

    swarm
        .listen_on(tcp_addr)
        .map_err(|e| P2PError::Transport(format!("Failed to listen on TCP: {}", e)))?;
    if let Err(e) = swarm.listen_on(quic_addr) {
        warn!("QUIC listener unavailable: {}", e);
    }

    for relay in &config.relays {
        let circuit = relay.clone().with(Protocol::P2pCircuit);
        match swarm.listen_on(circuit) {
            Ok(_) => info!("Requesting relay reservation on {}", relay),
            Err(e) => warn!("Cannot listen via relay {}: {}", relay, e),
        }
    }

    let mut driver = SwarmDriver::new(swarm, store);
    driver.wait_for_listen_addr().await?;

    let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let task = tokio::spawn(driver.run(command_rx));

    Ok((
        NetworkHandle {
            local_peer_id,
            commands,
        },
        task,
    ))
}

struct SwarmDriver {
    swarm: Swarm<Behaviour>,
    store: Arc<BlockStore>,
    listen_addrs: Vec<Multiaddr>,
    pending: HashMap<OutboundRequestId, (PeerId, oneshot::Sender<Result<Option<Vec<u8>>, P2PError>>)>,
    responses_tx: mpsc::UnboundedSender<(ResponseChannel<BlockResponse>, BlockResponse)>,
    responses_rx: mpsc::UnboundedReceiver<(ResponseChannel<BlockResponse>, BlockResponse)>,
}

impl SwarmDriver {
    fn new(swarm: Swarm<Behaviour>, store: Arc<BlockStore>) -> Self {
        let (responses_tx, responses_rx) = mpsc::unbounded_channel();
        Self {
            swarm,
            store,
            listen_addrs: Vec::new(),
            pending: HashMap::new(),
            responses_tx,
            responses_rx,
        }
    }

    async fn wait_for_listen_addr(&mut self) -> Result<(), P2PError> {
        tokio::time::timeout(LISTEN_TIMEOUT, async {
            while self.listen_addrs.is_empty() {
                let event = self.swarm.select_next_some().await;
                self.handle_swarm_event(event);
            }
        })
        .await
        .map_err(|_| P2PError::Transport("No listen address became available".to_string()))
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                Some((channel, response)) = self.responses_rx.recv() => {
                    if self.swarm.behaviour_mut().blocks.send_response(channel, response).is_err() {
                        debug!("Block response dropped, requester went away");
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        for (_, (peer, reply)) in self.pending.drain() {
            let _ = reply.send(Err(P2PError::Request {
                peer,
                reason: "node shutting down".to_string(),
            }));
        }
        info!("Network stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Fetch { peer, cid, reply } => {
                for addr in peer.dial_addrs() {
                    self.swarm.add_peer_address(peer.peer_id, addr.clone());
                }
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .blocks
                    .send_request(&peer.peer_id, BlockRequest { cid: cid.to_bytes() });
                debug!(%cid, peer = %peer.peer_id, "Requested block");
                self.pending.insert(request_id, (peer.peer_id, reply));
            }
            Command::Addrs { reply } => {
                let _ = reply.send(self.node_addr());
            }
            Command::Shutdown => {}
        }
    }

    fn node_addr(&self) -> NodeAddr {
        let (relayed, direct): (Vec<_>, Vec<_>) = self
            .listen_addrs
            .iter()
            .cloned()
            .partition(|addr| addr.iter().any(|p| p == Protocol::P2pCircuit));

        NodeAddr::new(*self.swarm.local_peer_id())
            .with_direct_addrs(direct)
            .with_relay_addrs(relayed)
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                debug!("Listen address expired: {}", address);
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                info!(
                    "Connected to peer: {} at {}",
                    peer_id,
                    endpoint.get_remote_address()
                );
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Connection closed with {}: {:?}", peer_id, cause);
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                warn!("Outgoing connection error to {:?}: {}", peer_id, error);
            }
            SwarmEvent::IncomingConnectionError {
                send_back_addr,
                error,
                ..
            } => {
                debug!("Incoming connection error from {}: {}", send_back_addr, error);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Blocks(event)) => self.handle_block_event(event),
            SwarmEvent::Behaviour(BehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted { relay_peer_id, .. },
            )) => {
                info!("Relay reservation accepted by {}", relay_peer_id);
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(%peer_id, agent = %info.agent_version, "Identified peer");
            }
            SwarmEvent::Behaviour(BehaviourEvent::Dcutr(event)) => {
                debug!("DCUtR event: {:?}", event);
            }
            _ => {}
        }
    }

    fn handle_block_event(&mut self, event: request_response::Event<BlockRequest, BlockResponse>) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.serve_block(peer, request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some((_, reply)) = self.pending.remove(&request_id) {
                        let _ = reply.send(Ok(response.data));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                warn!(%peer, "Block request failed: {}", error);
                if let Some((_, reply)) = self.pending.remove(&request_id) {
                    let _ = reply.send(Err(P2PError::Request {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                debug!(%peer, "Inbound block request failed: {}", error);
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    /// Answer an inbound request without blocking the swarm loop
    fn serve_block(
        &self,
        peer: PeerId,
        request: BlockRequest,
        channel: ResponseChannel<BlockResponse>,
    ) {
        let store = Arc::clone(&self.store);
        let responses = self.responses_tx.clone();

        tokio::spawn(async move {
            let data = match parse_cid(&request.cid) {
                Ok(cid) => match store.get(&cid).await {
                    Ok(block) => {
                        debug!(%peer, %cid, size = block.data.len(), "Serving block");
                        Some(block.data)
                    }
                    Err(e) => {
                        debug!(%peer, %cid, "Cannot serve block: {}", e);
                        None
                    }
                },
                Err(e) => {
                    error!(%peer, "Malformed block request: {}", e);
                    None
                }
            };
            let _ = responses.send((channel, BlockResponse { data }));
        });
    }
}
