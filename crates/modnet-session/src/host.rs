//! Host role
//!
//! Owns the socket, the peer roster, and the handshake state. Clients find
//! the host through its discovery announcer, pass the challenge/response
//! handshake, and are then serviced by the shared reliable engine. Data
//! addressed to other peers is forwarded through the host; target 0 fans
//! out to everyone else and is also consumed locally.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use modnet_core::packet::{DataPacket, PeerId};
use modnet_core::{codec, ModuleId, Packet, PeerColor, Reliability, BROADCAST_PEER_ID, HOST_PEER_ID};
use modnet_discovery::{AnnounceTarget, Announcement, Announcer, DiscoveryConfig};
use modnet_transport::{TransportEvent, UdpTransport};

use crate::config::{validate_name, SessionConfig};
use crate::dispatch::{AppEvent, ModuleHandle, ModuleHandler, ModuleRegistry};
use crate::error::Result;
use crate::event::{ConnectionState, DisconnectReason, SessionEvent};
use crate::handshake::challenge_digest;
use crate::peer::{Peer, PeerSummary};
use crate::reliable::{
    self, Delivery, OutboundJob, SendCompletion, SendCtx, Sequenced, SequencedSend,
};

/// An open ModNet host.
pub struct Host {
    inner: Arc<HostInner>,
    announcer: Option<Announcer>,
}

struct HostInner {
    config: SessionConfig,
    host_name: String,
    transport: Arc<UdpTransport>,
    local_addr: SocketAddr,

    peers: DashMap<SocketAddr, Arc<Peer>>,
    ids: DashMap<PeerId, SocketAddr>,
    /// Challenge digests for addresses mid-handshake.
    pending: DashMap<SocketAddr, [u8; 32]>,

    registry: Arc<ModuleRegistry>,
    active: Arc<AtomicBool>,
    jobs: mpsc::Sender<OutboundJob>,
    app: mpsc::Sender<AppEvent>,
    events: mpsc::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Host {
    /// Bind the application port, start the I/O loops and the presence
    /// announcer, and return the host plus its event stream.
    pub async fn open(
        host_name: &str,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;
        validate_name(host_name)?;

        let transport = Arc::new(
            UdpTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port))).await?,
        );
        let local_addr = transport.local_addr()?;
        let mut receiver = transport.start_receiver();

        let active = Arc::new(AtomicBool::new(true));
        let (jobs_tx, jobs_rx) = mpsc::channel(256);
        let (app_tx, app_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (evict_tx, mut evict_rx) = mpsc::channel(32);

        let send_ctx = Arc::new(SendCtx {
            active: active.clone(),
            transport: transport.clone(),
            mtu: config.mtu,
            retransmit_delay: config.retransmit_delay(),
            max_retries: config.max_retries,
            evict_tx,
        });
        let registry = ModuleRegistry::new();

        let inner = Arc::new(HostInner {
            config,
            host_name: host_name.to_string(),
            transport,
            local_addr,
            peers: DashMap::new(),
            ids: DashMap::new(),
            pending: DashMap::new(),
            registry: registry.clone(),
            active: active.clone(),
            jobs: jobs_tx,
            app: app_tx,
            events: events_tx.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(reliable::run_send_loop(jobs_rx, send_ctx)));
        tasks.push(tokio::spawn(crate::dispatch::run_dispatch(
            app_rx,
            registry,
            events_tx,
        )));

        // Receive loop
        let recv_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some((event, from)) = receiver.recv_from().await {
                if !recv_inner.active.load(Ordering::Acquire) {
                    break;
                }
                match event {
                    TransportEvent::Data(data) => recv_inner.handle_datagram(from, data).await,
                    TransportEvent::Error(e) => warn!("host receive error: {}", e),
                }
            }
        }));

        // Roster sweep: evict peers that fell silent.
        let sweep_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(sweep_inner.config.heartbeat_interval);
            loop {
                ticker.tick().await;
                if !sweep_inner.active.load(Ordering::Acquire) {
                    break;
                }
                let stale: Vec<SocketAddr> = sweep_inner
                    .peers
                    .iter()
                    .filter(|entry| entry.value().idle_for() > sweep_inner.config.peer_timeout)
                    .map(|entry| *entry.key())
                    .collect();
                for addr in stale {
                    debug!("peer at {} timed out", addr);
                    sweep_inner.remove_peer(addr, true).await;
                }
            }
        }));

        // Reliable-retry evictions.
        let evict_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(addr) = evict_rx.recv().await {
                if !evict_inner.active.load(Ordering::Acquire) {
                    break;
                }
                warn!("evicting unresponsive peer at {}", addr);
                evict_inner.remove_peer(addr, true).await;
            }
        }));

        *inner.tasks.lock() = tasks;

        let announcer = if inner.config.announce {
            let discovery = DiscoveryConfig {
                port: inner.config.discovery_port,
                target: match inner.config.multicast_group {
                    Some(group) => AnnounceTarget::Multicast(group),
                    None => AnnounceTarget::Broadcast,
                },
                interval: inner.config.heartbeat_interval,
                ..DiscoveryConfig::default()
            };
            let snapshot_inner = inner.clone();
            let started = Announcer::start(&discovery, move || Announcement {
                host_name: snapshot_inner.host_name.clone(),
                capacity: snapshot_inner.config.max_peers,
                occupancy: snapshot_inner.peers.len().min(u8::MAX as usize) as u8,
            })
            .await;
            match started {
                Ok(announcer) => Some(announcer),
                Err(e) => {
                    // Role-fatal: unwind the already-running loops.
                    inner.active.store(false, Ordering::Release);
                    for task in inner.tasks.lock().drain(..) {
                        task.abort();
                    }
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        inner.emit(SessionEvent::Connected).await;
        info!("host '{}' open on {}", inner.host_name, local_addr);

        Ok((Self { inner, announcer }, events_rx))
    }

    /// Address the host is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Advertised host name.
    pub fn name(&self) -> &str {
        &self.inner.host_name
    }

    pub fn state(&self) -> ConnectionState {
        if self.inner.active.load(Ordering::Acquire) {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// Roster snapshot.
    pub fn peers(&self) -> Vec<PeerSummary> {
        self.inner
            .peers
            .iter()
            .map(|entry| {
                let peer = entry.value();
                let identity = peer.identity();
                PeerSummary {
                    id: peer.id,
                    username: identity.username,
                    color: identity.color,
                }
            })
            .collect()
    }

    /// Register a module handler. Payloads carrying `id` are routed to
    /// `handler` on the dispatch task.
    pub fn register_module<F>(&self, id: ModuleId, handler: F) -> Result<ModuleHandle>
    where
        F: Fn(PeerId, Bytes) + Send + Sync + 'static,
    {
        self.inner
            .registry
            .register(id, Arc::new(handler) as ModuleHandler)
    }

    /// Send a payload to one peer, or to every peer when `target` is `None`.
    /// The returned [`Delivery`] resolves `false` on rejection (unknown
    /// target, oversized unreliable payload, host closed).
    pub async fn send(
        &self,
        reliability: Reliability,
        module: ModuleId,
        payload: Bytes,
        target: Option<PeerId>,
    ) -> Delivery {
        let inner = &self.inner;
        if !inner.active.load(Ordering::Acquire) {
            return Delivery::failed();
        }
        if !payload_fits(&inner.config, reliability, payload.len()) {
            return Delivery::failed();
        }

        let targets: Vec<Arc<Peer>> = match target {
            Some(id) => match inner.peer_by_id(id) {
                Some(peer) => vec![peer],
                None => {
                    warn!("send rejected: no peer {}", id);
                    return Delivery::failed();
                }
            },
            None => inner.peers.iter().map(|e| e.value().clone()).collect(),
        };

        let (completion, delivery) = SendCompletion::new(targets.len());
        for peer in targets {
            let job = OutboundJob::Sequenced {
                peer,
                send: SequencedSend::Data {
                    reliability,
                    module,
                    wire_peer: HOST_PEER_ID,
                    payload: payload.clone(),
                },
                completion: Some(completion.clone()),
            };
            if inner.jobs.send(job).await.is_err() {
                completion.finish(false);
            }
        }
        delivery
    }

    /// Close the session: notify every peer, stop the loops, clear state.
    pub async fn shutdown(mut self) {
        let inner = self.inner.clone();
        if !inner.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(announcer) = self.announcer.take() {
            announcer.stop();
        }

        // The send loop is already deactivated; notify peers directly.
        if let Ok(bytes) = codec::encode(&Packet::ConnectClosed) {
            let addrs: Vec<SocketAddr> = inner.peers.iter().map(|e| *e.key()).collect();
            for addr in addrs {
                let _ = inner.transport.send_to(&bytes, addr).await;
            }
        }

        let _ = inner
            .events
            .send(SessionEvent::Disconnected(DisconnectReason::Shutdown))
            .await;

        for task in inner.tasks.lock().drain(..) {
            task.abort();
        }
        for entry in inner.peers.iter() {
            entry.value().sender.close();
            entry.value().clear_buffers();
        }
        inner.peers.clear();
        inner.ids.clear();
        inner.pending.clear();
        info!("host '{}' closed", inner.host_name);
    }
}

impl Drop for Host {
    fn drop(&mut self) {
        // Best-effort sync teardown; `shutdown` is the graceful path.
        self.inner.active.store(false, Ordering::Release);
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl HostInner {
    async fn handle_datagram(&self, from: SocketAddr, data: Bytes) {
        let packet = match codec::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping malformed datagram from {}: {}", from, e);
                return;
            }
        };

        match packet {
            Packet::ConnectRequest => self.handle_connect_request(from).await,
            Packet::ChallengeAnswer { digest } => self.handle_challenge_answer(from, digest).await,
            Packet::Ack {
                sequence,
                slice_index,
            } => {
                if let Some(peer) = self.peer_at(from) {
                    peer.touch();
                    reliable::apply_ack(&peer, sequence, slice_index);
                }
            }
            Packet::Data(data_packet) => self.handle_data(from, data_packet).await,
            Packet::PeerInfo {
                sequence,
                username,
                color,
                ..
            } => self.handle_peer_info(from, sequence, username, color).await,
            Packet::ConnectClosed => {
                // Voluntary leave; no point notifying the leaver.
                self.remove_peer(from, false).await;
            }
            other => trace!("host ignoring {:?} from {}", other.kind(), from),
        }
    }

    async fn handle_connect_request(&self, from: SocketAddr) {
        if let Some(peer) = self.peer_at(from) {
            // Lost-accept retry or keep-alive beacon: answer again.
            peer.touch();
            let accepted = self.accepted_packet(peer.id);
            self.enqueue_control(from, accepted).await;
            return;
        }

        if self.peers.len() >= self.config.max_peers as usize {
            self.enqueue_control(from, Packet::ConnectDenied).await;
            return;
        }

        let nonce: u64 = rand::random();
        self.pending.insert(from, challenge_digest(nonce));
        debug!("challenging {}", from);
        self.enqueue_control(from, Packet::ConnectChallenge { nonce })
            .await;
    }

    async fn handle_challenge_answer(&self, from: SocketAddr, digest: [u8; 32]) {
        let Some((_, expected)) = self.pending.remove(&from) else {
            return;
        };
        if digest != expected || self.peers.len() >= self.config.max_peers as usize {
            self.enqueue_control(from, Packet::ConnectDenied).await;
            return;
        }
        self.admit(from).await;
    }

    async fn admit(&self, from: SocketAddr) {
        let Some(id) = self.next_free_id() else {
            self.enqueue_control(from, Packet::ConnectDenied).await;
            return;
        };

        let sender = Arc::new(self.transport.sender_to(from));
        let peer = Arc::new(Peer::new(id, from, sender));
        self.peers.insert(from, peer.clone());
        self.ids.insert(id, from);

        let accepted = self.accepted_packet(id);
        self.enqueue_control(from, accepted).await;

        // Identity exchange: the host introduces itself, replays the
        // existing roster to the newcomer, and announces the newcomer.
        self.enqueue_peer_info(
            peer.clone(),
            HOST_PEER_ID,
            self.config.username.clone(),
            self.config.color,
        )
        .await;

        let others: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|entry| *entry.key() != from)
            .map(|entry| entry.value().clone())
            .collect();
        let newcomer = peer.identity();
        for other in others {
            let identity = other.identity();
            self.enqueue_peer_info(peer.clone(), other.id, identity.username, identity.color)
                .await;
            self.enqueue_peer_info(
                other.clone(),
                id,
                newcomer.username.clone(),
                newcomer.color,
            )
            .await;
        }

        info!("admitted peer {} from {}", id, from);
        self.emit(SessionEvent::PeerJoined(id)).await;
        self.emit(SessionEvent::RosterChanged).await;
    }

    async fn handle_data(&self, from: SocketAddr, packet: DataPacket) {
        let Some(peer) = self.peer_at(from) else {
            return;
        };
        peer.touch();

        let result = reliable::ingest(&peer, Sequenced::Data(packet));
        if let Some(ack) = result.ack {
            self.enqueue_control(from, ack).await;
        }
        for item in result.ready {
            match item {
                Sequenced::Data(data_packet) => self.consume_data(&peer, data_packet).await,
                Sequenced::PeerInfo {
                    username, color, ..
                } => self.apply_peer_info(&peer, username, color).await,
            }
        }
    }

    async fn handle_peer_info(
        &self,
        from: SocketAddr,
        sequence: u16,
        username: String,
        color: PeerColor,
    ) {
        let Some(peer) = self.peer_at(from) else {
            return;
        };
        peer.touch();

        let item = Sequenced::PeerInfo {
            sequence,
            peer_id: peer.id,
            username,
            color,
        };
        let result = reliable::ingest(&peer, item);
        if let Some(ack) = result.ack {
            self.enqueue_control(from, ack).await;
        }
        for item in result.ready {
            match item {
                Sequenced::PeerInfo {
                    username, color, ..
                } => self.apply_peer_info(&peer, username, color).await,
                Sequenced::Data(data_packet) => self.consume_data(&peer, data_packet).await,
            }
        }
    }

    /// Deliver or forward one in-order data payload from `peer`.
    async fn consume_data(&self, peer: &Arc<Peer>, packet: DataPacket) {
        match packet.peer {
            HOST_PEER_ID => self.deliver(peer.id, packet).await,
            BROADCAST_PEER_ID => {
                let others: Vec<Arc<Peer>> = self
                    .peers
                    .iter()
                    .filter(|entry| entry.value().id != peer.id)
                    .map(|entry| entry.value().clone())
                    .collect();
                for target in others {
                    self.forward(target, peer.id, &packet).await;
                }
                self.deliver(peer.id, packet).await;
            }
            target_id => match self.peer_by_id(target_id) {
                Some(target) => self.forward(target, peer.id, &packet).await,
                None => debug!("dropping forward to unknown peer {}", target_id),
            },
        }
    }

    /// Re-send a consumed payload to `target`, stamped with the original
    /// sender. Re-enters the send path, so oversized payloads re-chunk.
    async fn forward(&self, target: Arc<Peer>, sender: PeerId, packet: &DataPacket) {
        let job = OutboundJob::Sequenced {
            peer: target,
            send: SequencedSend::Data {
                reliability: packet.reliability,
                module: packet.module,
                wire_peer: sender,
                payload: packet.payload.clone(),
            },
            completion: None,
        };
        let _ = self.jobs.send(job).await;
    }

    async fn deliver(&self, sender: PeerId, packet: DataPacket) {
        let _ = self
            .app
            .send(AppEvent::Data {
                module: packet.module,
                sender,
                payload: packet.payload,
            })
            .await;
    }

    async fn apply_peer_info(&self, peer: &Arc<Peer>, username: String, color: PeerColor) {
        peer.set_identity(username.clone(), color);

        // Everyone else learns the update.
        let others: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|entry| entry.value().id != peer.id)
            .map(|entry| entry.value().clone())
            .collect();
        for other in others {
            self.enqueue_peer_info(other, peer.id, username.clone(), color)
                .await;
        }
        self.emit(SessionEvent::RosterChanged).await;
    }

    async fn remove_peer(&self, addr: SocketAddr, notify_remote: bool) {
        let Some((_, peer)) = self.peers.remove(&addr) else {
            return;
        };
        self.ids.remove(&peer.id);
        peer.clear_buffers();
        peer.sender.close();

        if notify_remote {
            self.enqueue_control(addr, Packet::ConnectClosed).await;
        }
        let remaining: Vec<SocketAddr> = self.peers.iter().map(|entry| *entry.key()).collect();
        for other in remaining {
            self.enqueue_control(other, Packet::PeerDisconnected { peer_id: peer.id })
                .await;
        }

        info!("peer {} left", peer.id);
        self.emit(SessionEvent::PeerLeft(peer.id)).await;
        self.emit(SessionEvent::RosterChanged).await;
    }

    fn peer_at(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        self.peers.get(&addr).map(|entry| entry.value().clone())
    }

    fn peer_by_id(&self, id: PeerId) -> Option<Arc<Peer>> {
        let addr = *self.ids.get(&id)?;
        self.peer_at(addr)
    }

    /// Lowest free peer id, starting at 2 (1 is the host).
    fn next_free_id(&self) -> Option<PeerId> {
        (2..=u8::MAX).find(|candidate| !self.ids.contains_key(candidate))
    }

    fn accepted_packet(&self, id: PeerId) -> Packet {
        Packet::ConnectAccepted {
            peer_id: id,
            host_name: self.host_name.clone(),
            capacity: self.config.max_peers,
        }
    }

    async fn enqueue_control(&self, addr: SocketAddr, packet: Packet) {
        let _ = self.jobs.send(OutboundJob::Control { addr, packet }).await;
    }

    async fn enqueue_peer_info(
        &self,
        peer: Arc<Peer>,
        peer_id: PeerId,
        username: String,
        color: PeerColor,
    ) {
        let job = OutboundJob::Sequenced {
            peer,
            send: SequencedSend::PeerInfo {
                peer_id,
                username,
                color,
            },
            completion: None,
        };
        let _ = self.jobs.send(job).await;
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.app.send(AppEvent::Session(event)).await;
    }
}

/// Shared payload-size admission check.
pub(crate) fn payload_fits(config: &SessionConfig, reliability: Reliability, len: usize) -> bool {
    if !reliability.is_reliable() && len > config.mtu {
        warn!(
            "send rejected: unreliable payload of {} bytes exceeds mtu {}",
            len, config.mtu
        );
        return false;
    }
    // Reliable payloads are bounded by the 16-bit slice count.
    if len > config.mtu * u16::MAX as usize {
        warn!("send rejected: payload of {} bytes cannot be chunked", len);
        return false;
    }
    true
}
