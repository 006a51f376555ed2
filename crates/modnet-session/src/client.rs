//! Client role
//!
//! Connects to a host found via discovery (or a known address), runs the
//! challenge/response handshake, and then mirrors the host's roster while
//! exchanging module payloads. The host is the client's single [`Peer`];
//! everything addressed elsewhere is relayed by the host.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, trace, warn};

use modnet_core::packet::{DataPacket, PeerId};
use modnet_core::{codec, ModuleId, Packet, PeerColor, Reliability, BROADCAST_PEER_ID, HOST_PEER_ID};
use modnet_transport::{TransportEvent, UdpReceiver, UdpTransport};

use crate::config::SessionConfig;
use crate::dispatch::{AppEvent, ModuleHandle, ModuleHandler, ModuleRegistry};
use crate::error::{Result, SessionError};
use crate::event::{ConnectionState, DisconnectReason, SessionEvent};
use crate::handshake::challenge_digest;
use crate::host::payload_fits;
use crate::peer::{Peer, PeerIdentity, PeerSummary};
use crate::reliable::{
    self, Delivery, OutboundJob, SendCompletion, SendCtx, Sequenced, SequencedSend,
};

/// A connected ModNet client.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SessionConfig,
    host_addr: SocketAddr,
    transport: Arc<UdpTransport>,
    /// The host as a peer (id 1). Holds all delivery buffers and counters.
    host: Arc<Peer>,

    state: RwLock<ConnectionState>,
    local_id: PeerId,
    host_name: String,
    host_capacity: u8,
    /// Other endpoints in the session (the host included, as id 1), learned
    /// through identity packets.
    roster: DashMap<PeerId, PeerIdentity>,

    registry: Arc<ModuleRegistry>,
    active: Arc<AtomicBool>,
    jobs: mpsc::Sender<OutboundJob>,
    app: mpsc::Sender<AppEvent>,
    events: mpsc::Sender<SessionEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Client {
    /// Connect to a host. Resolves once the handshake has been accepted, or
    /// fails on denial/timeout with the socket already released.
    pub async fn connect(
        host_addr: SocketAddr,
        config: SessionConfig,
    ) -> Result<(Self, mpsc::Receiver<SessionEvent>)> {
        config.validate()?;

        let transport = Arc::new(
            UdpTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?,
        );
        let mut receiver = transport.start_receiver();

        info!("connecting to {}", host_addr);
        let request = codec::encode(&Packet::ConnectRequest)?;
        transport.send_to(&request, host_addr).await?;

        let (local_id, host_name, host_capacity) =
            handshake(&transport, &mut receiver, host_addr, &config).await?;

        let active = Arc::new(AtomicBool::new(true));
        let (jobs_tx, jobs_rx) = mpsc::channel(256);
        let (app_tx, app_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (evict_tx, mut evict_rx) = mpsc::channel(4);

        let send_ctx = Arc::new(SendCtx {
            active: active.clone(),
            transport: transport.clone(),
            mtu: config.mtu,
            retransmit_delay: config.retransmit_delay(),
            max_retries: config.max_retries,
            evict_tx,
        });
        let registry = ModuleRegistry::new();
        let host = Arc::new(Peer::new(
            HOST_PEER_ID,
            host_addr,
            Arc::new(transport.sender_to(host_addr)),
        ));

        // The host is addressable from the start; its identity packet
        // refines the placeholder once it arrives.
        let roster = DashMap::new();
        roster.insert(
            HOST_PEER_ID,
            PeerIdentity {
                username: host_name.clone(),
                color: PeerColor::default(),
            },
        );

        let inner = Arc::new(ClientInner {
            config,
            host_addr,
            transport,
            host,
            state: RwLock::new(ConnectionState::Connected),
            local_id,
            host_name,
            host_capacity,
            roster,
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
                    TransportEvent::Data(data) if from == recv_inner.host_addr => {
                        recv_inner.handle_datagram(data).await
                    }
                    TransportEvent::Data(_) => {}
                    TransportEvent::Error(e) => warn!("client receive error: {}", e),
                }
            }
        }));

        // Keep-alive beacon + host-silence watchdog. The request beacon is
        // answered by the host's idempotent accept, refreshing liveness on
        // both sides.
        let beat_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = time::interval(beat_inner.config.heartbeat_interval);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                if !beat_inner.active.load(Ordering::Acquire) {
                    break;
                }
                if beat_inner.host.idle_for() > beat_inner.config.connection_timeout {
                    warn!("host silent for too long, disconnecting");
                    beat_inner.teardown(DisconnectReason::Timeout).await;
                    break;
                }
                beat_inner
                    .enqueue_control(Packet::ConnectRequest)
                    .await;
            }
        }));

        // Reliable-retry failure tears the whole session down.
        let evict_inner = inner.clone();
        tasks.push(tokio::spawn(async move {
            if evict_rx.recv().await.is_some() {
                warn!("reliable delivery to host failed, disconnecting");
                evict_inner
                    .teardown(DisconnectReason::RetriesExhausted)
                    .await;
            }
        }));

        *inner.tasks.lock() = tasks;

        // Introduce ourselves; the host relays this to the rest of the
        // roster.
        inner
            .enqueue_peer_info(local_id, inner.config.username.clone(), inner.config.color)
            .await;
        inner.emit(SessionEvent::Connected).await;
        info!(
            "connected to '{}' at {} as peer {}",
            inner.host_name, host_addr, local_id
        );

        Ok((Self { inner }, events_rx))
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    /// Peer id assigned by the host.
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Name the host advertised during the handshake.
    pub fn host_name(&self) -> &str {
        &self.inner.host_name
    }

    /// Peer capacity the host advertised during the handshake.
    pub fn host_capacity(&self) -> u8 {
        self.inner.host_capacity
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.inner.transport.local_addr()?)
    }

    /// Known roster (host and other clients), as learned so far.
    pub fn roster(&self) -> Vec<PeerSummary> {
        self.inner
            .roster
            .iter()
            .map(|entry| PeerSummary {
                id: *entry.key(),
                username: entry.value().username.clone(),
                color: entry.value().color,
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

    /// Send a payload to `target` (relayed by the host), or to every other
    /// peer when `target` is `None`. The returned [`Delivery`] resolves
    /// `false` on rejection (not connected, unknown target, oversized
    /// unreliable payload).
    pub async fn send(
        &self,
        reliability: Reliability,
        module: ModuleId,
        payload: Bytes,
        target: Option<PeerId>,
    ) -> Delivery {
        let inner = &self.inner;
        if *inner.state.read() != ConnectionState::Connected {
            warn!("send rejected: not connected");
            return Delivery::failed();
        }
        if !payload_fits(&inner.config, reliability, payload.len()) {
            return Delivery::failed();
        }
        let wire_peer = match target {
            Some(id) => {
                if !inner.roster.contains_key(&id) {
                    warn!("send rejected: unknown target {}", id);
                    return Delivery::failed();
                }
                id
            }
            None => BROADCAST_PEER_ID,
        };

        let (completion, delivery) = SendCompletion::new(1);
        let job = OutboundJob::Sequenced {
            peer: inner.host.clone(),
            send: SequencedSend::Data {
                reliability,
                module,
                wire_peer,
                payload,
            },
            completion: Some(completion.clone()),
        };
        if inner.jobs.send(job).await.is_err() {
            completion.finish(false);
        }
        delivery
    }

    /// Leave the session: tell the host, stop the loops, clear state.
    pub async fn disconnect(self) {
        self.inner.teardown(DisconnectReason::Shutdown).await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.active.store(false, Ordering::Release);
        *self.inner.state.write() = ConnectionState::Disconnected;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Run the request → challenge → answer → accept exchange within the
/// configured deadline.
async fn handshake(
    transport: &UdpTransport,
    receiver: &mut UdpReceiver,
    host_addr: SocketAddr,
    config: &SessionConfig,
) -> Result<(PeerId, String, u8)> {
    let deadline = Instant::now() + config.connection_timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(SessionError::ConnectTimeout);
        }
        let received = match time::timeout(remaining, receiver.recv_from()).await {
            Ok(Some(received)) => received,
            Ok(None) => return Err(SessionError::ConnectTimeout),
            Err(_) => return Err(SessionError::ConnectTimeout),
        };
        let (event, from) = received;
        if from != host_addr {
            continue;
        }
        let data = match event {
            TransportEvent::Data(data) => data,
            TransportEvent::Error(_) => continue,
        };
        match codec::decode(&data) {
            Ok(Packet::ConnectChallenge { nonce }) => {
                debug!("answering challenge");
                let answer = codec::encode(&Packet::ChallengeAnswer {
                    digest: challenge_digest(nonce),
                })?;
                transport.send_to(&answer, host_addr).await?;
            }
            Ok(Packet::ConnectAccepted {
                peer_id,
                host_name,
                capacity,
            }) => return Ok((peer_id, host_name, capacity)),
            Ok(Packet::ConnectDenied) => return Err(SessionError::ConnectDenied),
            Ok(other) => trace!("ignoring {:?} during handshake", other.kind()),
            Err(e) => trace!("dropping malformed handshake datagram: {}", e),
        }
    }
}

impl ClientInner {
    async fn handle_datagram(&self, data: Bytes) {
        let packet = match codec::decode(&data) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("dropping malformed datagram: {}", e);
                return;
            }
        };

        match packet {
            Packet::Ack {
                sequence,
                slice_index,
            } => {
                self.host.touch();
                reliable::apply_ack(&self.host, sequence, slice_index);
            }
            Packet::Data(data_packet) => self.handle_data(data_packet).await,
            Packet::PeerInfo {
                sequence,
                peer_id,
                username,
                color,
            } => self.handle_peer_info(sequence, peer_id, username, color).await,
            Packet::PeerDisconnected { peer_id } => {
                if self.roster.remove(&peer_id).is_some() {
                    self.emit(SessionEvent::PeerLeft(peer_id)).await;
                    self.emit(SessionEvent::RosterChanged).await;
                }
            }
            Packet::ConnectClosed => {
                info!("host closed the connection");
                self.teardown(DisconnectReason::ClosedByRemote).await;
            }
            Packet::ConnectAccepted { .. } => {
                // Idempotent answer to the keep-alive beacon.
                self.host.touch();
            }
            other => trace!("client ignoring {:?}", other.kind()),
        }
    }

    async fn handle_data(&self, packet: DataPacket) {
        if *self.state.read() != ConnectionState::Connected {
            return;
        }
        self.host.touch();

        let result = reliable::ingest(&self.host, Sequenced::Data(packet));
        if let Some(ack) = result.ack {
            self.enqueue_control(ack).await;
        }
        for item in result.ready {
            match item {
                Sequenced::Data(data_packet) => {
                    // The wire field carries the originating sender here.
                    let _ = self
                        .app
                        .send(AppEvent::Data {
                            module: data_packet.module,
                            sender: data_packet.peer,
                            payload: data_packet.payload,
                        })
                        .await;
                }
                Sequenced::PeerInfo {
                    peer_id,
                    username,
                    color,
                    ..
                } => self.apply_peer_info(peer_id, username, color).await,
            }
        }
    }

    async fn handle_peer_info(
        &self,
        sequence: u16,
        peer_id: PeerId,
        username: String,
        color: PeerColor,
    ) {
        if *self.state.read() != ConnectionState::Connected {
            return;
        }
        self.host.touch();

        let item = Sequenced::PeerInfo {
            sequence,
            peer_id,
            username,
            color,
        };
        let result = reliable::ingest(&self.host, item);
        if let Some(ack) = result.ack {
            self.enqueue_control(ack).await;
        }
        for item in result.ready {
            match item {
                Sequenced::PeerInfo {
                    peer_id,
                    username,
                    color,
                    ..
                } => self.apply_peer_info(peer_id, username, color).await,
                Sequenced::Data(data_packet) => {
                    let _ = self
                        .app
                        .send(AppEvent::Data {
                            module: data_packet.module,
                            sender: data_packet.peer,
                            payload: data_packet.payload,
                        })
                        .await;
                }
            }
        }
    }

    async fn apply_peer_info(&self, peer_id: PeerId, username: String, color: PeerColor) {
        if peer_id == HOST_PEER_ID {
            self.host.set_identity(username.clone(), color);
        }
        let newcomer = self
            .roster
            .insert(peer_id, PeerIdentity { username, color })
            .is_none();
        if newcomer && peer_id != self.local_id {
            self.emit(SessionEvent::PeerJoined(peer_id)).await;
        }
        self.emit(SessionEvent::RosterChanged).await;
    }

    async fn teardown(&self, reason: DisconnectReason) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        *self.state.write() = ConnectionState::Disconnected;

        if reason != DisconnectReason::ClosedByRemote {
            // Bypass the (stopping) send loop.
            if let Ok(bytes) = codec::encode(&Packet::ConnectClosed) {
                let _ = self.transport.send_to(&bytes, self.host_addr).await;
            }
        }

        let _ = self
            .events
            .send(SessionEvent::Disconnected(reason))
            .await;

        self.host.clear_buffers();
        self.host.sender.close();
        self.roster.clear();
        info!("disconnected ({:?})", reason);

        // Abort last: this may cancel the calling task itself.
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn enqueue_control(&self, packet: Packet) {
        let _ = self
            .jobs
            .send(OutboundJob::Control {
                addr: self.host_addr,
                packet,
            })
            .await;
    }

    async fn enqueue_peer_info(&self, peer_id: PeerId, username: String, color: PeerColor) {
        let job = OutboundJob::Sequenced {
            peer: self.host.clone(),
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
