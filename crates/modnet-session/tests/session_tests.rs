//! Session tests (modnet-session)
//!
//! End-to-end behavior over loopback sockets: handshake and admission,
//! module data in all four delivery classes, chunking, forwarding,
//! retransmission/eviction, and lifecycle teardown. Where acks must be
//! withheld, a bare UDP socket encoding packets with modnet-core plays the
//! remote peer.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use modnet_core::{codec, ModuleId, Packet, Reliability};
use modnet_session::{
    Client, ConnectionState, DisconnectReason, Host, SessionConfig, SessionEvent,
};
use sha2::{Digest, Sha256};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_config() -> SessionConfig {
    SessionConfig {
        port: 0,        // OS-assigned; clients dial host.local_addr()
        announce: false, // no broadcast traffic from tests
        heartbeat_interval: Duration::from_millis(100),
        ..SessionConfig::default()
    }
}

async fn open_host(capacity: u8) -> (Host, mpsc::Receiver<SessionEvent>, SocketAddr) {
    let config = SessionConfig {
        max_peers: capacity,
        ..test_config()
    };
    let (host, events) = Host::open("test-host", config).await.expect("host open");
    let addr = SocketAddr::from(([127, 0, 0, 1], host.local_addr().port()));
    (host, events, addr)
}

async fn expect_event<F>(events: &mut mpsc::Receiver<SessionEvent>, mut pred: F)
where
    F: FnMut(&SessionEvent) -> bool,
{
    let deadline = Duration::from_secs(5);
    loop {
        let event = timeout(deadline, events.recv())
            .await
            .expect("event within deadline")
            .expect("event channel open");
        if pred(&event) {
            return;
        }
    }
}

/// A raw-socket peer that performs the handshake by hand.
struct Scripted {
    socket: UdpSocket,
    host: SocketAddr,
}

impl Scripted {
    async fn new(host: SocketAddr) -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            host,
        }
    }

    async fn send(&self, packet: &Packet) {
        let bytes = codec::encode(packet).unwrap();
        self.socket.send_to(&bytes, self.host).await.unwrap();
    }

    async fn recv(&self) -> Packet {
        let mut buf = vec![0u8; 65536];
        loop {
            let (len, from) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
                .await
                .expect("datagram within deadline")
                .unwrap();
            if from != self.host {
                continue;
            }
            if let Ok(packet) = codec::decode(&buf[..len]) {
                return packet;
            }
        }
    }

    /// Request → challenge → answer → accepted; returns the assigned id.
    async fn handshake(&self) -> u8 {
        self.send(&Packet::ConnectRequest).await;
        loop {
            match self.recv().await {
                Packet::ConnectChallenge { nonce } => {
                    let digest: [u8; 32] = Sha256::digest(nonce.to_be_bytes()).into();
                    self.send(&Packet::ChallengeAnswer { digest }).await;
                }
                Packet::ConnectAccepted { peer_id, .. } => return peer_id,
                Packet::ConnectDenied => panic!("handshake denied"),
                _ => {}
            }
        }
    }
}

// ============================================================================
// Handshake and admission
// ============================================================================

#[tokio::test]
async fn first_client_gets_id_2() {
    let (host, mut host_events, addr) = open_host(4).await;

    let (client, _events) = Client::connect(addr, test_config()).await.unwrap();
    assert_eq!(client.local_id(), 2);
    assert_eq!(client.host_name(), "test-host");
    assert_eq!(client.host_capacity(), 4);
    assert_eq!(client.state(), ConnectionState::Connected);

    expect_event(&mut host_events, |e| matches!(e, SessionEvent::PeerJoined(2))).await;
    assert_eq!(host.peer_count(), 1);
}

#[tokio::test]
async fn repeated_request_is_idempotent() {
    let (host, _events, addr) = open_host(4).await;

    let scripted = Scripted::new(addr).await;
    let id = scripted.handshake().await;
    assert_eq!(id, 2);
    assert_eq!(host.peer_count(), 1);

    // A request after admission re-receives the accept, roster unchanged.
    scripted.send(&Packet::ConnectRequest).await;
    loop {
        match scripted.recv().await {
            Packet::ConnectAccepted { peer_id, .. } => {
                assert_eq!(peer_id, 2);
                break;
            }
            Packet::PeerInfo { sequence, .. } => {
                scripted
                    .send(&Packet::Ack {
                        sequence,
                        slice_index: None,
                    })
                    .await;
            }
            _ => {}
        }
    }
    assert_eq!(host.peer_count(), 1);
}

#[tokio::test]
async fn wrong_challenge_answer_is_denied() {
    let (host, _events, addr) = open_host(4).await;

    let scripted = Scripted::new(addr).await;
    scripted.send(&Packet::ConnectRequest).await;
    loop {
        match scripted.recv().await {
            Packet::ConnectChallenge { .. } => {
                scripted
                    .send(&Packet::ChallengeAnswer { digest: [0u8; 32] })
                    .await;
            }
            Packet::ConnectDenied => break,
            Packet::ConnectAccepted { .. } => panic!("spoofed answer admitted"),
            _ => {}
        }
    }
    assert_eq!(host.peer_count(), 0);
}

#[tokio::test]
async fn full_host_denies_without_challenge() {
    let (host, _events, addr) = open_host(2).await;

    let (_a, _ea) = Client::connect(addr, test_config()).await.unwrap();
    let (_b, _eb) = Client::connect(addr, test_config()).await.unwrap();
    assert_eq!(host.peer_count(), 2);

    let scripted = Scripted::new(addr).await;
    scripted.send(&Packet::ConnectRequest).await;
    loop {
        match scripted.recv().await {
            Packet::ConnectDenied => break,
            Packet::ConnectChallenge { .. } => panic!("full host issued a challenge"),
            _ => {}
        }
    }
    assert_eq!(host.peer_count(), 2);
}

// ============================================================================
// Data paths
// ============================================================================

#[tokio::test]
async fn client_payloads_reach_host_module() {
    let (host, _events, addr) = open_host(4).await;
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();

    let module = ModuleId::from_name("echo");
    let (tx, mut rx) = mpsc::channel(16);
    let _handle = host
        .register_module(module, move |sender, payload| {
            let _ = tx.try_send((sender, payload));
        })
        .unwrap();

    for reliability in [
        Reliability::ReliableOrdered,
        Reliability::ReliableUnordered,
        Reliability::UnreliableOrdered,
        Reliability::UnreliableUnordered,
    ] {
        let delivery = client
            .send(
                reliability,
                module,
                Bytes::from_static(b"ping"),
                Some(1), // the host itself
            )
            .await;
        assert!(delivery.wait().await);

        let (sender, payload) = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("payload within deadline")
            .unwrap();
        assert_eq!(sender, client.local_id());
        assert_eq!(payload.as_ref(), b"ping");
    }
}

#[tokio::test]
async fn host_broadcast_reaches_client_module() {
    let (host, mut host_events, addr) = open_host(4).await;
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();
    expect_event(&mut host_events, |e| matches!(e, SessionEvent::PeerJoined(_))).await;

    let module = ModuleId::from_name("state");
    let (tx, mut rx) = mpsc::channel(16);
    let _handle = client
        .register_module(module, move |sender, payload| {
            let _ = tx.try_send((sender, payload));
        })
        .unwrap();

    let delivery = host
        .send(
            Reliability::ReliableOrdered,
            module,
            Bytes::from_static(b"snapshot"),
            None,
        )
        .await;
    assert!(delivery.wait().await);

    let (sender, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("payload within deadline")
        .unwrap();
    assert_eq!(sender, 1);
    assert_eq!(payload.as_ref(), b"snapshot");
}

#[tokio::test]
async fn client_to_client_traffic_is_relayed() {
    let (_host, _events, addr) = open_host(4).await;
    let (alice, mut alice_events) = Client::connect(addr, test_config()).await.unwrap();
    let (bob, _bob_events) = Client::connect(addr, test_config()).await.unwrap();

    let module = ModuleId::from_name("whisper");
    let (tx, mut rx) = mpsc::channel(16);
    let _handle = bob
        .register_module(module, move |sender, payload| {
            let _ = tx.try_send((sender, payload));
        })
        .unwrap();

    // Alice must learn about Bob before she may address him.
    let bob_id = bob.local_id();
    expect_event(&mut alice_events, |e| {
        matches!(e, SessionEvent::PeerJoined(id) if *id == bob_id)
    })
    .await;

    let delivery = alice
        .send(
            Reliability::ReliableOrdered,
            module,
            Bytes::from_static(b"psst"),
            Some(bob_id),
        )
        .await;
    assert!(delivery.wait().await);

    let (sender, payload) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("payload within deadline")
        .unwrap();
    assert_eq!(sender, alice.local_id());
    assert_eq!(payload.as_ref(), b"psst");
}

#[tokio::test]
async fn large_reliable_payload_is_chunked_and_reassembled() {
    let mtu = 64usize;
    let host_config = SessionConfig {
        mtu,
        ..test_config()
    };
    let (host, _events) = Host::open("chunky", host_config).await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], host.local_addr().port()));
    let client_config = SessionConfig {
        mtu,
        ..test_config()
    };
    let (client, _cevents) = Client::connect(addr, client_config).await.unwrap();

    let module = ModuleId::from_name("bulk");
    let (tx, mut rx) = mpsc::channel(4);
    let _handle = host
        .register_module(module, move |_sender, payload| {
            let _ = tx.try_send(payload);
        })
        .unwrap();

    // 3×MTU + 7 bytes, patterned so any reordering or loss is visible.
    let payload: Bytes = (0..mtu * 3 + 7).map(|i| (i % 251) as u8).collect();
    let delivery = client
        .send(
            Reliability::ReliableOrdered,
            module,
            payload.clone(),
            Some(1),
        )
        .await;
    assert!(delivery.wait().await);

    let received = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("payload within deadline")
        .unwrap();
    assert_eq!(received, payload);
}

#[tokio::test]
async fn oversized_unreliable_send_is_rejected() {
    let (host, _events, addr) = open_host(4).await;
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();

    let module = ModuleId::from_name("blob");
    let (tx, mut rx) = mpsc::channel(4);
    let _handle = host
        .register_module(module, move |_sender, payload| {
            let _ = tx.try_send(payload);
        })
        .unwrap();

    let oversized = Bytes::from(vec![0u8; 2000]); // > default MTU of 1200
    let delivery = client
        .send(Reliability::UnreliableOrdered, module, oversized, Some(1))
        .await;
    assert!(!delivery.wait().await);
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "rejected payload must never hit the wire"
    );
}

#[tokio::test]
async fn unknown_target_is_rejected() {
    let (_host, _events, addr) = open_host(4).await;
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();

    let delivery = client
        .send(
            Reliability::ReliableOrdered,
            ModuleId::from_name("x"),
            Bytes::from_static(b"?"),
            Some(99),
        )
        .await;
    assert!(!delivery.wait().await);
}

// ============================================================================
// Retransmission and eviction
// ============================================================================

#[tokio::test]
async fn suppressed_acks_trigger_retries_then_eviction() {
    let max_retries = 2u32;
    let config = SessionConfig {
        rtt: Duration::from_millis(40),
        max_retries,
        peer_timeout: Duration::from_secs(30), // keep the sweep out of the way
        ..test_config()
    };
    let (host, mut host_events) = Host::open("strict", config).await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], host.local_addr().port()));

    let scripted = Scripted::new(addr).await;
    let id = scripted.handshake().await;

    let module = ModuleId::from_name("probe");
    let delivery = host
        .send(
            Reliability::ReliableOrdered,
            module,
            Bytes::from_static(b"must-arrive"),
            Some(id),
        )
        .await;
    assert!(delivery.wait().await);

    // Ack identity traffic, withhold acks for the probe payload.
    let mut copies = 0u32;
    let mut closed = false;
    while !closed {
        match scripted.recv().await {
            Packet::PeerInfo { sequence, .. } => {
                scripted
                    .send(&Packet::Ack {
                        sequence,
                        slice_index: None,
                    })
                    .await;
            }
            Packet::Data(data) if data.module == module => copies += 1,
            Packet::ConnectClosed => closed = true,
            _ => {}
        }
    }

    // Original transmission plus exactly max_retries resends.
    assert_eq!(copies, 1 + max_retries);
    expect_event(&mut host_events, |e| {
        matches!(e, SessionEvent::PeerLeft(left) if *left == id)
    })
    .await;
    assert_eq!(host.peer_count(), 0);
}

#[tokio::test]
async fn ack_stops_retransmission() {
    let config = SessionConfig {
        rtt: Duration::from_millis(40),
        max_retries: 5,
        peer_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let (host, _events) = Host::open("lenient", config).await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], host.local_addr().port()));

    let scripted = Scripted::new(addr).await;
    let id = scripted.handshake().await;

    let module = ModuleId::from_name("probe");
    let _ = host
        .send(
            Reliability::ReliableOrdered,
            module,
            Bytes::from_static(b"ack-me-late"),
            Some(id),
        )
        .await;

    // Let one retransmit through, then ack; the buffer entry disappears and
    // the retransmit task stops on its next wake-up.
    let mut copies = 0u32;
    while copies < 2 {
        match scripted.recv().await {
            Packet::PeerInfo { sequence, .. } => {
                scripted
                    .send(&Packet::Ack {
                        sequence,
                        slice_index: None,
                    })
                    .await;
            }
            Packet::Data(data) if data.module == module => {
                copies += 1;
                if copies == 2 {
                    scripted
                        .send(&Packet::Ack {
                            sequence: data.sequence,
                            slice_index: None,
                        })
                        .await;
                }
            }
            _ => {}
        }
    }

    // No further copies may arrive after the ack settles.
    let mut buf = vec![0u8; 65536];
    let quiet = tokio::time::sleep(Duration::from_millis(300));
    tokio::pin!(quiet);
    loop {
        tokio::select! {
            _ = &mut quiet => break,
            received = scripted.socket.recv_from(&mut buf) => {
                let (len, _) = received.unwrap();
                if let Ok(Packet::Data(data)) = codec::decode(&buf[..len]) {
                    assert!(data.module != module, "retransmit after ack");
                }
            }
        }
    }
    assert_eq!(host.peer_count(), 1, "acked peer must not be evicted");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn client_disconnect_removes_it_from_roster() {
    let (host, mut host_events, addr) = open_host(4).await;
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();
    let id = client.local_id();
    expect_event(&mut host_events, |e| matches!(e, SessionEvent::PeerJoined(_))).await;

    client.disconnect().await;

    expect_event(&mut host_events, |e| {
        matches!(e, SessionEvent::PeerLeft(left) if *left == id)
    })
    .await;
    assert_eq!(host.peer_count(), 0);
}

#[tokio::test]
async fn host_shutdown_disconnects_client() {
    let (host, _events, addr) = open_host(4).await;
    let (client, mut client_events) = Client::connect(addr, test_config()).await.unwrap();

    host.shutdown().await;

    expect_event(&mut client_events, |e| {
        matches!(
            e,
            SessionEvent::Disconnected(DisconnectReason::ClosedByRemote)
        )
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn request_beacon_keeps_idle_client_alive() {
    let config = SessionConfig {
        peer_timeout: Duration::from_millis(400),
        ..test_config()
    };
    let (host, _events) = Host::open("watchful", config).await.unwrap();
    let addr = SocketAddr::from(([127, 0, 0, 1], host.local_addr().port()));
    let (client, _cevents) = Client::connect(addr, test_config()).await.unwrap();

    // Idle well past the host's peer timeout: the keep-alive beacon must
    // hold the roster entry.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(host.peer_count(), 1);
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn vanished_host_times_the_client_out() {
    let (host, _events, addr) = open_host(4).await;
    let client_config = SessionConfig {
        connection_timeout: Duration::from_millis(500),
        ..test_config()
    };
    let (client, mut client_events) = Client::connect(addr, client_config).await.unwrap();

    // Drop without the graceful shutdown: no ConnectClosed goes out.
    drop(host);

    expect_event(&mut client_events, |e| {
        matches!(e, SessionEvent::Disconnected(DisconnectReason::Timeout))
    })
    .await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_to_dead_port_times_out() {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    drop(socket); // nothing listening here

    let config = SessionConfig {
        connection_timeout: Duration::from_millis(300),
        ..test_config()
    };
    let result = Client::connect(addr, config).await;
    assert!(matches!(
        result,
        Err(modnet_session::SessionError::ConnectTimeout)
    ));
}
