//! Reliable delivery engine
//!
//! Outbound: sequence assignment, chunking, the outstanding-send buffers,
//! and per-packet retransmit tasks. Inbound: the ack-then-gate pipeline
//! that acks every reliable packet, drops stale ordered packets, parks
//! out-of-order ones, reassembles chunks, and drains contiguous successors.
//!
//! Both roles drive the same engine; only target resolution differs.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, trace, warn};

use modnet_core::packet::{DataPacket, PeerId};
use modnet_core::{codec, sequence, ChunkInfo, ModuleId, Packet, PeerColor, Reliability};
use modnet_transport::UdpTransport;

use crate::peer::Peer;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A sequenced item travelling through the ordering gate: application data
/// or a roster identity update (which rides the reliable-ordered channel).
#[derive(Debug, Clone)]
pub(crate) enum Sequenced {
    Data(DataPacket),
    PeerInfo {
        sequence: u16,
        peer_id: PeerId,
        username: String,
        color: PeerColor,
    },
}

impl Sequenced {
    pub(crate) fn sequence(&self) -> u16 {
        match self {
            Sequenced::Data(packet) => packet.sequence,
            Sequenced::PeerInfo { sequence, .. } => *sequence,
        }
    }

    pub(crate) fn reliability(&self) -> Reliability {
        match self {
            Sequenced::Data(packet) => packet.reliability,
            Sequenced::PeerInfo { .. } => Reliability::ReliableOrdered,
        }
    }

    fn chunk(&self) -> Option<ChunkInfo> {
        match self {
            Sequenced::Data(packet) => packet.chunk,
            Sequenced::PeerInfo { .. } => None,
        }
    }
}

/// Result of feeding one received packet through the gate.
pub(crate) struct Inbound {
    /// Ack to transmit (reliable packets only; emitted before the gate, so
    /// stale and duplicate packets are acked too).
    pub ack: Option<Packet>,
    /// Items now deliverable, in order.
    pub ready: Vec<Sequenced>,
}

impl Inbound {
    fn acked(ack: Option<Packet>) -> Self {
        Self { ack, ready: Vec::new() }
    }
}

/// Feed one sequenced packet from `peer` through the delivery pipeline.
pub(crate) fn ingest(peer: &Peer, item: Sequenced) -> Inbound {
    let reliability = item.reliability();
    if !reliability.is_reliable() {
        return ingest_unreliable(peer, item);
    }

    let sequence = item.sequence();
    let chunk = item.chunk();
    let ack = Some(Packet::Ack {
        sequence,
        slice_index: chunk.map(|c| c.index),
    });
    let ordered = reliability.is_ordered();

    if ordered && !sequence::is_newer(sequence, peer.reliable_remote()) {
        trace!("dropping stale reliable packet {}", sequence);
        return Inbound::acked(ack);
    }

    // Chunked slices accumulate; the logical payload enters the gate once
    // the declared slice count is met.
    let item = match (item, chunk) {
        (Sequenced::Data(packet), Some(chunk_info)) => {
            match absorb_slice(peer, &packet, chunk_info) {
                Some(whole) => Sequenced::Data(whole),
                None => return Inbound::acked(ack),
            }
        }
        (other, _) => other,
    };

    if !ordered {
        // Unordered reliable skips the gate and leaves the ordered channel's
        // remote counter alone; the two reliable classes cannot disturb each
        // other even though they share the sequence space.
        return Inbound {
            ack,
            ready: vec![item],
        };
    }

    if !sequence::is_next(sequence, peer.reliable_remote()) {
        peer.out_of_order.insert(sequence, item);
        return Inbound::acked(ack);
    }

    peer.set_reliable_remote(sequence);
    let mut ready = vec![item];

    // Drain successors whose gap just closed. Parked entries are already
    // reassembled, so stopping at the first missing sequence is exact.
    let mut next = sequence.wrapping_add(1);
    while let Some((_, parked)) = peer.out_of_order.remove(&next) {
        peer.set_reliable_remote(next);
        ready.push(parked);
        next = next.wrapping_add(1);
    }

    Inbound { ack, ready }
}

fn ingest_unreliable(peer: &Peer, item: Sequenced) -> Inbound {
    let sequence = item.sequence();
    if item.reliability().is_ordered() && !sequence::is_newer(sequence, peer.unreliable_remote())
    {
        trace!("dropping stale unreliable packet {}", sequence);
        return Inbound::acked(None);
    }
    peer.set_unreliable_remote(sequence);
    Inbound {
        ack: None,
        ready: vec![item],
    }
}

/// Store one slice; returns the reassembled logical packet once every
/// declared slice has arrived.
fn absorb_slice(peer: &Peer, packet: &DataPacket, chunk: ChunkInfo) -> Option<DataPacket> {
    let complete = {
        let mut slices = peer.chunks.entry(packet.sequence).or_default();
        slices.insert(chunk.index, packet.payload.clone());
        slices.len() >= chunk.count as usize
    };
    if !complete {
        return None;
    }

    let (_, slices) = peer.chunks.remove(&packet.sequence)?;
    let mut whole = BytesMut::with_capacity(slices.values().map(Bytes::len).sum());
    for part in slices.values() {
        whole.extend_from_slice(part);
    }
    debug!(
        "reassembled chunk {} ({} slices, {} bytes)",
        packet.sequence,
        chunk.count,
        whole.len()
    );
    Some(DataPacket {
        reliability: packet.reliability,
        sequence: packet.sequence,
        peer: packet.peer,
        module: packet.module,
        chunk: None,
        payload: whole.freeze(),
    })
}

/// Clear the outstanding-send entry an ack refers to. The matching
/// retransmit task observes the absence and stops.
pub(crate) fn apply_ack(peer: &Peer, sequence: u16, slice_index: Option<u16>) {
    match slice_index {
        Some(index) => {
            peer.outstanding_slices.remove(&(sequence, index));
        }
        None => {
            peer.outstanding.remove(&sequence);
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Completion handle for one `send` call.
///
/// Resolves `true` once the payload (every slice of it, for chunked sends,
/// and every recipient of it, for fan-out sends) has been handed to the
/// socket; resolves `false` for synchronous rejections.
pub struct Delivery {
    rx: oneshot::Receiver<bool>,
}

impl Delivery {
    /// Await the completion result.
    pub async fn wait(self) -> bool {
        self.rx.await.unwrap_or(false)
    }

    /// A delivery that has already failed (send-rejected path).
    pub(crate) fn failed() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(false);
        Self { rx }
    }
}

/// Shared completion across the per-recipient jobs of one send call.
pub(crate) struct SendCompletion {
    remaining: AtomicUsize,
    ok: AtomicBool,
    tx: parking_lot::Mutex<Option<oneshot::Sender<bool>>>,
}

impl SendCompletion {
    /// `parts` recipients share the completion; zero parts resolves
    /// immediately (a broadcast into an empty roster has nothing to fail).
    pub(crate) fn new(parts: usize) -> (Arc<Self>, Delivery) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            remaining: AtomicUsize::new(parts),
            ok: AtomicBool::new(true),
            tx: parking_lot::Mutex::new(Some(tx)),
        });
        if parts == 0 {
            completion.resolve();
        }
        (completion, Delivery { rx })
    }

    pub(crate) fn finish(&self, ok: bool) {
        if !ok {
            self.ok.store(false, Ordering::Release);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.resolve();
        }
    }

    fn resolve(&self) {
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(self.ok.load(Ordering::Acquire));
        }
    }
}

/// What a sequenced outbound job carries.
pub(crate) enum SequencedSend {
    Data {
        reliability: Reliability,
        module: ModuleId,
        /// Value of the sender-or-target field on the wire.
        wire_peer: PeerId,
        payload: Bytes,
    },
    PeerInfo {
        peer_id: PeerId,
        username: String,
        color: PeerColor,
    },
}

/// One entry on the send queue.
pub(crate) enum OutboundJob {
    /// Unsequenced connection/ack traffic, sent raw to an address.
    Control { addr: SocketAddr, packet: Packet },
    /// Sequenced traffic for one peer.
    Sequenced {
        peer: Arc<Peer>,
        send: SequencedSend,
        completion: Option<Arc<SendCompletion>>,
    },
}

/// Shared context of a role's send machinery.
pub(crate) struct SendCtx {
    pub active: Arc<AtomicBool>,
    pub transport: Arc<UdpTransport>,
    pub mtu: usize,
    pub retransmit_delay: Duration,
    pub max_retries: u32,
    /// Peers whose reliable sends exhausted their retries.
    pub evict_tx: mpsc::Sender<SocketAddr>,
}

/// Drain the send queue until the channel closes or the role deactivates.
pub(crate) async fn run_send_loop(mut jobs: mpsc::Receiver<OutboundJob>, ctx: Arc<SendCtx>) {
    while let Some(job) = jobs.recv().await {
        if !ctx.active.load(Ordering::Acquire) {
            break;
        }
        match job {
            OutboundJob::Control { addr, packet } => match codec::encode(&packet) {
                Ok(bytes) => {
                    if let Err(e) = ctx.transport.send_to(&bytes, addr).await {
                        warn!("control send to {} failed: {}", addr, e);
                    }
                }
                Err(e) => warn!("control encode failed: {}", e),
            },
            OutboundJob::Sequenced {
                peer,
                send,
                completion,
            } => {
                let ok = send_sequenced(&ctx, &peer, send).await;
                if let Some(completion) = completion {
                    completion.finish(ok);
                }
            }
        }
    }
}

async fn send_sequenced(ctx: &Arc<SendCtx>, peer: &Arc<Peer>, send: SequencedSend) -> bool {
    match send {
        SequencedSend::PeerInfo {
            peer_id,
            username,
            color,
        } => {
            let sequence = peer.next_reliable();
            let packet = Packet::PeerInfo {
                sequence,
                peer_id,
                username,
                color,
            };
            send_reliable(ctx, peer, sequence, None, &packet).await
        }
        SequencedSend::Data {
            reliability,
            module,
            wire_peer,
            payload,
        } => {
            if !reliability.is_reliable() {
                let packet = Packet::Data(DataPacket {
                    reliability,
                    sequence: peer.next_unreliable(),
                    peer: wire_peer,
                    module,
                    chunk: None,
                    payload,
                });
                return match codec::encode(&packet) {
                    Ok(bytes) => peer.sender.send(bytes).await.is_ok(),
                    Err(e) => {
                        warn!("data encode failed: {}", e);
                        false
                    }
                };
            }

            let sequence = peer.next_reliable();
            if payload.len() <= ctx.mtu {
                let packet = Packet::Data(DataPacket {
                    reliability,
                    sequence,
                    peer: wire_peer,
                    module,
                    chunk: None,
                    payload,
                });
                return send_reliable(ctx, peer, sequence, None, &packet).await;
            }

            // One sequence for the whole logical payload; each slice is
            // buffered and acked under (sequence, index).
            let count = payload.len().div_ceil(ctx.mtu) as u16;
            let mut ok = true;
            for index in 0..count {
                let start = index as usize * ctx.mtu;
                let end = usize::min(start + ctx.mtu, payload.len());
                let packet = Packet::Data(DataPacket {
                    reliability,
                    sequence,
                    peer: wire_peer,
                    module,
                    chunk: Some(ChunkInfo { count, index }),
                    payload: payload.slice(start..end),
                });
                ok &= send_reliable(ctx, peer, sequence, Some(index), &packet).await;
            }
            ok
        }
    }
}

/// Transmit one reliable packet: buffer it, send it, arm its retransmit.
async fn send_reliable(
    ctx: &Arc<SendCtx>,
    peer: &Arc<Peer>,
    sequence: u16,
    slice: Option<u16>,
    packet: &Packet,
) -> bool {
    let bytes = match codec::encode(packet) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("reliable encode failed: {}", e);
            return false;
        }
    };

    let key = match slice {
        Some(index) => {
            peer.outstanding_slices
                .insert((sequence, index), bytes.clone());
            OutstandingKey::Slice(sequence, index)
        }
        None => {
            peer.outstanding.insert(sequence, bytes.clone());
            OutstandingKey::Packet(sequence)
        }
    };

    let sent = peer.sender.send(bytes).await.is_ok();
    spawn_retransmit(ctx, peer.clone(), key);
    sent
}

#[derive(Debug, Clone, Copy)]
enum OutstandingKey {
    Packet(u16),
    Slice(u16, u16),
}

/// Per-packet retransmit task: resend while unacked, up to the retry
/// ceiling, then report the peer for eviction. Cancellation is implicit:
/// an ack removes the buffer entry, teardown clears the active flag.
fn spawn_retransmit(ctx: &Arc<SendCtx>, peer: Arc<Peer>, key: OutstandingKey) {
    let ctx = ctx.clone();
    tokio::spawn(async move {
        let mut retries: u32 = 0;
        loop {
            time::sleep(ctx.retransmit_delay).await;
            if !ctx.active.load(Ordering::Acquire) {
                return;
            }
            let pending = match key {
                OutstandingKey::Packet(sequence) => {
                    peer.outstanding.get(&sequence).map(|e| e.value().clone())
                }
                OutstandingKey::Slice(sequence, index) => peer
                    .outstanding_slices
                    .get(&(sequence, index))
                    .map(|e| e.value().clone()),
            };
            let Some(bytes) = pending else {
                return; // acked
            };
            if retries >= ctx.max_retries {
                debug!(
                    "peer {} exhausted {} retries for {:?}",
                    peer.id, retries, key
                );
                let _ = ctx.evict_tx.send(peer.addr).await;
                return;
            }
            if peer.sender.send(bytes).await.is_err() {
                return; // sender closed, teardown underway
            }
            retries += 1;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use modnet_transport::{TransportError, TransportSender};

    struct NullSender;

    #[async_trait]
    impl TransportSender for NullSender {
        async fn send(&self, _data: Bytes) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn close(&self) {}
    }

    fn peer() -> Peer {
        Peer::new(2, ([127, 0, 0, 1], 9).into(), Arc::new(NullSender))
    }

    fn data(reliability: Reliability, sequence: u16, payload: &[u8]) -> Sequenced {
        Sequenced::Data(DataPacket {
            reliability,
            sequence,
            peer: 1,
            module: ModuleId(7),
            chunk: None,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    fn slice(sequence: u16, count: u16, index: u16, payload: &[u8]) -> Sequenced {
        Sequenced::Data(DataPacket {
            reliability: Reliability::ReliableOrdered,
            sequence,
            peer: 1,
            module: ModuleId(7),
            chunk: Some(ChunkInfo { count, index }),
            payload: Bytes::copy_from_slice(payload),
        })
    }

    fn sequences(ready: &[Sequenced]) -> Vec<u16> {
        ready.iter().map(Sequenced::sequence).collect()
    }

    #[test]
    fn in_order_delivery() {
        let peer = peer();
        for seq in 1..=3u16 {
            let result = ingest(&peer, data(Reliability::ReliableOrdered, seq, b"x"));
            assert_eq!(sequences(&result.ready), vec![seq]);
            assert!(result.ack.is_some());
        }
        assert_eq!(peer.reliable_remote(), 3);
    }

    #[test]
    fn permuted_arrival_is_reordered_exactly_once() {
        let peer = peer();

        // 3 and 2 park; 1 releases the whole run.
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 3, b"c"));
        assert!(result.ready.is_empty());
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 2, b"b"));
        assert!(result.ready.is_empty());
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 1, b"a"));
        assert_eq!(sequences(&result.ready), vec![1, 2, 3]);
        assert_eq!(peer.reliable_remote(), 3);

        // Late duplicates are acked but never re-delivered.
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 2, b"b"));
        assert!(result.ready.is_empty());
        assert!(result.ack.is_some());
    }

    #[test]
    fn stale_packet_still_acked() {
        let peer = peer();
        ingest(&peer, data(Reliability::ReliableOrdered, 1, b"a"));
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 1, b"a"));
        assert!(result.ready.is_empty());
        assert_eq!(
            result.ack,
            Some(Packet::Ack {
                sequence: 1,
                slice_index: None
            })
        );
    }

    #[test]
    fn unordered_reliable_bypasses_gate() {
        let peer = peer();
        // Arrive far out of order; all delivered, ordered counter untouched.
        for seq in [5u16, 3, 9, 3] {
            let result = ingest(&peer, data(Reliability::ReliableUnordered, seq, b"u"));
            assert_eq!(sequences(&result.ready), vec![seq]);
            assert!(result.ack.is_some());
        }
        assert_eq!(peer.reliable_remote(), 0);
    }

    #[test]
    fn unreliable_ordered_drops_stale() {
        let peer = peer();
        let result = ingest(&peer, data(Reliability::UnreliableOrdered, 10, b"new"));
        assert_eq!(sequences(&result.ready), vec![10]);
        assert!(result.ack.is_none());

        // An older update arriving late must not undo a newer one.
        let result = ingest(&peer, data(Reliability::UnreliableOrdered, 9, b"old"));
        assert!(result.ready.is_empty());

        let result = ingest(&peer, data(Reliability::UnreliableUnordered, 2, b"any"));
        assert_eq!(sequences(&result.ready), vec![2]);
    }

    #[test]
    fn chunk_reassembles_in_index_order() {
        let peer = peer();
        assert!(ingest(&peer, slice(1, 3, 2, b"cc")).ready.is_empty());
        assert!(ingest(&peer, slice(1, 3, 0, b"aa")).ready.is_empty());
        let result = ingest(&peer, slice(1, 3, 1, b"bb"));
        assert_eq!(result.ready.len(), 1);
        match &result.ready[0] {
            Sequenced::Data(packet) => {
                assert_eq!(packet.payload.as_ref(), b"aabbcc");
                assert!(packet.chunk.is_none());
            }
            other => panic!("expected data, got {:?}", other),
        }
        assert_eq!(peer.reliable_remote(), 1);
    }

    #[test]
    fn incomplete_chunk_never_delivers() {
        let peer = peer();
        assert!(ingest(&peer, slice(1, 4, 0, b"a")).ready.is_empty());
        assert!(ingest(&peer, slice(1, 4, 1, b"b")).ready.is_empty());
        // Duplicate slice does not inflate the received count.
        assert!(ingest(&peer, slice(1, 4, 1, b"b")).ready.is_empty());
        assert!(ingest(&peer, slice(1, 4, 2, b"c")).ready.is_empty());
        assert_eq!(peer.reliable_remote(), 0);
    }

    #[test]
    fn slice_acks_carry_their_index() {
        let peer = peer();
        let result = ingest(&peer, slice(1, 2, 1, b"z"));
        assert_eq!(
            result.ack,
            Some(Packet::Ack {
                sequence: 1,
                slice_index: Some(1)
            })
        );
    }

    #[test]
    fn completed_chunk_waits_for_gap() {
        let peer = peer();
        // Sequence 2 completes before sequence 1 arrives; it must park.
        assert!(ingest(&peer, slice(2, 2, 0, b"22")).ready.is_empty());
        assert!(ingest(&peer, slice(2, 2, 1, b"22")).ready.is_empty());
        let result = ingest(&peer, data(Reliability::ReliableOrdered, 1, b"1"));
        assert_eq!(sequences(&result.ready), vec![1, 2]);
        assert_eq!(peer.reliable_remote(), 2);
    }

    #[test]
    fn ack_clears_outstanding() {
        let peer = peer();
        peer.outstanding.insert(4, Bytes::from_static(b"p"));
        peer.outstanding_slices.insert((4, 1), Bytes::from_static(b"s"));

        apply_ack(&peer, 4, None);
        assert!(peer.outstanding.is_empty());
        assert_eq!(peer.outstanding_slices.len(), 1);

        apply_ack(&peer, 4, Some(1));
        assert!(peer.outstanding_slices.is_empty());
    }

    #[tokio::test]
    async fn empty_fanout_resolves_immediately() {
        let (_completion, delivery) = SendCompletion::new(0);
        assert!(delivery.wait().await);
    }

    #[tokio::test]
    async fn fanout_resolves_after_last_part() {
        let (completion, delivery) = SendCompletion::new(3);
        completion.finish(true);
        completion.finish(true);
        completion.finish(true);
        assert!(delivery.wait().await);

        let (completion, delivery) = SendCompletion::new(2);
        completion.finish(true);
        completion.finish(false);
        assert!(!delivery.wait().await);
    }
}
