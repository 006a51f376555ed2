//! ModNet Transport
//!
//! Async UDP plumbing for ModNet: a bound datagram socket with a spawned
//! receive task, per-remote senders, and a broadcast/multicast sender for
//! discovery heartbeats. Framing, integrity, and retransmission live above
//! this layer.

pub mod error;
pub mod traits;
pub mod udp;

pub use error::{Result, TransportError};
pub use traits::{TransportEvent, TransportReceiver, TransportSender};
pub use udp::{UdpBroadcast, UdpConfig, UdpReceiver, UdpSender, UdpTransport};
