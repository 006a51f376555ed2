//! Host presence announcer
//!
//! Fixed-interval heartbeat loop advertising an open host on the discovery
//! port. Occupancy changes between ticks, so the packet is re-encoded each
//! round from a caller-supplied snapshot closure.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use modnet_core::{codec, Packet};
use modnet_transport::UdpBroadcast;

use crate::error::Result;
use crate::{AnnounceTarget, DiscoveryConfig};

/// Snapshot of what an open host advertises.
#[derive(Debug, Clone)]
pub struct Announcement {
    pub host_name: String,
    pub capacity: u8,
    pub occupancy: u8,
}

impl Announcement {
    fn to_packet(&self) -> Packet {
        Packet::HostPresence {
            host_name: self.host_name.clone(),
            capacity: self.capacity,
            occupancy: self.occupancy,
        }
    }
}

/// Periodic presence heartbeat. The loop stops when the announcer is dropped
/// or [`Announcer::stop`] is called.
pub struct Announcer {
    task: JoinHandle<()>,
}

impl Announcer {
    /// Validate the announcement, bind the heartbeat socket, and start the
    /// broadcast loop. `snapshot` is polled once per tick.
    pub async fn start<F>(config: &DiscoveryConfig, snapshot: F) -> Result<Self>
    where
        F: Fn() -> Announcement + Send + Sync + 'static,
    {
        // Reject bad names up front rather than once per tick.
        codec::encode(&snapshot().to_packet())?;

        let sender = match config.target {
            AnnounceTarget::Broadcast => UdpBroadcast::broadcast(config.port).await?,
            AnnounceTarget::Multicast(group) => {
                UdpBroadcast::multicast(group, config.port).await?
            }
            AnnounceTarget::Unicast(addr) => UdpBroadcast::unicast(addr).await?,
        };
        let sender = Arc::new(sender);
        let interval = config.interval;

        let task = tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                ticker.tick().await;
                let announcement = snapshot();
                let bytes = match codec::encode(&announcement.to_packet()) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("presence encode failed: {}", e);
                        continue;
                    }
                };
                match sender.send(&bytes).await {
                    Ok(()) => debug!(
                        host = %announcement.host_name,
                        occupancy = announcement.occupancy,
                        "presence heartbeat sent"
                    ),
                    Err(e) => warn!("presence heartbeat failed: {}", e),
                }
            }
        });

        Ok(Self { task })
    }

    /// Stop the heartbeat loop.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Announcer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
