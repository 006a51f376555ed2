//! Discovery browser
//!
//! Listens on the discovery port, maintains the registry of open hosts, and
//! evicts hosts whose heartbeats stop. Each host gets exactly one timeout
//! watcher task, spawned on first sighting; refreshes re-stamp `last_seen`
//! and the watcher re-arms itself while the entry stays fresh.

use dashmap::DashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, trace, warn};

use modnet_core::{codec, Packet};
use modnet_transport::{TransportEvent, UdpTransport};

use crate::error::Result;
use crate::host::DiscoveredHost;
use crate::{AnnounceTarget, DiscoveryConfig, DiscoveryEvent};

/// LAN host browser. Dropping it stops the listener and all watchers.
pub struct Browser {
    hosts: Arc<DashMap<SocketAddr, DiscoveredHost>>,
    active: Arc<AtomicBool>,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl Browser {
    /// Bind the discovery port and start listening. Returns the browser and
    /// its event stream.
    pub fn start(config: &DiscoveryConfig) -> Result<(Self, mpsc::Receiver<DiscoveryEvent>)> {
        let group = match config.target {
            AnnounceTarget::Multicast(group) => Some(group),
            _ => None,
        };
        let transport = UdpTransport::bind_reuse(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)),
            group,
        )?;
        let local_addr = transport.local_addr()?;
        let mut receiver = transport.start_receiver();

        let hosts: Arc<DashMap<SocketAddr, DiscoveredHost>> = Arc::new(DashMap::new());
        let active = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel(64);

        let loop_hosts = hosts.clone();
        let loop_active = active.clone();
        let local_ip = config.local_ip;
        let timeout = config.host_timeout;

        let task = tokio::spawn(async move {
            while let Some((event, from)) = receiver.recv_from().await {
                if !loop_active.load(Ordering::Acquire) {
                    break;
                }
                let data = match event {
                    TransportEvent::Data(data) => data,
                    TransportEvent::Error(e) => {
                        warn!("discovery receive error: {}", e);
                        continue;
                    }
                };

                // Our own announcer is audible on a shared port; skip it.
                if local_ip == Some(from.ip()) {
                    continue;
                }

                let (host_name, capacity, occupancy) = match codec::decode(&data) {
                    Ok(Packet::HostPresence {
                        host_name,
                        capacity,
                        occupancy,
                    }) => (host_name, capacity, occupancy),
                    Ok(_) => continue,
                    Err(e) => {
                        trace!("ignoring non-presence datagram from {}: {}", from, e);
                        continue;
                    }
                };

                let refreshed = {
                    match loop_hosts.get_mut(&from) {
                        Some(mut entry) => {
                            entry.refresh(host_name.clone(), capacity, occupancy);
                            Some(entry.value().clone())
                        }
                        None => None,
                    }
                };

                match refreshed {
                    Some(host) => {
                        let _ = tx.send(DiscoveryEvent::Updated(host)).await;
                    }
                    None => {
                        let host = DiscoveredHost::new(from, host_name, capacity, occupancy);
                        debug!("discovered host {} at {}", host.name, from);
                        loop_hosts.insert(from, host.clone());
                        tokio::spawn(watch_host(
                            loop_hosts.clone(),
                            tx.clone(),
                            loop_active.clone(),
                            from,
                            timeout,
                        ));
                        let _ = tx.send(DiscoveryEvent::Found(host)).await;
                    }
                }
            }
        });

        Ok((
            Self {
                hosts,
                active,
                local_addr,
                task,
            },
            rx,
        ))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Snapshot of the currently known hosts.
    pub fn hosts(&self) -> Vec<DiscoveredHost> {
        self.hosts.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Look up a host by heartbeat source address.
    pub fn get(&self, addr: &SocketAddr) -> Option<DiscoveredHost> {
        self.hosts.get(addr).map(|entry| entry.value().clone())
    }

    /// Stop listening and invalidate all watchers.
    pub fn stop(&self) {
        self.active.store(false, Ordering::Release);
        self.task.abort();
    }
}

impl Drop for Browser {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Evict `addr` once its heartbeats stop. One watcher per host; it exits
/// when the entry disappears or the browser deactivates.
async fn watch_host(
    hosts: Arc<DashMap<SocketAddr, DiscoveredHost>>,
    tx: mpsc::Sender<DiscoveryEvent>,
    active: Arc<AtomicBool>,
    addr: SocketAddr,
    timeout: Duration,
) {
    loop {
        time::sleep(timeout).await;
        if !active.load(Ordering::Acquire) {
            return;
        }
        let stale = match hosts.get(&addr) {
            Some(host) => host.is_stale(timeout),
            None => return,
        };
        if stale {
            hosts.remove(&addr);
            debug!("host at {} timed out", addr);
            let _ = tx.send(DiscoveryEvent::Lost(addr)).await;
            return;
        }
    }
}
