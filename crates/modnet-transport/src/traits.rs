//! Transport trait definitions

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Events surfaced by a receive loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Datagram received
    Data(Bytes),
    /// Receive-side error (the loop keeps running where possible)
    Error(String),
}

/// Trait for sending datagrams to one remote endpoint.
#[async_trait]
pub trait TransportSender: Send + Sync {
    /// Send one datagram.
    async fn send(&self, data: Bytes) -> Result<()>;

    /// Whether the sender has been closed.
    fn is_open(&self) -> bool;

    /// Close the sender. Further sends fail with [`crate::TransportError::Closed`].
    fn close(&self);
}

/// Trait for receiving transport events.
#[async_trait]
pub trait TransportReceiver: Send {
    /// Receive the next event; `None` once the socket task has stopped.
    async fn recv(&mut self) -> Option<TransportEvent>;
}
