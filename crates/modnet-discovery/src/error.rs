//! Discovery error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("transport error: {0}")]
    Transport(#[from] modnet_transport::TransportError),

    #[error("invalid announcement: {0}")]
    InvalidAnnouncement(#[from] modnet_core::Error),

    #[error("discovery error: {0}")]
    Other(String),
}
