//! Session error types

use modnet_core::ModuleId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport error: {0}")]
    Transport(#[from] modnet_transport::TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] modnet_core::Error),

    #[error("discovery error: {0}")]
    Discovery(#[from] modnet_discovery::DiscoveryError),

    #[error("connection denied by host")]
    ConnectDenied,

    #[error("connection attempt timed out")]
    ConnectTimeout,

    #[error("not connected")]
    NotConnected,

    #[error("module {0} is already registered")]
    ModuleAlreadyRegistered(ModuleId),
}
