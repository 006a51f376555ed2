//! ModNet Session
//!
//! The two transport roles and everything they share:
//! - [`Host`] owns the roster, admits clients through the challenge/response
//!   handshake, relays peer-to-peer traffic, and announces itself for
//!   discovery.
//! - [`Client`] connects to a host, mirrors its roster, and exchanges module
//!   payloads.
//!
//! Both roles drive the same reliable delivery engine (ack + retransmit +
//! ordering gate + chunk reassembly) and the same module dispatcher:
//! register a handler under a [`ModuleId`], then `send` with one of the four
//! [`Reliability`] classes. Completions surface as [`Delivery`] values that
//! resolve to a boolean; lifecycle changes arrive on the [`SessionEvent`]
//! channel returned by the role constructors.
//!
//! ```no_run
//! use modnet_core::{ModuleId, Reliability};
//! use modnet_session::{Client, SessionConfig};
//!
//! # async fn run() -> modnet_session::Result<()> {
//! let (client, mut events) = Client::connect(
//!     "192.168.1.17:26822".parse().unwrap(),
//!     SessionConfig::default(),
//! )
//! .await?;
//!
//! let chat = ModuleId::from_name("chat");
//! let _handle = client.register_module(chat, |sender, payload| {
//!     println!("peer {} says {:?}", sender, payload);
//! })?;
//!
//! let delivery = client
//!     .send(Reliability::ReliableOrdered, chat, "hello".into(), None)
//!     .await;
//! assert!(delivery.wait().await);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod host;
pub mod peer;

mod handshake;
mod reliable;

pub use client::Client;
pub use config::{SessionConfig, MAX_PEERS, MIN_PEERS};
pub use dispatch::{ModuleHandle, ModuleHandler, ModuleRegistry};
pub use error::{Result, SessionError};
pub use event::{ConnectionState, DisconnectReason, SessionEvent};
pub use host::Host;
pub use peer::{Peer, PeerIdentity, PeerSummary};
pub use reliable::Delivery;

pub use modnet_core::{ModuleId, PeerColor, Reliability};
