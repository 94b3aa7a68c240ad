//! Trustless P2P signaling and session core (§1–§9): a relay-mediated call
//! protocol, Ed25519/X25519 envelope crypto, connection sagas, and the
//! update/reliability layer that rides on the resulting data channel.
//!
//! The crate never touches SDP, ICE, or a real peer connection directly —
//! [`connection::channel`] is the seam an embedding application implements
//! against its own WebRTC stack. [`api`] is the entry point.

pub mod api;
pub mod call;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod reliability;
pub mod saga;
pub mod session;
pub mod time;
pub mod transport;

pub use api::{WhisperConfig, WhisperHandle};
pub use error::{Error, Result};
