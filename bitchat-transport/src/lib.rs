//! # BitChat Transport
//!
//! Selects between BLE and WiFi-Direct for a given peer and packet, and
//! owns the peer-id ↔ transport-address mappings each radio needs. The BLE
//! GATT stack and the WiFi-Direct P2P stack themselves are external
//! collaborators — this crate only makes the routing decision and tracks
//! which address belongs to which identity.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod router;

pub use router::{BleFingerprintManager, BlePeerInfo, PeerMapper, Transport, TransportRouter, WifiPeerInfo};

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the transport layer.
#[derive(Debug, Error)]
pub enum Error {
    /// No mapping exists for the given address.
    #[error("unknown peer address: {0}")]
    UnknownPeer(String),
}
