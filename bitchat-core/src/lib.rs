//! # BitChat Core
//!
//! Identity, contact, and message management for BitChat — a privacy-first
//! peer-to-peer messenger for unreliable and hostile network environments.
//!
//! This crate implements the subsystem described as the CORE in the
//! specification: identity derivation, the contact and message stores, the
//! encrypted at-rest database keystore, the in-memory conversation engine
//! (dedup, cross-identity consolidation, read receipts), and the
//! single-writer send pipeline. The Noise handshake engine, the BLE/WiFi-
//! Direct radio stacks, the Nostr relay overlay, and the UI are external
//! collaborators consumed through trait seams, not implemented here.
//!
//! ## Safety
//!
//! This crate forbids all unsafe code.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod config;
pub mod contact;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod keystore;
pub mod message;
pub mod panic_wipe;
pub mod send_pipeline;

pub use config::Config;
pub use contact::{Contact, ContactStore, VerificationMethod};
pub use conversation::{ConversationEngine, Sender};
pub use error::{Error, Result};
pub use identity::{fingerprint, hash_id, is_valid_hash_id, parse_qr_uri, qr_uri, ContactExchangePayload};
pub use keystore::{EncryptedDbKeystore, FileBackedEnclave, SecureEnclave};
pub use message::{DeliveryStatus, Message, MessageStore};
pub use panic_wipe::{PanicWipe, WipeReport};
pub use send_pipeline::{ConversationSink, SendPipeline, SendRequest};

/// The ephemeral transport-level address of a peer (BLE fingerprint, WiFi
/// MAC, or a Nostr-temp key). Always the transient key into the
/// conversation map — never a durable identifier. See [`identity::hash_id`]
/// and [`identity::fingerprint`] for the durable counterparts.
pub type PeerAddress = String;

/// The 8-character, human-shareable identifier derived from a public key.
pub type HashId = String;
