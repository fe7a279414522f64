//! The durable set of known identities: trust/block/favorite flags, and the
//! binding between a stable `HashID` and a contact's current ephemeral
//! `PeerAddress`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::identity::{fingerprint, hash_id, is_valid_hash_id};
use crate::{HashId, PeerAddress};

/// How a contact's identity was verified, per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationMethod {
    /// Verified by comparing fingerprints in person.
    InPerson,
    /// Verified by scanning a QR code.
    Qr,
    /// Introduced by a mutually trusted contact.
    Introduction,
    /// Entered manually, unverified.
    Manual,
}

/// A known identity and everything the app has learned about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    /// The contact's static public key. Empty (all-zero) for a placeholder
    /// created by [`ContactStore::add_by_hash_id`] before the peer is ever
    /// observed. Immutable once non-empty.
    pub public_key: [u8; 32],
    /// Whether `public_key` has been observed yet (placeholder vs. real).
    pub public_key_known: bool,
    /// Optional signing key, observed the same way as `public_key`.
    pub signing_key: Option<[u8; 32]>,
    /// Pure function of `public_key`; stable once the key is known.
    pub hash_id: HashId,
    /// The contact's self-announced display name.
    pub display_name: String,
    /// A local override of `display_name`.
    pub custom_name: Option<String>,
    pub trusted: bool,
    pub blocked: bool,
    pub favorite: bool,
    pub groups: Vec<String>,
    pub notes: Option<String>,
    pub verification_method: VerificationMethod,
    /// The ephemeral transport address this contact is currently reachable
    /// at, if any.
    pub current_peer_address: Option<PeerAddress>,
    pub connected: bool,
    pub last_seen_at: Option<u64>,
    pub unread_count: u32,
    pub last_message_at: Option<u64>,
    pub added_at: u64,
    pub updated_at: u64,
}

impl Contact {
    fn placeholder(hash: HashId, custom_name: Option<String>, method: VerificationMethod, now: u64) -> Self {
        Self {
            public_key: [0u8; 32],
            public_key_known: false,
            signing_key: None,
            hash_id: hash,
            display_name: String::new(),
            custom_name,
            trusted: false,
            blocked: false,
            favorite: false,
            groups: Vec::new(),
            notes: None,
            verification_method: method,
            current_peer_address: None,
            connected: false,
            last_seen_at: None,
            unread_count: 0,
            last_message_at: None,
            added_at: now,
            updated_at: now,
        }
    }

    /// The fingerprint used for durable block/favorite lookups, independent
    /// of whether the contact's key is currently known.
    pub fn fingerprint(&self) -> Option<String> {
        self.public_key_known.then(|| fingerprint(&self.public_key))
    }
}

/// Durable set of known identities. Internally single-locked; mutators are
/// atomic against concurrent readers, matching the failure-semantics
/// contract.
pub struct ContactStore {
    contacts: HashMap<HashId, Contact>,
    /// Fingerprints blocked even for identities never added as a contact —
    /// blocking survives ephemeral-address rotation and applies before a
    /// peer is ever added.
    blocked_fingerprints: std::collections::HashSet<String>,
    persistence_enabled: bool,
    path: PathBuf,
    snapshot_tx: watch::Sender<Vec<Contact>>,
}

impl ContactStore {
    /// Builds an empty store. Persistence is gated by `persistence_enabled`
    /// and, when on, snapshots are written encrypted to `path`.
    pub fn new(path: impl Into<PathBuf>, persistence_enabled: bool) -> Self {
        let (snapshot_tx, _rx) = watch::channel(Vec::new());
        Self {
            contacts: HashMap::new(),
            blocked_fingerprints: std::collections::HashSet::new(),
            persistence_enabled,
            path: path.into(),
            snapshot_tx,
        }
    }

    fn touch_snapshot(&self) {
        let _ = self.snapshot_tx.send(self.ordered_for_ui());
    }

    /// Creates a placeholder contact keyed by `hash`, with no public key
    /// yet observed. Idempotent: calling again with an existing `hash`
    /// returns the existing contact rather than erroring.
    pub fn add_by_hash_id(
        &mut self,
        hash: &str,
        custom_name: Option<String>,
        method: VerificationMethod,
        now: u64,
    ) -> Result<Contact> {
        if !is_valid_hash_id(hash) {
            return Err(Error::InvalidInput(format!("invalid hash id: {hash}")));
        }
        if let Some(existing) = self.contacts.get(hash) {
            return Ok(existing.clone());
        }
        let contact = Contact::placeholder(hash.to_string(), custom_name, method, now);
        self.contacts.insert(hash.to_string(), contact.clone());
        self.touch_snapshot();
        Ok(contact)
    }

    /// Inserts or updates a contact derived from an observed public key.
    pub fn add_from_peer(
        &mut self,
        pk: [u8; 32],
        sk: Option<[u8; 32]>,
        display_name: &str,
        addr: Option<PeerAddress>,
        trusted: bool,
        method: VerificationMethod,
        now: u64,
    ) -> Contact {
        let hash = hash_id(&pk);
        let contact = self.contacts.entry(hash.clone()).or_insert_with(|| {
            Contact::placeholder(hash.clone(), None, method, now)
        });
        contact.public_key = pk;
        contact.public_key_known = true;
        contact.signing_key = sk;
        contact.display_name = display_name.to_string();
        contact.trusted = trusted;
        contact.current_peer_address = addr;
        contact.connected = true;
        contact.last_seen_at = Some(now);
        contact.updated_at = now;
        let fp = fingerprint(&pk);
        if self.blocked_fingerprints.contains(&fp) {
            contact.blocked = true;
        }
        let snapshot = contact.clone();
        self.touch_snapshot();
        snapshot
    }

    /// If a contact with this public key already exists, refreshes its live
    /// state. Otherwise a no-op — unknown peers are never auto-added.
    pub fn sync_with_peer(
        &mut self,
        addr: PeerAddress,
        pk: [u8; 32],
        _sk: Option<[u8; 32]>,
        display_name: &str,
        now: u64,
    ) {
        let hash = hash_id(&pk);
        if let Some(contact) = self.contacts.get_mut(&hash) {
            if contact.public_key_known {
                contact.current_peer_address = Some(addr);
                contact.connected = true;
                contact.display_name = display_name.to_string();
                contact.last_seen_at = Some(now);
                contact.updated_at = now;
                self.touch_snapshot();
            }
        }
    }

    pub fn is_contact(&self, pk: &[u8; 32]) -> bool {
        self.contacts.values().any(|c| c.public_key_known && &c.public_key == pk)
    }

    /// True if `hash`'s contact is blocked, OR its fingerprint is on the
    /// standalone blocklist (block survives identity never being added).
    pub fn is_blocked(&self, hash: &str) -> bool {
        match self.contacts.get(hash) {
            Some(c) if c.blocked => true,
            Some(c) => c
                .fingerprint()
                .map(|fp| self.blocked_fingerprints.contains(&fp))
                .unwrap_or(false),
            None => false,
        }
    }

    /// True if `fingerprint` is blocked, regardless of whether it belongs to
    /// a known contact.
    pub fn is_fingerprint_blocked(&self, fingerprint: &str) -> bool {
        self.blocked_fingerprints.contains(fingerprint)
    }

    pub fn get_by_hash(&self, hash: &str) -> Option<&Contact> {
        self.contacts.get(hash)
    }

    pub fn get_by_pk(&self, pk: &[u8; 32]) -> Option<&Contact> {
        self.contacts.values().find(|c| c.public_key_known && &c.public_key == pk)
    }

    pub fn get_by_addr(&self, addr: &str) -> Option<&Contact> {
        self.contacts
            .values()
            .find(|c| c.current_peer_address.as_deref() == Some(addr))
    }

    pub fn set_favorite(&mut self, hash: &str, favorite: bool, now: u64) -> Result<()> {
        self.mutate(hash, now, |c| c.favorite = favorite)
    }

    /// Blocking resolves to the contact's fingerprint (§4.5.8): recorded
    /// against the fingerprint, not the ephemeral address, so it survives
    /// address rotation and applies even if the contact is later removed.
    pub fn set_blocked(&mut self, hash: &str, blocked: bool, now: u64) -> Result<()> {
        let fp = self
            .contacts
            .get(hash)
            .ok_or(Error::NotFound)?
            .fingerprint();
        if let Some(fp) = fp {
            if blocked {
                self.blocked_fingerprints.insert(fp);
            } else {
                self.blocked_fingerprints.remove(&fp);
            }
        }
        self.mutate(hash, now, |c| c.blocked = blocked)
    }

    /// Blocks a fingerprint directly, without requiring a contact to exist.
    pub fn block_fingerprint(&mut self, fingerprint: &str) {
        self.blocked_fingerprints.insert(fingerprint.to_string());
    }

    pub fn unblock_fingerprint(&mut self, fingerprint: &str) {
        self.blocked_fingerprints.remove(fingerprint);
    }

    pub fn set_trusted(&mut self, hash: &str, trusted: bool, now: u64) -> Result<()> {
        self.mutate(hash, now, |c| c.trusted = trusted)
    }

    pub fn update_display_name(&mut self, hash: &str, name: &str, now: u64) -> Result<()> {
        let name = name.to_string();
        self.mutate(hash, now, move |c| c.display_name = name)
    }

    pub fn update_custom_name(&mut self, hash: &str, name: Option<String>, now: u64) -> Result<()> {
        self.mutate(hash, now, move |c| c.custom_name = name)
    }

    pub fn increment_unread(&mut self, hash: &str, now: u64) -> Result<()> {
        self.mutate(hash, now, |c| c.unread_count += 1)
    }

    pub fn clear_unread(&mut self, hash: &str, now: u64) -> Result<()> {
        self.mutate(hash, now, |c| c.unread_count = 0)
    }

    pub fn mark_disconnected(&mut self, addr: &str, now: u64) {
        let hash = self
            .contacts
            .iter()
            .find(|(_, c)| c.current_peer_address.as_deref() == Some(addr))
            .map(|(h, _)| h.clone());
        if let Some(hash) = hash {
            let _ = self.mutate(&hash, now, |c| {
                c.connected = false;
            });
        }
    }

    pub fn update_last_message(&mut self, hash: &str, now: u64) -> Result<()> {
        self.mutate(hash, now, |c| c.last_message_at = Some(now))
    }

    fn mutate(&mut self, hash: &str, now: u64, f: impl FnOnce(&mut Contact)) -> Result<()> {
        let contact = self.contacts.get_mut(hash).ok_or(Error::NotFound)?;
        f(contact);
        contact.updated_at = now;
        self.touch_snapshot();
        Ok(())
    }

    /// Listings ordered `favorite DESC, last_message_at DESC NULLS LAST,
    /// display_name ASC`, excluding blocked contacts.
    pub fn ordered_for_ui(&self) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = self
            .contacts
            .values()
            .filter(|c| !c.blocked)
            .cloned()
            .collect();
        contacts.sort_by(|a, b| {
            b.favorite
                .cmp(&a.favorite)
                .then_with(|| b.last_message_at.cmp(&a.last_message_at))
                .then_with(|| a.display_name.cmp(&b.display_name))
        });
        contacts
    }

    /// Subscribes to the current snapshot and every subsequent change.
    pub fn observe_all(&self) -> watch::Receiver<Vec<Contact>> {
        self.snapshot_tx.subscribe()
    }

    /// Drops every contact and blocklist entry from memory. Used by panic
    /// wipe's teardown step, before the on-disk snapshot is deleted.
    pub fn clear(&mut self) {
        self.contacts.clear();
        self.blocked_fingerprints.clear();
        self.touch_snapshot();
    }

    /// Persists the current contact set as an encrypted snapshot keyed by
    /// `db_key`. A no-op when persistence is disabled.
    pub fn persist(&self, db_key: &[u8; 32]) -> Result<()> {
        if !self.persistence_enabled {
            return Ok(());
        }
        let plaintext = bincode::serialize(&self.contacts)
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        write_encrypted(&self.path, db_key, &plaintext)
    }

    /// Loads a previously persisted snapshot. Returns an empty store when
    /// persistence is disabled or no snapshot exists yet.
    pub fn load(path: impl Into<PathBuf>, persistence_enabled: bool, db_key: &[u8; 32]) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new(path.clone(), persistence_enabled);
        if !persistence_enabled || !path.exists() {
            return Ok(store);
        }
        let plaintext = read_encrypted(&path, db_key)?;
        store.contacts = bincode::deserialize(&plaintext)
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        store.touch_snapshot();
        Ok(store)
    }
}

fn write_encrypted(path: &PathBuf, key: &[u8; 32], plaintext: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    let mut out = Vec::with_capacity(12 + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    fs::write(path, out).map_err(|e| Error::PersistenceFailure(e.to_string()))
}

fn read_encrypted(path: &PathBuf, key: &[u8; 32]) -> Result<Vec<u8>> {
    let data = fs::read(path).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    if data.len() < 12 {
        return Err(Error::PersistenceFailure("corrupt snapshot".into()));
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    let nonce = Nonce::from_slice(&data[..12]);
    cipher
        .decrypt(nonce, &data[12..])
        .map_err(|_| Error::PersistenceFailure("decryption failed".into()))
}
