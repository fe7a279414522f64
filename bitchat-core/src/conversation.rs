//! In-memory chat state: dedup, cross-identity consolidation, unread
//! tracking, read receipts, and the handshake-initiator tie-break.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::message::{DeliveryStatus, Message};
use crate::PeerAddress;

/// Capability the engine uses to reach the transport/encryption layer,
/// wired in at construction time rather than owned — this is the
/// engine-side half of the cyclic engine/transport relationship.
pub trait Sender: Send + Sync {
    /// True once a Noise session with `addr` exists.
    fn has_session(&self, addr: &str) -> bool;
    /// Begins a Noise handshake with `addr`.
    fn initiate_handshake(&self, addr: &str);
    /// Announces this identity to `addr` without waiting for a session.
    fn send_announce(&self, addr: &str);
    /// Sends a read receipt for `msg_id` to `addr`. Best-effort; failure of
    /// one receipt must not block the others.
    fn send_read_receipt(&self, addr: &str, msg_id: &str);
}

/// Prefix used for ephemeral Nostr-relay conversation keys, fixed at 16 hex
/// characters (8 bytes) of the relay pubkey.
pub const NOSTR_TEMP_PREFIX: &str = "nostr_";

/// The central in-memory conversation structure.
pub struct ConversationEngine {
    conversations: HashMap<PeerAddress, Vec<Message>>,
    unread: HashSet<PeerAddress>,
    pending_read_receipts: HashMap<PeerAddress, Vec<String>>,
    selected: Option<PeerAddress>,
    my_peer_address: PeerAddress,
}

impl ConversationEngine {
    /// Builds an empty engine for the local identity at `my_peer_address`.
    pub fn new(my_peer_address: impl Into<PeerAddress>) -> Self {
        Self {
            conversations: HashMap::new(),
            unread: HashSet::new(),
            pending_read_receipts: HashMap::new(),
            selected: None,
            my_peer_address: my_peer_address.into(),
        }
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn unread_peers(&self) -> &HashSet<PeerAddress> {
        &self.unread
    }

    /// Returns a snapshot of `addr`'s conversation, sorted and deduplicated.
    pub fn conversation(&self, addr: &str) -> Vec<Message> {
        self.conversations.get(addr).cloned().unwrap_or_default()
    }

    /// Inserts `msg` into `addr`'s conversation (used by the send pipeline
    /// and by callers re-hydrating from the message store).
    pub fn insert(&mut self, addr: &str, msg: Message) {
        self.conversations.entry(addr.to_string()).or_default().push(msg);
    }

    /// Deduplicates by id (first occurrence kept) and re-sorts by
    /// timestamp ascending. O(n).
    pub fn sanitize(&mut self, addr: &str) {
        let Some(msgs) = self.conversations.get_mut(addr) else {
            return;
        };
        let mut seen = HashSet::new();
        msgs.retain(|m| seen.insert(m.id.clone()));
        msgs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }

    fn sources_for_identity(&self, display_name: &str) -> Vec<PeerAddress> {
        self.conversations
            .iter()
            .filter(|(_, msgs)| {
                msgs.iter().any(|m| {
                    m.sender_display == display_name
                        || m.recipient_nickname.as_deref() == Some(display_name)
                })
            })
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    /// Merges every conversation belonging to `display_name` into
    /// `target_addr`. Idempotent: a second run with the same inputs is a
    /// no-op past the first.
    pub fn consolidate(&mut self, target_addr: &str, display_name: &str) -> Vec<Message> {
        let mut sources = self.sources_for_identity(display_name);
        if !sources.contains(&target_addr.to_string()) {
            sources.push(target_addr.to_string());
        }
        self.merge_into(target_addr, &sources)
    }

    /// Merges a set of ephemeral `nostr_<pub16>`-prefixed conversation keys,
    /// already resolved by the caller (via the contact store) as belonging
    /// to `target_addr`, into the target conversation.
    pub fn merge_nostr_temp(&mut self, target_addr: &str, nostr_keys: &[String]) -> Vec<Message> {
        let mut sources: Vec<PeerAddress> = nostr_keys
            .iter()
            .filter(|k| k.starts_with(NOSTR_TEMP_PREFIX))
            .cloned()
            .collect();
        if !sources.contains(&target_addr.to_string()) {
            sources.push(target_addr.to_string());
        }
        self.merge_into(target_addr, &sources)
    }

    fn merge_into(&mut self, target_addr: &str, sources: &[PeerAddress]) -> Vec<Message> {
        let mut union: Vec<Message> = Vec::new();
        let mut any_unread = false;
        for addr in sources {
            if let Some(msgs) = self.conversations.remove(addr) {
                union.extend(msgs);
            }
            if self.unread.remove(addr) {
                any_unread = true;
            }
        }
        let mut seen = HashSet::new();
        union.retain(|m| seen.insert(m.id.clone()));
        union.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        self.conversations.insert(target_addr.to_string(), union.clone());
        if any_unread {
            self.unread.insert(target_addr.to_string());
        }
        self.pending_read_receipts.remove(target_addr);
        union
    }

    /// Brings `addr` into focus: consolidates any known aliases, sanitizes,
    /// clears unread, and drains pending read receipts.
    ///
    /// `display_name` is the peer's known display name, if any (step 3 of
    /// the contract is skipped when `None`). `known_nostr_keys` are any
    /// `nostr_`-prefixed conversation keys the contact store has resolved
    /// as belonging to this peer.
    pub fn start_private_chat(
        &mut self,
        addr: &str,
        blocked: bool,
        display_name: Option<&str>,
        known_nostr_keys: &[String],
        sender: &dyn Sender,
    ) -> Result<()> {
        if blocked {
            self.append_system_message(addr, "This contact is blocked.");
            return Err(Error::BlockedPeer);
        }
        if !sender.has_session(addr) {
            self.ensure_handshake(addr, sender);
        }
        if let Some(name) = display_name {
            self.consolidate(addr, name);
        }
        if !known_nostr_keys.is_empty() {
            self.merge_nostr_temp(addr, known_nostr_keys);
        }
        self.sanitize(addr);
        self.selected = Some(addr.to_string());
        self.unread.remove(addr);
        self.drain_read_receipts(addr, sender);
        Ok(())
    }

    /// §4.5.7: if no session exists, the lexicographically smaller address
    /// is authoritative and initiates; the other side announces and also
    /// initiates, to avoid symmetric handshake collisions.
    pub fn ensure_handshake(&self, addr: &str, sender: &dyn Sender) {
        if sender.has_session(addr) {
            return;
        }
        if self.my_peer_address.as_str() < addr {
            sender.initiate_handshake(addr);
        } else {
            sender.send_announce(addr);
            sender.initiate_handshake(addr);
        }
    }

    /// Handles an inbound message. `suppress_unread` skips unread tracking
    /// (e.g. while actively viewing the conversation). The caller remains
    /// responsible for inserting the message on the mesh path; this method
    /// only sanitizes and updates unread state in that case.
    pub fn handle_incoming(&mut self, msg: Message, suppress_unread: bool, blocked: bool) {
        match msg.sender_peer_address.clone() {
            Some(addr) => {
                if blocked {
                    tracing::debug!(addr, "dropping inbound message from blocked peer");
                    return;
                }
                self.conversations.entry(addr.clone()).or_default();
                self.sanitize(&addr);
                if self.selected.as_deref() != Some(addr.as_str()) && !suppress_unread {
                    self.pending_read_receipts.entry(addr.clone()).or_default().push(msg.id.clone());
                    self.unread.insert(addr);
                }
            }
            None => {
                if let Some(addr) = self.selected.clone() {
                    self.insert(&addr, msg);
                    self.sanitize(&addr);
                }
            }
        }
    }

    /// Emits one read receipt per pending message id for `addr`, then
    /// clears both the pending queue and the unread entry. Best-effort:
    /// one receipt failing does not stop the others (the `Sender` trait
    /// itself has no fallible return for this reason).
    fn drain_read_receipts(&mut self, addr: &str, sender: &dyn Sender) {
        if let Some(ids) = self.pending_read_receipts.remove(addr) {
            for id in ids {
                sender.send_read_receipt(addr, &id);
            }
        }
        self.unread.remove(addr);
    }

    fn append_system_message(&mut self, addr: &str, text: &str) {
        let msg = Message {
            id: crate::message::fresh_message_id(),
            sender_display: "system".to_string(),
            content: text.to_string(),
            timestamp: now_millis(),
            is_private: false,
            recipient_nickname: None,
            sender_peer_address: None,
            delivery_status: DeliveryStatus::Sent,
            encrypted_blob: None,
        };
        self.conversations.entry(addr.to_string()).or_default().push(msg);
    }

    /// Blocks `addr`'s resolved fingerprint (passed in by the caller, which
    /// owns the contact store). If `addr` is the current selection, clears
    /// it and appends a system message to that conversation.
    pub fn block(&mut self, addr: &str) {
        if self.selected.as_deref() == Some(addr) {
            self.selected = None;
            self.append_system_message(addr, "You have blocked this contact.");
        }
    }

    pub fn unblock(&mut self, _addr: &str) {}
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
