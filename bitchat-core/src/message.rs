//! Durable per-conversation message log with cap and retention.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::PeerAddress;

/// Generates a fresh message id: 16 random bytes, hex-encoded.
pub fn fresh_message_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A message's delivery state. Transitions form the monotone chain
/// `Sending -> Sent -> Delivered -> Read`; `Failed` is terminal and
/// overrides `Sending`/`Sent`. Backward transitions besides `Failed` are
/// ignored by [`MessageStore::update_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sending,
    Sent,
    Delivered { to: String, at: u64 },
    Read { by: String, at: u64 },
    Failed { reason: String },
    PartiallyDelivered { reached: u32, total: u32 },
}

impl DeliveryStatus {
    /// Rank in the monotone chain; `Failed` is ranked highest so it always
    /// wins except against another `Failed`, and `PartiallyDelivered` sits
    /// alongside `Sent` (a non-terminal status not part of the main chain).
    fn rank(&self) -> u8 {
        match self {
            DeliveryStatus::Sending => 0,
            DeliveryStatus::Sent => 1,
            DeliveryStatus::PartiallyDelivered { .. } => 1,
            DeliveryStatus::Delivered { .. } => 2,
            DeliveryStatus::Read { .. } => 3,
            DeliveryStatus::Failed { .. } => 4,
        }
    }

    /// On-disk encoding, colon-separated and human-greppable.
    pub fn encode(&self) -> String {
        match self {
            DeliveryStatus::Sending => "sending".to_string(),
            DeliveryStatus::Sent => "sent".to_string(),
            DeliveryStatus::Delivered { to, at } => format!("delivered:{to}:{at}"),
            DeliveryStatus::Read { by, at } => format!("read:{by}:{at}"),
            DeliveryStatus::Failed { reason } => format!("failed:{reason}"),
            DeliveryStatus::PartiallyDelivered { reached, total } => {
                format!("partial:{reached}:{total}")
            }
        }
    }

    /// Parses the on-disk encoding produced by [`Self::encode`].
    pub fn decode(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let status = match parts.next().ok_or(Error::InvalidInput("empty status".into()))? {
            "sending" => DeliveryStatus::Sending,
            "sent" => DeliveryStatus::Sent,
            "delivered" => DeliveryStatus::Delivered {
                to: parts.next().ok_or(Error::InvalidInput(s.into()))?.to_string(),
                at: parts
                    .next()
                    .ok_or(Error::InvalidInput(s.into()))?
                    .parse()
                    .map_err(|_| Error::InvalidInput(s.into()))?,
            },
            "read" => DeliveryStatus::Read {
                by: parts.next().ok_or(Error::InvalidInput(s.into()))?.to_string(),
                at: parts
                    .next()
                    .ok_or(Error::InvalidInput(s.into()))?
                    .parse()
                    .map_err(|_| Error::InvalidInput(s.into()))?,
            },
            "failed" => DeliveryStatus::Failed {
                reason: parts.collect::<Vec<_>>().join(":"),
            },
            "partial" => DeliveryStatus::PartiallyDelivered {
                reached: parts
                    .next()
                    .ok_or(Error::InvalidInput(s.into()))?
                    .parse()
                    .map_err(|_| Error::InvalidInput(s.into()))?,
                total: parts
                    .next()
                    .ok_or(Error::InvalidInput(s.into()))?
                    .parse()
                    .map_err(|_| Error::InvalidInput(s.into()))?,
            },
            other => return Err(Error::InvalidInput(format!("unknown status: {other}"))),
        };
        Ok(status)
    }
}

/// An append-only chat message. Mutation is restricted to `delivery_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_display: String,
    pub content: String,
    pub timestamp: u64,
    pub is_private: bool,
    pub recipient_nickname: Option<String>,
    pub sender_peer_address: Option<PeerAddress>,
    pub delivery_status: DeliveryStatus,
    pub encrypted_blob: Option<Vec<u8>>,
}

struct ConversationLog {
    by_id: HashMap<String, Message>,
    /// Secondary index on `(peer_addr, timestamp)`, timestamp-ordered.
    by_time: BTreeMap<(u64, String), String>,
}

impl ConversationLog {
    fn new() -> Self {
        Self {
            by_id: HashMap::new(),
            by_time: BTreeMap::new(),
        }
    }

    fn upsert(&mut self, msg: Message) {
        if let Some(old) = self.by_id.get(&msg.id) {
            self.by_time.remove(&(old.timestamp, old.id.clone()));
        }
        self.by_time.insert((msg.timestamp, msg.id.clone()), msg.id.clone());
        self.by_id.insert(msg.id.clone(), msg);
    }

    fn remove(&mut self, id: &str) -> Option<Message> {
        let msg = self.by_id.remove(id)?;
        self.by_time.remove(&(msg.timestamp, msg.id.clone()));
        Some(msg)
    }

    fn ordered_ascending(&self) -> Vec<Message> {
        self.by_time
            .values()
            .filter_map(|id| self.by_id.get(id))
            .cloned()
            .collect()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

/// Durable per-conversation message log.
pub struct MessageStore {
    conversations: HashMap<PeerAddress, ConversationLog>,
    persistence_enabled: bool,
    message_cap: usize,
    path: PathBuf,
}

impl MessageStore {
    /// Builds an empty store. `message_cap` is enforced after every save;
    /// persistence gates every write per the external interface contract.
    pub fn new(path: impl Into<PathBuf>, persistence_enabled: bool, message_cap: usize) -> Self {
        Self {
            conversations: HashMap::new(),
            persistence_enabled,
            message_cap,
            path: path.into(),
        }
    }

    /// Upserts `msg` by id, then enforces the per-peer cap. A no-op when
    /// persistence is disabled.
    pub fn save(&mut self, peer_addr: &str, msg: Message) {
        if !self.persistence_enabled {
            return;
        }
        let log = self
            .conversations
            .entry(peer_addr.to_string())
            .or_insert_with(ConversationLog::new);
        log.upsert(msg);
        self.enforce_cap(peer_addr);
    }

    /// Saves a batch as a single transaction (cap enforced once, after all
    /// inserts).
    pub fn save_batch(&mut self, peer_addr: &str, msgs: Vec<Message>) {
        if !self.persistence_enabled {
            return;
        }
        let log = self
            .conversations
            .entry(peer_addr.to_string())
            .or_insert_with(ConversationLog::new);
        for msg in msgs {
            log.upsert(msg);
        }
        self.enforce_cap(peer_addr);
    }

    /// After any save for `peer_addr`, if the conversation exceeds the cap,
    /// deletes the oldest-by-timestamp entries (ties broken by id) until it
    /// is at the cap.
    fn enforce_cap(&mut self, peer_addr: &str) {
        let Some(log) = self.conversations.get_mut(peer_addr) else {
            return;
        };
        let over = log.len().saturating_sub(self.message_cap);
        if over == 0 {
            return;
        }
        let to_remove: Vec<String> = log
            .by_time
            .iter()
            .take(over)
            .map(|(_, id)| id.clone())
            .collect();
        for id in to_remove {
            log.remove(&id);
        }
        tracing::debug!(peer_addr, removed = over, "message cap enforced");
    }

    /// Loads a conversation, ascending by timestamp. Empty when persistence
    /// is disabled.
    pub fn load(&self, peer_addr: &str) -> Vec<Message> {
        if !self.persistence_enabled {
            return Vec::new();
        }
        self.conversations
            .get(peer_addr)
            .map(|log| log.ordered_ascending())
            .unwrap_or_default()
    }

    /// Descending-by-timestamp page, for infinite scroll.
    pub fn load_paginated(&self, peer_addr: &str, limit: usize, offset: usize) -> Vec<Message> {
        if !self.persistence_enabled {
            return Vec::new();
        }
        let mut all = self.load(peer_addr);
        all.reverse();
        all.into_iter().skip(offset).take(limit).collect()
    }

    /// Updates a message's delivery status by id, applying the monotone
    /// transition rule. `Failed` is only accepted as an override of
    /// `Sending`/`Sent`; it cannot regress a message already `Delivered` or
    /// `Read`.
    pub fn update_status(&mut self, msg_id: &str, peer_addr: &str, new_status: DeliveryStatus) -> Result<()> {
        let log = self.conversations.get_mut(peer_addr).ok_or(Error::NotFound)?;
        let msg = log.by_id.get_mut(msg_id).ok_or(Error::NotFound)?;
        let current_rank = msg.delivery_status.rank();
        let accept = new_status.rank() >= current_rank
            || (matches!(new_status, DeliveryStatus::Failed { .. }) && current_rank <= 1);
        if accept {
            msg.delivery_status = new_status;
        }
        Ok(())
    }

    pub fn delete_conversation(&mut self, peer_addr: &str) -> usize {
        self.conversations.remove(peer_addr).map(|log| log.len()).unwrap_or(0)
    }

    pub fn delete_all(&mut self) -> usize {
        let count = self.conversations.values().map(ConversationLog::len).sum();
        self.conversations.clear();
        count
    }

    /// Case-insensitive substring search over `content`, optionally scoped
    /// to one peer.
    pub fn search(&self, query: &str, peer_addr: Option<&str>) -> Vec<Message> {
        let needle = query.to_lowercase();
        let scopes: Vec<&ConversationLog> = match peer_addr {
            Some(addr) => self.conversations.get(addr).into_iter().collect(),
            None => self.conversations.values().collect(),
        };
        scopes
            .into_iter()
            .flat_map(|log| log.ordered_ascending())
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .collect()
    }

    /// Deletes every message older than `now - max_age` across all
    /// conversations.
    pub fn apply_retention(&mut self, now: u64, max_age: u64) {
        let cutoff = now.saturating_sub(max_age);
        for log in self.conversations.values_mut() {
            let stale: Vec<String> = log
                .by_time
                .range(..(cutoff, String::new()))
                .map(|(_, id)| id.clone())
                .collect();
            for id in stale {
                log.remove(&id);
            }
        }
    }

    /// Persists every conversation as one encrypted snapshot. A no-op when
    /// persistence is disabled.
    pub fn persist(&self, db_key: &[u8; 32]) -> Result<()> {
        if !self.persistence_enabled {
            return Ok(());
        }
        let flat: HashMap<&PeerAddress, Vec<Message>> = self
            .conversations
            .iter()
            .map(|(addr, log)| (addr, log.ordered_ascending()))
            .collect();
        let plaintext = bincode::serialize(&flat).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        write_encrypted(&self.path, db_key, &plaintext)
    }

    /// Loads a previously persisted snapshot.
    pub fn load_from_disk(
        path: impl Into<PathBuf>,
        persistence_enabled: bool,
        message_cap: usize,
        db_key: &[u8; 32],
    ) -> Result<Self> {
        let path = path.into();
        let mut store = Self::new(path.clone(), persistence_enabled, message_cap);
        if !persistence_enabled || !path.exists() {
            return Ok(store);
        }
        let plaintext = read_encrypted(&path, db_key)?;
        let flat: HashMap<PeerAddress, Vec<Message>> =
            bincode::deserialize(&plaintext).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        for (addr, msgs) in flat {
            store.save_batch(&addr, msgs);
        }
        Ok(store)
    }

    /// Whether the underlying file deletion should also happen; callers
    /// that turn persistence off decide separately whether to call
    /// `delete_all` and remove the file.
    pub fn delete_db_file(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        }
        Ok(())
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

#[cfg(test)]
fn test_message(id: &str, ts: u64) -> Message {
    Message {
        id: id.to_string(),
        sender_display: "Alice".to_string(),
        content: format!("hello {id}"),
        timestamp: ts,
        is_private: true,
        recipient_nickname: None,
        sender_peer_address: None,
        delivery_status: DeliveryStatus::Sending,
        encrypted_blob: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_path() -> PathBuf {
        env::temp_dir().join(format!("bitchat_messages_test_{}.enc", rand::random::<u64>()))
    }

    #[test]
    fn save_is_a_no_op_when_persistence_is_disabled() {
        let mut store = MessageStore::new(temp_path(), false, 1000);
        store.save("X", test_message("m1", 1000));
        assert!(store.load("X").is_empty());
    }

    #[test]
    fn cap_scenario_from_the_design_doc() {
        // MESSAGE_CAP=3, save ts=1..5 for peer X -> only ts=3,4,5 survive.
        let mut store = MessageStore::new(temp_path(), true, 3);
        for ts in 1..=5u64 {
            store.save("X", test_message(&format!("m{ts}"), ts));
        }
        let remaining: Vec<u64> = store.load("X").iter().map(|m| m.timestamp).collect();
        assert_eq!(remaining, vec![3, 4, 5]);
    }

    #[test]
    fn save_twice_is_an_upsert() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store.save("X", test_message("m1", 1000));
        assert_eq!(store.load("X").len(), 1);
    }

    #[test]
    fn load_is_ascending_by_timestamp() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("m2", 2000));
        store.save("X", test_message("m1", 1000));
        let loaded = store.load("X");
        assert_eq!(loaded[0].id, "m1");
        assert_eq!(loaded[1].id, "m2");
    }

    #[test]
    fn load_paginated_is_descending() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        for ts in 1..=5u64 {
            store.save("X", test_message(&format!("m{ts}"), ts));
        }
        let page = store.load_paginated("X", 2, 0);
        assert_eq!(page.iter().map(|m| m.timestamp).collect::<Vec<_>>(), vec![5, 4]);
    }

    #[test]
    fn update_status_follows_the_monotone_chain() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store.update_status("m1", "X", DeliveryStatus::Sent).unwrap();
        store
            .update_status("m1", "X", DeliveryStatus::Delivered { to: "X".into(), at: 2000 })
            .unwrap();
        // Backward transition to Sending is ignored.
        store.update_status("m1", "X", DeliveryStatus::Sending).unwrap();
        let msg = &store.load("X")[0];
        assert!(matches!(msg.delivery_status, DeliveryStatus::Delivered { .. }));
    }

    #[test]
    fn failed_overrides_sending_or_sent() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store
            .update_status("m1", "X", DeliveryStatus::Failed { reason: "timeout".into() })
            .unwrap();
        let msg = &store.load("X")[0];
        assert!(matches!(msg.delivery_status, DeliveryStatus::Failed { .. }));
    }

    #[test]
    fn failed_does_not_regress_delivered_or_read() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store
            .update_status("m1", "X", DeliveryStatus::Delivered { to: "X".into(), at: 2000 })
            .unwrap();
        store
            .update_status("m1", "X", DeliveryStatus::Failed { reason: "timeout".into() })
            .unwrap();
        let msg = &store.load("X")[0];
        assert!(matches!(msg.delivery_status, DeliveryStatus::Delivered { .. }));

        store.save("Y", test_message("m2", 1000));
        store
            .update_status("m2", "Y", DeliveryStatus::Sent)
            .unwrap();
        store
            .update_status("m2", "Y", DeliveryStatus::Read { by: "Y".into(), at: 3000 })
            .unwrap();
        store
            .update_status("m2", "Y", DeliveryStatus::Failed { reason: "timeout".into() })
            .unwrap();
        let msg = &store.load("Y")[0];
        assert!(matches!(msg.delivery_status, DeliveryStatus::Read { .. }));
    }

    #[test]
    fn delivery_status_encoding_round_trips_all_variants() {
        let variants = vec![
            DeliveryStatus::Sending,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered { to: "X".into(), at: 123 },
            DeliveryStatus::Read { by: "Y".into(), at: 456 },
            DeliveryStatus::Failed { reason: "no route".into() },
            DeliveryStatus::PartiallyDelivered { reached: 2, total: 5 },
        ];
        for v in variants {
            let encoded = v.encode();
            let decoded = DeliveryStatus::decode(&encoded).unwrap();
            assert_eq!(v, decoded);
        }
    }

    #[test]
    fn apply_retention_drops_only_stale_messages() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        store.save("X", test_message("old", 1000));
        store.save("X", test_message("new", 9000));
        store.apply_retention(10_000, 5_000);
        let remaining: Vec<_> = store.load("X").iter().map(|m| m.id.clone()).collect();
        assert_eq!(remaining, vec!["new"]);
    }

    #[test]
    fn search_is_case_insensitive() {
        let mut store = MessageStore::new(temp_path(), true, 1000);
        let mut msg = test_message("m1", 1000);
        msg.content = "Hello World".to_string();
        store.save("X", msg);
        assert_eq!(store.search("world", None).len(), 1);
        assert_eq!(store.search("WORLD", Some("X")).len(), 1);
        assert_eq!(store.search("bye", None).len(), 0);
    }

    #[test]
    fn persist_and_reload_round_trip() {
        let path = temp_path();
        let key = [9u8; 32];
        let mut store = MessageStore::new(path.clone(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store.persist(&key).unwrap();

        let reloaded = MessageStore::load_from_disk(path.clone(), true, 1000, &key).unwrap();
        assert_eq!(reloaded.load("X").len(), 1);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn delete_all_and_delete_db_file_leave_nothing_behind() {
        let path = temp_path();
        let key = [2u8; 32];
        let mut store = MessageStore::new(path.clone(), true, 1000);
        store.save("X", test_message("m1", 1000));
        store.persist(&key).unwrap();

        store.delete_all();
        store.delete_db_file().unwrap();
        assert!(store.load("X").is_empty());
        assert!(!path.exists());
    }
}
