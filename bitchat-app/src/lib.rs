//! BitChat application facade.
//!
//! Wires the identity, the two encrypted stores, the database keystore, the
//! conversation engine, the send pipeline, and the transport router behind
//! one `AppState`: a set of independently Mutex-guarded singletons exposed
//! as plain async methods. This crate has no UI of its own — no IPC layer,
//! no command dispatch — just the facade a UI binding would sit behind.
//!
//! The Noise handshake/session layer is an external collaborator, reached
//! through the [`bitchat_core::Sender`] trait object supplied at
//! construction time; this crate ships [`NullSender`] as a logging stand-in
//! so the facade is usable standalone.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bitchat_core::send_pipeline::EmitCallback;
use bitchat_core::{
    Config, Contact, ContactExchangePayload, ContactStore, ConversationEngine, ConversationSink,
    DeliveryStatus, EncryptedDbKeystore, FileBackedEnclave, Message, MessageStore, PanicWipe,
    Sender, SendPipeline, SendRequest, VerificationMethod, WipeReport,
};
use bitchat_transport::{BlePeerInfo, Transport, TransportRouter, WifiPeerInfo};
use bip39::Mnemonic;
use ed25519_dalek::SigningKey;
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

/// The user's identity: a 24-word mnemonic and the two keypairs it derives —
/// an X25519 static secret (the Noise identity) and an Ed25519 signing key,
/// each domain-separated from the same BIP-39 seed by hashing a distinct
/// context string into the key material before deriving it.
pub struct Identity {
    pub mnemonic: Vec<String>,
    static_secret: StaticSecret,
    pub public_key: [u8; 32],
    signing_key: SigningKey,
    pub verifying_key: [u8; 32],
    pub hash_id: String,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("hash_id", &self.hash_id)
            .field("public_key", &hex::encode(self.public_key))
            .finish_non_exhaustive()
    }
}

impl Identity {
    fn from_seed(mnemonic: Vec<String>, seed: &[u8]) -> Result<Self, String> {
        if seed.len() < 32 {
            return Err("mnemonic seed too short".to_string());
        }
        let mut root_key = [0u8; 32];
        root_key.copy_from_slice(&seed[..32]);

        let static_secret = StaticSecret::from(root_key);
        let public_key = PublicKey::from(&static_secret).to_bytes();

        let mut hasher = Sha256::new();
        hasher.update(b"bitchat-ed25519-signing-key-v1");
        hasher.update(root_key);
        let signing_seed: [u8; 32] = hasher.finalize().into();
        let signing_key = SigningKey::from_bytes(&signing_seed);
        let verifying_key = signing_key.verifying_key().to_bytes();

        let hash_id = bitchat_core::hash_id(&public_key);

        Ok(Self {
            mnemonic,
            static_secret,
            public_key,
            signing_key,
            verifying_key,
            hash_id,
        })
    }

    /// Generates a fresh 24-word mnemonic and derives both keypairs from it.
    fn generate() -> Result<Self, String> {
        let mut entropy = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy(&entropy).map_err(|e| e.to_string())?;
        let words: Vec<String> = mnemonic.word_iter().map(str::to_string).collect();
        let seed = mnemonic.to_seed("");
        Self::from_seed(words, &seed)
    }

    /// Recovers an identity from a previously generated 24-word mnemonic.
    fn from_mnemonic(words: Vec<String>) -> Result<Self, String> {
        if words.len() != 24 {
            return Err("mnemonic must be 24 words".to_string());
        }
        let phrase = words.join(" ");
        let mnemonic = Mnemonic::parse(&phrase).map_err(|e| e.to_string())?;
        let seed = mnemonic.to_seed("");
        Self::from_seed(words, &seed)
    }
}

/// Result of creating or recovering an identity.
#[derive(Debug, Clone, Serialize)]
pub struct CreateIdentityResult {
    pub mnemonic: Vec<String>,
    pub hash_id: String,
    pub qr_uri: String,
}

/// Logging stand-in for the Noise handshake/session layer. Real transports
/// supply their own [`Sender`] at [`AppState::new`] time; this one lets the
/// facade run standalone and in tests without a live session manager.
pub struct NullSender;

impl Sender for NullSender {
    fn has_session(&self, _addr: &str) -> bool {
        false
    }
    fn initiate_handshake(&self, addr: &str) {
        tracing::debug!(addr, "initiate_handshake (no session layer wired)");
    }
    fn send_announce(&self, addr: &str) {
        tracing::debug!(addr, "send_announce (no session layer wired)");
    }
    fn send_read_receipt(&self, addr: &str, msg_id: &str) {
        tracing::debug!(addr, msg_id, "send_read_receipt (no session layer wired)");
    }
}

/// Feeds messages the send pipeline produces into both the in-memory
/// conversation engine and the durable message log, so a sent message is
/// visible to the UI the instant it's queued.
struct AppSink {
    conversation: Arc<Mutex<ConversationEngine>>,
    messages: Arc<Mutex<MessageStore>>,
}

impl ConversationSink for AppSink {
    fn insert_outbound(&self, peer_addr: &str, msg: Message) {
        self.conversation
            .lock()
            .expect("conversation lock poisoned")
            .insert(peer_addr, msg.clone());
        self.messages
            .lock()
            .expect("messages lock poisoned")
            .save(peer_addr, msg);
    }
}

/// Application state: one instance per running client. Every store is
/// guarded by its own lock — independently-locked singletons rather than
/// one big lock, so a long-running operation on one store never blocks
/// reads of another.
pub struct AppState {
    identity: Mutex<Option<Identity>>,
    contacts: Arc<Mutex<ContactStore>>,
    messages: Arc<Mutex<MessageStore>>,
    keystore: Mutex<EncryptedDbKeystore<FileBackedEnclave>>,
    conversation: Arc<Mutex<ConversationEngine>>,
    transport: Mutex<TransportRouter>,
    config: Mutex<Config>,
    send_pipeline: SendPipeline<AppSink>,
    sender: Arc<dyn Sender>,
    my_peer_address: bitchat_core::PeerAddress,
    data_dir: PathBuf,
    contacts_path: PathBuf,
    messages_path: PathBuf,
}

impl AppState {
    /// Builds the facade, loading any previously persisted contacts and
    /// messages. `install_id` is a stable per-install token the keystore
    /// binds its wrapping key to; `my_peer_address` is the ephemeral
    /// transport address the local radio stack is currently advertising.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        install_id: Vec<u8>,
        my_peer_address: impl Into<bitchat_core::PeerAddress>,
        config: Config,
        sender: Arc<dyn Sender>,
    ) -> Result<Self, String> {
        let data_dir = data_dir.into();
        let my_peer_address = my_peer_address.into();
        let keystore_path = data_dir.join("keystore.enc");
        let contacts_path = data_dir.join("contacts.enc");
        let messages_path = data_dir.join("messages.enc");

        let mut keystore =
            EncryptedDbKeystore::new(FileBackedEnclave::new(install_id), keystore_path);
        let db_key = keystore.get_or_create().map_err(|e| e.to_string())?;

        let contacts =
            ContactStore::load(contacts_path.clone(), config.persistence_enabled, &db_key)
                .map_err(|e| e.to_string())?;
        let messages = MessageStore::load_from_disk(
            messages_path.clone(),
            config.persistence_enabled,
            config.message_cap,
            &db_key,
        )
        .map_err(|e| e.to_string())?;

        let conversation = Arc::new(Mutex::new(ConversationEngine::new(my_peer_address.clone())));
        let messages = Arc::new(Mutex::new(messages));
        let sink = Arc::new(AppSink {
            conversation: Arc::clone(&conversation),
            messages: Arc::clone(&messages),
        });

        Ok(Self {
            identity: Mutex::new(None),
            contacts: Arc::new(Mutex::new(contacts)),
            messages,
            keystore: Mutex::new(keystore),
            conversation,
            transport: Mutex::new(TransportRouter::new()),
            config: Mutex::new(config),
            send_pipeline: SendPipeline::new(sink),
            sender,
            my_peer_address,
            data_dir,
            contacts_path,
            messages_path,
        })
    }

    // -- Identity -----------------------------------------------------

    pub async fn create_identity(&self) -> Result<CreateIdentityResult, String> {
        let identity = Identity::generate()?;
        let result = CreateIdentityResult {
            mnemonic: identity.mnemonic.clone(),
            hash_id: identity.hash_id.clone(),
            qr_uri: bitchat_core::qr_uri(&identity.public_key),
        };
        *self.identity.lock().expect("identity lock poisoned") = Some(identity);
        Ok(result)
    }

    pub async fn recover_identity(&self, mnemonic: Vec<String>) -> Result<String, String> {
        let identity = Identity::from_mnemonic(mnemonic)?;
        let hash_id = identity.hash_id.clone();
        *self.identity.lock().expect("identity lock poisoned") = Some(identity);
        Ok(hash_id)
    }

    pub async fn my_qr_uri(&self) -> Result<String, String> {
        let identity = self.identity.lock().expect("identity lock poisoned");
        let identity = identity.as_ref().ok_or("no identity created yet")?;
        Ok(bitchat_core::qr_uri(&identity.public_key))
    }

    /// Builds the compact contact-exchange payload to hand the peer directly
    /// (QR code or in-band introduction), distinct from the hash-id-only QR
    /// link: this one carries the actual keys, for first contact.
    pub async fn contact_exchange_payload(&self, display_name: &str) -> Result<String, String> {
        let identity = self.identity.lock().expect("identity lock poisoned");
        let identity = identity.as_ref().ok_or("no identity created yet")?;
        let payload = ContactExchangePayload {
            v: 1,
            n: display_name.to_string(),
            npk: hex::encode(identity.public_key),
            spk: Some(hex::encode(identity.verifying_key)),
        };
        payload.to_json().map_err(|e| e.to_string())
    }

    // -- Contacts -------------------------------------------------------

    pub async fn add_contact_by_hash_uri(
        &self,
        qr_uri: &str,
        custom_name: Option<String>,
    ) -> Result<Contact, String> {
        let hash = bitchat_core::parse_qr_uri(qr_uri).map_err(|e| e.to_string())?;
        self.contacts
            .lock()
            .expect("contacts lock poisoned")
            .add_by_hash_id(&hash, custom_name, VerificationMethod::Qr, now_millis())
            .map_err(|e| e.to_string())
    }

    pub async fn add_contact_from_exchange_payload(&self, json: &str) -> Result<Contact, String> {
        let payload = ContactExchangePayload::from_json(json).map_err(|e| e.to_string())?;
        let pk = decode_hex32(&payload.npk)?;
        let sk = match &payload.spk {
            Some(s) => Some(decode_hex32(s)?),
            None => None,
        };
        Ok(self.contacts.lock().expect("contacts lock poisoned").add_from_peer(
            pk,
            sk,
            &payload.n,
            None,
            false,
            VerificationMethod::Introduction,
            now_millis(),
        ))
    }

    pub async fn list_contacts(&self) -> Vec<Contact> {
        self.contacts.lock().expect("contacts lock poisoned").ordered_for_ui()
    }

    pub async fn set_favorite(&self, hash: &str, favorite: bool) -> Result<(), String> {
        self.contacts
            .lock()
            .expect("contacts lock poisoned")
            .set_favorite(hash, favorite, now_millis())
            .map_err(|e| e.to_string())
    }

    pub async fn set_trusted(&self, hash: &str, trusted: bool) -> Result<(), String> {
        self.contacts
            .lock()
            .expect("contacts lock poisoned")
            .set_trusted(hash, trusted, now_millis())
            .map_err(|e| e.to_string())
    }

    /// Blocks the contact by its resolved fingerprint and, if it's the
    /// currently-selected conversation, clears the selection.
    pub async fn block_contact(&self, hash: &str) -> Result<(), String> {
        let addr = {
            let mut contacts = self.contacts.lock().expect("contacts lock poisoned");
            contacts
                .set_blocked(hash, true, now_millis())
                .map_err(|e| e.to_string())?;
            contacts
                .get_by_hash(hash)
                .and_then(|c| c.current_peer_address.clone())
        };
        if let Some(addr) = addr {
            self.conversation.lock().expect("conversation lock poisoned").block(&addr);
        }
        Ok(())
    }

    pub async fn unblock_contact(&self, hash: &str) -> Result<(), String> {
        self.contacts
            .lock()
            .expect("contacts lock poisoned")
            .set_blocked(hash, false, now_millis())
            .map_err(|e| e.to_string())
    }

    // -- Conversation -----------------------------------------------------

    /// Brings `addr` into focus: loads any persisted history for this peer
    /// and merges it into the in-memory conversation, resolves the contact's
    /// block/display-name state, then hands off to the conversation engine's
    /// consolidation and handshake-ensure contract.
    pub async fn start_private_chat(&self, addr: &str) -> Result<(), String> {
        let (blocked, display_name) = {
            let contacts = self.contacts.lock().expect("contacts lock poisoned");
            match contacts.get_by_addr(addr) {
                Some(contact) => (
                    contacts.is_blocked(&contact.hash_id),
                    Some(contact.display_name.clone()),
                ),
                None => (false, None),
            }
        };
        let persisted = self.messages.lock().expect("messages lock poisoned").load(addr);
        let mut conversation = self.conversation.lock().expect("conversation lock poisoned");
        for msg in persisted {
            conversation.insert(addr, msg);
        }
        conversation
            .start_private_chat(addr, blocked, display_name.as_deref(), &[], self.sender.as_ref())
            .map_err(|e| e.to_string())
    }

    pub async fn conversation(&self, addr: &str) -> Vec<Message> {
        self.conversation.lock().expect("conversation lock poisoned").conversation(addr)
    }

    /// Queues an outbound message. Returns once it's durably on the per-peer
    /// queue, not once it's been transmitted — delivery status arrives out
    /// of band via [`Self::update_delivery_status`].
    pub async fn send_message(
        &self,
        peer_addr: &str,
        content: &str,
        recipient_nickname: Option<String>,
    ) -> Result<(), String> {
        let sender = Arc::clone(&self.sender);
        let emit_callback: EmitCallback = Box::new(move |content, addr, _recipient, msg_id| {
            tracing::debug!(addr, msg_id, len = content.len(), "handing message to the transport layer");
            if !sender.has_session(addr) {
                sender.initiate_handshake(addr);
            }
        });
        self.send_pipeline
            .enqueue(SendRequest {
                content: content.to_string(),
                peer_addr: peer_addr.to_string(),
                recipient_nickname,
                sender_nickname: None,
                my_peer_addr: self.my_peer_address.clone(),
                emit_callback,
            })
            .await
            .map_err(|e| e.to_string())
    }

    /// Receives and records an inbound, already-decrypted message. Called by
    /// the transport/session layer once a message clears the Noise session.
    pub async fn receive_message(&self, msg: Message, suppress_unread: bool) -> Result<(), String> {
        let blocked = match &msg.sender_peer_address {
            Some(addr) => {
                let contacts = self.contacts.lock().expect("contacts lock poisoned");
                contacts
                    .get_by_addr(addr)
                    .map(|c| contacts.is_blocked(&c.hash_id))
                    .unwrap_or(false)
            }
            None => false,
        };
        if let Some(addr) = &msg.sender_peer_address {
            self.messages.lock().expect("messages lock poisoned").save(addr, msg.clone());
        }
        self.conversation
            .lock()
            .expect("conversation lock poisoned")
            .handle_incoming(msg, suppress_unread, blocked);
        Ok(())
    }

    pub async fn update_delivery_status(
        &self,
        msg_id: &str,
        peer_addr: &str,
        status: DeliveryStatus,
    ) -> Result<(), String> {
        self.messages
            .lock()
            .expect("messages lock poisoned")
            .update_status(msg_id, peer_addr, status)
            .map_err(|e| e.to_string())
    }

    pub async fn search_messages(&self, query: &str, peer_addr: Option<&str>) -> Vec<Message> {
        self.messages.lock().expect("messages lock poisoned").search(query, peer_addr)
    }

    // -- Transport --------------------------------------------------------

    pub async fn select_transport(
        &self,
        ble: Option<BlePeerInfo>,
        wifi: Option<WifiPeerInfo>,
        battery_percent: u8,
        packet_size: usize,
    ) -> Transport {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .select(ble.as_ref(), wifi.as_ref(), battery_percent, packet_size)
    }

    pub async fn observe_ble_peer(&self, info: BlePeerInfo) {
        self.transport.lock().expect("transport lock poisoned").ble.observe(info);
    }

    pub async fn bind_peer_address(&self, addr: bitchat_core::PeerAddress, hash: bitchat_core::HashId) {
        self.transport
            .lock()
            .expect("transport lock poisoned")
            .peer_mapper
            .bind(addr, hash);
    }

    // -- Config / persistence ---------------------------------------------

    pub async fn get_config(&self) -> Config {
        self.config.lock().expect("config lock poisoned").clone()
    }

    pub async fn set_config(&self, config: Config) {
        *self.config.lock().expect("config lock poisoned") = config;
    }

    /// Persists the current contact and message stores under the keystore's
    /// database key. A no-op for either store when persistence is disabled.
    pub async fn persist_all(&self) -> Result<(), String> {
        let db_key = self
            .keystore
            .lock()
            .expect("keystore lock poisoned")
            .get_or_create()
            .map_err(|e| e.to_string())?;
        self.contacts
            .lock()
            .expect("contacts lock poisoned")
            .persist(&db_key)
            .map_err(|e| e.to_string())?;
        self.messages
            .lock()
            .expect("messages lock poisoned")
            .persist(&db_key)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Destroys all durable and in-memory state: shuts down the send
    /// pipeline, wipes the message/contact snapshots and the data
    /// directory's top-level files, and shreds the database key.
    pub async fn panic_wipe(&self) -> WipeReport {
        self.send_pipeline.shutdown();

        let wipe = PanicWipe::new(
            vec![self.messages_path.clone(), self.contacts_path.clone()],
            Vec::new(),
            None,
            Some(self.data_dir.clone()),
        );

        let mut keystore = self.keystore.lock().expect("keystore lock poisoned");
        let my_peer_address = self.my_peer_address.clone();
        wipe.run(&mut keystore, || {
            self.messages.lock().expect("messages lock poisoned").delete_all();
            self.contacts.lock().expect("contacts lock poisoned").clear();
            *self.conversation.lock().expect("conversation lock poisoned") =
                ConversationEngine::new(my_peer_address);
            *self.identity.lock().expect("identity lock poisoned") = None;
        })
    }
}

fn decode_hex32(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| e.to_string())?;
    bytes.try_into().map_err(|_| "expected 32 bytes".to_string())
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_dir() -> PathBuf {
        let dir = env::temp_dir().join(format!("bitchat_app_test_{}", rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn new_state(data_dir: PathBuf) -> AppState {
        AppState::new(
            data_dir,
            b"test-install".to_vec(),
            "me",
            Config {
                persistence_enabled: true,
                ..Config::default()
            },
            Arc::new(NullSender),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_identity_yields_a_resolvable_hash_id() {
        let dir = temp_dir();
        let state = new_state(dir.clone());
        let result = state.create_identity().await.unwrap();
        assert_eq!(result.mnemonic.len(), 24);
        assert!(bitchat_core::is_valid_hash_id(&result.hash_id));
        assert!(result.qr_uri.starts_with("bitchat://add/"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn recover_identity_reproduces_the_same_hash_id() {
        let dir = temp_dir();
        let state = new_state(dir.clone());
        let created = state.create_identity().await.unwrap();
        let mnemonic = {
            let identity = state.identity.lock().unwrap();
            identity.as_ref().unwrap().mnemonic.clone()
        };

        let other_dir = temp_dir();
        let other = new_state(other_dir.clone());
        let recovered_hash = other.recover_identity(mnemonic).await.unwrap();
        assert_eq!(recovered_hash, created.hash_id);

        let _ = std::fs::remove_dir_all(&dir);
        let _ = std::fs::remove_dir_all(&other_dir);
    }

    #[tokio::test]
    async fn send_then_receive_round_trips_through_the_conversation() {
        let dir = temp_dir();
        let state = new_state(dir.clone());
        state.send_message("peer-a", "hello", None).await.unwrap();

        let conv = state.conversation("peer-a").await;
        assert_eq!(conv.len(), 1);
        assert_eq!(conv[0].content, "hello");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn blocking_a_contact_refuses_start_private_chat() {
        let dir = temp_dir();
        let state = new_state(dir.clone());
        let contact = state.contacts.lock().unwrap().add_from_peer(
            [3u8; 32],
            None,
            "Eve",
            Some("peer-eve".to_string()),
            false,
            VerificationMethod::Manual,
            1,
        );
        state.block_contact(&contact.hash_id).await.unwrap();

        let result = state.start_private_chat("peer-eve").await;
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn panic_wipe_clears_identity_and_contacts() {
        let dir = temp_dir();
        let state = new_state(dir.clone());
        state.create_identity().await.unwrap();
        state
            .contacts
            .lock()
            .unwrap()
            .add_from_peer([4u8; 32], None, "Carol", None, false, VerificationMethod::Manual, 1);
        state.persist_all().await.unwrap();

        let report = state.panic_wipe().await;
        assert!(report.success, "errors: {:?}", report.errors);
        assert!(state.identity.lock().unwrap().is_none());
        assert!(state.list_contacts().await.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
