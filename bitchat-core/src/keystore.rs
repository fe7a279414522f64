//! Generates, persists, and shreds the 256-bit database key.
//!
//! The key never touches unencrypted disk: it is wrapped by a
//! [`SecureEnclave`] before being written, using a `[nonce 12B][ciphertext+tag]`
//! on-disk shape.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A 256-bit database key, wrapped for storage.
#[derive(Clone)]
pub struct WrappedKey(Vec<u8>);

/// The OS-specific binding that protects the wrapping key itself (Keychain,
/// Keystore, TPM, ...). Out of scope as an external collaborator; this
/// crate supplies [`FileBackedEnclave`] as the default, pluggable
/// implementation.
pub trait SecureEnclave {
    /// Wraps a 32-byte key, returning an opaque on-disk form.
    fn wrap(&self, key: &[u8; 32]) -> Result<WrappedKey>;
    /// Unwraps a previously-wrapped key.
    fn unwrap(&self, wrapped: &WrappedKey) -> Result<[u8; 32]>;
}

/// Derives a wrapping key via HKDF-SHA256 over a stable per-install
/// identifier, then AES-256-GCM-wraps the database key — the file format is
/// `[nonce 12B][ciphertext+tag]`, matching `storage.rs`.
pub struct FileBackedEnclave {
    install_id: Vec<u8>,
}

impl FileBackedEnclave {
    /// Builds an enclave bound to a stable per-install identifier (e.g. a
    /// random token generated once and cached outside this crate).
    pub fn new(install_id: impl Into<Vec<u8>>) -> Self {
        Self {
            install_id: install_id.into(),
        }
    }

    fn wrapping_key(&self) -> [u8; 32] {
        let hk = Hkdf::<Sha256>::new(None, &self.install_id);
        let mut okm = [0u8; 32];
        hk.expand(b"bitchat-db-keystore-v1", &mut okm)
            .expect("32 is a valid HKDF-SHA256 output length");
        okm
    }
}

impl SecureEnclave for FileBackedEnclave {
    fn wrap(&self, key: &[u8; 32]) -> Result<WrappedKey> {
        let wrapping_key = self.wrapping_key();
        let cipher = Aes256Gcm::new_from_slice(&wrapping_key)
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        let mut nonce_bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, key.as_slice())
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(WrappedKey(out))
    }

    fn unwrap(&self, wrapped: &WrappedKey) -> Result<[u8; 32]> {
        if wrapped.0.len() < 12 {
            return Err(Error::PersistenceFailure("wrapped key too short".into()));
        }
        let wrapping_key = self.wrapping_key();
        let cipher = Aes256Gcm::new_from_slice(&wrapping_key)
            .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
        let (nonce_bytes, ciphertext) = wrapped.0.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| Error::PersistenceFailure("key unwrap failed".into()))?;
        plaintext
            .try_into()
            .map_err(|_| Error::PersistenceFailure("unwrapped key has wrong length".into()))
    }
}

/// Generates, persists, and shreds the database's master key.
pub struct EncryptedDbKeystore<E: SecureEnclave> {
    enclave: E,
    path: PathBuf,
    cached: Option<[u8; 32]>,
}

impl<E: SecureEnclave> EncryptedDbKeystore<E> {
    /// Builds a keystore that persists its wrapped key under `path`.
    pub fn new(enclave: E, path: impl Into<PathBuf>) -> Self {
        Self {
            enclave,
            path: path.into(),
            cached: None,
        }
    }

    /// Returns the database key, generating and wrapping a fresh one on
    /// first call. Subsequent calls unwrap the persisted form.
    pub fn get_or_create(&mut self) -> Result<[u8; 32]> {
        if let Some(key) = self.cached {
            return Ok(key);
        }
        if self.path.exists() {
            let wrapped = read_wrapped(&self.path)?;
            let key = self.enclave.unwrap(&wrapped)?;
            self.cached = Some(key);
            return Ok(key);
        }
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        let wrapped = self.enclave.wrap(&key)?;
        write_wrapped(&self.path, &wrapped)?;
        self.cached = Some(key);
        Ok(key)
    }

    /// Removes the wrapped key and any cached copy. The next
    /// [`Self::get_or_create`] call generates a fresh key, making any
    /// surviving ciphertext encrypted under the old key unreadable.
    pub fn shred(&mut self) -> Result<()> {
        if let Some(mut key) = self.cached.take() {
            key.zeroize();
        }
        if self.path.exists() {
            secure_delete(&self.path)?;
        }
        Ok(())
    }
}

fn read_wrapped(path: &Path) -> Result<WrappedKey> {
    let mut file = File::open(path).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    Ok(WrappedKey(data))
}

fn write_wrapped(path: &Path, wrapped: &WrappedKey) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    }
    let mut file = File::create(path).map_err(|e| Error::PersistenceFailure(e.to_string()))?;
    file.write_all(&wrapped.0)
        .map_err(|e| Error::PersistenceFailure(e.to_string()))
}

/// Overwrite-then-delete, matching `storage.rs::secure_delete`.
fn secure_delete(path: &Path) -> Result<()> {
    if let Ok(metadata) = fs::metadata(path) {
        let size = metadata.len() as usize;
        let mut random_data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut random_data);
        if let Ok(mut file) = File::create(path) {
            let _ = file.write_all(&random_data);
            let _ = file.sync_all();
        }
        let zeros = vec![0u8; size];
        if let Ok(mut file) = File::create(path) {
            let _ = file.write_all(&zeros);
            let _ = file.sync_all();
        }
    }
    fs::remove_file(path).map_err(|e| Error::PersistenceFailure(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_path() -> PathBuf {
        env::temp_dir().join(format!("bitchat_keystore_test_{}", rand::random::<u64>()))
    }

    fn enclave() -> FileBackedEnclave {
        FileBackedEnclave::new(b"test-install-id".to_vec())
    }

    #[test]
    fn get_or_create_is_stable_across_calls() {
        let path = temp_path();
        let mut store = EncryptedDbKeystore::new(enclave(), &path);
        let first = store.get_or_create().unwrap();
        let second = store.get_or_create().unwrap();
        assert_eq!(first, second);
        let _ = store.shred();
    }

    #[test]
    fn get_or_create_survives_a_fresh_instance() {
        let path = temp_path();
        let key = {
            let mut store = EncryptedDbKeystore::new(enclave(), &path);
            store.get_or_create().unwrap()
        };
        let mut reloaded = EncryptedDbKeystore::new(enclave(), &path);
        assert_eq!(reloaded.get_or_create().unwrap(), key);
        let _ = reloaded.shred();
    }

    #[test]
    fn shred_then_get_or_create_yields_a_different_key() {
        let path = temp_path();
        let mut store = EncryptedDbKeystore::new(enclave(), &path);
        let before = store.get_or_create().unwrap();
        store.shred().unwrap();
        assert!(!path.exists());
        let after = store.get_or_create().unwrap();
        assert_ne!(before, after);
        let _ = store.shred();
    }

    #[test]
    fn the_key_never_touches_disk_unwrapped() {
        let path = temp_path();
        let mut store = EncryptedDbKeystore::new(enclave(), &path);
        let key = store.get_or_create().unwrap();
        let on_disk = fs::read(&path).unwrap();
        assert!(
            !on_disk.windows(32).any(|w| w == key),
            "raw key bytes must not appear in the wrapped file"
        );
        let _ = store.shred();
    }
}
