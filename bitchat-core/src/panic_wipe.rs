//! Atomic, best-effort destruction of all durable application state.
//!
//! Sequential, continuing past failures and accumulating them — grounded on
//! the overwrite-then-delete pattern in `storage.rs::secure_delete`/
//! `wipe_all_data`, generalized to the full set of stores, directories, and
//! the keystore shred call.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use rand::RngCore;

use crate::keystore::{EncryptedDbKeystore, SecureEnclave};

/// The outcome of a wipe attempt. Never thrown — PanicWipe results are
/// aggregated here, matching the `Fatal` error kind's "never thrown"
/// propagation policy.
#[derive(Debug, Clone)]
pub struct WipeReport {
    pub success: bool,
    pub deleted_items: Vec<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

/// Everything PanicWipe needs to locate and destroy.
pub struct PanicWipe {
    db_files: Vec<PathBuf>,
    preference_files: Vec<PathBuf>,
    cache_dir: Option<PathBuf>,
    data_root: Option<PathBuf>,
}

impl PanicWipe {
    pub fn new(
        db_files: Vec<PathBuf>,
        preference_files: Vec<PathBuf>,
        cache_dir: Option<PathBuf>,
        data_root: Option<PathBuf>,
    ) -> Self {
        Self {
            db_files,
            preference_files,
            cache_dir,
            data_root,
        }
    }

    /// Runs the wipe. `close_handles` is invoked first so the caller can
    /// drop/close any open DB handle or singleton before files underneath
    /// it are deleted; its result does not gate the rest of the sequence —
    /// PanicWipe is privileged and proceeds even if teardown fails.
    pub fn run<E: SecureEnclave>(
        &self,
        keystore: &mut EncryptedDbKeystore<E>,
        close_handles: impl FnOnce(),
    ) -> WipeReport {
        let start = Instant::now();
        let mut deleted = Vec::new();
        let mut errors = Vec::new();

        close_handles();

        for path in &self.db_files {
            wipe_file(path, &mut deleted, &mut errors);
        }
        for path in &self.preference_files {
            wipe_file(path, &mut deleted, &mut errors);
        }
        if let Some(dir) = &self.cache_dir {
            wipe_dir_recursive(dir, &mut deleted, &mut errors);
        }
        if let Some(root) = &self.data_root {
            wipe_top_level_files(root, &mut deleted, &mut errors);
        }
        match keystore.shred() {
            Ok(()) => deleted.push("db_keystore".to_string()),
            Err(e) => errors.push(format!("keystore shred failed: {e}")),
        }

        WipeReport {
            success: errors.is_empty(),
            deleted_items: deleted,
            errors,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

fn overwrite_then_delete(path: &PathBuf) -> std::io::Result<()> {
    if let Ok(metadata) = fs::metadata(path) {
        let size = metadata.len() as usize;
        let mut random_data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut random_data);
        if let Ok(()) = fs::write(path, &random_data) {
            let zeros = vec![0u8; size];
            let _ = fs::write(path, &zeros);
        }
    }
    fs::remove_file(path)
}

fn wipe_file(path: &PathBuf, deleted: &mut Vec<String>, errors: &mut Vec<String>) {
    if !path.exists() {
        return;
    }
    match overwrite_then_delete(path) {
        Ok(()) => deleted.push(path.display().to_string()),
        Err(e) => errors.push(format!("{}: {e}", path.display())),
    }
}

fn wipe_dir_recursive(dir: &PathBuf, deleted: &mut Vec<String>, errors: &mut Vec<String>) {
    if !dir.exists() {
        return;
    }
    match fs::remove_dir_all(dir) {
        Ok(()) => deleted.push(dir.display().to_string()),
        Err(e) => errors.push(format!("{}: {e}", dir.display())),
    }
}

fn wipe_top_level_files(root: &PathBuf, deleted: &mut Vec<String>, errors: &mut Vec<String>) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            errors.push(format!("{}: {e}", root.display()));
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        wipe_file(&path, deleted, errors);
    }
}
