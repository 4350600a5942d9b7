//! Durable storage for pairing credentials.
//!
//! The engine only produces credentials; persisting them is the store's job.
//! [`FileCredentialStore`] keeps a JSON map in the data directory, written
//! atomically (temp file + rename) under a process-wide lock. A file that
//! exists but does not parse is left untouched and writes fail.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::airplay::types::{PairingCredential, SpeakerId};
use crate::protocol_constants::CREDENTIALS_FILE;

/// Storage collaborator for per-identity pairing credentials.
pub trait CredentialStore: Send + Sync {
    fn get(&self, id: &SpeakerId) -> Option<PairingCredential>;

    /// Stores (or replaces) the credential for `id`.
    fn put(&self, id: &SpeakerId, credential: PairingCredential) -> std::io::Result<()>;

    /// Drops the credential for `id`, e.g. after the device rejected it.
    fn remove(&self, id: &SpeakerId) -> std::io::Result<()>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory store
// ─────────────────────────────────────────────────────────────────────────────

/// Volatile store used when no data directory is configured.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    entries: DashMap<SpeakerId, PairingCredential>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, id: &SpeakerId) -> Option<PairingCredential> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    fn put(&self, id: &SpeakerId, credential: PairingCredential) -> std::io::Result<()> {
        self.entries.insert(id.clone(), credential);
        Ok(())
    }

    fn remove(&self, id: &SpeakerId) -> std::io::Result<()> {
        self.entries.remove(id);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File-backed store
// ─────────────────────────────────────────────────────────────────────────────

/// Global mutex to serialize all credential file operations.
static FILE_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn file_lock() -> &'static Mutex<()> {
    FILE_LOCK.get_or_init(|| Mutex::new(()))
}

/// JSON-file credential store in the app data directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self) -> PathBuf {
        self.dir.join(CREDENTIALS_FILE)
    }

    /// Loads the whole map. A missing file reads as empty; one that exists
    /// but cannot be read or parsed is an error.
    fn load(&self) -> std::io::Result<BTreeMap<SpeakerId, PairingCredential>> {
        let contents = match std::fs::read_to_string(self.path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };
        serde_json::from_str(&contents).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is not a credential map: {e}", self.path().display()),
            )
        })
    }

    /// Uses atomic write (temp file + rename) to prevent corruption on crash.
    fn save(&self, entries: &BTreeMap<SpeakerId, PairingCredential>) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let temp_path = self.dir.join(format!("{CREDENTIALS_FILE}.tmp"));
        let contents = serde_json::to_string_pretty(entries)?;

        std::fs::write(&temp_path, contents)?;
        restrict_permissions(&temp_path)?;
        std::fs::rename(&temp_path, self.path())
    }

    fn update<F>(&self, mutate: F) -> std::io::Result<()>
    where
        F: FnOnce(&mut BTreeMap<SpeakerId, PairingCredential>) -> bool,
    {
        let _guard = file_lock().lock();
        // Refuse to rewrite a file we could not read; it may hold credentials.
        let mut entries = self.load()?;
        if mutate(&mut entries) {
            self.save(&entries)?;
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self, id: &SpeakerId) -> Option<PairingCredential> {
        let _guard = file_lock().lock();
        match self.load() {
            Ok(mut entries) => entries.remove(id),
            Err(e) => {
                log::warn!("[Credentials] Ignoring unreadable credential file: {}", e);
                None
            }
        }
    }

    fn put(&self, id: &SpeakerId, credential: PairingCredential) -> std::io::Result<()> {
        self.update(|entries| entries.insert(id.clone(), credential.clone()).as_ref() != Some(&credential))
    }

    fn remove(&self, id: &SpeakerId) -> std::io::Result<()> {
        self.update(|entries| entries.remove(id).is_some())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
