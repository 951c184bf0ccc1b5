//! Persisted Slot Storage
//!
//! Named slots that outlive the process: the credential pair and the
//! serialized user record.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::warn;

// == Slot ==
/// The persisted slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    /// Both tokens as one JSON document, so they are replaced in one save
    Credentials,
    /// Per-token slots written by earlier releases; read only as a fallback
    AccessToken,
    RefreshToken,
    User,
}

impl Slot {
    pub const ALL: [Slot; 4] = [Slot::Credentials, Slot::AccessToken, Slot::RefreshToken, Slot::User];

    pub fn name(&self) -> &'static str {
        match self {
            Slot::Credentials => "credentials",
            Slot::AccessToken => "access_token",
            Slot::RefreshToken => "refresh_token",
            Slot::User => "user",
        }
    }
}

// == Slot Storage ==
/// Durable key/value backend behind the token store.
///
/// Implementations report failures; the token store decides what to do with them.
pub trait SlotStorage: Send + Sync {
    fn load(&self, slot: Slot) -> io::Result<Option<String>>;
    fn save(&self, slot: Slot, value: &str) -> io::Result<()>;
    fn remove(&self, slot: Slot) -> io::Result<()>;
}

// == File Slots ==
/// One file per slot inside a directory.
#[derive(Debug, Clone)]
pub struct FileSlots {
    dir: PathBuf,
}

impl FileSlots {
    /// Opens (and creates if needed) the slot directory.
    pub fn open(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self, slot: Slot) -> PathBuf {
        self.dir.join(slot.name())
    }
}

impl SlotStorage for FileSlots {
    fn load(&self, slot: Slot) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path(slot)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, slot: Slot, value: &str) -> io::Result<()> {
        // Write-then-rename so a crash never leaves a truncated token behind
        let tmp = self.dir.join(format!(".{}.tmp", slot.name()));
        fs::write(&tmp, value)?;
        fs::rename(tmp, self.path(slot))
    }

    fn remove(&self, slot: Slot) -> io::Result<()> {
        match fs::remove_file(self.path(slot)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

// == Memory Slots ==
/// Non-durable slots, for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemorySlots {
    slots: Mutex<HashMap<Slot, String>>,
}

impl MemorySlots {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SlotStorage for MemorySlots {
    fn load(&self, slot: Slot) -> io::Result<Option<String>> {
        Ok(self.slots.lock().get(&slot).cloned())
    }

    fn save(&self, slot: Slot, value: &str) -> io::Result<()> {
        self.slots.lock().insert(slot, value.to_string());
        Ok(())
    }

    fn remove(&self, slot: Slot) -> io::Result<()> {
        self.slots.lock().remove(&slot);
        Ok(())
    }
}

/// Runs a storage operation, logging instead of failing.
pub(crate) fn best_effort<T>(op: &str, slot: Slot, result: io::Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Credential storage {} failed for slot {}: {}", op, slot.name(), e);
            None
        }
    }
}
