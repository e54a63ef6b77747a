//! Durable state: identity, prekeys, serialized sessions, contacts
//!
//! Everything lives as JSON files under one data directory, keyed by the
//! url-safe encoding of the peer public key. Session writes happen
//! synchronously after every ratchet mutation; a lost ratchet step is
//! unrecoverable for that peer.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::crypto::{
    IdentityKeyPair, OneTimePrekeyState, PeerKey, SignedPrekeyState,
};
use crate::session::contact::ContactRecord;
use crate::util::serde_b64;

const IDENTITY_FILE: &str = "identity.key";
const PREKEYS_FILE: &str = "prekeys.json";
const SESSIONS_FILE: &str = "sessions.json";
const CONTACTS_FILE: &str = "contacts.json";

/// Persisted prekey pool
#[derive(Clone, Serialize, Deserialize)]
pub struct PrekeyStoreState {
    pub signed: SignedPrekeyState,
    pub one_time: Vec<OneTimePrekeyState>,
    pub next_one_time_id: u32,
}

/// File-backed store for all durable protocol state
pub struct StateStore {
    data_dir: PathBuf,
    /// In-memory image of sessions.json
    sessions: HashMap<String, Vec<u8>>,
}

impl StateStore {
    /// Open (creating the directory if needed) and load the session image
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let sessions = load_sessions_file(&data_dir.join(SESSIONS_FILE));

        Ok(Self { data_dir, sessions })
    }

    /// Restore the identity, or generate and persist a fresh one on first run
    pub fn load_or_generate_identity(&self) -> Result<IdentityKeyPair, StoreError> {
        let path = self.data_dir.join(IDENTITY_FILE);
        match fs::read(&path) {
            Ok(bytes) => IdentityKeyPair::from_bytes(&bytes)
                .map_err(|_| StoreError::Corrupt(IDENTITY_FILE.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no identity on disk, generating a new one");
                let identity = IdentityKeyPair::generate();
                fs::write(&path, identity.to_bytes())?;
                Ok(identity)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Destroy all state and mint a new identity. Every session and contact
    /// is gone afterwards; this is the explicit user action, never implicit.
    pub fn reset_identity(&mut self) -> Result<IdentityKeyPair, StoreError> {
        for file in [IDENTITY_FILE, PREKEYS_FILE, SESSIONS_FILE, CONTACTS_FILE] {
            let path = self.data_dir.join(file);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        self.sessions.clear();
        self.load_or_generate_identity()
    }

    pub fn load_prekeys(&self) -> Option<PrekeyStoreState> {
        let path = self.data_dir.join(PREKEYS_FILE);
        let content = fs::read_to_string(path).ok()?;
        match serde_json::from_str(&content) {
            Ok(state) => Some(state),
            Err(_) => {
                error!("prekey store unreadable, regenerating prekeys");
                None
            }
        }
    }

    pub fn save_prekeys(&self, state: &PrekeyStoreState) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(state)?;
        fs::write(self.data_dir.join(PREKEYS_FILE), content)?;
        Ok(())
    }

    /// All persisted sessions, keyed by url-safe base64 public key
    pub fn sessions(&self) -> &HashMap<String, Vec<u8>> {
        &self.sessions
    }

    pub fn save_session(&mut self, peer: &PeerKey, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.sessions.insert(peer.to_base64(), bytes);
        self.write_sessions()
    }

    pub fn remove_session(&mut self, peer: &PeerKey) -> Result<(), StoreError> {
        self.sessions.remove(&peer.to_base64());
        self.write_sessions()
    }

    fn write_sessions(&self) -> Result<(), StoreError> {
        let image: HashMap<&String, String> = self
            .sessions
            .iter()
            .map(|(key, bytes)| (key, serde_b64::encode(bytes)))
            .collect();
        let content = serde_json::to_string_pretty(&image)?;
        fs::write(self.data_dir.join(SESSIONS_FILE), content)?;
        Ok(())
    }

    pub fn load_contacts(&self) -> Vec<ContactRecord> {
        let path = self.data_dir.join(CONTACTS_FILE);
        let Ok(content) = fs::read_to_string(path) else {
            return Vec::new();
        };
        match serde_json::from_str::<HashMap<String, ContactRecord>>(&content) {
            Ok(records) => records.into_values().collect(),
            Err(_) => {
                error!("contact store unreadable, starting with no contacts");
                Vec::new()
            }
        }
    }

    pub fn save_contacts<'a>(
        &self,
        records: impl Iterator<Item = &'a ContactRecord>,
    ) -> Result<(), StoreError> {
        let image: HashMap<String, &ContactRecord> = records
            .map(|record| (record.public_key.to_base64(), record))
            .collect();
        let content = serde_json::to_string_pretty(&image)?;
        fs::write(self.data_dir.join(CONTACTS_FILE), content)?;
        Ok(())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

fn load_sessions_file(path: &Path) -> HashMap<String, Vec<u8>> {
    let Ok(content) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, String>>(&content) {
        Ok(image) => {
            let mut sessions = HashMap::new();
            for (key, encoded) in image {
                match serde_b64::decode(&encoded) {
                    Ok(bytes) => {
                        sessions.insert(key, bytes);
                    }
                    Err(_) => error!("dropping undecodable session record for {}", key),
                }
            }
            info!("loaded {} persisted sessions", sessions.len());
            sessions
        }
        Err(_) => {
            error!("session store unreadable, starting with no sessions");
            HashMap::new()
        }
    }
}

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Corrupt store file: {0}")]
    Corrupt(String),
}
