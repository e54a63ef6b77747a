//! Contact directory: trust metadata per peer public key
//!
//! A record is created the first time a handshake with that key completes
//! and is never silently overwritten by a later handshake from the same key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::PeerKey;
use crate::util::now_ms;

/// How the relationship with a peer was established
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrustOrigin {
    /// Keys were exchanged in person (QR scan or equivalent)
    DirectVerification,
    /// Keys arrived via a shared invite link
    SharedLink,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContactRecord {
    pub public_key: PeerKey,
    pub display_name: String,
    pub trust_origin: TrustOrigin,
    pub established_at: u64,
}

impl ContactRecord {
    pub fn new(public_key: PeerKey, display_name: &str, trust_origin: TrustOrigin) -> Self {
        Self {
            public_key,
            display_name: display_name.to_string(),
            trust_origin,
            established_at: now_ms(),
        }
    }
}

/// In-memory view of all contact records, keyed by peer public key
#[derive(Default)]
pub struct ContactDirectory {
    contacts: HashMap<PeerKey, ContactRecord>,
}

impl ContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<ContactRecord>) -> Self {
        Self {
            contacts: records
                .into_iter()
                .map(|r| (r.public_key, r))
                .collect(),
        }
    }

    pub fn get(&self, peer: &PeerKey) -> Option<&ContactRecord> {
        self.contacts.get(peer)
    }

    pub fn contains(&self, peer: &PeerKey) -> bool {
        self.contacts.contains_key(peer)
    }

    /// Insert unless a record for this key already exists. Returns whether
    /// the record was inserted; an existing record always wins.
    pub fn add_if_absent(&mut self, record: ContactRecord) -> bool {
        if self.contacts.contains_key(&record.public_key) {
            return false;
        }
        self.contacts.insert(record.public_key, record);
        true
    }

    pub fn remove(&mut self, peer: &PeerKey) -> Option<ContactRecord> {
        self.contacts.remove(peer)
    }

    pub fn records(&self) -> impl Iterator<Item = &ContactRecord> {
        self.contacts.values()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeyPair;

    #[test]
    fn test_first_record_wins() {
        let peer = IdentityKeyPair::generate().peer_key();
        let mut directory = ContactDirectory::new();

        assert!(directory.add_if_absent(ContactRecord::new(
            peer,
            "Mallory? No, Alice",
            TrustOrigin::DirectVerification,
        )));
        // A second handshake from the same key must not replace the record
        assert!(!directory.add_if_absent(ContactRecord::new(
            peer,
            "Imposter",
            TrustOrigin::SharedLink,
        )));

        let record = directory.get(&peer).unwrap();
        assert_eq!(record.display_name, "Mallory? No, Alice");
        assert_eq!(record.trust_origin, TrustOrigin::DirectVerification);
    }

    #[test]
    fn test_remove_unlocks_reinsert() {
        let peer = IdentityKeyPair::generate().peer_key();
        let mut directory = ContactDirectory::new();

        directory.add_if_absent(ContactRecord::new(peer, "A", TrustOrigin::SharedLink));
        directory.remove(&peer);
        assert!(directory.add_if_absent(ContactRecord::new(
            peer,
            "A again",
            TrustOrigin::SharedLink
        )));
        assert_eq!(directory.get(&peer).unwrap().display_name, "A again");
    }

    #[test]
    fn test_record_serde_roundtrip() {
        let peer = IdentityKeyPair::generate().peer_key();
        let record = ContactRecord::new(peer, "Bob", TrustOrigin::SharedLink);
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("shared-link"));
        let restored: ContactRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.public_key, peer);
    }
}
