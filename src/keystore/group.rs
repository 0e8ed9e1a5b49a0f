//! Key groups: the caching and commit unit of a key store

use super::key::Key;
use crate::algo::KeyType;
use crate::error::{HsmError, HsmResult};
use crate::flags::{KeyInfo, Persistence};
use crate::nvm::GroupRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Highest valid key group number
pub const MAX_KEY_GROUP: u16 = 1023;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Residency {
    /// Key material is in local memory
    Resident,
    /// Only the key ids are known; material will be reloaded from NVM
    Evicted,
}

/// Attributes of a key that stay known while its group is evicted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyHeader {
    pub key_type: KeyType,
    pub info: KeyInfo,
}

impl KeyHeader {
    pub fn is_permanent(&self) -> bool {
        self.info.contains(KeyInfo::PERMANENT)
    }
}

#[derive(Debug, Clone)]
pub struct KeyGroup {
    pub id: u16,
    pub class: Persistence,
    pub residency: Residency,
    /// Cache lockdown: never evicted while set
    pub locked: bool,
    /// Holds changes not yet committed to NVM
    pub dirty: bool,
    pub last_used: u64,
    keys: BTreeMap<u32, Key>,
    headers: BTreeMap<u32, KeyHeader>,
}

impl KeyGroup {
    pub fn new(id: u16, class: Persistence) -> Self {
        Self {
            id,
            class,
            residency: Residency::Resident,
            locked: false,
            dirty: false,
            last_used: 0,
            keys: BTreeMap::new(),
            headers: BTreeMap::new(),
        }
    }

    /// Evicted view of a committed group, material not loaded
    pub fn from_record_ids(record: &GroupRecord) -> Self {
        Self {
            residency: Residency::Evicted,
            headers: record
                .keys
                .iter()
                .map(|k| {
                    let header = KeyHeader {
                        key_type: k.key_type,
                        info: k.info,
                    };
                    (k.id, header)
                })
                .collect(),
            ..Self::new(record.group, Persistence::Persistent)
        }
    }

    pub fn insert(&mut self, key: Key) {
        let header = KeyHeader {
            key_type: key.key_type,
            info: key.info,
        };
        self.headers.insert(key.id, header);
        self.keys.insert(key.id, key);
    }

    pub fn remove(&mut self, id: u32) -> Option<Key> {
        self.headers.remove(&id);
        self.keys.remove(&id)
    }

    pub fn get(&self, id: u32) -> Option<&Key> {
        self.keys.get(&id)
    }

    /// Type and attributes of a key, available even when evicted
    pub fn header(&self, id: u32) -> Option<KeyHeader> {
        self.headers.get(&id).copied()
    }

    pub fn key_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.headers.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn is_resident(&self) -> bool {
        self.residency == Residency::Resident
    }

    pub fn has_permanent(&self) -> bool {
        self.headers.values().any(KeyHeader::is_permanent)
    }

    /// Clean unlocked persistent groups may leave memory
    pub fn is_evictable(&self) -> bool {
        self.is_resident()
            && !self.locked
            && !self.dirty
            && self.class == Persistence::Persistent
    }

    pub fn evict(&mut self) {
        self.keys.clear();
        self.residency = Residency::Evicted;
    }

    /// Reload material of an evicted group
    pub fn restore(&mut self, record: &GroupRecord) -> HsmResult<()> {
        let mut keys = BTreeMap::new();
        for rec in &record.keys {
            keys.insert(rec.id, Key::from_record(rec)?);
        }
        let unchanged = keys.len() == self.headers.len()
            && keys.values().all(|k: &Key| {
                self.header(k.id)
                    .map_or(false, |h| h.key_type == k.key_type && h.info == k.info)
            });
        if !unchanged {
            return Err(HsmError::KeyStoreError(format!(
                "group {} changed in NVM while evicted",
                self.id
            )));
        }
        self.keys = keys;
        self.residency = Residency::Resident;
        Ok(())
    }

    pub fn to_record(&self) -> GroupRecord {
        GroupRecord {
            group: self.id,
            keys: self.keys.values().map(Key::to_record).collect(),
            committed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::KeyType;
    use crate::engine::KeyMaterial;
    use crate::flags::KeyInfo;
    use zeroize::Zeroizing;

    fn key(id: u32, info: KeyInfo) -> Key {
        let material = KeyMaterial {
            secret: Zeroizing::new(vec![id as u8; 16]),
            public: None,
        };
        Key::new(id, KeyType::Aes128, info, material)
    }

    #[test]
    fn test_evict_and_restore() {
        let mut group = KeyGroup::new(3, Persistence::Persistent);
        group.insert(key(1, KeyInfo::empty()));
        group.insert(key(2, KeyInfo::PERMANENT));
        let record = group.to_record();
        assert!(group.is_evictable());

        group.evict();
        assert!(!group.is_resident());
        assert!(group.get(1).is_none());
        assert_eq!(group.len(), 2);
        assert!(group.has_permanent());
        assert!(group.header(2).unwrap().is_permanent());
        assert_eq!(group.header(1).unwrap().key_type, KeyType::Aes128);

        group.restore(&record).unwrap();
        assert_eq!(group.get(1).unwrap().secret(), &[1u8; 16]);
        assert!(group.has_permanent());
    }

    #[test]
    fn test_locked_dirty_and_transient_stay_resident() {
        let mut group = KeyGroup::new(1, Persistence::Persistent);
        group.locked = true;
        assert!(!group.is_evictable());
        group.locked = false;
        group.dirty = true;
        assert!(!group.is_evictable());
        assert!(!KeyGroup::new(2, Persistence::Transient).is_evictable());
    }

    #[test]
    fn test_restore_detects_mismatch() {
        let mut group = KeyGroup::new(4, Persistence::Persistent);
        group.insert(key(1, KeyInfo::empty()));
        group.evict();
        let mut other = KeyGroup::new(4, Persistence::Persistent);
        other.insert(key(9, KeyInfo::empty()));
        assert!(matches!(
            group.restore(&other.to_record()),
            Err(HsmError::KeyStoreError(_))
        ));
    }
}
