//! NVM: durable key store images
//!
//! One image per key store holds its header (credential, counter), every committed key
//! group and the generic data blobs. Backends only load and save whole images; a save
//! replaces the previous image atomically, so a group and the counter that protects it
//! always land in the same write.

pub mod file;

pub use file::FileNvm;

use crate::algo::KeyType;
use crate::flags::KeyInfo;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use zeroize::Zeroize;

/// Durable attributes of a key store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub store_id: u32,
    /// SHA-256 over (id, nonce), hex
    pub credential: String,
    pub max_updates: u16,
    /// Anti-rollback counter committed with the last write
    pub counter: u16,
    pub updated_at: DateTime<Utc>,
}

/// A committed key
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: u32,
    pub key_type: KeyType,
    pub info: KeyInfo,
    /// Hex-encoded secret material
    pub secret: String,
    pub public: Option<String>,
}

impl Drop for KeyRecord {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl std::fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRecord")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// A key group written as a unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub group: u16,
    pub keys: Vec<KeyRecord>,
    pub committed_at: DateTime<Utc>,
}

/// Everything the NVM holds for one key store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreImage {
    pub header: StoreHeader,
    pub groups: BTreeMap<u16, GroupRecord>,
    /// Hex-encoded data storage blobs
    pub data: BTreeMap<u16, String>,
}

impl StoreImage {
    fn new(header: StoreHeader) -> Self {
        Self {
            header,
            groups: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }
}

/// Durable storage collaborator
///
/// Backends implement the image primitives; the group and data operations are built
/// on them. Callers serialize operations on one store.
pub trait NvmStore: Send + Sync {
    fn load_image(&self, store_id: u32) -> Result<Option<StoreImage>, NvmError>;

    /// Replace the image of `image.header.store_id` atomically
    fn save_image(&self, image: &StoreImage) -> Result<(), NvmError>;

    fn image_ids(&self) -> Result<Vec<u32>, NvmError>;

    fn erase_all(&self) -> Result<(), NvmError>;

    fn read_store(&self, store_id: u32) -> Result<Option<StoreHeader>, NvmError> {
        Ok(self.load_image(store_id)?.map(|image| image.header))
    }

    fn list_stores(&self) -> Result<Vec<StoreHeader>, NvmError> {
        let mut headers = Vec::new();
        for id in self.image_ids()? {
            if let Some(header) = self.read_store(id)? {
                headers.push(header);
            }
        }
        Ok(headers)
    }

    /// Commit one group together with the header that protects it
    fn write_group(&self, header: &StoreHeader, group: &GroupRecord) -> Result<(), NvmError> {
        let mut image = self
            .load_image(header.store_id)?
            .unwrap_or_else(|| StoreImage::new(header.clone()));
        image.header = header.clone();
        image.groups.insert(group.group, group.clone());
        self.save_image(&image)
    }

    /// Remove one group, committing the header in the same write
    fn erase_group(&self, header: &StoreHeader, group: u16) -> Result<(), NvmError> {
        let mut image = self
            .load_image(header.store_id)?
            .unwrap_or_else(|| StoreImage::new(header.clone()));
        image.header = header.clone();
        image.groups.remove(&group);
        self.save_image(&image)
    }

    fn read_group(&self, store_id: u32, group: u16) -> Result<Option<GroupRecord>, NvmError> {
        Ok(self
            .load_image(store_id)?
            .and_then(|mut image| image.groups.remove(&group)))
    }

    fn read_groups(&self, store_id: u32) -> Result<Vec<GroupRecord>, NvmError> {
        Ok(self
            .load_image(store_id)?
            .map(|image| image.groups.into_values().collect())
            .unwrap_or_default())
    }

    fn write_data(&self, header: &StoreHeader, data_id: u16, data: &[u8]) -> Result<(), NvmError> {
        let mut image = self
            .load_image(header.store_id)?
            .unwrap_or_else(|| StoreImage::new(header.clone()));
        image.data.insert(data_id, hex::encode(data));
        self.save_image(&image)
    }

    fn read_data(&self, store_id: u32, data_id: u16) -> Result<Option<Vec<u8>>, NvmError> {
        let image = match self.load_image(store_id)? {
            Some(image) => image,
            None => return Ok(None),
        };
        match image.data.get(&data_id) {
            Some(encoded) => hex::decode(encoded)
                .map(Some)
                .map_err(|e| NvmError::Corrupted(format!("data {}: {}", data_id, e))),
            None => Ok(None),
        }
    }
}

/// Volatile NVM for tests and benches, with write fault injection
#[derive(Default)]
pub struct InMemoryNvm {
    images: Mutex<BTreeMap<u32, StoreImage>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryNvm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful image writes
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl NvmStore for InMemoryNvm {
    fn load_image(&self, store_id: u32) -> Result<Option<StoreImage>, NvmError> {
        Ok(self.images.lock().get(&store_id).cloned())
    }

    fn save_image(&self, image: &StoreImage) -> Result<(), NvmError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NvmError::WriteFailed("injected write failure".into()));
        }
        self.images
            .lock()
            .insert(image.header.store_id, image.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn image_ids(&self) -> Result<Vec<u32>, NvmError> {
        Ok(self.images.lock().keys().copied().collect())
    }

    fn erase_all(&self) -> Result<(), NvmError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(NvmError::WriteFailed("injected write failure".into()));
        }
        self.images.lock().clear();
        Ok(())
    }
}

/// NVM errors
#[derive(Debug, thiserror::Error)]
pub enum NvmError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupted record: {0}")]
    Corrupted(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(counter: u16) -> StoreHeader {
        StoreHeader {
            store_id: 7,
            credential: "00".into(),
            max_updates: 4,
            counter,
            updated_at: Utc::now(),
        }
    }

    fn group(id: u16) -> GroupRecord {
        GroupRecord {
            group: id,
            keys: vec![KeyRecord {
                id: 1,
                key_type: KeyType::Aes128,
                info: KeyInfo::empty(),
                secret: hex::encode([1u8; 16]),
                public: None,
            }],
            committed_at: Utc::now(),
        }
    }

    #[test]
    fn test_write_group_commits_header() {
        let nvm = InMemoryNvm::new();
        nvm.write_group(&header(1), &group(3)).unwrap();
        assert_eq!(nvm.read_store(7).unwrap().unwrap().counter, 1);
        assert_eq!(nvm.read_group(7, 3).unwrap().unwrap().keys.len(), 1);

        nvm.erase_group(&header(2), 3).unwrap();
        assert!(nvm.read_group(7, 3).unwrap().is_none());
        assert_eq!(nvm.read_store(7).unwrap().unwrap().counter, 2);
    }

    #[test]
    fn test_failed_write_keeps_previous_image() {
        let nvm = InMemoryNvm::new();
        nvm.write_group(&header(1), &group(3)).unwrap();
        nvm.set_fail_writes(true);
        assert!(nvm.write_group(&header(2), &group(4)).is_err());
        nvm.set_fail_writes(false);
        assert_eq!(nvm.read_store(7).unwrap().unwrap().counter, 1);
        assert!(nvm.read_group(7, 4).unwrap().is_none());
        assert_eq!(nvm.write_count(), 1);
    }

    #[test]
    fn test_data_and_erase_all() {
        let nvm = InMemoryNvm::new();
        nvm.write_data(&header(0), 9, b"blob").unwrap();
        assert_eq!(nvm.read_data(7, 9).unwrap(), Some(b"blob".to_vec()));
        assert_eq!(nvm.read_data(7, 10).unwrap(), None);
        nvm.erase_all().unwrap();
        assert!(nvm.list_stores().unwrap().is_empty());
    }
}
