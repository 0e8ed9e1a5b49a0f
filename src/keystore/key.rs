//! Keys held by a key store

use crate::algo::KeyType;
use crate::engine::{KeyMaterial, Secret};
use crate::error::{HsmError, HsmResult};
use crate::flags::KeyInfo;
use crate::nvm::KeyRecord;
use zeroize::Zeroizing;

/// Operation a key is requested for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUsage {
    /// Unwrap imported key material
    Unwrap,
    Cipher,
    Mac,
    Sign,
    Decrypt,
    Agreement,
    /// Source of a butterfly expansion
    Expansion,
    ExportPublic,
}

/// A key with its immutable type and attribute bitmap
#[derive(Clone)]
pub struct Key {
    pub id: u32,
    pub key_type: KeyType,
    pub info: KeyInfo,
    secret: Secret,
    public: Option<Vec<u8>>,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("id", &self.id)
            .field("key_type", &self.key_type)
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl Key {
    pub fn new(id: u32, key_type: KeyType, info: KeyInfo, material: KeyMaterial) -> Self {
        Self {
            id,
            key_type,
            info,
            secret: material.secret,
            public: material.public,
        }
    }

    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    pub fn public(&self) -> Option<&[u8]> {
        self.public.as_deref()
    }

    pub fn is_permanent(&self) -> bool {
        self.info.contains(KeyInfo::PERMANENT)
    }

    /// Refuse uses the attribute bitmap forbids
    pub fn check_usage(&self, usage: KeyUsage) -> HsmResult<()> {
        let kek = self.info.contains(KeyInfo::KEK);
        match usage {
            KeyUsage::Unwrap if !kek || self.key_type != KeyType::Aes256 => Err(HsmError::lifecycle(
                format!("key {:#x} is not an AES-256 KEK", self.id),
            )),
            KeyUsage::Unwrap => Ok(()),
            _ if kek => Err(HsmError::lifecycle(format!(
                "key {:#x} is a KEK, only usable for unwrapping",
                self.id
            ))),
            KeyUsage::Expansion if !self.info.contains(KeyInfo::MASTER) => Err(
                HsmError::lifecycle(format!("key {:#x} is not a master key", self.id)),
            ),
            _ => Ok(()),
        }
    }

    pub fn to_record(&self) -> KeyRecord {
        KeyRecord {
            id: self.id,
            key_type: self.key_type,
            info: self.info,
            secret: hex::encode(self.secret.as_slice()),
            public: self.public.as_ref().map(hex::encode),
        }
    }

    pub fn from_record(record: &KeyRecord) -> HsmResult<Self> {
        let corrupted =
            |e: hex::FromHexError| HsmError::KeyStoreError(format!("key {:#x}: {}", record.id, e));
        let secret = Zeroizing::new(hex::decode(&record.secret).map_err(corrupted)?);
        let public = match &record.public {
            Some(encoded) => Some(hex::decode(encoded).map_err(corrupted)?),
            None => None,
        };
        Ok(Self {
            id: record.id,
            key_type: record.key_type,
            info: record.info,
            secret,
            public,
        })
    }
}
