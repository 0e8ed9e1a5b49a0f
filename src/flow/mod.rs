//! Service flows: typed operation contexts opened under a session or a key store
//!
//! Each submodule adds the operations of one flow kind to `Hsm`. A flow records its
//! parent handle; every call re-validates the handle and its kind.

pub mod cipher;
pub mod data_storage;
pub mod hash;
pub mod key_exchange;
pub mod key_management;
pub mod mac;
pub mod rng;
pub mod signature;
pub mod sm2_eces;

pub use cipher::{AuthEncArgs, CipherArgs, EciesDecryptArgs};
pub use key_exchange::{KeyExchangeArgs, KeyExchangeOutcome};
pub use key_management::{ButterflyArgs, GenerateKeyArgs, KeyOutcome, ManageKeyArgs};
pub use mac::{MacArgs, MacMode, MacOutcome, MacStatus};
pub use signature::{SignArgs, VerificationStatus, VerifyArgs, VerifyKey};

use crate::algo::{KeyType, SignatureScheme};
use crate::config::Feature;
use crate::engine::Secret;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Kind tag of a service flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowKind {
    KeyManagement,
    Cipher,
    SignatureGeneration,
    SignatureVerification,
    Rng,
    Hash,
    Mac,
    DataStorage,
    Sm2Eces,
    KeyExchange,
}

/// What a flow must be opened under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Session,
    KeyStore,
}

impl FlowKind {
    pub const ALL: &'static [FlowKind] = &[
        FlowKind::KeyManagement,
        FlowKind::Cipher,
        FlowKind::SignatureGeneration,
        FlowKind::SignatureVerification,
        FlowKind::Rng,
        FlowKind::Hash,
        FlowKind::Mac,
        FlowKind::DataStorage,
        FlowKind::Sm2Eces,
        FlowKind::KeyExchange,
    ];

    pub fn parent(&self) -> ParentKind {
        match self {
            FlowKind::SignatureVerification | FlowKind::Rng | FlowKind::Hash => ParentKind::Session,
            _ => ParentKind::KeyStore,
        }
    }

    /// Feature a platform must offer before the flow can be opened
    pub fn required_feature(&self) -> Option<Feature> {
        match self {
            FlowKind::DataStorage => Some(Feature::DataStorage),
            FlowKind::Sm2Eces => Some(Feature::Sm2Eces),
            FlowKind::KeyExchange => Some(Feature::KeyExchange),
            _ => None,
        }
    }

    pub(crate) fn initial_state(&self) -> FlowState {
        match self {
            FlowKind::SignatureGeneration => FlowState::SignatureGeneration {
                prepared: HashMap::new(),
            },
            FlowKind::SignatureVerification => FlowState::SignatureVerification {
                imported: BTreeMap::new(),
                next_ref: 1,
            },
            _ => FlowState::Stateless,
        }
    }
}

/// Public key imported into a signature verification flow
#[derive(Debug, Clone)]
pub(crate) struct ImportedKey {
    pub key_type: KeyType,
    pub public: Vec<u8>,
}

/// Flow-local cached state
pub(crate) enum FlowState {
    Stateless,
    /// One prepared artifact per scheme, consumed by the next low latency signature
    SignatureGeneration {
        prepared: HashMap<SignatureScheme, Secret>,
    },
    SignatureVerification {
        imported: BTreeMap<u32, ImportedKey>,
        next_ref: u32,
    },
}
