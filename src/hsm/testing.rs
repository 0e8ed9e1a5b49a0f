//! Fixtures shared by the unit tests of the facade and the flows

use super::{Hsm, OpenKeyStoreArgs};
use crate::algo::KeyType;
use crate::auth::HmacAuthority;
use crate::config::HsmConfig;
use crate::engine::SimulatedEngine;
use crate::flags::{KeyGenFlags, KeyInfo, ManageKeyFlags};
use crate::flow::{FlowKind, GenerateKeyArgs, ManageKeyArgs};
use crate::handle::Handle;
use crate::nvm::InMemoryNvm;
use crate::session::SessionConfig;
use std::sync::Arc;

pub(crate) const AUTHORITY_SECRET: &[u8] = b"oem-provisioning-secret";

pub(crate) fn authority() -> HmacAuthority {
    HmacAuthority::new(AUTHORITY_SECRET.to_vec())
}

pub(crate) fn boot_with(config: HsmConfig, nvm: Arc<InMemoryNvm>) -> Hsm {
    let engine = Arc::new(SimulatedEngine::new(config.identity.chip_unique_id));
    Hsm::new(config, engine, nvm, Arc::new(authority())).unwrap()
}

pub(crate) fn boot(nvm: Arc<InMemoryNvm>) -> Hsm {
    boot_with(HsmConfig::default(), nvm)
}

pub(crate) fn hsm_with(config: HsmConfig) -> (Hsm, Arc<InMemoryNvm>) {
    let nvm = Arc::new(InMemoryNvm::new());
    (boot_with(config, nvm.clone()), nvm)
}

pub(crate) fn hsm() -> (Hsm, Arc<InMemoryNvm>) {
    hsm_with(HsmConfig::default())
}

/// New session with a freshly created key store
pub(crate) fn key_store(hsm: &Hsm, id: u32, nonce: u32, max_updates: u16) -> (Handle, Handle) {
    let session = hsm.open_session(SessionConfig::default()).unwrap();
    let ks = hsm
        .open_key_store(session, &OpenKeyStoreArgs::create(id, nonce, max_updates))
        .unwrap()
        .handle()
        .unwrap();
    (session, ks)
}

/// New session attached to an existing key store
pub(crate) fn attach(hsm: &Hsm, id: u32, nonce: u32) -> (Handle, Handle) {
    let session = hsm.open_session(SessionConfig::default()).unwrap();
    let ks = hsm
        .open_key_store(session, &OpenKeyStoreArgs::attach(id, nonce))
        .unwrap()
        .handle()
        .unwrap();
    (session, ks)
}

pub(crate) fn aes_args(group: u16, strict: bool) -> GenerateKeyArgs {
    let mut args = GenerateKeyArgs::create(KeyType::Aes256, group, KeyInfo::empty());
    if strict {
        args.flags |= KeyGenFlags::STRICT_OPERATION;
    }
    args
}

pub(crate) fn delete_args(key_id: u32, strict: bool) -> ManageKeyArgs {
    let mut args = ManageKeyArgs::delete(key_id);
    if strict {
        args.flags |= ManageKeyFlags::STRICT_OPERATION;
    }
    args
}

/// Generate one AES-256 key through a short lived key management flow
pub(crate) fn generate_aes(hsm: &Hsm, ks: Handle, group: u16, strict: bool) -> u32 {
    let km = hsm.open_service(ks, FlowKind::KeyManagement).unwrap();
    let outcome = hsm.generate_key(km, &aes_args(group, strict)).unwrap();
    hsm.close_service(km).unwrap();
    outcome.key_id
}
