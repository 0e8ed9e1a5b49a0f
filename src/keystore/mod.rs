//! Key Store: groups, keys and the anti-rollback counter of one partition
//!
//! Every change is staged on a copy of the owning group. A strict change on a
//! persistent group is committed (group + header with the advanced counter) in one
//! NVM write before the copy is swapped in, so a failed write leaves both the memory
//! state and the durable state untouched.
//!
//! Callers hold the store's `StoreGate` for the whole duration of an operation.

pub mod group;
pub mod key;

pub use group::{KeyGroup, KeyHeader, Residency, MAX_KEY_GROUP};
pub use key::{Key, KeyUsage};

use crate::algo::KeyType;
use crate::engine::KeyMaterial;
use crate::error::{HsmError, HsmResult, NO_ERROR};
use crate::flags::{KeyGroupOp, KeyInfo, Persistence, WriteMode};
use crate::nvm::{NvmStore, StoreHeader};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use subtle::ConstantTimeEq;

/// Digest of the (id, nonce) access credential; the raw nonce is never stored
pub fn credential(store_id: u32, nonce: u32) -> String {
    let mut h = Sha256::new();
    h.update(b"hsm-key-store-credential-v1");
    h.update(store_id.to_be_bytes());
    h.update(nonce.to_be_bytes());
    hex::encode(h.finalize())
}

/// Outcome of a key store write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitStatus {
    /// Applied in memory only, lost on close or reset
    MemoryOnly,
    /// Committed to NVM, counter advanced
    Committed { counter: u16 },
    /// Committed to NVM but the counter reached its ceiling and stayed put
    CounterExhausted { counter: u16 },
}

impl CommitStatus {
    /// Soft status code: `KeyStoreCounter` when exhausted, success otherwise
    pub fn code(&self) -> u8 {
        match self {
            CommitStatus::CounterExhausted { .. } => HsmError::KeyStoreCounter.code(),
            _ => NO_ERROR,
        }
    }

    pub fn is_counter_exhausted(&self) -> bool {
        matches!(self, CommitStatus::CounterExhausted { .. })
    }

    pub fn advanced_counter(&self) -> bool {
        matches!(self, CommitStatus::Committed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// New key; HSM assigns the id when none is requested
    Create { requested: Option<u32> },
    Update(u32),
}

/// One key to create or replace
#[derive(Debug, Clone, Copy)]
pub struct KeyWrite {
    pub target: WriteTarget,
    pub key_type: KeyType,
    pub info: KeyInfo,
}

impl KeyWrite {
    /// `key_id` 0 on create asks the HSM for an identifier
    pub fn new(mode: WriteMode, key_id: u32, key_type: KeyType, info: KeyInfo) -> Self {
        let target = match mode {
            WriteMode::Create => WriteTarget::Create {
                requested: (key_id != 0).then_some(key_id),
            },
            WriteMode::Update => WriteTarget::Update(key_id),
        };
        Self {
            target,
            key_type,
            info,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PlannedKey {
    id: u32,
    key_type: KeyType,
    info: KeyInfo,
}

/// Validated write, ready to receive key material
#[derive(Debug)]
pub struct WritePlan {
    group: u16,
    class: Persistence,
    entries: Vec<PlannedKey>,
}

impl WritePlan {
    /// Identifiers in write order
    pub fn ids(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStatus {
    pub id: u16,
    pub class: Persistence,
    pub residency: Residency,
    pub locked: bool,
    pub dirty: bool,
    pub keys: usize,
}

/// Store-level status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyStoreStatus {
    pub store_id: u32,
    pub counter: u16,
    pub max_updates: u16,
    pub counter_exhausted: bool,
    pub durable: bool,
    pub groups: Vec<GroupStatus>,
}

/// Live state of an attached key store
pub struct KeyStore {
    id: u32,
    credential: String,
    max_updates: u16,
    counter: u16,
    durable: bool,
    groups: BTreeMap<u16, KeyGroup>,
    key_index: HashMap<u32, u16>,
    /// Ids deleted in memory only, still held by their group's NVM record
    reserved: HashMap<u32, u16>,
    next_key_id: u32,
    cache_capacity: usize,
    tick: u64,
    nvm: Arc<dyn NvmStore>,
}

impl KeyStore {
    /// Fresh store, durable only after its first NVM write
    pub fn create(
        id: u32,
        credential: String,
        max_updates: u16,
        cache_capacity: usize,
        nvm: Arc<dyn NvmStore>,
    ) -> Self {
        Self {
            id,
            credential,
            max_updates,
            counter: 0,
            durable: false,
            groups: BTreeMap::new(),
            key_index: HashMap::new(),
            reserved: HashMap::new(),
            next_key_id: 1,
            cache_capacity: cache_capacity.max(1),
            tick: 0,
            nvm,
        }
    }

    /// Attach to a committed store; groups start evicted and load on first use
    pub fn load(header: StoreHeader, cache_capacity: usize, nvm: Arc<dyn NvmStore>) -> HsmResult<Self> {
        let mut store = Self::create(
            header.store_id,
            header.credential.clone(),
            header.max_updates,
            cache_capacity,
            nvm,
        );
        store.counter = header.counter;
        store.durable = true;
        for record in store.nvm.read_groups(header.store_id)? {
            let group = KeyGroup::from_record_ids(&record);
            for id in group.key_ids() {
                if let Some(other) = store.key_index.insert(id, group.id) {
                    return Err(HsmError::KeyStoreError(format!(
                        "key {:#x} recorded in groups {} and {}",
                        id, other, group.id
                    )));
                }
            }
            store.groups.insert(group.id, group);
        }
        store.next_key_id = store
            .key_index
            .keys()
            .max()
            .map_or(1, |max| max.wrapping_add(1).max(1));
        info!(
            "Loaded key store {} ({} groups, counter {}/{})",
            store.id,
            store.groups.len(),
            store.counter,
            store.max_updates
        );
        Ok(store)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn counter(&self) -> u16 {
        self.counter
    }

    pub fn max_updates(&self) -> u16 {
        self.max_updates
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn counter_exhausted(&self) -> bool {
        self.counter >= self.max_updates
    }

    pub fn status(&self) -> KeyStoreStatus {
        KeyStoreStatus {
            store_id: self.id,
            counter: self.counter,
            max_updates: self.max_updates,
            counter_exhausted: self.counter_exhausted(),
            durable: self.durable,
            groups: self
                .groups
                .values()
                .map(|g| GroupStatus {
                    id: g.id,
                    class: g.class,
                    residency: g.residency,
                    locked: g.locked,
                    dirty: g.dirty,
                    keys: g.len(),
                })
                .collect(),
        }
    }

    fn header(&self, counter: u16) -> StoreHeader {
        StoreHeader {
            store_id: self.id,
            credential: self.credential.clone(),
            max_updates: self.max_updates,
            counter,
            updated_at: Utc::now(),
        }
    }

    // --- Cache residency ---

    fn touch(&mut self, gid: u16) {
        self.tick += 1;
        if let Some(group) = self.groups.get_mut(&gid) {
            group.last_used = self.tick;
        }
    }

    fn resident_count(&self) -> usize {
        self.groups.values().filter(|g| g.is_resident()).count()
    }

    /// Evict least recently used groups until `incoming` fits
    fn make_room(&mut self, incoming: u16) -> HsmResult<()> {
        while self.resident_count() >= self.cache_capacity {
            let victim = self
                .groups
                .values()
                .filter(|g| g.id != incoming && g.is_evictable())
                .min_by_key(|g| g.last_used)
                .map(|g| g.id);
            match victim {
                Some(id) => {
                    if let Some(group) = self.groups.get_mut(&id) {
                        group.evict();
                    }
                    debug!("Evicted key group {} of store {}", id, self.id);
                }
                None => {
                    warn!(
                        "Store {}: no evictable key group to make room for group {}",
                        self.id, incoming
                    );
                    return Err(HsmError::OutOfMemory(format!(
                        "key group cache full ({} resident)",
                        self.cache_capacity
                    )));
                }
            }
        }
        Ok(())
    }

    fn ensure_resident(&mut self, gid: u16) -> HsmResult<()> {
        let evicted = match self.groups.get(&gid) {
            Some(group) => !group.is_resident(),
            None => return Ok(()),
        };
        if evicted {
            self.make_room(gid)?;
            let record = self.nvm.read_group(self.id, gid)?.ok_or_else(|| {
                HsmError::KeyStoreError(format!("evicted group {} missing from NVM", gid))
            })?;
            if let Some(group) = self.groups.get_mut(&gid) {
                group.restore(&record)?;
            }
            debug!("Reloaded key group {} of store {}", gid, self.id);
        }
        self.touch(gid);
        Ok(())
    }

    fn key_header(&self, id: u32) -> HsmResult<(u16, KeyHeader)> {
        let gid = *self.key_index.get(&id).ok_or(HsmError::UnknownId(id))?;
        let header = self
            .group(gid)?
            .header(id)
            .ok_or_else(|| HsmError::KeyStoreError(format!("key {:#x} missing from group {}", id, gid)))?;
        Ok((gid, header))
    }

    fn id_taken(&self, id: u32) -> bool {
        self.key_index.contains_key(&id) || self.reserved.contains_key(&id)
    }

    fn group(&self, gid: u16) -> HsmResult<&KeyGroup> {
        self.groups
            .get(&gid)
            .ok_or(HsmError::UnknownId(u32::from(gid)))
    }

    // --- Lookup ---

    /// Resolve a key, reloading its group if evicted
    pub fn key(&mut self, id: u32) -> HsmResult<Key> {
        let gid = *self.key_index.get(&id).ok_or(HsmError::UnknownId(id))?;
        self.ensure_resident(gid)?;
        self.group(gid)?
            .get(id)
            .cloned()
            .ok_or_else(|| HsmError::KeyStoreError(format!("key {:#x} missing from group {}", id, gid)))
    }

    /// Resolve a key and check its attributes allow `usage`
    pub fn key_for(&mut self, id: u32, usage: KeyUsage) -> HsmResult<Key> {
        let key = self.key(id)?;
        key.check_usage(usage)?;
        Ok(key)
    }

    pub fn contains_key(&self, id: u32) -> bool {
        self.key_index.contains_key(&id)
    }

    // --- Writes ---

    /// Validate a create/update batch targeting one group
    pub fn plan_write(&mut self, group: u16, writes: &[KeyWrite]) -> HsmResult<WritePlan> {
        let first = writes
            .first()
            .ok_or_else(|| HsmError::param("no key to write"))?;
        let mut claimed = HashSet::new();
        let mut next = self.next_key_id;
        let mut entries = Vec::with_capacity(writes.len());

        for write in writes {
            let id = match write.target {
                WriteTarget::Update(id) => {
                    let (owner, existing) = self.key_header(id)?;
                    if existing.key_type != write.key_type {
                        return Err(HsmError::InvalidParam(format!(
                            "key {:#x} is {:?}, update supplied {:?}",
                            id, existing.key_type, write.key_type
                        )));
                    }
                    if existing.is_permanent() {
                        return Err(HsmError::lifecycle(format!("key {:#x} is permanent", id)));
                    }
                    if owner != group {
                        return Err(HsmError::InvalidParam(format!(
                            "key {:#x} belongs to group {}",
                            id, owner
                        )));
                    }
                    if !claimed.insert(id) {
                        return Err(HsmError::InvalidParam(format!("key {:#x} written twice", id)));
                    }
                    id
                }
                WriteTarget::Create { requested: Some(id) } => {
                    if let Some(owner) = self.reserved.get(&id) {
                        return Err(HsmError::IdConflict(format!(
                            "key {:#x} still held by uncommitted group {}",
                            id, owner
                        )));
                    }
                    if self.key_index.contains_key(&id) || !claimed.insert(id) {
                        return Err(HsmError::IdConflict(format!("key {:#x} already exists", id)));
                    }
                    id
                }
                WriteTarget::Create { requested: None } => {
                    while next == 0 || self.id_taken(next) || claimed.contains(&next) {
                        next = next.wrapping_add(1);
                    }
                    claimed.insert(next);
                    next = next.wrapping_add(1);
                    next.wrapping_sub(1)
                }
            };
            entries.push(PlannedKey {
                id,
                key_type: write.key_type,
                info: write.info,
            });
        }

        if group > MAX_KEY_GROUP {
            return Err(HsmError::InvalidParam(format!(
                "key group {} out of range 0..={}",
                group, MAX_KEY_GROUP
            )));
        }
        let class = first.info.persistence();
        if writes.iter().any(|w| w.info.persistence() != class) {
            return Err(HsmError::param("mixed persistence in one write"));
        }
        if let Some(existing) = self.groups.get(&group) {
            if existing.class != class {
                return Err(HsmError::InvalidParam(format!(
                    "key group {} holds {:?} keys",
                    group, existing.class
                )));
            }
        }

        if self.groups.contains_key(&group) {
            self.ensure_resident(group)?;
        } else {
            self.make_room(group)?;
        }
        Ok(WritePlan {
            group,
            class,
            entries,
        })
    }

    /// Apply a validated plan with one material per planned key
    pub fn apply_write(
        &mut self,
        plan: WritePlan,
        materials: Vec<KeyMaterial>,
        strict: bool,
    ) -> HsmResult<CommitStatus> {
        if materials.len() != plan.entries.len() {
            return Err(HsmError::GeneralError(format!(
                "{} keys planned, {} materials supplied",
                plan.entries.len(),
                materials.len()
            )));
        }
        let mut staged = match self.groups.get(&plan.group) {
            Some(group) => group.clone(),
            None => KeyGroup::new(plan.group, plan.class),
        };
        for (entry, material) in plan.entries.iter().zip(materials) {
            staged.insert(Key::new(entry.id, entry.key_type, entry.info, material));
        }
        let status = self.commit(staged, strict)?;
        if let Some(max) = plan.entries.iter().map(|e| e.id).max() {
            if max >= self.next_key_id {
                self.next_key_id = max.wrapping_add(1).max(1);
            }
        }
        Ok(status)
    }

    pub fn delete_key(&mut self, id: u32, strict: bool) -> HsmResult<CommitStatus> {
        let (gid, header) = self.key_header(id)?;
        if header.is_permanent() {
            return Err(HsmError::lifecycle(format!("key {:#x} is permanent", id)));
        }
        self.ensure_resident(gid)?;
        let mut staged = self.group(gid)?.clone();
        staged.remove(id);
        self.commit(staged, strict)
    }

    /// Cache lockdown / unlock / delete of a whole group
    pub fn manage_group(&mut self, gid: u16, op: KeyGroupOp, strict: bool) -> HsmResult<CommitStatus> {
        if gid > MAX_KEY_GROUP {
            return Err(HsmError::InvalidParam(format!("key group {} out of range", gid)));
        }
        if op == KeyGroupOp::Delete && self.group(gid)?.has_permanent() {
            return Err(HsmError::lifecycle(format!(
                "key group {} holds permanent keys",
                gid
            )));
        }
        self.ensure_resident(gid)?;
        match op {
            KeyGroupOp::Lockdown | KeyGroupOp::Unlock => {
                let locked = op == KeyGroupOp::Lockdown;
                debug!(
                    "Store {} group {} cache {}",
                    self.id,
                    gid,
                    if locked { "locked down" } else { "unlocked" }
                );
                if strict {
                    let mut staged = self.group(gid)?.clone();
                    staged.locked = locked;
                    self.commit(staged, true)
                } else {
                    if let Some(group) = self.groups.get_mut(&gid) {
                        group.locked = locked;
                    }
                    Ok(CommitStatus::MemoryOnly)
                }
            }
            KeyGroupOp::Delete => {
                let staged = KeyGroup::new(gid, self.group(gid)?.class);
                self.commit(staged, strict)
            }
        }
    }

    fn commit(&mut self, mut staged: KeyGroup, strict: bool) -> HsmResult<CommitStatus> {
        let status = if strict && staged.class == Persistence::Persistent {
            let (counter, status) = if self.counter < self.max_updates {
                let next = self.counter + 1;
                (next, CommitStatus::Committed { counter: next })
            } else {
                (self.counter, CommitStatus::CounterExhausted { counter: self.counter })
            };
            let header = self.header(counter);
            if staged.is_empty() {
                self.nvm.erase_group(&header, staged.id)?;
            } else {
                self.nvm.write_group(&header, &staged.to_record())?;
            }
            self.counter = counter;
            self.durable = true;
            staged.dirty = false;
            self.reserved.retain(|_, gid| *gid != staged.id);
            match status {
                CommitStatus::CounterExhausted { .. } => warn!(
                    "Store {} committed group {} with counter exhausted at {}",
                    self.id, staged.id, counter
                ),
                _ => info!(
                    "Store {} committed group {} (counter {}/{})",
                    self.id, staged.id, counter, self.max_updates
                ),
            }
            status
        } else {
            if staged.class == Persistence::Persistent {
                staged.dirty = true;
                if let Some(old) = self.groups.get(&staged.id) {
                    for id in old.key_ids().filter(|id| staged.header(*id).is_none()) {
                        self.reserved.insert(id, staged.id);
                    }
                }
            }
            CommitStatus::MemoryOnly
        };
        self.install(staged);
        Ok(status)
    }

    fn install(&mut self, staged: KeyGroup) {
        let gid = staged.id;
        if let Some(old) = self.groups.remove(&gid) {
            for id in old.key_ids() {
                self.key_index.remove(&id);
            }
        }
        if staged.is_empty() {
            debug!("Key group {} of store {} is empty, dropped", gid, self.id);
            return;
        }
        for id in staged.key_ids() {
            self.key_index.insert(id, gid);
        }
        self.groups.insert(gid, staged);
        self.touch(gid);
    }

    // --- Data storage ---

    /// Write a data blob; makes the store durable without moving the counter
    pub fn store_data(&mut self, data_id: u16, data: &[u8]) -> HsmResult<()> {
        if data.is_empty() {
            return Err(HsmError::param("empty data payload"));
        }
        self.nvm.write_data(&self.header(self.counter), data_id, data)?;
        self.durable = true;
        Ok(())
    }

    pub fn retrieve_data(&self, data_id: u16) -> HsmResult<Vec<u8>> {
        self.nvm
            .read_data(self.id, data_id)?
            .ok_or(HsmError::UnknownId(u32::from(data_id)))
    }
}

/// Serialization point of one key store
///
/// The identity and credential are immutable and readable without the lock.
pub struct StoreGate {
    pub id: u32,
    credential: String,
    max_updates: u16,
    state: Mutex<KeyStore>,
}

impl StoreGate {
    pub fn new(store: KeyStore) -> Self {
        Self {
            id: store.id,
            credential: store.credential.clone(),
            max_updates: store.max_updates,
            state: Mutex::new(store),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, KeyStore> {
        self.state.lock()
    }

    pub fn max_updates(&self) -> u16 {
        self.max_updates
    }

    pub fn matches_credential(&self, credential: &str) -> bool {
        credential_matches(&self.credential, credential)
    }
}

/// Constant time comparison of two credential digests
pub fn credential_matches(stored: &str, presented: &str) -> bool {
    stored.as_bytes().ct_eq(presented.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CryptoEngine, SimulatedEngine};
    use crate::nvm::InMemoryNvm;
    use proptest::prelude::*;

    fn material(key_type: KeyType) -> KeyMaterial {
        SimulatedEngine::new(1).generate_key(key_type).unwrap()
    }

    fn store(max_updates: u16, capacity: usize) -> (KeyStore, Arc<InMemoryNvm>) {
        let nvm = Arc::new(InMemoryNvm::new());
        let ks = KeyStore::create(7, credential(7, 42), max_updates, capacity, nvm.clone());
        (ks, nvm)
    }

    fn create(ks: &mut KeyStore, group: u16, info: KeyInfo, strict: bool) -> HsmResult<(u32, CommitStatus)> {
        let write = KeyWrite::new(WriteMode::Create, 0, KeyType::Aes256, info);
        let plan = ks.plan_write(group, &[write])?;
        let id = plan.ids()[0];
        let status = ks.apply_write(plan, vec![material(KeyType::Aes256)], strict)?;
        Ok((id, status))
    }

    #[test]
    fn test_strict_create_advances_counter() {
        let (mut ks, nvm) = store(2, 8);
        let (id, status) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        assert_eq!(id, 1);
        assert_eq!(status, CommitStatus::Committed { counter: 1 });
        assert!(ks.is_durable());
        assert_eq!(nvm.read_store(7).unwrap().unwrap().counter, 1);
        assert_eq!(nvm.read_group(7, 1).unwrap().unwrap().keys.len(), 1);
    }

    #[test]
    fn test_counter_exhaustion_is_soft() {
        let (mut ks, nvm) = store(2, 8);
        create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        let (_, status) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        assert_eq!(status, CommitStatus::CounterExhausted { counter: 2 });
        assert_eq!(status.code(), HsmError::KeyStoreCounter.code());
        assert_eq!(ks.counter(), 2);
        assert!(ks.status().counter_exhausted);
        assert_eq!(nvm.read_group(7, 1).unwrap().unwrap().keys.len(), 3);
    }

    #[test]
    fn test_memory_only_and_transient_writes() {
        let (mut ks, nvm) = store(5, 8);
        let (_, status) = create(&mut ks, 1, KeyInfo::empty(), false).unwrap();
        assert_eq!(status, CommitStatus::MemoryOnly);
        let (_, status) = create(&mut ks, 2, KeyInfo::TRANSIENT, true).unwrap();
        assert_eq!(status, CommitStatus::MemoryOnly);
        assert_eq!(ks.counter(), 0);
        assert!(!ks.is_durable());
        assert_eq!(nvm.write_count(), 0);
    }

    #[test]
    fn test_mixed_persistence_rejected() {
        let (mut ks, _) = store(5, 8);
        create(&mut ks, 3, KeyInfo::empty(), false).unwrap();
        assert!(matches!(
            create(&mut ks, 3, KeyInfo::TRANSIENT, false),
            Err(HsmError::InvalidParam(_))
        ));
        assert!(matches!(
            create(&mut ks, 1024, KeyInfo::empty(), false),
            Err(HsmError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_update_rules() {
        let (mut ks, _) = store(5, 8);
        let (id, _) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();

        let wrong_type = KeyWrite::new(WriteMode::Update, id, KeyType::Aes128, KeyInfo::empty());
        assert!(matches!(ks.plan_write(1, &[wrong_type]), Err(HsmError::InvalidParam(_))));
        assert_eq!(ks.counter(), 1);

        let missing = KeyWrite::new(WriteMode::Update, 99, KeyType::Aes256, KeyInfo::empty());
        assert_eq!(ks.plan_write(1, &[missing]).unwrap_err(), HsmError::UnknownId(99));

        let dup = KeyWrite::new(WriteMode::Create, id, KeyType::Aes256, KeyInfo::empty());
        assert!(matches!(ks.plan_write(1, &[dup]), Err(HsmError::IdConflict(_))));

        let other_group = KeyWrite::new(WriteMode::Update, id, KeyType::Aes256, KeyInfo::empty());
        assert!(matches!(ks.plan_write(2, &[other_group]), Err(HsmError::InvalidParam(_))));
    }

    #[test]
    fn test_permanent_key_is_immutable() {
        let (mut ks, _) = store(5, 8);
        let (id, _) = create(&mut ks, 1, KeyInfo::PERMANENT, true).unwrap();
        let update = KeyWrite::new(WriteMode::Update, id, KeyType::Aes256, KeyInfo::empty());
        assert!(matches!(ks.plan_write(1, &[update]), Err(HsmError::InvalidLifecycle(_))));
        assert!(matches!(ks.delete_key(id, true), Err(HsmError::InvalidLifecycle(_))));
        assert!(matches!(
            ks.manage_group(1, KeyGroupOp::Delete, true),
            Err(HsmError::InvalidLifecycle(_))
        ));
        assert!(ks.key(id).is_ok());
    }

    #[test]
    fn test_nvm_failure_leaves_state_unchanged() {
        let (mut ks, nvm) = store(5, 8);
        let (first, _) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        nvm.set_fail_writes(true);
        assert!(matches!(
            create(&mut ks, 1, KeyInfo::empty(), true),
            Err(HsmError::NvmError(_))
        ));
        assert!(matches!(ks.delete_key(first, true), Err(HsmError::NvmError(_))));
        nvm.set_fail_writes(false);
        assert_eq!(ks.counter(), 1);
        assert!(ks.key(first).is_ok());
        assert_eq!(ks.status().groups[0].keys, 1);
        assert!(!ks.contains_key(2));
    }

    #[test]
    fn test_eviction_and_transparent_reload() {
        let (mut ks, _) = store(10, 1);
        let (a, _) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        let (b, _) = create(&mut ks, 2, KeyInfo::empty(), true).unwrap();
        let status = ks.status();
        assert_eq!(status.groups[0].residency, Residency::Evicted);
        assert_eq!(status.groups[1].residency, Residency::Resident);

        assert_eq!(ks.key(a).unwrap().id, a);
        assert_eq!(ks.status().groups[1].residency, Residency::Evicted);
        assert_eq!(ks.key(b).unwrap().id, b);
    }

    #[test]
    fn test_lockdown_blocks_eviction() {
        let (mut ks, _) = store(10, 1);
        create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        ks.manage_group(1, KeyGroupOp::Lockdown, false).unwrap();
        assert!(matches!(
            create(&mut ks, 2, KeyInfo::empty(), true),
            Err(HsmError::OutOfMemory(_))
        ));
        ks.manage_group(1, KeyGroupOp::Unlock, false).unwrap();
        assert!(create(&mut ks, 2, KeyInfo::empty(), true).is_ok());
        assert!(matches!(
            ks.manage_group(9, KeyGroupOp::Lockdown, false),
            Err(HsmError::UnknownId(9))
        ));
    }

    #[test]
    fn test_dirty_group_not_evicted() {
        let (mut ks, _) = store(10, 1);
        create(&mut ks, 1, KeyInfo::empty(), false).unwrap();
        assert!(matches!(
            create(&mut ks, 2, KeyInfo::empty(), false),
            Err(HsmError::OutOfMemory(_))
        ));
    }

    #[test]
    fn test_reload_drops_uncommitted_changes() {
        let (mut ks, nvm) = store(10, 8);
        let (kept, _) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        let (lost, _) = create(&mut ks, 1, KeyInfo::empty(), false).unwrap();
        let (transient, _) = create(&mut ks, 2, KeyInfo::TRANSIENT, false).unwrap();
        drop(ks);

        let header = nvm.read_store(7).unwrap().unwrap();
        let mut reloaded = KeyStore::load(header, 8, nvm.clone()).unwrap();
        assert!(reloaded.key(kept).is_ok());
        assert_eq!(reloaded.key(lost).unwrap_err(), HsmError::UnknownId(lost));
        assert!(reloaded.key(transient).is_err());
        assert_eq!(reloaded.counter(), 1);
        let (next, _) = create(&mut reloaded, 1, KeyInfo::empty(), false).unwrap();
        assert!(next > kept);
    }

    #[test]
    fn test_group_delete_strict() {
        let (mut ks, nvm) = store(10, 8);
        let (id, _) = create(&mut ks, 4, KeyInfo::empty(), true).unwrap();
        let status = ks.manage_group(4, KeyGroupOp::Delete, true).unwrap();
        assert_eq!(status, CommitStatus::Committed { counter: 2 });
        assert!(!ks.contains_key(id));
        assert!(nvm.read_group(7, 4).unwrap().is_none());
        create(&mut ks, 4, KeyInfo::TRANSIENT, false).unwrap();
    }

    #[test]
    fn test_data_storage() {
        let (mut ks, _) = store(10, 8);
        assert!(matches!(ks.store_data(1, &[]), Err(HsmError::InvalidParam(_))));
        ks.store_data(1, b"payload").unwrap();
        assert!(ks.is_durable());
        assert_eq!(ks.counter(), 0);
        assert_eq!(ks.retrieve_data(1).unwrap(), b"payload".to_vec());
        assert_eq!(ks.retrieve_data(2).unwrap_err(), HsmError::UnknownId(2));
    }

    fn create_id(ks: &mut KeyStore, id: u32, group: u16, strict: bool) -> HsmResult<CommitStatus> {
        let write = KeyWrite::new(WriteMode::Create, id, KeyType::Aes256, KeyInfo::empty());
        let plan = ks.plan_write(group, &[write])?;
        ks.apply_write(plan, vec![material(KeyType::Aes256)], strict)
    }

    #[test]
    fn test_permanent_checks_precede_reload() {
        let (mut ks, _) = store(10, 2);
        let (perm, _) = create(&mut ks, 3, KeyInfo::PERMANENT, true).unwrap();
        create(&mut ks, 0, KeyInfo::empty(), false).unwrap();
        create(&mut ks, 1, KeyInfo::empty(), false).unwrap();
        assert_eq!(ks.status().groups[2].residency, Residency::Evicted);

        assert!(matches!(ks.delete_key(perm, true), Err(HsmError::InvalidLifecycle(_))));
        let update = KeyWrite::new(WriteMode::Update, perm, KeyType::Aes256, KeyInfo::PERMANENT);
        assert!(matches!(ks.plan_write(3, &[update]), Err(HsmError::InvalidLifecycle(_))));
        let wrong_type = KeyWrite::new(WriteMode::Update, perm, KeyType::Aes128, KeyInfo::PERMANENT);
        assert!(matches!(ks.plan_write(3, &[wrong_type]), Err(HsmError::InvalidParam(_))));
        assert!(matches!(
            ks.manage_group(3, KeyGroupOp::Delete, true),
            Err(HsmError::InvalidLifecycle(_))
        ));
        assert!(matches!(ks.key(perm), Err(HsmError::OutOfMemory(_))));
        assert_eq!(ks.counter(), 1);
    }

    #[test]
    fn test_id_reserved_until_old_group_commits() {
        let (mut ks, nvm) = store(10, 8);
        create_id(&mut ks, 0x99, 1, true).unwrap();
        assert_eq!(ks.delete_key(0x99, false).unwrap(), CommitStatus::MemoryOnly);
        assert!(!ks.contains_key(0x99));
        assert!(matches!(create_id(&mut ks, 0x99, 2, true), Err(HsmError::IdConflict(_))));
        assert!(nvm.read_group(7, 2).unwrap().is_none());

        let (other, _) = create(&mut ks, 1, KeyInfo::empty(), true).unwrap();
        assert_ne!(other, 0x99);
        let ids: Vec<u32> = nvm.read_group(7, 1).unwrap().unwrap().keys.iter().map(|k| k.id).collect();
        assert_eq!(ids, vec![other]);

        create_id(&mut ks, 0x99, 2, true).unwrap();
        drop(ks);
        let header = nvm.read_store(7).unwrap().unwrap();
        let mut reloaded = KeyStore::load(header, 8, nvm.clone()).unwrap();
        assert_eq!(reloaded.key_index[&0x99], 2);
        assert!(reloaded.key(0x99).is_ok());
    }

    #[test]
    fn test_load_rejects_id_in_two_groups() {
        let nvm = Arc::new(InMemoryNvm::new());
        let header = StoreHeader {
            store_id: 7,
            credential: credential(7, 42),
            max_updates: 10,
            counter: 2,
            updated_at: Utc::now(),
        };
        for gid in [1, 2] {
            let mut group = KeyGroup::new(gid, Persistence::Persistent);
            group.insert(Key::new(0x99, KeyType::Aes256, KeyInfo::empty(), material(KeyType::Aes256)));
            nvm.write_group(&header, &group.to_record()).unwrap();
        }
        assert!(matches!(
            KeyStore::load(header, 8, nvm.clone()),
            Err(HsmError::KeyStoreError(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Create { group: u16, transient: bool, permanent: bool, strict: bool },
        Update { slot: usize, strict: bool },
        Delete { slot: usize, strict: bool },
        Lock { group: u16, strict: bool },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..4, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
                |(group, transient, permanent, strict)| Op::Create { group, transient, permanent, strict }
            ),
            (0usize..16, any::<bool>()).prop_map(|(slot, strict)| Op::Update { slot, strict }),
            (0usize..16, any::<bool>()).prop_map(|(slot, strict)| Op::Delete { slot, strict }),
            (0u16..4, any::<bool>()).prop_map(|(group, strict)| Op::Lock { group, strict }),
        ]
    }

    proptest! {
        #[test]
        fn prop_permanent_counter_and_class_invariants(ops in proptest::collection::vec(op(), 1..40)) {
            let (mut ks, _) = store(6, 2);
            let mut ids: Vec<u32> = Vec::new();
            let mut permanent: Vec<u32> = Vec::new();
            let mut last_counter = 0;
            for op in ops {
                match op {
                    Op::Create { group, transient, permanent: perm, strict } => {
                        let mut info = KeyInfo::empty();
                        if transient { info |= KeyInfo::TRANSIENT; }
                        if perm { info |= KeyInfo::PERMANENT; }
                        if let Ok((id, _)) = create(&mut ks, group, info, strict) {
                            ids.push(id);
                            if perm { permanent.push(id); }
                        }
                    }
                    Op::Update { slot, strict } => {
                        if let Some(&id) = ids.get(slot) {
                            if let Ok(key) = ks.key(id) {
                                let gid = ks.key_index[&id];
                                let write = KeyWrite::new(WriteMode::Update, id, key.key_type, key.info);
                                let result = ks.plan_write(gid, &[write])
                                    .and_then(|plan| ks.apply_write(plan, vec![material(KeyType::Aes256)], strict));
                                if permanent.contains(&id) {
                                    prop_assert!(matches!(result, Err(HsmError::InvalidLifecycle(_))));
                                }
                            }
                        }
                    }
                    Op::Delete { slot, strict } => {
                        if let Some(&id) = ids.get(slot) {
                            let result = ks.delete_key(id, strict);
                            if permanent.contains(&id) {
                                prop_assert!(matches!(result, Err(HsmError::InvalidLifecycle(_))));
                            }
                        }
                    }
                    Op::Lock { group, strict } => {
                        let _ = ks.manage_group(group, KeyGroupOp::Lockdown, strict);
                        let _ = ks.manage_group(group, KeyGroupOp::Unlock, false);
                    }
                }
                prop_assert!(ks.counter() >= last_counter);
                prop_assert!(ks.counter() <= ks.max_updates());
                last_counter = ks.counter();
                for id in &permanent {
                    prop_assert!(ks.contains_key(*id));
                }
                for (gid, group) in &ks.groups {
                    if group.is_resident() {
                        for id in group.key_ids() {
                            let key = group.get(id).unwrap();
                            prop_assert_eq!(key.info.persistence(), group.class);
                            prop_assert_eq!(ks.key_index[&id], *gid);
                        }
                    }
                }
            }
        }
    }
}
