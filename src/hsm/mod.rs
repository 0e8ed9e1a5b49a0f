//! HSM facade: session registry, handle hierarchy and key store attachment
//!
//! All handles live in one generation-checked table. Each node records its parent so
//! every call re-validates the hierarchy instead of trusting the caller.
//!
//! Lock order is store gate, then registry. An operation resolves its handle under the
//! registry, takes the store gate, then checks the handle again: a close that won the
//! race is observed as `UnknownHandle`. Closing takes the gate first, so it waits for
//! in-flight operations of the store it tears down.

pub mod misc;
#[cfg(test)]
pub(crate) mod testing;

pub use misc::{EciesEncryptArgs, HsmInfo, PublicKeyReconstructionArgs};

use crate::auth::{AuthPurpose, Authorizer};
use crate::config::HsmConfig;
use crate::engine::CryptoEngine;
use crate::error::{HsmError, HsmResult};
use crate::flags::SessionMode;
use crate::flow::{FlowKind, FlowState, ParentKind};
use crate::handle::{Handle, HandleTable};
use crate::keystore::{
    credential, credential_matches, CommitStatus, KeyStore, KeyStoreStatus, StoreGate,
};
use crate::nvm::NvmStore;
use crate::session::SessionConfig;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

/// Arguments of `open_key_store`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenKeyStoreArgs {
    pub id: u32,
    pub nonce: u32,
    /// Ceiling of counter advancing writes, only used on create
    pub max_updates: u16,
    pub create: bool,
    /// Signed re-provisioning message; erases every key store when authorized
    pub signed_message: Option<Vec<u8>>,
}

impl OpenKeyStoreArgs {
    pub fn create(id: u32, nonce: u32, max_updates: u16) -> Self {
        Self {
            id,
            nonce,
            max_updates,
            create: true,
            signed_message: None,
        }
    }

    pub fn attach(id: u32, nonce: u32) -> Self {
        Self {
            create: false,
            ..Self::create(id, nonce, 0)
        }
    }

    pub fn reprovision(signed_message: Vec<u8>) -> Self {
        Self {
            signed_message: Some(signed_message),
            ..Self::attach(0, 0)
        }
    }
}

/// Result of `open_key_store`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenedKeyStore {
    Attached(Handle),
    /// Every key store was erased; no flow was opened
    Reprovisioned,
}

impl OpenedKeyStore {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            OpenedKeyStore::Attached(handle) => Some(*handle),
            OpenedKeyStore::Reprovisioned => None,
        }
    }
}

struct SessionNode {
    config: SessionConfig,
    /// Mode bits the platform honors
    mode: SessionMode,
    key_store: Option<Handle>,
    children: Vec<Handle>,
}

struct KeyStoreNode {
    session: Handle,
    gate: Arc<StoreGate>,
    children: Vec<Handle>,
}

struct FlowNode {
    kind: FlowKind,
    parent: Handle,
    session: Handle,
    gate: Option<Arc<StoreGate>>,
    state: FlowState,
}

enum Node {
    Session(SessionNode),
    KeyStore(KeyStoreNode),
    Flow(FlowNode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeClass {
    Session,
    KeyStore,
    Flow,
}

impl Node {
    fn class(&self) -> NodeClass {
        match self {
            Node::Session(_) => NodeClass::Session,
            Node::KeyStore(_) => NodeClass::KeyStore,
            Node::Flow(_) => NodeClass::Flow,
        }
    }
}

struct Registry {
    nodes: HandleTable<Node>,
    /// Attached stores by id, at most one flow per store
    live_stores: HashMap<u32, Arc<StoreGate>>,
    exclusive: Option<Handle>,
    /// Set while re-provisioning erases the NVM; blocks attachment
    reprovisioning: bool,
}

impl Registry {
    fn insert(&mut self, node: Node) -> HsmResult<Handle> {
        let open = self.nodes.len();
        self.nodes
            .insert(node)
            .ok_or_else(|| HsmError::OutOfMemory(format!("handle table full ({} open)", open)))
    }

    fn session(&self, handle: Handle) -> HsmResult<&SessionNode> {
        match self.nodes.get(handle) {
            Some(Node::Session(session)) => Ok(session),
            _ => Err(HsmError::UnknownHandle(handle)),
        }
    }

    fn handles_of(&self, class: NodeClass) -> Vec<Handle> {
        self.nodes
            .handles()
            .into_iter()
            .filter(|h| self.nodes.get(*h).map(Node::class) == Some(class))
            .collect()
    }

    /// Gate of the store a node depends on
    fn gate_of(&self, handle: Handle) -> Option<Arc<StoreGate>> {
        match self.nodes.get(handle)? {
            Node::Session(session) => match session.key_store.and_then(|h| self.nodes.get(h)) {
                Some(Node::KeyStore(ks)) => Some(ks.gate.clone()),
                _ => None,
            },
            Node::KeyStore(ks) => Some(ks.gate.clone()),
            Node::Flow(flow) => flow.gate.clone(),
        }
    }

    fn subtree(&self, root: Handle) -> Vec<Handle> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(handle) = stack.pop() {
            match self.nodes.get(handle) {
                Some(Node::Session(session)) => {
                    stack.extend(session.children.iter().copied());
                    stack.extend(session.key_store);
                }
                Some(Node::KeyStore(ks)) => stack.extend(ks.children.iter().copied()),
                _ => {}
            }
            out.push(handle);
        }
        out
    }

    fn detach(&mut self, root: Handle) {
        let parent = match self.nodes.get(root) {
            Some(Node::KeyStore(ks)) => Some(ks.session),
            Some(Node::Flow(flow)) => Some(flow.parent),
            _ => None,
        };
        match parent.and_then(|p| self.nodes.get_mut(p)) {
            Some(Node::Session(session)) => {
                session.children.retain(|h| *h != root);
                if session.key_store == Some(root) {
                    session.key_store = None;
                }
            }
            Some(Node::KeyStore(ks)) => ks.children.retain(|h| *h != root),
            _ => {}
        }
    }

    fn remove_subtree(&mut self, root: Handle) {
        self.detach(root);
        for handle in self.subtree(root) {
            match self.nodes.remove(handle) {
                Some(Node::Session(session)) => {
                    if self.exclusive == Some(handle) {
                        self.exclusive = None;
                    }
                    info!("Closed session {} ({:?})", handle, session.config.priority);
                }
                Some(Node::KeyStore(ks)) => {
                    self.live_stores.remove(&ks.gate.id);
                    info!("Detached key store {} ({})", ks.gate.id, handle);
                }
                Some(Node::Flow(flow)) => debug!("Closed {:?} flow {}", flow.kind, handle),
                None => {}
            }
        }
    }
}

fn same_gate(a: &Option<Arc<StoreGate>>, b: &Option<Arc<StoreGate>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Holds the registry's re-provisioning flag for the duration of an erase
struct ReprovisionGuard<'a>(&'a Mutex<Registry>);

impl<'a> ReprovisionGuard<'a> {
    fn enter(registry: &'a Mutex<Registry>) -> HsmResult<Self> {
        let mut reg = registry.lock();
        if reg.reprovisioning {
            return Err(HsmError::CmdNotSupported("re-provisioning in progress".into()));
        }
        reg.reprovisioning = true;
        Ok(Self(registry))
    }
}

impl Drop for ReprovisionGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().reprovisioning = false;
    }
}

/// Resolved view of a handle for one call
pub(crate) struct Access {
    pub mode: SessionMode,
    pub gate: Option<Arc<StoreGate>>,
}

/// The secure element command provider
pub struct Hsm {
    config: HsmConfig,
    engine: Arc<dyn CryptoEngine>,
    nvm: Arc<dyn NvmStore>,
    authorizer: Arc<dyn Authorizer>,
    registry: Mutex<Registry>,
    chip_counter: AtomicU16,
}

impl Hsm {
    /// Boot on top of the given collaborators
    pub fn new(
        config: HsmConfig,
        engine: Arc<dyn CryptoEngine>,
        nvm: Arc<dyn NvmStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> HsmResult<Self> {
        let stores = nvm.list_stores()?;
        let counter = stores
            .iter()
            .fold(0u16, |acc, header| acc.saturating_add(header.counter));
        info!(
            "HSM up on platform '{}' ({} key stores in NVM, chip counter {})",
            config.capabilities.name,
            stores.len(),
            counter
        );
        let registry = Registry {
            nodes: HandleTable::with_capacity(config.max_handles),
            live_stores: HashMap::new(),
            exclusive: None,
            reprovisioning: false,
        };
        Ok(Self {
            config,
            engine,
            nvm,
            authorizer,
            registry: Mutex::new(registry),
            chip_counter: AtomicU16::new(counter),
        })
    }

    pub fn config(&self) -> &HsmConfig {
        &self.config
    }

    pub(crate) fn engine(&self) -> &dyn CryptoEngine {
        self.engine.as_ref()
    }

    pub(crate) fn authorizer(&self) -> &dyn Authorizer {
        self.authorizer.as_ref()
    }

    pub fn chip_counter(&self) -> u16 {
        self.chip_counter.load(Ordering::SeqCst)
    }

    /// Account a store commit in the chip wide counter
    pub(crate) fn record_commit(&self, status: CommitStatus) {
        if status.advanced_counter() {
            let _ = self
                .chip_counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_add(1)));
        }
    }

    /// Number of currently open handles of every kind
    pub fn open_handles(&self) -> usize {
        self.registry.lock().nodes.len()
    }

    // --- Sessions ---

    pub fn open_session(&self, config: SessionConfig) -> HsmResult<Handle> {
        let mode = self.config.capabilities.effective_mode(config.mode);
        let mut reg = self.registry.lock();
        if let Some(exclusive) = reg.exclusive {
            return Err(HsmError::CmdNotSupported(format!(
                "exclusive session {} is open",
                exclusive
            )));
        }
        let exclusive = mode.contains(SessionMode::EXCLUSIVE);
        if exclusive && !reg.handles_of(NodeClass::Session).is_empty() {
            return Err(HsmError::CmdNotSupported(
                "exclusive session requires no other open session".into(),
            ));
        }
        let handle = reg.insert(Node::Session(SessionNode {
            config,
            mode,
            key_store: None,
            children: Vec::new(),
        }))?;
        if exclusive {
            reg.exclusive = Some(handle);
        }
        info!(
            "Opened session {} ({:?}, mode {:?})",
            handle, config.priority, mode
        );
        Ok(handle)
    }

    /// Close a session and everything opened under it
    pub fn close_session(&self, session: Handle) -> HsmResult<()> {
        self.close_node(session, NodeClass::Session)
    }

    /// Power-on reset: close every session, dropping all uncommitted state
    pub fn reset(&self) {
        let sessions = self.registry.lock().handles_of(NodeClass::Session);
        let count = sessions.len();
        for session in sessions {
            // a racing close already removed it
            let _ = self.close_node(session, NodeClass::Session);
        }
        info!("HSM reset ({} sessions closed)", count);
    }

    fn close_node(&self, root: Handle, class: NodeClass) -> HsmResult<()> {
        loop {
            let gate = {
                let reg = self.registry.lock();
                match reg.nodes.get(root) {
                    Some(node) if node.class() == class => reg.gate_of(root),
                    _ => return Err(HsmError::UnknownHandle(root)),
                }
            };
            let _store = gate.as_ref().map(|g| g.lock());
            let mut reg = self.registry.lock();
            match reg.nodes.get(root) {
                Some(node) if node.class() == class => {}
                _ => return Err(HsmError::UnknownHandle(root)),
            }
            if !same_gate(&gate, &reg.gate_of(root)) {
                // a key store was attached or detached meanwhile
                continue;
            }
            reg.remove_subtree(root);
            return Ok(());
        }
    }

    // --- Key store attachment ---

    pub fn open_key_store(&self, session: Handle, args: &OpenKeyStoreArgs) -> HsmResult<OpenedKeyStore> {
        if let Some(message) = &args.signed_message {
            return self.reprovision(session, message);
        }
        let mut reg = self.registry.lock();
        if reg.reprovisioning {
            return Err(HsmError::CmdNotSupported("re-provisioning in progress".into()));
        }
        let node = reg.session(session)?;
        if node.mode.contains(SessionMode::NO_KEY_STORE) {
            return Err(HsmError::CmdNotSupported(
                "session was opened without key store".into(),
            ));
        }
        if node.key_store.is_some() {
            return Err(HsmError::CmdNotSupported(
                "session already holds a key store".into(),
            ));
        }

        let presented = credential(args.id, args.nonce);
        let live = reg.live_stores.get(&args.id).cloned();
        let attached = || HsmError::IdConflict(format!("key store {} is already attached", args.id));
        let capacity = self.config.group_cache_capacity;
        let store = match (args.create, self.nvm.read_store(args.id)?) {
            (true, Some(header)) => {
                let identical = credential_matches(&header.credential, &presented)
                    && header.max_updates == args.max_updates;
                return Err(if identical && live.is_none() {
                    HsmError::KeyStoreConflict(args.id)
                } else if identical {
                    attached()
                } else {
                    HsmError::IdConflict(format!(
                        "key store {} exists with other attributes",
                        args.id
                    ))
                });
            }
            (true, None) => {
                if live.is_some() {
                    return Err(attached());
                }
                KeyStore::create(args.id, presented, args.max_updates, capacity, self.nvm.clone())
            }
            (false, Some(header)) => {
                if !credential_matches(&header.credential, &presented) {
                    warn!("Key store {} authentication failed", args.id);
                    return Err(HsmError::KeyStoreAuth);
                }
                if live.is_some() {
                    return Err(attached());
                }
                KeyStore::load(header, capacity, self.nvm.clone())?
            }
            (false, None) => {
                return Err(match live {
                    Some(gate) if gate.matches_credential(&presented) => attached(),
                    Some(_) => HsmError::KeyStoreAuth,
                    None => HsmError::UnknownKeyStore(args.id),
                })
            }
        };

        let id = store.id();
        let gate = Arc::new(StoreGate::new(store));
        let handle = reg.insert(Node::KeyStore(KeyStoreNode {
            session,
            gate: gate.clone(),
            children: Vec::new(),
        }))?;
        reg.live_stores.insert(id, gate);
        if let Some(Node::Session(node)) = reg.nodes.get_mut(session) {
            node.key_store = Some(handle);
        }
        info!(
            "{} key store {} as {} (session {})",
            if args.create { "Created" } else { "Attached" },
            id,
            handle,
            session
        );
        Ok(OpenedKeyStore::Attached(handle))
    }

    fn reprovision(&self, session: Handle, message: &[u8]) -> HsmResult<OpenedKeyStore> {
        {
            let reg = self.registry.lock();
            if reg.session(session)?.mode.contains(SessionMode::NO_KEY_STORE) {
                return Err(HsmError::CmdNotSupported(
                    "session was opened without key store".into(),
                ));
            }
        }
        if !self.authorizer.authorize(AuthPurpose::Reprovision, message) {
            warn!("Rejected re-provisioning message");
            return Err(HsmError::KeyStoreAuth);
        }
        let _guard = ReprovisionGuard::enter(&self.registry)?;
        let attached = self.registry.lock().handles_of(NodeClass::KeyStore);
        for handle in attached {
            match self.close_node(handle, NodeClass::KeyStore) {
                Ok(()) | Err(HsmError::UnknownHandle(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.nvm.erase_all()?;
        warn!("Re-provisioned: every key store erased");
        Ok(OpenedKeyStore::Reprovisioned)
    }

    /// Detach a key store without flushing; uncommitted changes are lost
    pub fn close_key_store(&self, key_store: Handle) -> HsmResult<()> {
        self.close_node(key_store, NodeClass::KeyStore)
    }

    pub fn key_store_status(&self, key_store: Handle) -> HsmResult<KeyStoreStatus> {
        self.key_store_op(key_store, |_, store| Ok(store.status()))
    }

    // --- Service flows ---

    /// Open a service flow of `kind` under a session or key store handle
    pub fn open_service(&self, parent: Handle, kind: FlowKind) -> HsmResult<Handle> {
        if let Some(feature) = kind.required_feature() {
            self.config.capabilities.require_feature(feature)?;
        }
        let mut reg = self.registry.lock();
        let (session, mode, gate) = match (kind.parent(), reg.nodes.get(parent)) {
            (ParentKind::Session, Some(Node::Session(node))) => (parent, node.mode, None),
            (ParentKind::KeyStore, Some(Node::KeyStore(node))) => {
                let mode = reg.session(node.session)?.mode;
                (node.session, mode, Some(node.gate.clone()))
            }
            _ => return Err(HsmError::UnknownHandle(parent)),
        };
        if kind == FlowKind::Sm2Eces {
            self.config.require_fips_allowed(mode, false, "SM2 ECES")?;
        }
        let handle = reg.insert(Node::Flow(FlowNode {
            kind,
            parent,
            session,
            gate,
            state: kind.initial_state(),
        }))?;
        match reg.nodes.get_mut(parent) {
            Some(Node::Session(node)) => node.children.push(handle),
            Some(Node::KeyStore(node)) => node.children.push(handle),
            _ => {}
        }
        debug!("Opened {:?} flow {} under {}", kind, handle, parent);
        Ok(handle)
    }

    pub fn close_service(&self, flow: Handle) -> HsmResult<()> {
        self.close_node(flow, NodeClass::Flow)
    }

    // --- Call plumbing shared by the flow modules ---

    pub(crate) fn flow_access(&self, handle: Handle, kinds: &[FlowKind]) -> HsmResult<Access> {
        let reg = self.registry.lock();
        match reg.nodes.get(handle) {
            Some(Node::Flow(flow)) if kinds.contains(&flow.kind) => Ok(Access {
                mode: reg.session(flow.session)?.mode,
                gate: flow.gate.clone(),
            }),
            _ => Err(HsmError::UnknownHandle(handle)),
        }
    }

    pub(crate) fn session_access(&self, session: Handle) -> HsmResult<Access> {
        let reg = self.registry.lock();
        let mode = reg.session(session)?.mode;
        Ok(Access {
            mode,
            gate: reg.gate_of(session),
        })
    }

    fn key_store_access(&self, key_store: Handle) -> HsmResult<Access> {
        let reg = self.registry.lock();
        match reg.nodes.get(key_store) {
            Some(Node::KeyStore(node)) => Ok(Access {
                mode: reg.session(node.session)?.mode,
                gate: Some(node.gate.clone()),
            }),
            _ => Err(HsmError::UnknownHandle(key_store)),
        }
    }

    /// Run `op` with the store gate held, after re-checking `handle`
    fn with_gate<T>(
        &self,
        handle: Handle,
        access: Access,
        op: impl FnOnce(SessionMode, &mut KeyStore) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let gate = access.gate.ok_or(HsmError::UnknownHandle(handle))?;
        let mut store = gate.lock();
        if !self.registry.lock().nodes.contains(handle) {
            return Err(HsmError::UnknownHandle(handle));
        }
        op(access.mode, &mut store)
    }

    /// Serialized operation on the store owning a flow
    pub(crate) fn store_op<T>(
        &self,
        flow: Handle,
        kinds: &[FlowKind],
        op: impl FnOnce(SessionMode, &mut KeyStore) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let access = self.flow_access(flow, kinds)?;
        self.with_gate(flow, access, op)
    }

    /// Serialized operation addressed by the key store handle itself
    pub(crate) fn key_store_op<T>(
        &self,
        key_store: Handle,
        op: impl FnOnce(SessionMode, &mut KeyStore) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let access = self.key_store_access(key_store)?;
        self.with_gate(key_store, access, op)
    }

    /// Mutate the flow-local state of an open flow
    pub(crate) fn with_flow_state<T>(
        &self,
        flow: Handle,
        op: impl FnOnce(&mut FlowState) -> HsmResult<T>,
    ) -> HsmResult<T> {
        let mut reg = self.registry.lock();
        match reg.nodes.get_mut(flow) {
            Some(Node::Flow(node)) => op(&mut node.state),
            _ => Err(HsmError::UnknownHandle(flow)),
        }
    }
}
