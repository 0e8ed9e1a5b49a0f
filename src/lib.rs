//! HSM Flows: secure-element command provider
//!
//! Sessions own key stores, key stores own service flows. Keys live in groups that
//! are cached in memory and committed to NVM under a monotonic anti-rollback counter.
//! Crypto primitives run in an injected `CryptoEngine`.

pub mod algo;
pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod flags;
pub mod flow;
pub mod handle;
pub mod hsm;
pub mod keystore;
pub mod nvm;
pub mod session;

pub use config::{CapabilityTable, Feature, HsmConfig};
pub use engine::{CryptoEngine, SimulatedEngine};
pub use error::{HsmError, HsmResult};
pub use flow::FlowKind;
pub use handle::Handle;
pub use hsm::{Hsm, HsmInfo, OpenKeyStoreArgs, OpenedKeyStore};
pub use keystore::{CommitStatus, KeyStoreStatus};
pub use nvm::{FileNvm, InMemoryNvm, NvmStore};
pub use session::{Priority, SessionConfig};
