//! Key management flow: generation, import, deletion, group cache control and
//! butterfly key expansion
//!
//! Every write goes through `KeyStore::plan_write` before any key material is
//! produced, so validation failures never touch the engine or the counter.

use crate::algo::{AuthEncAlgo, KeyType, AEAD_IV_SIZE, AEAD_TAG_SIZE};
use crate::config::Feature;
use crate::engine::{Direction, ImplicitCertificate, KeyMaterial};
use crate::error::{HsmError, HsmResult};
use crate::flags::{
    ButterflyFlags, KeyGenFlags, KeyGroupFlags, KeyGroupOp, KeyInfo, ManageKeyFlags, ManageKeyOp,
};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::{CommitStatus, KeyUsage, KeyWrite};
use log::debug;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const KEY_MANAGEMENT: &[FlowKind] = &[FlowKind::KeyManagement];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateKeyArgs {
    /// On create, 0 lets the HSM assign the identifier
    pub key_id: u32,
    pub key_type: KeyType,
    pub group: u16,
    pub info: KeyInfo,
    pub flags: KeyGenFlags,
}

impl GenerateKeyArgs {
    pub fn create(key_type: KeyType, group: u16, info: KeyInfo) -> Self {
        Self {
            key_id: 0,
            key_type,
            group,
            info,
            flags: KeyGenFlags::CREATE,
        }
    }

    pub fn update(key_id: u32, key_type: KeyType, group: u16, info: KeyInfo) -> Self {
        Self {
            key_id,
            flags: KeyGenFlags::UPDATE,
            ..Self::create(key_type, group, info)
        }
    }
}

/// Import, update or delete of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManageKeyArgs {
    pub key_id: u32,
    /// Stored KEK unwrapping the material, unused with a root KEK flag
    pub kek_id: u32,
    pub key_type: KeyType,
    pub group: u16,
    pub info: KeyInfo,
    pub flags: ManageKeyFlags,
    /// `IV(12) || ciphertext || tag(16)`
    pub wrapped: Vec<u8>,
}

impl ManageKeyArgs {
    pub fn delete(key_id: u32) -> Self {
        Self {
            key_id,
            kek_id: 0,
            key_type: KeyType::Aes256,
            group: 0,
            info: KeyInfo::empty(),
            flags: ManageKeyFlags::DELETE,
            wrapped: Vec::new(),
        }
    }

    pub fn import(key_type: KeyType, group: u16, info: KeyInfo, wrapped: Vec<u8>) -> Self {
        Self {
            key_id: 0,
            kek_id: 0,
            key_type,
            group,
            info,
            flags: ManageKeyFlags::IMPORT_CREATE,
            wrapped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ButterflyArgs {
    /// Master key the expansion starts from
    pub source_key_id: u32,
    pub expansion_value: Vec<u8>,
    /// Implicit certificate hash, empty for explicit certificates
    pub hash: Vec<u8>,
    /// Implicit certificate private reconstruction value
    pub private_reconstruction: Vec<u8>,
    pub dest_key_id: u32,
    pub group: u16,
    pub info: KeyInfo,
    pub flags: ButterflyFlags,
}

/// Result of a key write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyOutcome {
    pub key_id: u32,
    /// Public half of asymmetric keys
    pub public_key: Option<Vec<u8>>,
    pub status: CommitStatus,
}

fn no_kek_grant(info: KeyInfo) -> HsmResult<()> {
    if info.contains(KeyInfo::KEK) {
        Err(HsmError::param("KEK attribute is only granted by key import"))
    } else {
        Ok(())
    }
}

impl Hsm {
    pub fn generate_key(&self, flow: Handle, args: &GenerateKeyArgs) -> HsmResult<KeyOutcome> {
        let mode = args.flags.mode()?;
        self.config().capabilities.require_key_type(args.key_type)?;
        no_kek_grant(args.info)?;
        let outcome = self.store_op(flow, KEY_MANAGEMENT, |session_mode, store| {
            self.config().require_fips_allowed(
                session_mode,
                args.key_type.is_fips_approved(),
                "key type",
            )?;
            let write = KeyWrite::new(mode, args.key_id, args.key_type, args.info);
            let plan = store.plan_write(args.group, &[write])?;
            let key_id = plan.ids()[0];
            let material = self.engine().generate_key(args.key_type)?;
            let public_key = material.public.clone();
            let status = store.apply_write(plan, vec![material], args.flags.strict())?;
            Ok(KeyOutcome {
                key_id,
                public_key,
                status,
            })
        })?;
        self.record_commit(outcome.status);
        debug!(
            "Generated {:?} key {:#x} in group {}",
            args.key_type, outcome.key_id, args.group
        );
        Ok(outcome)
    }

    /// Import (create or update) or delete a key
    pub fn manage_key(&self, flow: Handle, args: &ManageKeyArgs) -> HsmResult<KeyOutcome> {
        let op = args.flags.op()?;
        let strict = args.flags.strict();
        let outcome = match op {
            ManageKeyOp::Delete => self.store_op(flow, KEY_MANAGEMENT, |_, store| {
                let status = store.delete_key(args.key_id, strict)?;
                Ok(KeyOutcome {
                    key_id: args.key_id,
                    public_key: None,
                    status,
                })
            })?,
            ManageKeyOp::Import(mode) => {
                self.config().capabilities.require_key_type(args.key_type)?;
                if args.info.contains(KeyInfo::KEK) && args.key_type != KeyType::Aes256 {
                    return Err(HsmError::param("only AES-256 keys can be KEKs"));
                }
                self.store_op(flow, KEY_MANAGEMENT, |session_mode, store| {
                    self.config().require_fips_allowed(
                        session_mode,
                        args.key_type.is_fips_approved(),
                        "key type",
                    )?;
                    let write = KeyWrite::new(mode, args.key_id, args.key_type, args.info);
                    let plan = store.plan_write(args.group, &[write])?;
                    let key_id = plan.ids()[0];
                    let kek = match args.flags.root_kek() {
                        Some(which) => self.engine().root_kek(which)?,
                        None => Zeroizing::new(
                            store.key_for(args.kek_id, KeyUsage::Unwrap)?.secret().to_vec(),
                        ),
                    };
                    let material = self.unwrap_key(&kek, args.key_type, &args.wrapped)?;
                    let public_key = material.public.clone();
                    let status = store.apply_write(plan, vec![material], strict)?;
                    Ok(KeyOutcome {
                        key_id,
                        public_key,
                        status,
                    })
                })?
            }
        };
        self.record_commit(outcome.status);
        Ok(outcome)
    }

    /// Decrypt and authenticate imported material; failures carry no detail
    fn unwrap_key(&self, kek: &[u8], key_type: KeyType, wrapped: &[u8]) -> HsmResult<KeyMaterial> {
        let failed = || HsmError::KeyStoreError("key import failed".into());
        if wrapped.len() <= AEAD_IV_SIZE + AEAD_TAG_SIZE {
            return Err(failed());
        }
        let (iv, sealed) = wrapped.split_at(AEAD_IV_SIZE);
        let secret = self
            .engine()
            .auth_enc(AuthEncAlgo::AesGcm, kek, iv, &[], sealed, Direction::Decrypt)
            .map(Zeroizing::new)
            .map_err(|_| failed())?;
        if secret.len() != key_type.secret_size() {
            return Err(failed());
        }
        let public = if key_type.is_asymmetric() {
            Some(self.engine().derive_public_key(key_type, &secret)?)
        } else {
            None
        };
        Ok(KeyMaterial { secret, public })
    }

    pub fn manage_key_group(
        &self,
        flow: Handle,
        group: u16,
        flags: KeyGroupFlags,
    ) -> HsmResult<CommitStatus> {
        let op = flags.op()?;
        if op == KeyGroupOp::Delete {
            self.config()
                .capabilities
                .require_feature(Feature::KeyGroupDelete)?;
        }
        let status = self.store_op(flow, KEY_MANAGEMENT, |_, store| {
            store.manage_group(group, op, flags.strict())
        })?;
        self.record_commit(status);
        Ok(status)
    }

    /// Derive a key from a master key and externally supplied expansion scalars
    pub fn butterfly_key_expansion(&self, flow: Handle, args: &ButterflyArgs) -> HsmResult<KeyOutcome> {
        let mode = args.flags.mode()?;
        self.config()
            .capabilities
            .require_feature(Feature::ButterflyKeyExpansion)?;
        no_kek_grant(args.info)?;
        let explicit = args.flags.contains(ButterflyFlags::EXPLICIT_CERTIF);
        let outcome = self.store_op(flow, KEY_MANAGEMENT, |session_mode, store| {
            self.config()
                .require_fips_allowed(session_mode, false, "butterfly key expansion")?;
            let source = store.key_for(args.source_key_id, KeyUsage::Expansion)?;
            self.config()
                .capabilities
                .require_butterfly_key_type(source.key_type)?;
            let scalar = source
                .key_type
                .coordinate_size()
                .ok_or_else(|| HsmError::param("expansion source is not an ECC key"))?;
            if args.expansion_value.len() != scalar {
                return Err(HsmError::InvalidParam(format!(
                    "expansion value must be {} bytes",
                    scalar
                )));
            }
            let implicit = if explicit {
                if !args.hash.is_empty() || !args.private_reconstruction.is_empty() {
                    return Err(HsmError::param(
                        "explicit certificates take no hash or reconstruction value",
                    ));
                }
                None
            } else {
                if args.hash.len() != scalar || args.private_reconstruction.len() != scalar {
                    return Err(HsmError::InvalidParam(format!(
                        "implicit certificates need a {} byte hash and reconstruction value",
                        scalar
                    )));
                }
                Some(ImplicitCertificate {
                    hash: &args.hash,
                    private_reconstruction: &args.private_reconstruction,
                })
            };

            let write = KeyWrite::new(mode, args.dest_key_id, source.key_type, args.info);
            let plan = store.plan_write(args.group, &[write])?;
            let key_id = plan.ids()[0];
            let secret = self.engine().butterfly_expand(
                source.key_type,
                source.secret(),
                &args.expansion_value,
                implicit,
            )?;
            let public = self.engine().derive_public_key(source.key_type, &secret)?;
            let material = KeyMaterial {
                secret,
                public: Some(public.clone()),
            };
            let status = store.apply_write(plan, vec![material], args.flags.strict())?;
            Ok(KeyOutcome {
                key_id,
                public_key: Some(public),
                status,
            })
        })?;
        self.record_commit(outcome.status);
        Ok(outcome)
    }

    /// Public half of a stored private key
    pub fn public_key_recovery(
        &self,
        key_store: Handle,
        key_id: u32,
        key_type: KeyType,
    ) -> HsmResult<Vec<u8>> {
        self.config()
            .capabilities
            .require_feature(Feature::PublicKeyRecovery)?;
        self.key_store_op(key_store, |_, store| {
            let key = store.key_for(key_id, KeyUsage::ExportPublic)?;
            if key.key_type != key_type {
                return Err(HsmError::InvalidParam(format!(
                    "key {:#x} is {:?}",
                    key_id, key.key_type
                )));
            }
            key.public()
                .map(<[u8]>::to_vec)
                .ok_or_else(|| HsmError::param("key has no public part"))
        })
    }
}
