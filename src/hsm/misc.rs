//! Session scoped operations that need no key store
//!
//! Public key reconstruction and decompression, ECIES and SM2 ECES encryption to a
//! public key, SM2 Z computation, root KEK export and the chip information query.

use super::Hsm;
use crate::algo::KeyType;
use crate::auth::AuthPurpose;
use crate::config::Feature;
use crate::engine::Secret;
use crate::error::{HsmError, HsmResult};
use crate::flags::{FipsMode, RootKek};
use crate::flow::cipher::{check_ecies_geometry, ECIES_PLAINTEXT_SIZE};
use crate::handle::Handle;
use log::{info, warn};
use serde::{Deserialize, Serialize};

/// Longest SM2 identifier whose bit length fits ENTL
pub const SM2_MAX_ID_SIZE: usize = (u16::MAX / 8) as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyReconstructionArgs {
    pub key_type: KeyType,
    pub public_reconstruction: Vec<u8>,
    /// Certificate hash, one coordinate long
    pub hash: Vec<u8>,
    pub ca_key: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EciesEncryptArgs {
    pub key_type: KeyType,
    pub public_key: Vec<u8>,
    pub input: Vec<u8>,
    pub p1: Vec<u8>,
    pub p2: Vec<u8>,
    pub mac_size: usize,
}

/// Answer of `get_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmInfo {
    pub user_sab_id: u32,
    pub chip_unique_id: u64,
    pub chip_monotonic_counter: u16,
    pub chip_life_cycle: u16,
    pub version: u32,
    pub version_ext: u32,
    pub fips_mode: FipsMode,
    /// Counter of the key store attached to the session, if any
    pub key_store_counter: Option<u16>,
}

fn require_public_key(key_type: KeyType, public: &[u8]) -> HsmResult<()> {
    if key_type.public_key_size() == Some(public.len()) {
        Ok(())
    } else {
        Err(HsmError::InvalidParam(format!(
            "{:?} public keys are {} bytes",
            key_type,
            key_type.public_key_size().unwrap_or(0)
        )))
    }
}

impl Hsm {
    pub fn get_info(&self, session: Handle) -> HsmResult<HsmInfo> {
        let access = self.session_access(session)?;
        let key_store_counter = access.gate.map(|gate| gate.lock().counter());
        let identity = &self.config().identity;
        Ok(HsmInfo {
            user_sab_id: identity.user_sab_id,
            chip_unique_id: identity.chip_unique_id,
            chip_monotonic_counter: self.chip_counter(),
            chip_life_cycle: identity.chip_life_cycle,
            version: identity.version,
            version_ext: identity.version_ext,
            fips_mode: self.config().fips_mode,
            key_store_counter,
        })
    }

    /// Derive a public key from an implicit certificate
    pub fn public_key_reconstruction(
        &self,
        session: Handle,
        args: &PublicKeyReconstructionArgs,
    ) -> HsmResult<Vec<u8>> {
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::PublicKeyReconstruction)?;
        caps.require_ecies_key_type(args.key_type)?;
        let access = self.session_access(session)?;
        self.config()
            .require_fips_allowed(access.mode, false, "public key reconstruction")?;
        require_public_key(args.key_type, &args.public_reconstruction)?;
        require_public_key(args.key_type, &args.ca_key)?;
        if args.key_type.coordinate_size() != Some(args.hash.len()) {
            return Err(HsmError::param("certificate hash size"));
        }
        Ok(self.engine().reconstruct_public_key(
            args.key_type,
            &args.public_reconstruction,
            &args.hash,
            &args.ca_key,
        )?)
    }

    /// Expand `x || lsb(y)` into an uncompressed public key
    pub fn public_key_decompression(
        &self,
        session: Handle,
        key_type: KeyType,
        compressed: &[u8],
    ) -> HsmResult<Vec<u8>> {
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::PublicKeyDecompression)?;
        caps.require_ecies_key_type(key_type)?;
        let access = self.session_access(session)?;
        self.config()
            .require_fips_allowed(access.mode, false, "public key decompression")?;
        let coordinate = key_type.coordinate_size().unwrap_or(0);
        if compressed.len() != coordinate + 1 {
            return Err(HsmError::param("compressed key size"));
        }
        Ok(self.engine().decompress_public_key(key_type, compressed)?)
    }

    pub fn ecies_encrypt(&self, session: Handle, args: &EciesEncryptArgs) -> HsmResult<Vec<u8>> {
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::Ecies)?;
        caps.require_ecies_key_type(args.key_type)?;
        let access = self.session_access(session)?;
        self.config().require_fips_allowed(access.mode, false, "ECIES")?;
        check_ecies_geometry(&args.p1, &args.p2, args.mac_size)?;
        require_public_key(args.key_type, &args.public_key)?;
        if args.input.len() != ECIES_PLAINTEXT_SIZE {
            return Err(HsmError::InvalidParam(format!(
                "ECIES encrypts {} bytes",
                ECIES_PLAINTEXT_SIZE
            )));
        }
        Ok(self.engine().ecies_encrypt(
            args.key_type,
            &args.public_key,
            &args.input,
            &args.p1,
            &args.p2,
            args.mac_size,
        )?)
    }

    fn require_sm2(&self, session: Handle, feature: Feature, what: &str) -> HsmResult<()> {
        let caps = &self.config().capabilities;
        caps.require_feature(feature)?;
        caps.require_key_type(KeyType::DsaSm2Fp256)?;
        let access = self.session_access(session)?;
        self.config().require_fips_allowed(access.mode, false, what)
    }

    /// Encrypt to an SM2 public key, output `C1 || C2 || C3`
    pub fn sm2_eces_encrypt(&self, session: Handle, public_key: &[u8], input: &[u8]) -> HsmResult<Vec<u8>> {
        self.require_sm2(session, Feature::Sm2Eces, "SM2 ECES")?;
        require_public_key(KeyType::DsaSm2Fp256, public_key)?;
        if input.is_empty() {
            return Err(HsmError::param("empty SM2 ECES plaintext"));
        }
        Ok(self.engine().sm2_eces_encrypt(public_key, input)?)
    }

    /// Z value of an SM2 signer: SM3(ENTL || ID || curve parameters || public key)
    pub fn sm2_get_z(&self, session: Handle, public_key: &[u8], identifier: &[u8]) -> HsmResult<Vec<u8>> {
        self.require_sm2(session, Feature::Sm2GetZ, "SM2 Z computation")?;
        require_public_key(KeyType::DsaSm2Fp256, public_key)?;
        if identifier.len() > SM2_MAX_ID_SIZE {
            return Err(HsmError::param("SM2 identifier too long"));
        }
        Ok(self.engine().sm2_get_z(public_key, identifier)?)
    }

    /// Release a root key encryption key to a caller holding a signed authorization
    pub fn export_root_kek(
        &self,
        session: Handle,
        signed_message: &[u8],
        which: RootKek,
    ) -> HsmResult<Secret> {
        self.config()
            .capabilities
            .require_feature(Feature::ExportRootKek)?;
        self.session_access(session)?;
        let purpose = AuthPurpose::ExportRootKek {
            common: which == RootKek::Common,
        };
        if !self.authorizer().authorize(purpose, signed_message) {
            warn!("Refused {:?} root KEK export on {}", which, session);
            return Err(HsmError::KeyStoreAuth);
        }
        info!("Exported {:?} root KEK on {}", which, session);
        Ok(self.engine().root_kek(which)?)
    }
}
