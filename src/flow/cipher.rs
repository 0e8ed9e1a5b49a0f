//! Cipher flow: one-go block ciphers, AES-GCM and ECIES decryption

use crate::algo::{AuthEncAlgo, CipherAlgo, KeyType, AEAD_IV_SIZE, AEAD_TAG_SIZE, BLOCK_SIZE};
use crate::config::Feature;
use crate::engine::Direction;
use crate::error::{HsmError, HsmResult};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::{Key, KeyUsage};

const CIPHER: &[FlowKind] = &[FlowKind::Cipher];

/// ECIES message geometry accepted by the enclave
pub const ECIES_PLAINTEXT_SIZE: usize = 16;
pub const ECIES_P1_SIZE: usize = 32;
pub const ECIES_MAC_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherArgs {
    pub key_id: u32,
    pub algo: CipherAlgo,
    pub direction: Direction,
    /// Empty for ECB
    pub iv: Vec<u8>,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEncArgs {
    pub key_id: u32,
    pub algo: AuthEncAlgo,
    pub direction: Direction,
    pub iv: Vec<u8>,
    pub aad: Vec<u8>,
    /// Plaintext, or ciphertext with the tag appended
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EciesDecryptArgs {
    pub key_id: u32,
    pub key_type: KeyType,
    pub input: Vec<u8>,
    pub p1: Vec<u8>,
    pub p2: Vec<u8>,
    pub mac_size: usize,
}

/// Total ECIES ciphertext length for `key_type`
pub(crate) fn ecies_ciphertext_size(key_type: KeyType) -> Option<usize> {
    key_type
        .public_key_size()
        .map(|point| point + ECIES_PLAINTEXT_SIZE + ECIES_MAC_SIZE)
}

pub(crate) fn check_ecies_geometry(p1: &[u8], p2: &[u8], mac_size: usize) -> HsmResult<()> {
    if p1.len() != ECIES_P1_SIZE || !p2.is_empty() || mac_size != ECIES_MAC_SIZE {
        return Err(HsmError::InvalidParam(format!(
            "ECIES expects P1 of {} bytes, empty P2 and a {} byte MAC",
            ECIES_P1_SIZE, ECIES_MAC_SIZE
        )));
    }
    Ok(())
}

fn check_cipher_sizes(args: &CipherArgs) -> HsmResult<()> {
    if args.iv.len() != args.algo.iv_size() {
        return Err(HsmError::InvalidParam(format!(
            "{:?} takes a {} byte IV",
            args.algo,
            args.algo.iv_size()
        )));
    }
    if args.algo.is_block_mode() {
        if args.input.is_empty() || args.input.len() % BLOCK_SIZE != 0 {
            return Err(HsmError::param("input must be a non-empty multiple of 16 bytes"));
        }
    } else if args.direction == Direction::Decrypt && args.input.len() <= AEAD_TAG_SIZE {
        return Err(HsmError::param("CCM ciphertext shorter than its tag"));
    }
    Ok(())
}

fn require_compatible(key: &Key, accepted: bool, what: &str) -> HsmResult<()> {
    if accepted {
        Ok(())
    } else {
        Err(HsmError::InvalidParam(format!(
            "{} cannot use {:?} key {:#x}",
            what, key.key_type, key.id
        )))
    }
}

impl Hsm {
    pub fn cipher_one_go(&self, flow: Handle, args: &CipherArgs) -> HsmResult<Vec<u8>> {
        self.config().capabilities.require_cipher(args.algo)?;
        check_cipher_sizes(args)?;
        self.store_op(flow, CIPHER, |mode, store| {
            self.config()
                .require_fips_allowed(mode, args.algo.is_fips_approved(), "SM4")?;
            let key = store.key_for(args.key_id, KeyUsage::Cipher)?;
            require_compatible(&key, args.algo.accepts_key(key.key_type), "cipher")?;
            Ok(self.engine().cipher(
                args.algo,
                key.secret(),
                &args.iv,
                &args.input,
                args.direction,
            )?)
        })
    }

    /// Authenticated encryption; a tag mismatch on decrypt is an error
    pub fn auth_enc(&self, flow: Handle, args: &AuthEncArgs) -> HsmResult<Vec<u8>> {
        if args.iv.len() != AEAD_IV_SIZE {
            return Err(HsmError::InvalidParam(format!(
                "GCM takes a {} byte IV",
                AEAD_IV_SIZE
            )));
        }
        if args.direction == Direction::Decrypt && args.input.len() < AEAD_TAG_SIZE {
            return Err(HsmError::param("GCM ciphertext shorter than its tag"));
        }
        self.store_op(flow, CIPHER, |_, store| {
            let key = store.key_for(args.key_id, KeyUsage::Cipher)?;
            require_compatible(&key, key.key_type.is_aes(), "AES-GCM")?;
            Ok(self.engine().auth_enc(
                args.algo,
                key.secret(),
                &args.iv,
                &args.aad,
                &args.input,
                args.direction,
            )?)
        })
    }

    pub fn ecies_decrypt(&self, flow: Handle, args: &EciesDecryptArgs) -> HsmResult<Vec<u8>> {
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::Ecies)?;
        caps.require_ecies_key_type(args.key_type)?;
        check_ecies_geometry(&args.p1, &args.p2, args.mac_size)?;
        if Some(args.input.len()) != ecies_ciphertext_size(args.key_type) {
            return Err(HsmError::param("ECIES ciphertext size"));
        }
        self.store_op(flow, CIPHER, |mode, store| {
            self.config().require_fips_allowed(mode, false, "ECIES")?;
            let key = store.key_for(args.key_id, KeyUsage::Decrypt)?;
            require_compatible(&key, key.key_type == args.key_type, "ECIES")?;
            Ok(self.engine().ecies_decrypt(
                args.key_type,
                key.secret(),
                &args.input,
                &args.p1,
                &args.p2,
                args.mac_size,
            )?)
        })
    }
}
