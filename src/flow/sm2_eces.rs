//! SM2 ECES decryption flow

use crate::algo::KeyType;
use crate::error::{HsmError, HsmResult};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::KeyUsage;

/// `0x04 || C1` plus the 32 byte C3 hash
pub const SM2_ECES_OVERHEAD: usize = 97;

impl Hsm {
    pub fn sm2_eces_decrypt(&self, flow: Handle, key_id: u32, input: &[u8]) -> HsmResult<Vec<u8>> {
        if input.len() <= SM2_ECES_OVERHEAD {
            return Err(HsmError::InvalidParam(format!(
                "SM2 ECES ciphertext must exceed {} bytes",
                SM2_ECES_OVERHEAD
            )));
        }
        self.store_op(flow, &[FlowKind::Sm2Eces], |mode, store| {
            self.config().require_fips_allowed(mode, false, "SM2 ECES")?;
            let key = store.key_for(key_id, KeyUsage::Decrypt)?;
            if key.key_type != KeyType::DsaSm2Fp256 {
                return Err(HsmError::InvalidParam(format!(
                    "SM2 ECES cannot use {:?} key {:#x}",
                    key.key_type, key.id
                )));
            }
            Ok(self.engine().sm2_eces_decrypt(key.secret(), input)?)
        })
    }
}
