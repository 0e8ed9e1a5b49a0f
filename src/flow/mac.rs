//! MAC flow: one-go CMAC / HMAC generation and verification

use crate::algo::{MacAlgo, MIN_MAC_SIZE};
use crate::error::{HsmError, HsmResult};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::KeyUsage;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

const MAC: &[FlowKind] = &[FlowKind::Mac];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacMode {
    /// Produce a tag truncated to `mac_size` bytes
    Generate { mac_size: usize },
    Verify { mac: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacArgs {
    pub key_id: u32,
    pub algo: MacAlgo,
    pub payload: Vec<u8>,
    pub mode: MacMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MacStatus {
    Success,
    Failure,
}

impl MacStatus {
    pub const SUCCESS_VALUE: u32 = 0x6C1A_A1C6;

    pub fn value(&self) -> u32 {
        match self {
            MacStatus::Success => Self::SUCCESS_VALUE,
            MacStatus::Failure => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacOutcome {
    Tag(Vec<u8>),
    Verified(MacStatus),
}

fn check_mac_size(algo: MacAlgo, size: usize) -> HsmResult<()> {
    if (MIN_MAC_SIZE..=algo.max_mac_size()).contains(&size) {
        Ok(())
    } else {
        Err(HsmError::InvalidParam(format!(
            "{:?} tags are {}..={} bytes",
            algo,
            MIN_MAC_SIZE,
            algo.max_mac_size()
        )))
    }
}

impl Hsm {
    pub fn mac_one_go(&self, flow: Handle, args: &MacArgs) -> HsmResult<MacOutcome> {
        self.config().capabilities.require_mac(args.algo)?;
        let size = match &args.mode {
            MacMode::Generate { mac_size } => *mac_size,
            MacMode::Verify { mac } => mac.len(),
        };
        check_mac_size(args.algo, size)?;
        self.store_op(flow, MAC, |_, store| {
            let key = store.key_for(args.key_id, KeyUsage::Mac)?;
            if !args.algo.accepts_key(key.key_type) {
                return Err(HsmError::InvalidParam(format!(
                    "{:?} cannot use {:?} key {:#x}",
                    args.algo, key.key_type, key.id
                )));
            }
            let mut tag = self.engine().mac(args.algo, key.secret(), &args.payload)?;
            tag.truncate(size);
            Ok(match &args.mode {
                MacMode::Generate { .. } => MacOutcome::Tag(tag),
                MacMode::Verify { mac } => MacOutcome::Verified(if bool::from(tag.ct_eq(mac)) {
                    MacStatus::Success
                } else {
                    MacStatus::Failure
                }),
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::KeyType;
    use crate::flags::KeyInfo;
    use crate::flow::GenerateKeyArgs;
    use crate::hsm::testing::*;

    fn setup(key_type: KeyType) -> (Hsm, Handle, u32) {
        let (hsm, _) = hsm();
        let (_, ks) = key_store(&hsm, 7, 42, 10);
        let km = hsm.open_service(ks, FlowKind::KeyManagement).unwrap();
        let key_id = hsm
            .generate_key(km, &GenerateKeyArgs::create(key_type, 1, KeyInfo::empty()))
            .unwrap()
            .key_id;
        let mac = hsm.open_service(ks, FlowKind::Mac).unwrap();
        (hsm, mac, key_id)
    }

    fn args(key_id: u32, algo: MacAlgo, mode: MacMode) -> MacArgs {
        MacArgs {
            key_id,
            algo,
            payload: b"telemetry frame".to_vec(),
            mode,
        }
    }

    #[test]
    fn test_hmac_generate_then_verify() {
        let (hsm, flow, key) = setup(KeyType::Hmac256);
        let tag = match hsm
            .mac_one_go(flow, &args(key, MacAlgo::HmacSha256, MacMode::Generate { mac_size: 20 }))
            .unwrap()
        {
            MacOutcome::Tag(tag) => tag,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(tag.len(), 20);

        let ok = hsm
            .mac_one_go(flow, &args(key, MacAlgo::HmacSha256, MacMode::Verify { mac: tag.clone() }))
            .unwrap();
        assert_eq!(ok, MacOutcome::Verified(MacStatus::Success));
        let mut bad = tag;
        bad[0] ^= 1;
        let status = hsm
            .mac_one_go(flow, &args(key, MacAlgo::HmacSha256, MacMode::Verify { mac: bad }))
            .unwrap();
        assert_eq!(status, MacOutcome::Verified(MacStatus::Failure));
    }

    #[test]
    fn test_tag_size_bounds() {
        let (hsm, flow, key) = setup(KeyType::Aes128);
        for size in [3, 17] {
            assert!(matches!(
                hsm.mac_one_go(flow, &args(key, MacAlgo::AesCmac, MacMode::Generate { mac_size: size })),
                Err(HsmError::InvalidParam(_))
            ));
        }
        assert!(hsm
            .mac_one_go(flow, &args(key, MacAlgo::AesCmac, MacMode::Generate { mac_size: 16 }))
            .is_ok());
        assert!(matches!(
            hsm.mac_one_go(flow, &args(key, MacAlgo::HmacSha256, MacMode::Generate { mac_size: 32 })),
            Err(HsmError::InvalidParam(_))
        ));
    }
}
