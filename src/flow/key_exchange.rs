//! Key exchange: ECDH / SM2 agreement followed by a KDF that stores the derived keys
//!
//! The derived keys go through the same write pipeline as generated keys, so the
//! identifier, group and commit rules are those of `generate_key`.

use crate::algo::{KdfAlgo, KeyExchangeScheme, KeyType, TLS_KDF_INPUT_SIZE};
use crate::config::Feature;
use crate::engine::KeyMaterial;
use crate::error::{HsmError, HsmResult};
use crate::flags::{KeyExchangeFlags, KeyInfo};
use crate::flow::FlowKind;
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::{CommitStatus, KeyUsage, KeyWrite};
use log::debug;
use serde::{Deserialize, Serialize};

const KEY_EXCHANGE: &[FlowKind] = &[FlowKind::KeyManagement, FlowKind::KeyExchange];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeArgs {
    /// Stored private key, 0 with `USE_EPHEMERAL`
    pub key_id: u32,
    pub scheme: KeyExchangeScheme,
    pub kdf: KdfAlgo,
    pub peer_public: Vec<u8>,
    pub kdf_input: Vec<u8>,
    /// Output key type for KDFs that do not fix it
    pub derived_key_type: KeyType,
    /// One identifier per derived key; empty lets the HSM assign them all
    pub derived_key_ids: Vec<u32>,
    pub group: u16,
    pub info: KeyInfo,
    pub flags: KeyExchangeFlags,
}

impl KeyExchangeArgs {
    pub fn create(scheme: KeyExchangeScheme, kdf: KdfAlgo, peer_public: Vec<u8>, group: u16) -> Self {
        Self {
            key_id: 0,
            scheme,
            kdf,
            peer_public,
            kdf_input: Vec::new(),
            derived_key_type: KeyType::Aes256,
            derived_key_ids: Vec::new(),
            group,
            info: KeyInfo::empty(),
            flags: KeyExchangeFlags::CREATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyExchangeOutcome {
    pub key_ids: Vec<u32>,
    /// Client and server write IVs for TLS KDFs, empty otherwise
    pub iv_output: Vec<u8>,
    /// Public half of the ephemeral key when one was used
    pub ephemeral_public: Option<Vec<u8>>,
    pub status: CommitStatus,
}

fn derived_info(args: &KeyExchangeArgs) -> HsmResult<KeyInfo> {
    if args.kdf == KdfAlgo::AesCmac256Counter {
        return Ok(args.info | KeyInfo::KEK);
    }
    if args.info.contains(KeyInfo::KEK) {
        return Err(HsmError::param("only the CMAC counter KDF derives KEKs"));
    }
    Ok(args.info)
}

fn check_kdf_input(args: &KeyExchangeArgs) -> HsmResult<()> {
    if args.kdf.is_tls() && args.kdf_input.len() != TLS_KDF_INPUT_SIZE {
        return Err(HsmError::InvalidParam(format!(
            "TLS KDF input is {} bytes",
            TLS_KDF_INPUT_SIZE
        )));
    }
    if args.kdf == KdfAlgo::ForSm2 && args.derived_key_type.is_asymmetric() {
        return Err(HsmError::param("SM2 KDF derives symmetric keys"));
    }
    Ok(())
}

impl Hsm {
    pub fn key_exchange(&self, flow: Handle, args: &KeyExchangeArgs) -> HsmResult<KeyExchangeOutcome> {
        let mode = args.flags.mode()?;
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::KeyExchange)?;
        caps.require_key_exchange(args.scheme)?;
        caps.require_kdf(args.kdf)?;
        if !args.scheme.accepts_kdf(args.kdf) {
            return Err(HsmError::InvalidParam(format!(
                "{:?} cannot be followed by {:?}",
                args.scheme, args.kdf
            )));
        }
        check_kdf_input(args)?;
        let ephemeral = args.flags.contains(KeyExchangeFlags::USE_EPHEMERAL);
        if ephemeral && args.key_id != 0 {
            return Err(HsmError::param("ephemeral key exchange takes no key identifier"));
        }
        let curve = args.scheme.key_type();
        if curve.public_key_size() != Some(args.peer_public.len()) {
            return Err(HsmError::param("peer public key size"));
        }
        let info = derived_info(args)?;
        let outputs = args.kdf.derived_key_types(args.derived_key_type);
        let ids = if args.derived_key_ids.is_empty() {
            vec![0; outputs.len()]
        } else if args.derived_key_ids.len() == outputs.len() {
            args.derived_key_ids.clone()
        } else {
            return Err(HsmError::InvalidParam(format!(
                "{:?} derives {} keys",
                args.kdf,
                outputs.len()
            )));
        };

        let outcome = self.store_op(flow, KEY_EXCHANGE, |session_mode, store| {
            self.config().require_fips_allowed(
                session_mode,
                curve.is_fips_approved(),
                "SM2 key exchange",
            )?;
            let writes: Vec<KeyWrite> = ids
                .iter()
                .zip(&outputs)
                .map(|(id, key_type)| KeyWrite::new(mode, *id, *key_type, info))
                .collect();
            let plan = store.plan_write(args.group, &writes)?;
            let key_ids = plan.ids();

            let (shared, ephemeral_public) = if ephemeral {
                let own = self.engine().generate_key(curve)?;
                let shared = self
                    .engine()
                    .key_agreement(args.scheme, &own.secret, &args.peer_public)?;
                (shared, own.public)
            } else {
                let key = store.key_for(args.key_id, KeyUsage::Agreement)?;
                if key.key_type != curve {
                    return Err(HsmError::InvalidParam(format!(
                        "{:?} cannot use {:?} key {:#x}",
                        args.scheme, key.key_type, key.id
                    )));
                }
                let shared = self
                    .engine()
                    .key_agreement(args.scheme, key.secret(), &args.peer_public)?;
                (shared, None)
            };
            let derived = self
                .engine()
                .derive_keys(args.kdf, &shared, &args.kdf_input, &outputs)?;
            let materials = derived
                .keys
                .into_iter()
                .map(|secret| KeyMaterial {
                    secret,
                    public: None,
                })
                .collect();
            let status = store.apply_write(plan, materials, args.flags.strict())?;
            Ok(KeyExchangeOutcome {
                key_ids,
                iv_output: derived.iv_output,
                ephemeral_public,
                status,
            })
        })?;
        self.record_commit(outcome.status);
        debug!(
            "{:?} / {:?} derived keys {:?}",
            args.scheme, args.kdf, outcome.key_ids
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::{CipherAlgo, TLS_KDF_OUTPUT_SIZE};
    use crate::engine::Direction;
    use crate::flow::{CipherArgs, GenerateKeyArgs};
    use crate::hsm::testing::*;

    const SCHEME: KeyExchangeScheme = KeyExchangeScheme::EcdhNistP256;
    const TLS: KdfAlgo = KdfAlgo::HmacSha256Tls0_32_4;

    fn encrypt(hsm: &Hsm, ks: Handle, key_id: u32, direction: Direction, input: Vec<u8>) -> Vec<u8> {
        let flow = hsm.open_service(ks, FlowKind::Cipher).unwrap();
        let out = hsm
            .cipher_one_go(
                flow,
                &CipherArgs {
                    key_id,
                    algo: CipherAlgo::AesEcb,
                    direction,
                    iv: Vec::new(),
                    input,
                },
            )
            .unwrap();
        hsm.close_service(flow).unwrap();
        out
    }

    #[test]
    fn test_both_sides_derive_the_same_keys() {
        let (hsm, _) = hsm();
        let (_, server_ks) = key_store(&hsm, 1, 11, 10);
        let (_, client_ks) = key_store(&hsm, 2, 22, 10);

        let km = hsm.open_service(server_ks, FlowKind::KeyManagement).unwrap();
        let server = hsm
            .generate_key(km, &GenerateKeyArgs::create(KeyType::EcdsaNistP256, 1, KeyInfo::empty()))
            .unwrap();

        let client_flow = hsm.open_service(client_ks, FlowKind::KeyExchange).unwrap();
        let mut args = KeyExchangeArgs::create(SCHEME, TLS, server.public_key.clone().unwrap(), 3);
        args.kdf_input = vec![0x5A; TLS_KDF_INPUT_SIZE];
        args.flags |= KeyExchangeFlags::USE_EPHEMERAL;
        let client = hsm.key_exchange(client_flow, &args).unwrap();
        assert_eq!(client.key_ids.len(), 2);
        assert_eq!(client.iv_output.len(), TLS_KDF_OUTPUT_SIZE);

        let mut args = KeyExchangeArgs::create(SCHEME, TLS, client.ephemeral_public.clone().unwrap(), 3);
        args.key_id = server.key_id;
        args.kdf_input = vec![0x5A; TLS_KDF_INPUT_SIZE];
        let derived = hsm.key_exchange(km, &args).unwrap();
        assert_eq!(derived.iv_output, client.iv_output);
        assert_eq!(derived.ephemeral_public, None);

        let block = b"tls record block".to_vec();
        let sealed = encrypt(&hsm, client_ks, client.key_ids[0], Direction::Encrypt, block.clone());
        assert_eq!(
            encrypt(&hsm, server_ks, derived.key_ids[0], Direction::Decrypt, sealed),
            block
        );
    }

    #[test]
    fn test_argument_rules() {
        let (hsm, _) = hsm();
        let (_, ks) = key_store(&hsm, 1, 11, 10);
        let flow = hsm.open_service(ks, FlowKind::KeyExchange).unwrap();
        let peer = vec![7; 64];

        let mut args = KeyExchangeArgs::create(SCHEME, TLS, peer.clone(), 1);
        args.flags |= KeyExchangeFlags::USE_EPHEMERAL;
        args.kdf_input = vec![0; 64];
        assert!(matches!(hsm.key_exchange(flow, &args), Err(HsmError::InvalidParam(_))));

        args.kdf_input = vec![0; TLS_KDF_INPUT_SIZE];
        args.key_id = 5;
        assert!(matches!(hsm.key_exchange(flow, &args), Err(HsmError::InvalidParam(_))));

        let sm2_kdf = KeyExchangeArgs::create(SCHEME, KdfAlgo::ForSm2, peer.clone(), 1);
        assert!(matches!(hsm.key_exchange(flow, &sm2_kdf), Err(HsmError::InvalidParam(_))));

        let mut kek = KeyExchangeArgs::create(SCHEME, TLS, peer, 1);
        kek.kdf_input = vec![0; TLS_KDF_INPUT_SIZE];
        kek.flags |= KeyExchangeFlags::USE_EPHEMERAL;
        kek.info = KeyInfo::KEK;
        assert!(matches!(hsm.key_exchange(flow, &kek), Err(HsmError::InvalidParam(_))));

        let missing = KeyExchangeArgs {
            key_id: 0x99,
            info: KeyInfo::empty(),
            flags: KeyExchangeFlags::CREATE,
            ..kek
        };
        assert_eq!(hsm.key_exchange(flow, &missing).map(|o| o.key_ids), Err(HsmError::UnknownId(0x99)));
    }

    #[test]
    fn test_cmac_kdf_derives_a_kek() {
        let (hsm, _) = hsm();
        let (_, ks) = key_store(&hsm, 1, 11, 10);
        let flow = hsm.open_service(ks, FlowKind::KeyExchange).unwrap();
        let mut args = KeyExchangeArgs::create(SCHEME, KdfAlgo::AesCmac256Counter, vec![7; 64], 1);
        args.flags |= KeyExchangeFlags::USE_EPHEMERAL;
        let outcome = hsm.key_exchange(flow, &args).unwrap();
        assert_eq!(outcome.key_ids.len(), 1);

        let wrapped = encrypt_attempt(&hsm, ks, outcome.key_ids[0]);
        assert!(matches!(wrapped, Err(HsmError::InvalidLifecycle(_))));
    }

    fn encrypt_attempt(hsm: &Hsm, ks: Handle, key_id: u32) -> HsmResult<Vec<u8>> {
        let flow = hsm.open_service(ks, FlowKind::Cipher).unwrap();
        hsm.cipher_one_go(
            flow,
            &CipherArgs {
                key_id,
                algo: CipherAlgo::AesEcb,
                direction: Direction::Encrypt,
                iv: Vec::new(),
                input: vec![0; 16],
            },
        )
    }
}
