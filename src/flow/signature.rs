//! Signature generation and verification flows
//!
//! Generation keeps one prepared artifact per scheme; a low latency signature consumes
//! it. Verification reports its verdict as a status value, a bad signature is not a
//! call failure.

use crate::algo::{KeyType, SignatureScheme};
use crate::config::Feature;
use crate::error::{HsmError, HsmResult};
use crate::flags::{SignFlags, VerifyFlags};
use crate::flow::{FlowKind, FlowState, ImportedKey};
use crate::handle::Handle;
use crate::hsm::Hsm;
use crate::keystore::KeyUsage;
use log::debug;
use serde::{Deserialize, Serialize};

const SIGNATURE_GENERATION: &[FlowKind] = &[FlowKind::SignatureGeneration];
const SIGNATURE_VERIFICATION: &[FlowKind] = &[FlowKind::SignatureVerification];

/// Verdict of `verify_signature`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerificationStatus {
    Success,
    Failure,
}

impl VerificationStatus {
    pub const SUCCESS_VALUE: u32 = 0x5A3C_C3A5;

    /// Raw status word; anything but `SUCCESS_VALUE` is a failed verification
    pub fn value(&self) -> u32 {
        match self {
            VerificationStatus::Success => Self::SUCCESS_VALUE,
            VerificationStatus::Failure => 0,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == VerificationStatus::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignArgs {
    pub key_id: u32,
    pub scheme: SignatureScheme,
    /// Message when `INPUT_MESSAGE` is set, digest otherwise
    pub input: Vec<u8>,
    pub flags: SignFlags,
}

/// Public key used by a verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyKey {
    Raw(Vec<u8>),
    /// Reference returned by `import_public_key`
    Imported(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyArgs {
    pub key: VerifyKey,
    pub scheme: SignatureScheme,
    pub input: Vec<u8>,
    pub signature: Vec<u8>,
    pub flags: VerifyFlags,
}

impl Hsm {
    fn digest_for(&self, scheme: SignatureScheme, input: &[u8], message: bool) -> HsmResult<Vec<u8>> {
        let hash = scheme.hash();
        if message {
            self.config().capabilities.require_hash(hash)?;
            return Ok(self.engine().hash(hash, input)?);
        }
        if input.len() != hash.digest_size() {
            return Err(HsmError::InvalidParam(format!(
                "{:?} signs a {} byte digest",
                scheme,
                hash.digest_size()
            )));
        }
        Ok(input.to_vec())
    }

    /// Precompute the message independent part of a signature for `scheme`
    pub fn prepare_signature(&self, flow: Handle, scheme: SignatureScheme) -> HsmResult<()> {
        self.config().capabilities.require_signature_scheme(scheme)?;
        let access = self.flow_access(flow, SIGNATURE_GENERATION)?;
        self.config()
            .require_fips_allowed(access.mode, scheme.is_fips_approved(), "signature scheme")?;
        let artifact = self.engine().prepare_signature(scheme)?;
        self.with_flow_state(flow, |state| match state {
            FlowState::SignatureGeneration { prepared } => {
                prepared.insert(scheme, artifact);
                Ok(())
            }
            _ => Err(HsmError::UnknownHandle(flow)),
        })?;
        debug!("Prepared {:?} signature on {}", scheme, flow);
        Ok(())
    }

    /// Sign with a stored key, returning `r || s || Ry`
    pub fn generate_signature(&self, flow: Handle, args: &SignArgs) -> HsmResult<Vec<u8>> {
        self.config()
            .capabilities
            .require_signature_scheme(args.scheme)?;
        let digest = self.digest_for(
            args.scheme,
            &args.input,
            args.flags.contains(SignFlags::INPUT_MESSAGE),
        )?;
        self.store_op(flow, SIGNATURE_GENERATION, |mode, store| {
            self.config().require_fips_allowed(
                mode,
                args.scheme.is_fips_approved(),
                "signature scheme",
            )?;
            let key = store.key_for(args.key_id, KeyUsage::Sign)?;
            if key.key_type != args.scheme.key_type() {
                return Err(HsmError::InvalidParam(format!(
                    "{:?} cannot sign with {:?} key {:#x}",
                    args.scheme, key.key_type, key.id
                )));
            }
            let prepared = if args.flags.contains(SignFlags::LOW_LATENCY_SIGNATURE) {
                let artifact = self.with_flow_state(flow, |state| match state {
                    FlowState::SignatureGeneration { prepared } => {
                        prepared.remove(&args.scheme).ok_or_else(|| {
                            HsmError::CmdNotSupported(format!(
                                "no prepared {:?} signature",
                                args.scheme
                            ))
                        })
                    }
                    _ => Err(HsmError::UnknownHandle(flow)),
                })?;
                Some(artifact)
            } else {
                None
            };
            Ok(self.engine().sign(
                args.scheme,
                key.secret(),
                &digest,
                prepared.as_ref().map(|p| p.as_slice()),
            )?)
        })
    }

    /// Register a public key with a verification flow, returning its reference
    pub fn import_public_key(
        &self,
        flow: Handle,
        key_type: KeyType,
        public_key: &[u8],
    ) -> HsmResult<u32> {
        let caps = &self.config().capabilities;
        caps.require_feature(Feature::ImportPublicKey)?;
        caps.require_key_type(key_type)?;
        if key_type.public_key_size() != Some(public_key.len()) {
            return Err(HsmError::param("public key size"));
        }
        self.flow_access(flow, SIGNATURE_VERIFICATION)?;
        self.with_flow_state(flow, |state| match state {
            FlowState::SignatureVerification { imported, next_ref } => {
                let key_ref = *next_ref;
                *next_ref = next_ref.wrapping_add(1).max(1);
                imported.insert(
                    key_ref,
                    ImportedKey {
                        key_type,
                        public: public_key.to_vec(),
                    },
                );
                Ok(key_ref)
            }
            _ => Err(HsmError::UnknownHandle(flow)),
        })
    }

    pub fn verify_signature(&self, flow: Handle, args: &VerifyArgs) -> HsmResult<VerificationStatus> {
        self.config()
            .capabilities
            .require_signature_scheme(args.scheme)?;
        let access = self.flow_access(flow, SIGNATURE_VERIFICATION)?;
        self.config().require_fips_allowed(
            access.mode,
            args.scheme.is_fips_approved(),
            "signature scheme",
        )?;
        let key_type = args.scheme.key_type();
        let public = match &args.key {
            VerifyKey::Raw(public) => public.clone(),
            VerifyKey::Imported(key_ref) => self.with_flow_state(flow, |state| match state {
                FlowState::SignatureVerification { imported, .. } => match imported.get(key_ref) {
                    Some(key) if key.key_type == key_type => Ok(key.public.clone()),
                    Some(key) => Err(HsmError::InvalidParam(format!(
                        "imported key {} is {:?}",
                        key_ref, key.key_type
                    ))),
                    None => Err(HsmError::UnknownId(*key_ref)),
                },
                _ => Err(HsmError::UnknownHandle(flow)),
            })?,
        };
        if key_type.public_key_size() != Some(public.len()) {
            return Err(HsmError::param("public key size"));
        }
        if args.signature.len() != args.scheme.signature_size() {
            return Err(HsmError::InvalidParam(format!(
                "{:?} signatures are {} bytes",
                args.scheme,
                args.scheme.signature_size()
            )));
        }
        let digest = self.digest_for(
            args.scheme,
            &args.input,
            args.flags.contains(VerifyFlags::INPUT_MESSAGE),
        )?;
        let valid = self
            .engine()
            .verify(args.scheme, &public, &digest, &args.signature)?;
        Ok(if valid {
            VerificationStatus::Success
        } else {
            VerificationStatus::Failure
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::CipherAlgo;
    use crate::engine::simulated::wrap_key;
    use crate::engine::{CryptoEngine, Direction, SimulatedEngine};
    use crate::flags::{KeyInfo, ManageKeyFlags, RootKek};
    use crate::flow::{CipherArgs, GenerateKeyArgs, ManageKeyArgs};
    use crate::hsm::testing::*;

    const SCHEME: SignatureScheme = SignatureScheme::EcdsaNistP256Sha256;

    struct Fixture {
        hsm: Hsm,
        key_id: u32,
        public: Vec<u8>,
        sign: Handle,
        verify: Handle,
    }

    fn fixture() -> Fixture {
        let (hsm, _) = hsm();
        let (session, ks) = key_store(&hsm, 7, 42, 10);
        let km = hsm.open_service(ks, FlowKind::KeyManagement).unwrap();
        let outcome = hsm
            .generate_key(km, &GenerateKeyArgs::create(KeyType::EcdsaNistP256, 1, KeyInfo::empty()))
            .unwrap();
        let sign = hsm.open_service(ks, FlowKind::SignatureGeneration).unwrap();
        let verify = hsm.open_service(session, FlowKind::SignatureVerification).unwrap();
        Fixture {
            hsm,
            key_id: outcome.key_id,
            public: outcome.public_key.unwrap(),
            sign,
            verify,
        }
    }

    fn sign_message(f: &Fixture, flags: SignFlags) -> HsmResult<Vec<u8>> {
        f.hsm.generate_signature(
            f.sign,
            &SignArgs {
                key_id: f.key_id,
                scheme: SCHEME,
                input: b"firmware image".to_vec(),
                flags: flags | SignFlags::INPUT_MESSAGE,
            },
        )
    }

    fn verify(f: &Fixture, key: VerifyKey, signature: Vec<u8>) -> HsmResult<VerificationStatus> {
        f.hsm.verify_signature(
            f.verify,
            &VerifyArgs {
                key,
                scheme: SCHEME,
                input: b"firmware image".to_vec(),
                signature,
                flags: VerifyFlags::INPUT_MESSAGE,
            },
        )
    }

    #[test]
    fn test_sign_verify_and_tampered_signature() {
        let f = fixture();
        let signature = sign_message(&f, SignFlags::empty()).unwrap();
        assert_eq!(signature.len(), 65);
        let status = verify(&f, VerifyKey::Raw(f.public.clone()), signature.clone()).unwrap();
        assert_eq!(status.value(), VerificationStatus::SUCCESS_VALUE);

        let mut tampered = signature;
        tampered[10] ^= 0x80;
        let status = verify(&f, VerifyKey::Raw(f.public.clone()), tampered).unwrap();
        assert_ne!(status.value(), VerificationStatus::SUCCESS_VALUE);
    }

    #[test]
    fn test_prepared_signature_is_single_use() {
        let f = fixture();
        assert!(matches!(
            sign_message(&f, SignFlags::LOW_LATENCY_SIGNATURE),
            Err(HsmError::CmdNotSupported(_))
        ));
        f.hsm.prepare_signature(f.sign, SCHEME).unwrap();
        let signature = sign_message(&f, SignFlags::LOW_LATENCY_SIGNATURE).unwrap();
        assert!(verify(&f, VerifyKey::Raw(f.public.clone()), signature)
            .unwrap()
            .is_success());
        assert!(matches!(
            sign_message(&f, SignFlags::LOW_LATENCY_SIGNATURE),
            Err(HsmError::CmdNotSupported(_))
        ));
    }

    #[test]
    fn test_imported_public_key() {
        let f = fixture();
        let key_ref = f
            .hsm
            .import_public_key(f.verify, KeyType::EcdsaNistP256, &f.public)
            .unwrap();
        let signature = sign_message(&f, SignFlags::empty()).unwrap();
        assert!(verify(&f, VerifyKey::Imported(key_ref), signature.clone())
            .unwrap()
            .is_success());
        assert_eq!(
            verify(&f, VerifyKey::Imported(key_ref + 1), signature),
            Err(HsmError::UnknownId(key_ref + 1))
        );
        assert!(matches!(
            f.hsm.import_public_key(f.verify, KeyType::EcdsaNistP256, &f.public[..10]),
            Err(HsmError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_digest_and_key_checks() {
        let f = fixture();
        let short_digest = SignArgs {
            key_id: f.key_id,
            scheme: SCHEME,
            input: vec![0; 20],
            flags: SignFlags::empty(),
        };
        assert!(matches!(
            f.hsm.generate_signature(f.sign, &short_digest),
            Err(HsmError::InvalidParam(_))
        ));
        let wrong_scheme = SignArgs {
            scheme: SignatureScheme::EcdsaNistP384Sha384,
            input: vec![0; 48],
            ..short_digest
        };
        assert!(matches!(
            f.hsm.generate_signature(f.sign, &wrong_scheme),
            Err(HsmError::InvalidParam(_))
        ));
        assert!(matches!(
            verify(&f, VerifyKey::Raw(f.public.clone()), vec![0; 64]),
            Err(HsmError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_imported_keys_serve_matching_algorithms() {
        let (hsm, _) = hsm();
        let (session, ks) = key_store(&hsm, 7, 42, 10);
        let km = hsm.open_service(ks, FlowKind::KeyManagement).unwrap();
        let cipher = hsm.open_service(ks, FlowKind::Cipher).unwrap();
        let sign = hsm.open_service(ks, FlowKind::SignatureGeneration).unwrap();
        let verify = hsm.open_service(session, FlowKind::SignatureVerification).unwrap();
        let engine = SimulatedEngine::new(hsm.config().identity.chip_unique_id);
        let root = engine.root_kek(RootKek::PartUnique).unwrap();
        let import = |key_type: KeyType, info: KeyInfo, secret: &[u8]| {
            let mut args = ManageKeyArgs::import(key_type, 1, info, wrap_key(&root, &[3u8; 12], secret).unwrap());
            args.flags |= ManageKeyFlags::PART_UNIQUE_ROOT_KEK;
            hsm.manage_key(km, &args).unwrap()
        };

        let aes_plain = [0x24u8; 16];
        let aes = import(KeyType::Aes128, KeyInfo::empty(), &aes_plain).key_id;
        let ecc = engine.generate_key(KeyType::EcdsaNistP256).unwrap();
        let ecc_outcome = import(KeyType::EcdsaNistP256, KeyInfo::empty(), &ecc.secret);
        let kek = import(KeyType::Aes256, KeyInfo::KEK, &[0x11u8; 32]).key_id;

        let encrypt = |key_id: u32| {
            hsm.cipher_one_go(
                cipher,
                &CipherArgs {
                    key_id,
                    algo: CipherAlgo::AesCbc,
                    direction: Direction::Encrypt,
                    iv: vec![0; 16],
                    input: vec![0x5A; 32],
                },
            )
        };
        let expected = engine
            .cipher(CipherAlgo::AesCbc, &aes_plain, &[0; 16], &[0x5A; 32], Direction::Encrypt)
            .unwrap();
        assert_eq!(encrypt(aes).unwrap(), expected);
        assert!(matches!(encrypt(ecc_outcome.key_id), Err(HsmError::InvalidParam(_))));
        assert!(matches!(encrypt(kek), Err(HsmError::InvalidLifecycle(_))));

        let sign_with = |key_id: u32| {
            hsm.generate_signature(
                sign,
                &SignArgs {
                    key_id,
                    scheme: SCHEME,
                    input: b"boot stage".to_vec(),
                    flags: SignFlags::INPUT_MESSAGE,
                },
            )
        };
        let signature = sign_with(ecc_outcome.key_id).unwrap();
        let status = hsm
            .verify_signature(
                verify,
                &VerifyArgs {
                    key: VerifyKey::Raw(ecc_outcome.public_key.unwrap()),
                    scheme: SCHEME,
                    input: b"boot stage".to_vec(),
                    signature,
                    flags: VerifyFlags::INPUT_MESSAGE,
                },
            )
            .unwrap();
        assert!(status.is_success());
        assert!(matches!(sign_with(aes), Err(HsmError::InvalidParam(_))));
        assert!(matches!(sign_with(kek), Err(HsmError::InvalidLifecycle(_))));
    }
}
