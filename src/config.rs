//! HSM configuration: platform capability table, FIPS mode, limits, chip identity
//!
//! Platform variants are data, not branches: every operation asks the injected
//! `CapabilityTable` whether an algorithm or feature exists on this part.

use crate::algo::{
    CipherAlgo, HashAlgo, KdfAlgo, KeyExchangeScheme, KeyType, MacAlgo, SignatureScheme,
};
use crate::error::{HsmError, HsmResult};
use crate::flags::{FipsMode, SessionMode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Debug;

/// Optional operations a platform may lack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    KeyGroupDelete,
    ButterflyKeyExpansion,
    Ecies,
    PublicKeyReconstruction,
    PublicKeyDecompression,
    PublicKeyRecovery,
    ImportPublicKey,
    Sm2GetZ,
    Sm2Eces,
    KeyExchange,
    DataStorage,
    ExportRootKek,
}

impl Feature {
    pub const ALL: &'static [Feature] = &[
        Feature::KeyGroupDelete,
        Feature::ButterflyKeyExpansion,
        Feature::Ecies,
        Feature::PublicKeyReconstruction,
        Feature::PublicKeyDecompression,
        Feature::PublicKeyRecovery,
        Feature::ImportPublicKey,
        Feature::Sm2GetZ,
        Feature::Sm2Eces,
        Feature::KeyExchange,
        Feature::DataStorage,
        Feature::ExportRootKek,
    ];

    /// Disabled while the part runs in FIPS approved mode
    pub fn is_fips_approved(&self) -> bool {
        !matches!(
            self,
            Feature::ButterflyKeyExpansion
                | Feature::Ecies
                | Feature::PublicKeyReconstruction
                | Feature::PublicKeyDecompression
                | Feature::Sm2GetZ
                | Feature::Sm2Eces
        )
    }
}

/// What a given part supports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    pub name: String,
    pub key_types: BTreeSet<KeyType>,
    pub signature_schemes: BTreeSet<SignatureScheme>,
    pub cipher_algos: BTreeSet<CipherAlgo>,
    pub mac_algos: BTreeSet<MacAlgo>,
    pub hash_algos: BTreeSet<HashAlgo>,
    pub kdf_algos: BTreeSet<KdfAlgo>,
    pub key_exchange_schemes: BTreeSet<KeyExchangeScheme>,
    /// Curves accepted by butterfly expansion
    pub butterfly_key_types: BTreeSet<KeyType>,
    /// Curves accepted by ECIES and public key reconstruction
    pub ecies_key_types: BTreeSet<KeyType>,
    pub features: BTreeSet<Feature>,
    /// Session mode bits the platform acts on; others are accepted and ignored
    pub honored_session_modes: SessionMode,
}

fn set<T: Ord + Copy>(items: &[T]) -> BTreeSet<T> {
    items.iter().copied().collect()
}

fn without<T: Ord + Copy>(items: &[T], excluded: &[T]) -> BTreeSet<T> {
    items.iter().copied().filter(|i| !excluded.contains(i)).collect()
}

fn check<T: Ord + Debug>(supported: &BTreeSet<T>, item: &T, platform: &str) -> HsmResult<()> {
    if supported.contains(item) {
        Ok(())
    } else {
        Err(HsmError::FeatureNotSupported(format!(
            "{:?} on {}",
            item, platform
        )))
    }
}

impl CapabilityTable {
    /// Every algorithm and feature
    pub fn full() -> Self {
        let ecc256 = [
            KeyType::EcdsaNistP256,
            KeyType::EcdsaBrainpoolR1_256,
            KeyType::EcdsaBrainpoolT1_256,
        ];
        Self {
            name: "full".into(),
            key_types: set(KeyType::ALL),
            signature_schemes: set(SignatureScheme::ALL),
            cipher_algos: set(CipherAlgo::ALL),
            mac_algos: set(MacAlgo::ALL),
            hash_algos: set(HashAlgo::ALL),
            kdf_algos: set(KdfAlgo::ALL),
            key_exchange_schemes: set(KeyExchangeScheme::ALL),
            butterfly_key_types: set(&ecc256),
            ecies_key_types: set(&ecc256),
            features: set(Feature::ALL),
            honored_session_modes: SessionMode::all(),
        }
    }

    /// i.MX8QXP: SECO core only, no SM algorithms, reduced curve set
    pub fn qxp() -> Self {
        let unsupported_keys = [
            KeyType::EcdsaNistP521,
            KeyType::EcdsaBrainpoolR1_320,
            KeyType::EcdsaBrainpoolR1_512,
            KeyType::EcdsaBrainpoolT1_256,
            KeyType::EcdsaBrainpoolT1_320,
            KeyType::EcdsaBrainpoolT1_384,
            KeyType::EcdsaBrainpoolT1_512,
            KeyType::DsaSm2Fp256,
            KeyType::Sm4_128,
        ];
        let unsupported_schemes = [
            SignatureScheme::EcdsaNistP521Sha512,
            SignatureScheme::EcdsaBrainpoolR1_320Sha384,
            SignatureScheme::EcdsaBrainpoolR1_512Sha512,
            SignatureScheme::EcdsaBrainpoolT1_256Sha256,
            SignatureScheme::EcdsaBrainpoolT1_320Sha384,
            SignatureScheme::EcdsaBrainpoolT1_384Sha384,
            SignatureScheme::EcdsaBrainpoolT1_512Sha512,
            SignatureScheme::DsaSm2Fp256Sm3,
        ];
        let ecc256 = [KeyType::EcdsaNistP256, KeyType::EcdsaBrainpoolR1_256];
        Self {
            name: "qxp".into(),
            key_types: without(KeyType::ALL, &unsupported_keys),
            signature_schemes: without(SignatureScheme::ALL, &unsupported_schemes),
            cipher_algos: without(CipherAlgo::ALL, &[CipherAlgo::Sm4Ecb, CipherAlgo::Sm4Cbc]),
            mac_algos: set(MacAlgo::ALL),
            hash_algos: without(HashAlgo::ALL, &[HashAlgo::Sm3_256]),
            kdf_algos: without(KdfAlgo::ALL, &[KdfAlgo::ForSm2]),
            key_exchange_schemes: without(KeyExchangeScheme::ALL, &[KeyExchangeScheme::Sm2Fp256]),
            butterfly_key_types: set(&ecc256),
            ecies_key_types: set(&ecc256),
            features: without(
                Feature::ALL,
                &[
                    Feature::KeyGroupDelete,
                    Feature::ImportPublicKey,
                    Feature::Sm2GetZ,
                    Feature::Sm2Eces,
                ],
            ),
            honored_session_modes: SessionMode::NO_KEY_STORE,
        }
    }

    /// i.MX8DXL: SECO and V2X cores, low latency selects V2X
    pub fn dxl() -> Self {
        let ecc256 = [
            KeyType::EcdsaNistP256,
            KeyType::EcdsaBrainpoolR1_256,
            KeyType::EcdsaBrainpoolT1_256,
        ];
        Self {
            name: "dxl".into(),
            key_types: set(KeyType::ALL),
            signature_schemes: set(SignatureScheme::ALL),
            cipher_algos: set(CipherAlgo::ALL),
            mac_algos: set(MacAlgo::ALL),
            hash_algos: set(HashAlgo::ALL),
            kdf_algos: without(
                KdfAlgo::ALL,
                &[KdfAlgo::HmacSha256Tls0_16_4, KdfAlgo::HmacSha384Tls0_32_4],
            ),
            key_exchange_schemes: set(KeyExchangeScheme::ALL),
            butterfly_key_types: set(&ecc256),
            ecies_key_types: set(&ecc256),
            features: without(Feature::ALL, &[Feature::KeyGroupDelete]),
            honored_session_modes: SessionMode::LOW_LATENCY | SessionMode::NO_KEY_STORE,
        }
    }

    /// Look a preset up by name
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "full" => Some(Self::full()),
            "qxp" => Some(Self::qxp()),
            "dxl" => Some(Self::dxl()),
            _ => None,
        }
    }

    pub fn require_feature(&self, feature: Feature) -> HsmResult<()> {
        check(&self.features, &feature, &self.name)
    }

    pub fn require_key_type(&self, key_type: KeyType) -> HsmResult<()> {
        check(&self.key_types, &key_type, &self.name)
    }

    pub fn require_signature_scheme(&self, scheme: SignatureScheme) -> HsmResult<()> {
        check(&self.signature_schemes, &scheme, &self.name)
    }

    pub fn require_cipher(&self, algo: CipherAlgo) -> HsmResult<()> {
        check(&self.cipher_algos, &algo, &self.name)
    }

    pub fn require_mac(&self, algo: MacAlgo) -> HsmResult<()> {
        check(&self.mac_algos, &algo, &self.name)
    }

    pub fn require_hash(&self, algo: HashAlgo) -> HsmResult<()> {
        check(&self.hash_algos, &algo, &self.name)
    }

    pub fn require_kdf(&self, algo: KdfAlgo) -> HsmResult<()> {
        check(&self.kdf_algos, &algo, &self.name)
    }

    pub fn require_key_exchange(&self, scheme: KeyExchangeScheme) -> HsmResult<()> {
        check(&self.key_exchange_schemes, &scheme, &self.name)
    }

    pub fn require_butterfly_key_type(&self, key_type: KeyType) -> HsmResult<()> {
        check(&self.butterfly_key_types, &key_type, &self.name)
    }

    pub fn require_ecies_key_type(&self, key_type: KeyType) -> HsmResult<()> {
        check(&self.ecies_key_types, &key_type, &self.name)
    }

    /// Mode bits that take effect on this platform
    pub fn effective_mode(&self, requested: SessionMode) -> SessionMode {
        requested & self.honored_session_modes
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::full()
    }
}

/// Identity values reported by `get_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChipIdentity {
    pub user_sab_id: u32,
    pub chip_unique_id: u64,
    pub chip_life_cycle: u16,
    pub version: u32,
    pub version_ext: u32,
}

impl Default for ChipIdentity {
    fn default() -> Self {
        Self {
            user_sab_id: 0x0000_0001,
            chip_unique_id: 0x5EC0_0000_0000_0001,
            chip_life_cycle: 0x0020,
            version: 0x0001_0000,
            version_ext: 0,
        }
    }
}

/// Complete HSM configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HsmConfig {
    pub capabilities: CapabilityTable,
    pub fips_mode: FipsMode,
    /// Upper bound on simultaneously open handles
    pub max_handles: usize,
    /// Key groups a key store keeps resident before evicting
    pub group_cache_capacity: usize,
    pub identity: ChipIdentity,
}

impl Default for HsmConfig {
    fn default() -> Self {
        Self {
            capabilities: CapabilityTable::full(),
            fips_mode: FipsMode::empty(),
            max_handles: 256,
            group_cache_capacity: 64,
            identity: ChipIdentity::default(),
        }
    }
}

impl HsmConfig {
    pub fn with_capabilities(capabilities: CapabilityTable) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    pub fn fips_approved(&self) -> bool {
        self.fips_mode.contains(FipsMode::APPROVED)
    }

    /// Whether non approved operations are refused for a session with `mode`
    pub fn fips_restricted(&self, mode: SessionMode) -> bool {
        self.fips_approved()
            || self
                .capabilities
                .effective_mode(mode)
                .contains(SessionMode::FIPS_ONLY)
    }

    /// Fail `FeatureDisabled` when FIPS rules exclude a non approved operation
    pub fn require_fips_allowed(&self, mode: SessionMode, approved: bool, what: &str) -> HsmResult<()> {
        if !approved && self.fips_restricted(mode) {
            Err(HsmError::FeatureDisabled(format!("{} in FIPS mode", what)))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_encode_platform_notes() {
        let qxp = CapabilityTable::qxp();
        assert!(qxp.require_key_type(KeyType::EcdsaNistP256).is_ok());
        assert!(matches!(
            qxp.require_key_type(KeyType::Sm4_128),
            Err(HsmError::FeatureNotSupported(_))
        ));
        assert!(qxp.require_feature(Feature::KeyGroupDelete).is_err());
        assert!(qxp.require_hash(HashAlgo::Sm3_256).is_err());

        let dxl = CapabilityTable::dxl();
        assert!(dxl.require_key_type(KeyType::Sm4_128).is_ok());
        assert!(dxl.require_kdf(KdfAlgo::HmacSha256Tls0_16_4).is_err());
        assert!(dxl.require_butterfly_key_type(KeyType::EcdsaBrainpoolT1_256).is_ok());
        assert!(CapabilityTable::full().require_feature(Feature::KeyGroupDelete).is_ok());
    }

    #[test]
    fn test_ignored_session_modes() {
        let qxp = CapabilityTable::qxp();
        let mode = SessionMode::FIPS_ONLY | SessionMode::EXCLUSIVE | SessionMode::NO_KEY_STORE;
        assert_eq!(qxp.effective_mode(mode), SessionMode::NO_KEY_STORE);
    }

    #[test]
    fn test_fips_gating() {
        let mut config = HsmConfig::default();
        assert!(config.require_fips_allowed(SessionMode::empty(), false, "ECIES").is_ok());
        assert!(matches!(
            config.require_fips_allowed(SessionMode::FIPS_ONLY, false, "ECIES"),
            Err(HsmError::FeatureDisabled(_))
        ));
        config.fips_mode = FipsMode::APPROVED | FipsMode::CERTIFIED;
        assert!(config.require_fips_allowed(SessionMode::empty(), false, "ECIES").is_err());
        assert!(config.require_fips_allowed(SessionMode::empty(), true, "AES").is_ok());
    }

    #[test]
    fn test_config_save_load() {
        let path = std::env::temp_dir().join(format!("hsm-config-{}.json", uuid::Uuid::new_v4()));
        let path = path.to_string_lossy().to_string();
        let config = HsmConfig::with_capabilities(CapabilityTable::dxl());
        config.save(&path).unwrap();
        let loaded = HsmConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = std::fs::remove_file(&path);
    }
}
