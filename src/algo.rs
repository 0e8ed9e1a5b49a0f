//! Key types, algorithm identifiers and the static compatibility table
//!
//! Every enum maps to the numeric identifier of the command contract through
//! `code()` / `from_code()`. Compatibility rules (which key type serves which
//! algorithm, fixed IV and tag lengths) live here so the flow dispatchers stay thin.

use crate::error::{HsmError, HsmResult};
use serde::{Deserialize, Serialize};

macro_rules! coded_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $code:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(&self) -> u8 {
                match self {
                    $($name::$variant => $code),+
                }
            }

            pub fn from_code(code: u8) -> HsmResult<Self> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(HsmError::InvalidParam(format!(
                        "unknown {} {:#04x}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

coded_enum! {
    /// Type of a key held in (or presented to) the key store
    KeyType {
        EcdsaNistP256 = 0x02,
        EcdsaNistP384 = 0x03,
        EcdsaNistP521 = 0x04,
        EcdsaBrainpoolR1_256 = 0x13,
        EcdsaBrainpoolR1_320 = 0x14,
        EcdsaBrainpoolR1_384 = 0x15,
        EcdsaBrainpoolR1_512 = 0x16,
        EcdsaBrainpoolT1_256 = 0x23,
        EcdsaBrainpoolT1_320 = 0x24,
        EcdsaBrainpoolT1_384 = 0x25,
        EcdsaBrainpoolT1_512 = 0x26,
        Aes128 = 0x30,
        Aes192 = 0x31,
        Aes256 = 0x32,
        DsaSm2Fp256 = 0x42,
        Sm4_128 = 0x50,
        Hmac224 = 0x60,
        Hmac256 = 0x61,
        Hmac384 = 0x62,
        Hmac512 = 0x63,
    }
}

impl KeyType {
    /// Curve coordinate size in bytes, `None` for symmetric keys
    pub fn coordinate_size(&self) -> Option<usize> {
        match self {
            KeyType::EcdsaNistP256
            | KeyType::EcdsaBrainpoolR1_256
            | KeyType::EcdsaBrainpoolT1_256
            | KeyType::DsaSm2Fp256 => Some(32),
            KeyType::EcdsaBrainpoolR1_320 | KeyType::EcdsaBrainpoolT1_320 => Some(40),
            KeyType::EcdsaNistP384
            | KeyType::EcdsaBrainpoolR1_384
            | KeyType::EcdsaBrainpoolT1_384 => Some(48),
            KeyType::EcdsaBrainpoolR1_512 | KeyType::EcdsaBrainpoolT1_512 => Some(64),
            KeyType::EcdsaNistP521 => Some(66),
            _ => None,
        }
    }

    /// Size in bytes of the secret part (private scalar or symmetric key)
    pub fn secret_size(&self) -> usize {
        match self {
            KeyType::Aes128 | KeyType::Sm4_128 => 16,
            KeyType::Aes192 => 24,
            KeyType::Aes256 => 32,
            KeyType::Hmac224 => 28,
            KeyType::Hmac256 => 32,
            KeyType::Hmac384 => 48,
            KeyType::Hmac512 => 64,
            ecc => ecc.coordinate_size().unwrap_or(0),
        }
    }

    /// Uncompressed public key size (x || y), `None` for symmetric keys
    pub fn public_key_size(&self) -> Option<usize> {
        self.coordinate_size().map(|c| 2 * c)
    }

    pub fn is_asymmetric(&self) -> bool {
        self.coordinate_size().is_some()
    }

    pub fn is_aes(&self) -> bool {
        matches!(self, KeyType::Aes128 | KeyType::Aes192 | KeyType::Aes256)
    }

    pub fn is_hmac(&self) -> bool {
        matches!(
            self,
            KeyType::Hmac224 | KeyType::Hmac256 | KeyType::Hmac384 | KeyType::Hmac512
        )
    }

    /// SM2 and SM4 are outside the FIPS approved set
    pub fn is_fips_approved(&self) -> bool {
        !matches!(self, KeyType::DsaSm2Fp256 | KeyType::Sm4_128)
    }
}

coded_enum! {
    /// Digital signature scheme
    SignatureScheme {
        EcdsaNistP256Sha256 = 0x02,
        EcdsaNistP384Sha384 = 0x03,
        EcdsaNistP521Sha512 = 0x04,
        EcdsaBrainpoolR1_256Sha256 = 0x13,
        EcdsaBrainpoolR1_320Sha384 = 0x14,
        EcdsaBrainpoolR1_384Sha384 = 0x15,
        EcdsaBrainpoolR1_512Sha512 = 0x16,
        EcdsaBrainpoolT1_256Sha256 = 0x23,
        EcdsaBrainpoolT1_320Sha384 = 0x24,
        EcdsaBrainpoolT1_384Sha384 = 0x25,
        EcdsaBrainpoolT1_512Sha512 = 0x26,
        DsaSm2Fp256Sm3 = 0x43,
    }
}

impl SignatureScheme {
    /// Key type a scheme signs with
    pub fn key_type(&self) -> KeyType {
        match self {
            SignatureScheme::EcdsaNistP256Sha256 => KeyType::EcdsaNistP256,
            SignatureScheme::EcdsaNistP384Sha384 => KeyType::EcdsaNistP384,
            SignatureScheme::EcdsaNistP521Sha512 => KeyType::EcdsaNistP521,
            SignatureScheme::EcdsaBrainpoolR1_256Sha256 => KeyType::EcdsaBrainpoolR1_256,
            SignatureScheme::EcdsaBrainpoolR1_320Sha384 => KeyType::EcdsaBrainpoolR1_320,
            SignatureScheme::EcdsaBrainpoolR1_384Sha384 => KeyType::EcdsaBrainpoolR1_384,
            SignatureScheme::EcdsaBrainpoolR1_512Sha512 => KeyType::EcdsaBrainpoolR1_512,
            SignatureScheme::EcdsaBrainpoolT1_256Sha256 => KeyType::EcdsaBrainpoolT1_256,
            SignatureScheme::EcdsaBrainpoolT1_320Sha384 => KeyType::EcdsaBrainpoolT1_320,
            SignatureScheme::EcdsaBrainpoolT1_384Sha384 => KeyType::EcdsaBrainpoolT1_384,
            SignatureScheme::EcdsaBrainpoolT1_512Sha512 => KeyType::EcdsaBrainpoolT1_512,
            SignatureScheme::DsaSm2Fp256Sm3 => KeyType::DsaSm2Fp256,
        }
    }

    /// Hash applied when the input is a message rather than a digest
    pub fn hash(&self) -> HashAlgo {
        match self {
            SignatureScheme::EcdsaNistP256Sha256
            | SignatureScheme::EcdsaBrainpoolR1_256Sha256
            | SignatureScheme::EcdsaBrainpoolT1_256Sha256 => HashAlgo::Sha256,
            SignatureScheme::EcdsaNistP384Sha384
            | SignatureScheme::EcdsaBrainpoolR1_320Sha384
            | SignatureScheme::EcdsaBrainpoolR1_384Sha384
            | SignatureScheme::EcdsaBrainpoolT1_320Sha384
            | SignatureScheme::EcdsaBrainpoolT1_384Sha384 => HashAlgo::Sha384,
            SignatureScheme::EcdsaNistP521Sha512
            | SignatureScheme::EcdsaBrainpoolR1_512Sha512
            | SignatureScheme::EcdsaBrainpoolT1_512Sha512 => HashAlgo::Sha512,
            SignatureScheme::DsaSm2Fp256Sm3 => HashAlgo::Sm3_256,
        }
    }

    /// Signature length: r || s || Ry
    pub fn signature_size(&self) -> usize {
        2 * self.key_type().coordinate_size().unwrap_or(0) + 1
    }

    pub fn is_fips_approved(&self) -> bool {
        !matches!(self, SignatureScheme::DsaSm2Fp256Sm3)
    }
}

coded_enum! {
    /// One-go cipher algorithm
    CipherAlgo {
        AesEcb = 0x00,
        AesCbc = 0x01,
        AesCcm = 0x04,
        Sm4Ecb = 0x10,
        Sm4Cbc = 0x11,
    }
}

/// Block size shared by AES and SM4
pub const BLOCK_SIZE: usize = 16;
/// Fixed nonce length for CCM / GCM / key import
pub const AEAD_IV_SIZE: usize = 12;
/// Fixed tag length for CCM / GCM / key import
pub const AEAD_TAG_SIZE: usize = 16;

impl CipherAlgo {
    pub fn accepts_key(&self, key_type: KeyType) -> bool {
        match self {
            CipherAlgo::AesEcb | CipherAlgo::AesCbc | CipherAlgo::AesCcm => key_type.is_aes(),
            CipherAlgo::Sm4Ecb | CipherAlgo::Sm4Cbc => key_type == KeyType::Sm4_128,
        }
    }

    pub fn iv_size(&self) -> usize {
        match self {
            CipherAlgo::AesEcb | CipherAlgo::Sm4Ecb => 0,
            CipherAlgo::AesCbc | CipherAlgo::Sm4Cbc => BLOCK_SIZE,
            CipherAlgo::AesCcm => AEAD_IV_SIZE,
        }
    }

    pub fn is_block_mode(&self) -> bool {
        !matches!(self, CipherAlgo::AesCcm)
    }

    pub fn is_fips_approved(&self) -> bool {
        !matches!(self, CipherAlgo::Sm4Ecb | CipherAlgo::Sm4Cbc)
    }
}

coded_enum! {
    /// Authenticated encryption algorithm
    AuthEncAlgo {
        AesGcm = 0x00,
    }
}

coded_enum! {
    /// One-go MAC algorithm
    MacAlgo {
        AesCmac = 0x01,
        HmacSha224 = 0x05,
        HmacSha256 = 0x06,
        HmacSha384 = 0x07,
        HmacSha512 = 0x08,
    }
}

/// Smallest tag the MAC service accepts
pub const MIN_MAC_SIZE: usize = 4;

impl MacAlgo {
    pub fn accepts_key(&self, key_type: KeyType) -> bool {
        match self {
            MacAlgo::AesCmac => key_type.is_aes(),
            MacAlgo::HmacSha224 => key_type == KeyType::Hmac224,
            MacAlgo::HmacSha256 => key_type == KeyType::Hmac256,
            MacAlgo::HmacSha384 => key_type == KeyType::Hmac384,
            MacAlgo::HmacSha512 => key_type == KeyType::Hmac512,
        }
    }

    /// Longest tag the algorithm produces
    pub fn max_mac_size(&self) -> usize {
        match self {
            MacAlgo::AesCmac => 16,
            MacAlgo::HmacSha224 => 28,
            MacAlgo::HmacSha256 => 32,
            MacAlgo::HmacSha384 => 48,
            MacAlgo::HmacSha512 => 64,
        }
    }
}

coded_enum! {
    /// Hash algorithm
    HashAlgo {
        Sha224 = 0x00,
        Sha256 = 0x01,
        Sha384 = 0x02,
        Sha512 = 0x03,
        Sm3_256 = 0x11,
    }
}

impl HashAlgo {
    pub fn digest_size(&self) -> usize {
        match self {
            HashAlgo::Sha224 => 28,
            HashAlgo::Sha256 | HashAlgo::Sm3_256 => 32,
            HashAlgo::Sha384 => 48,
            HashAlgo::Sha512 => 64,
        }
    }

    pub fn is_fips_approved(&self) -> bool {
        !matches!(self, HashAlgo::Sm3_256)
    }
}

coded_enum! {
    /// Key derivation function applied after a key exchange
    KdfAlgo {
        AesCmac256Counter = 0x00,
        ForSm2 = 0x10,
        HmacSha256Tls0_16_4 = 0x20,
        HmacSha384Tls0_32_4 = 0x21,
        HmacSha256Tls0_32_4 = 0x22,
        HmacSha256Tls32_16_4 = 0x23,
        HmacSha384Tls48_32_4 = 0x24,
    }
}

/// TLS KDF input: clientHello_random || serverHello_random || server_random || client_random
pub const TLS_KDF_INPUT_SIZE: usize = 128;
/// TLS KDF output: client_write_iv || server_write_iv
pub const TLS_KDF_OUTPUT_SIZE: usize = 8;

impl KdfAlgo {
    pub fn is_tls(&self) -> bool {
        !matches!(self, KdfAlgo::AesCmac256Counter | KdfAlgo::ForSm2)
    }

    /// Types of the keys a KDF derives, in output order
    ///
    /// `requested` is the caller's shared key type, used only by KDFs that do not
    /// fix their outputs.
    pub fn derived_key_types(&self, requested: KeyType) -> Vec<KeyType> {
        match self {
            KdfAlgo::AesCmac256Counter => vec![KeyType::Aes256],
            KdfAlgo::ForSm2 => vec![requested],
            KdfAlgo::HmacSha256Tls0_16_4 => vec![KeyType::Aes128, KeyType::Aes128],
            KdfAlgo::HmacSha384Tls0_32_4 | KdfAlgo::HmacSha256Tls0_32_4 => {
                vec![KeyType::Aes256, KeyType::Aes256]
            }
            KdfAlgo::HmacSha256Tls32_16_4 => vec![
                KeyType::Hmac256,
                KeyType::Hmac256,
                KeyType::Aes128,
                KeyType::Aes128,
            ],
            KdfAlgo::HmacSha384Tls48_32_4 => vec![
                KeyType::Hmac384,
                KeyType::Hmac384,
                KeyType::Aes256,
                KeyType::Aes256,
            ],
        }
    }
}

coded_enum! {
    /// Key agreement scheme
    KeyExchangeScheme {
        EcdhNistP256 = 0x02,
        EcdhNistP384 = 0x03,
        Sm2Fp256 = 0x42,
    }
}

impl KeyExchangeScheme {
    pub fn key_type(&self) -> KeyType {
        match self {
            KeyExchangeScheme::EcdhNistP256 => KeyType::EcdsaNistP256,
            KeyExchangeScheme::EcdhNistP384 => KeyType::EcdsaNistP384,
            KeyExchangeScheme::Sm2Fp256 => KeyType::DsaSm2Fp256,
        }
    }

    /// Whether `kdf` may follow this scheme
    pub fn accepts_kdf(&self, kdf: KdfAlgo) -> bool {
        match (self, kdf) {
            (KeyExchangeScheme::Sm2Fp256, KdfAlgo::ForSm2) => true,
            (KeyExchangeScheme::Sm2Fp256, _) | (_, KdfAlgo::ForSm2) => false,
            (KeyExchangeScheme::EcdhNistP256, KdfAlgo::AesCmac256Counter) => true,
            (KeyExchangeScheme::EcdhNistP384, KdfAlgo::AesCmac256Counter) => false,
            (_, tls) => tls.is_tls(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_every_variant() {
        for kt in KeyType::ALL {
            assert_eq!(KeyType::from_code(kt.code()).unwrap(), *kt);
        }
        for s in SignatureScheme::ALL {
            assert_eq!(SignatureScheme::from_code(s.code()).unwrap(), *s);
        }
        assert!(KeyType::from_code(0x01).is_err());
        assert!(HashAlgo::from_code(0x04).is_err());
    }

    #[test]
    fn test_key_sizes() {
        assert_eq!(KeyType::EcdsaNistP256.public_key_size(), Some(64));
        assert_eq!(KeyType::EcdsaNistP521.public_key_size(), Some(132));
        assert_eq!(KeyType::Aes256.public_key_size(), None);
        assert_eq!(KeyType::Aes192.secret_size(), 24);
        assert_eq!(SignatureScheme::EcdsaNistP384Sha384.signature_size(), 97);
    }

    #[test]
    fn test_algorithm_key_compatibility() {
        assert!(CipherAlgo::AesCbc.accepts_key(KeyType::Aes128));
        assert!(!CipherAlgo::AesCbc.accepts_key(KeyType::Sm4_128));
        assert!(CipherAlgo::Sm4Ecb.accepts_key(KeyType::Sm4_128));
        assert!(MacAlgo::AesCmac.accepts_key(KeyType::Aes256));
        assert!(!MacAlgo::AesCmac.accepts_key(KeyType::Hmac256));
        assert!(MacAlgo::HmacSha256.accepts_key(KeyType::Hmac256));
        assert!(!MacAlgo::HmacSha256.accepts_key(KeyType::Hmac384));
    }

    #[test]
    fn test_kdf_scheme_pairs() {
        assert!(KeyExchangeScheme::EcdhNistP256.accepts_kdf(KdfAlgo::AesCmac256Counter));
        assert!(!KeyExchangeScheme::EcdhNistP384.accepts_kdf(KdfAlgo::AesCmac256Counter));
        assert!(KeyExchangeScheme::Sm2Fp256.accepts_kdf(KdfAlgo::ForSm2));
        assert!(!KeyExchangeScheme::EcdhNistP256.accepts_kdf(KdfAlgo::ForSm2));
        assert!(KeyExchangeScheme::EcdhNistP384.accepts_kdf(KdfAlgo::HmacSha384Tls48_32_4));
        assert_eq!(
            KdfAlgo::HmacSha256Tls32_16_4.derived_key_types(KeyType::Aes128).len(),
            4
        );
    }
}
