//! Crypto Engine: primitive operations behind a capability interface
//!
//! The key store hands key material to the engine by reference and gets bytes or a
//! verdict back. The engine never sees handles, groups or counters.

pub mod simulated;

pub use simulated::SimulatedEngine;

use crate::algo::{
    AuthEncAlgo, CipherAlgo, HashAlgo, KdfAlgo, KeyExchangeScheme, KeyType, MacAlgo,
    SignatureScheme,
};
use crate::flags::RootKek;
use zeroize::Zeroizing;

pub type EngineResult<T> = Result<T, EngineError>;

/// Secret bytes that are wiped when dropped
pub type Secret = Zeroizing<Vec<u8>>;

/// Freshly generated or derived key material
#[derive(Clone)]
pub struct KeyMaterial {
    pub secret: Secret,
    /// Uncompressed public key for asymmetric types
    pub public: Option<Vec<u8>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("secret", &"<redacted>")
            .field("public", &self.public.as_ref().map(hex::encode))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Output of a key derivation function
pub struct DerivedKeys {
    pub keys: Vec<Secret>,
    /// Non sensitive output (TLS write IVs), empty for other KDFs
    pub iv_output: Vec<u8>,
}

/// Inputs that turn a butterfly expansion into the implicit-certificate variant
#[derive(Debug, Clone, Copy)]
pub struct ImplicitCertificate<'a> {
    pub hash: &'a [u8],
    pub private_reconstruction: &'a [u8],
}

/// Named cryptographic primitives
pub trait CryptoEngine: Send + Sync {
    fn random_bytes(&self, len: usize) -> EngineResult<Vec<u8>>;

    fn generate_key(&self, key_type: KeyType) -> EngineResult<KeyMaterial>;

    /// Public half of an asymmetric private key
    fn derive_public_key(&self, key_type: KeyType, secret: &[u8]) -> EngineResult<Vec<u8>>;

    fn cipher(
        &self,
        algo: CipherAlgo,
        key: &[u8],
        iv: &[u8],
        input: &[u8],
        direction: Direction,
    ) -> EngineResult<Vec<u8>>;

    /// Authenticated encryption; ciphertext carries the tag appended
    fn auth_enc(
        &self,
        algo: AuthEncAlgo,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        input: &[u8],
        direction: Direction,
    ) -> EngineResult<Vec<u8>>;

    fn hash(&self, algo: HashAlgo, input: &[u8]) -> EngineResult<Vec<u8>>;

    /// Full-length tag; truncation is up to the caller
    fn mac(&self, algo: MacAlgo, key: &[u8], input: &[u8]) -> EngineResult<Vec<u8>>;

    /// Message independent part of a signature (nonce material)
    fn prepare_signature(&self, scheme: SignatureScheme) -> EngineResult<Secret>;

    /// Sign a digest, returning `r || s || Ry`
    fn sign(
        &self,
        scheme: SignatureScheme,
        secret: &[u8],
        digest: &[u8],
        prepared: Option<&[u8]>,
    ) -> EngineResult<Vec<u8>>;

    fn verify(
        &self,
        scheme: SignatureScheme,
        public: &[u8],
        digest: &[u8],
        signature: &[u8],
    ) -> EngineResult<bool>;

    fn ecies_encrypt(
        &self,
        key_type: KeyType,
        public: &[u8],
        input: &[u8],
        p1: &[u8],
        p2: &[u8],
        mac_size: usize,
    ) -> EngineResult<Vec<u8>>;

    fn ecies_decrypt(
        &self,
        key_type: KeyType,
        secret: &[u8],
        input: &[u8],
        p1: &[u8],
        p2: &[u8],
        mac_size: usize,
    ) -> EngineResult<Vec<u8>>;

    /// Output is `C1 || C2 || C3`, 97 bytes longer than the input
    fn sm2_eces_encrypt(&self, public: &[u8], input: &[u8]) -> EngineResult<Vec<u8>>;

    fn sm2_eces_decrypt(&self, secret: &[u8], input: &[u8]) -> EngineResult<Vec<u8>>;

    fn sm2_get_z(&self, public: &[u8], identifier: &[u8]) -> EngineResult<Vec<u8>>;

    fn key_agreement(
        &self,
        scheme: KeyExchangeScheme,
        secret: &[u8],
        peer_public: &[u8],
    ) -> EngineResult<Secret>;

    fn derive_keys(
        &self,
        kdf: KdfAlgo,
        shared_secret: &[u8],
        kdf_input: &[u8],
        outputs: &[KeyType],
    ) -> EngineResult<DerivedKeys>;

    fn butterfly_expand(
        &self,
        key_type: KeyType,
        secret: &[u8],
        expansion_value: &[u8],
        implicit: Option<ImplicitCertificate<'_>>,
    ) -> EngineResult<Secret>;

    fn reconstruct_public_key(
        &self,
        key_type: KeyType,
        public_reconstruction: &[u8],
        hash: &[u8],
        ca_key: &[u8],
    ) -> EngineResult<Vec<u8>>;

    /// Decompress `x || lsb_y` into `x || y`
    fn decompress_public_key(&self, key_type: KeyType, compressed: &[u8]) -> EngineResult<Vec<u8>>;

    fn root_kek(&self, which: RootKek) -> EngineResult<Secret>;
}

/// Crypto engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Unsupported primitive: {0}")]
    Unsupported(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Engine failure: {0}")]
    Failure(String),

    #[error("RNG not started")]
    RngNotStarted,

    #[error("Self test failed: {0}")]
    SelfTest(String),
}
