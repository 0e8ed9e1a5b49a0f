//! Signed message authorization for the destructive and export paths
//!
//! Re-provisioning and root KEK export carry a message signed by an external
//! authority. The HSM only asks an `Authorizer` whether the message is valid for
//! the requested purpose.

use hmac::{Hmac, Mac};
use sha2::Sha256;

/// What a signed message authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthPurpose {
    /// Erase every key store
    Reprovision,
    ExportRootKek { common: bool },
}

impl AuthPurpose {
    fn label(&self) -> &'static [u8] {
        match self {
            AuthPurpose::Reprovision => b"hsm-reprovision-v1",
            AuthPurpose::ExportRootKek { common: true } => b"hsm-export-common-kek-v1",
            AuthPurpose::ExportRootKek { common: false } => b"hsm-export-unique-kek-v1",
        }
    }
}

/// Verify-and-authorize collaborator
pub trait Authorizer: Send + Sync {
    fn authorize(&self, purpose: AuthPurpose, signed_message: &[u8]) -> bool;
}

/// Rejects every message
pub struct DenyAll;

impl Authorizer for DenyAll {
    fn authorize(&self, _purpose: AuthPurpose, _signed_message: &[u8]) -> bool {
        false
    }
}

/// HMAC-SHA256 authority sharing a secret with the signer
pub struct HmacAuthority {
    secret: Vec<u8>,
}

impl HmacAuthority {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self) -> Hmac<Sha256> {
        // HMAC accepts keys of any length
        match <Hmac<Sha256> as Mac>::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => unreachable!("HMAC key length is unrestricted"),
        }
    }

    /// Produce the message authorizing `purpose`
    pub fn sign(&self, purpose: AuthPurpose) -> Vec<u8> {
        let mut mac = self.mac();
        mac.update(purpose.label());
        mac.finalize().into_bytes().to_vec()
    }
}

impl Authorizer for HmacAuthority {
    fn authorize(&self, purpose: AuthPurpose, signed_message: &[u8]) -> bool {
        let mut mac = self.mac();
        mac.update(purpose.label());
        mac.verify_slice(signed_message).is_ok()
    }
}
