//! Error taxonomy shared by every HSM operation
//!
//! Each API call returns exactly one `HsmError` on failure. `code()` yields the
//! numeric value the firmware contract assigns to the kind; success is `NO_ERROR`.

use crate::engine::EngineError;
use crate::handle::Handle;
use crate::nvm::NvmError;

/// Numeric code of a successful call
pub const NO_ERROR: u8 = 0x00;

/// Result alias used across the crate
pub type HsmResult<T> = Result<T, HsmError>;

/// HSM error kinds
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HsmError {
    #[error("Invalid or unknown message: {0}")]
    InvalidMessage(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Unknown identifier: {0:#x}")]
    UnknownId(u32),

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),

    #[error("NVM error: {0}")]
    NvmError(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Unknown handle: {0}")]
    UnknownHandle(Handle),

    #[error("Unknown key store: {0}")]
    UnknownKeyStore(u32),

    #[error("Key store authentication failed")]
    KeyStoreAuth,

    #[error("Key store error: {0}")]
    KeyStoreError(String),

    #[error("Identifier conflict: {0}")]
    IdConflict(String),

    #[error("RNG not started")]
    RngNotStarted,

    #[error("Command not supported: {0}")]
    CmdNotSupported(String),

    #[error("Invalid lifecycle: {0}")]
    InvalidLifecycle(String),

    #[error("Key store {0} already exists with the same attributes")]
    KeyStoreConflict(u32),

    #[error("Key store monotonic counter exhausted")]
    KeyStoreCounter,

    #[error("Feature not supported: {0}")]
    FeatureNotSupported(String),

    #[error("Self test failure: {0}")]
    SelfTestFailure(String),

    #[error("HSM not ready")]
    NotReadyRating,

    #[error("Feature disabled: {0}")]
    FeatureDisabled(String),

    #[error("General error: {0}")]
    GeneralError(String),
}

impl HsmError {
    /// Numeric code of this error kind
    pub fn code(&self) -> u8 {
        match self {
            HsmError::InvalidMessage(_) => 0x01,
            HsmError::InvalidAddress(_) => 0x02,
            HsmError::UnknownId(_) => 0x03,
            HsmError::InvalidParam(_) => 0x04,
            HsmError::NvmError(_) => 0x05,
            HsmError::OutOfMemory(_) => 0x06,
            HsmError::UnknownHandle(_) => 0x07,
            HsmError::UnknownKeyStore(_) => 0x08,
            HsmError::KeyStoreAuth => 0x09,
            HsmError::KeyStoreError(_) => 0x0A,
            HsmError::IdConflict(_) => 0x0B,
            HsmError::RngNotStarted => 0x0C,
            HsmError::CmdNotSupported(_) => 0x0D,
            HsmError::InvalidLifecycle(_) => 0x0E,
            HsmError::KeyStoreConflict(_) => 0x0F,
            HsmError::KeyStoreCounter => 0x10,
            HsmError::FeatureNotSupported(_) => 0x11,
            HsmError::SelfTestFailure(_) => 0x12,
            HsmError::NotReadyRating => 0x13,
            HsmError::FeatureDisabled(_) => 0x14,
            HsmError::GeneralError(_) => 0xFF,
        }
    }

    pub(crate) fn param(msg: impl Into<String>) -> Self {
        HsmError::InvalidParam(msg.into())
    }

    pub(crate) fn lifecycle(msg: impl Into<String>) -> Self {
        HsmError::InvalidLifecycle(msg.into())
    }
}

impl From<EngineError> for HsmError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::RngNotStarted => HsmError::RngNotStarted,
            EngineError::SelfTest(msg) => HsmError::SelfTestFailure(msg),
            EngineError::Unsupported(msg) => HsmError::FeatureNotSupported(msg),
            EngineError::InvalidInput(msg) => HsmError::InvalidParam(msg),
            EngineError::AuthenticationFailed => {
                HsmError::GeneralError("authentication tag mismatch".into())
            }
            EngineError::Failure(msg) => HsmError::GeneralError(msg),
        }
    }
}

impl From<NvmError> for HsmError {
    fn from(err: NvmError) -> Self {
        HsmError::NvmError(err.to_string())
    }
}
