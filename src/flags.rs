//! Typed flag sets for every bitmap argument
//!
//! Raw words coming from callers are parsed with `from_raw`, which rejects any bit
//! outside the named set. Mutual-exclusion rules live next to each set.

use crate::error::{HsmError, HsmResult};
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

macro_rules! raw_parser {
    ($name:ident, $bits:ty, $what:expr) => {
        impl $name {
            /// Parse a raw word, rejecting reserved bits
            pub fn from_raw(raw: $bits) -> HsmResult<Self> {
                Self::from_bits(raw).ok_or_else(|| {
                    HsmError::InvalidParam(format!("reserved {} bits set in {:#x}", $what, raw))
                })
            }
        }
    };
}

bitflags! {
    /// Operating mode of a session
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SessionMode: u8 {
        /// Only FIPS approved operations are authorized in the session
        const FIPS_ONLY = 1 << 0;
        /// No other session may be open on the enclave at the same time
        const EXCLUSIVE = 1 << 1;
        const LOW_LATENCY = 1 << 3;
        /// The session never attaches a key store
        const NO_KEY_STORE = 1 << 4;
    }
}
raw_parser!(SessionMode, u8, "session mode");

bitflags! {
    /// Attribute bitmap of a key
    ///
    /// Absence of `TRANSIENT` means the key is persistent.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KeyInfo: u16 {
        /// Can be used but never updated or deleted
        const PERMANENT = 1 << 0;
        /// Lives in memory only, vanishes when the key store closes
        const TRANSIENT = 1 << 1;
        /// Eligible as input of butterfly expansion and key derivation
        const MASTER = 1 << 2;
        /// Only usable to unwrap imported keys
        const KEK = 1 << 3;
    }
}
raw_parser!(KeyInfo, u16, "key info");

impl KeyInfo {
    pub fn persistence(&self) -> Persistence {
        if self.contains(KeyInfo::TRANSIENT) {
            Persistence::Transient
        } else {
            Persistence::Persistent
        }
    }
}

/// Persistence class shared by every key of one group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Persistence {
    Persistent,
    Transient,
}

/// Create-or-update choice carried by the key writing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Update,
}

fn write_mode(create: bool, update: bool, what: &str) -> HsmResult<WriteMode> {
    match (create, update) {
        (true, false) => Ok(WriteMode::Create),
        (false, true) => Ok(WriteMode::Update),
        _ => Err(HsmError::InvalidParam(format!(
            "{} requires exactly one of CREATE and UPDATE",
            what
        ))),
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KeyGenFlags: u8 {
        const UPDATE = 1 << 0;
        const CREATE = 1 << 1;
        /// Complete only once the owning group has been written to NVM
        const STRICT_OPERATION = 1 << 7;
    }
}
raw_parser!(KeyGenFlags, u8, "key generation");

impl KeyGenFlags {
    pub fn mode(&self) -> HsmResult<WriteMode> {
        write_mode(
            self.contains(KeyGenFlags::CREATE),
            self.contains(KeyGenFlags::UPDATE),
            "key generation",
        )
    }

    pub fn strict(&self) -> bool {
        self.contains(KeyGenFlags::STRICT_OPERATION)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ManageKeyFlags: u8 {
        const IMPORT_UPDATE = 1 << 0;
        const IMPORT_CREATE = 1 << 1;
        const DELETE = 1 << 2;
        /// Wrapped material is encrypted with the part-unique root KEK
        const PART_UNIQUE_ROOT_KEK = 1 << 3;
        /// Wrapped material is encrypted with the common root KEK
        const COMMON_ROOT_KEK = 1 << 4;
        const STRICT_OPERATION = 1 << 7;
    }
}
raw_parser!(ManageKeyFlags, u8, "manage key");

/// Operation selected by a `ManageKeyFlags` word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManageKeyOp {
    Import(WriteMode),
    Delete,
}

impl ManageKeyFlags {
    pub fn op(&self) -> HsmResult<ManageKeyOp> {
        let selected = [
            ManageKeyFlags::IMPORT_CREATE,
            ManageKeyFlags::IMPORT_UPDATE,
            ManageKeyFlags::DELETE,
        ];
        match selected.iter().filter(|f| self.contains(**f)).count() {
            1 => {}
            _ => {
                return Err(HsmError::param(
                    "manage key requires exactly one of IMPORT_CREATE, IMPORT_UPDATE and DELETE",
                ))
            }
        }
        if self.contains(ManageKeyFlags::PART_UNIQUE_ROOT_KEK | ManageKeyFlags::COMMON_ROOT_KEK) {
            return Err(HsmError::param("both root KEK selectors set"));
        }
        if self.contains(ManageKeyFlags::DELETE) {
            Ok(ManageKeyOp::Delete)
        } else if self.contains(ManageKeyFlags::IMPORT_CREATE) {
            Ok(ManageKeyOp::Import(WriteMode::Create))
        } else {
            Ok(ManageKeyOp::Import(WriteMode::Update))
        }
    }

    /// Root KEK named by the flags, `None` when a stored KEK is used
    pub fn root_kek(&self) -> Option<RootKek> {
        if self.contains(ManageKeyFlags::COMMON_ROOT_KEK) {
            Some(RootKek::Common)
        } else if self.contains(ManageKeyFlags::PART_UNIQUE_ROOT_KEK) {
            Some(RootKek::PartUnique)
        } else {
            None
        }
    }

    pub fn strict(&self) -> bool {
        self.contains(ManageKeyFlags::STRICT_OPERATION)
    }
}

/// Which on-chip root key encryption key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootKek {
    Common,
    PartUnique,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KeyGroupFlags: u8 {
        const CACHE_LOCKDOWN = 1 << 0;
        const CACHE_UNLOCK = 1 << 1;
        const DELETE = 1 << 2;
        const STRICT_OPERATION = 1 << 7;
    }
}
raw_parser!(KeyGroupFlags, u8, "key group");

/// Cache or lifecycle action on a key group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyGroupOp {
    Lockdown,
    Unlock,
    Delete,
}

impl KeyGroupFlags {
    pub fn op(&self) -> HsmResult<KeyGroupOp> {
        let action = *self - KeyGroupFlags::STRICT_OPERATION;
        if action == KeyGroupFlags::CACHE_LOCKDOWN {
            Ok(KeyGroupOp::Lockdown)
        } else if action == KeyGroupFlags::CACHE_UNLOCK {
            Ok(KeyGroupOp::Unlock)
        } else if action == KeyGroupFlags::DELETE {
            Ok(KeyGroupOp::Delete)
        } else {
            Err(HsmError::param(
                "key group management requires exactly one of CACHE_LOCKDOWN, CACHE_UNLOCK and DELETE",
            ))
        }
    }

    pub fn strict(&self) -> bool {
        self.contains(KeyGroupFlags::STRICT_OPERATION)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ButterflyFlags: u8 {
        const UPDATE = 1 << 0;
        const CREATE = 1 << 1;
        /// Explicit certificate; implicit when clear
        const EXPLICIT_CERTIF = 1 << 2;
        const STRICT_OPERATION = 1 << 7;
    }
}
raw_parser!(ButterflyFlags, u8, "butterfly key expansion");

impl ButterflyFlags {
    pub fn mode(&self) -> HsmResult<WriteMode> {
        write_mode(
            self.contains(ButterflyFlags::CREATE),
            self.contains(ButterflyFlags::UPDATE),
            "butterfly key expansion",
        )
    }

    pub fn strict(&self) -> bool {
        self.contains(ButterflyFlags::STRICT_OPERATION)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct KeyExchangeFlags: u8 {
        const UPDATE = 1 << 0;
        const CREATE = 1 << 1;
        /// Use a freshly generated key instead of a stored one
        const USE_EPHEMERAL = 1 << 2;
        const STRICT_OPERATION = 1 << 7;
    }
}
raw_parser!(KeyExchangeFlags, u8, "key exchange");

impl KeyExchangeFlags {
    pub fn mode(&self) -> HsmResult<WriteMode> {
        write_mode(
            self.contains(KeyExchangeFlags::CREATE),
            self.contains(KeyExchangeFlags::UPDATE),
            "key exchange",
        )
    }

    pub fn strict(&self) -> bool {
        self.contains(KeyExchangeFlags::STRICT_OPERATION)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct SignFlags: u8 {
        /// Input is the message, hashed by the HSM; a digest when clear
        const INPUT_MESSAGE = 1 << 0;
        const COMPRESSED_POINT = 1 << 1;
        /// Finalize with the artifact of a previous `prepare_signature`
        const LOW_LATENCY_SIGNATURE = 1 << 2;
    }
}
raw_parser!(SignFlags, u8, "signature generation");

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct VerifyFlags: u8 {
        const INPUT_MESSAGE = 1 << 0;
        const COMPRESSED_POINT = 1 << 1;
    }
}
raw_parser!(VerifyFlags, u8, "signature verification");

bitflags! {
    /// FIPS mode bitfield reported by `get_info`
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FipsMode: u8 {
        /// Part is running in FIPS approved mode
        const APPROVED = 1 << 0;
        /// Part is FIPS certified
        const CERTIFIED = 1 << 1;
    }
}
raw_parser!(FipsMode, u8, "FIPS mode");
