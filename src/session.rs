//! Session parameters

use crate::error::{HsmError, HsmResult};
use crate::flags::SessionMode;
use serde::{Deserialize, Serialize};

/// Scheduling priority of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Priority {
    #[default]
    Low,
    High,
}

impl Priority {
    pub fn from_raw(raw: u8) -> HsmResult<Self> {
        match raw {
            0 => Ok(Priority::Low),
            1 => Ok(Priority::High),
            other => Err(HsmError::InvalidParam(format!("session priority {:#x}", other))),
        }
    }
}

/// Arguments of `open_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    pub priority: Priority,
    pub mode: SessionMode,
}

impl SessionConfig {
    pub fn new(priority: Priority, mode: SessionMode) -> Self {
        Self { priority, mode }
    }

    /// Parse the raw priority byte and operating mode bitmap
    pub fn from_raw(priority: u8, mode: u8) -> HsmResult<Self> {
        Ok(Self {
            priority: Priority::from_raw(priority)?,
            mode: SessionMode::from_raw(mode)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_raw() {
        let config = SessionConfig::from_raw(1, 0x10).unwrap();
        assert_eq!(config.priority, Priority::High);
        assert_eq!(config.mode, SessionMode::NO_KEY_STORE);
        assert!(matches!(SessionConfig::from_raw(2, 0), Err(HsmError::InvalidParam(_))));
        assert!(matches!(SessionConfig::from_raw(0, 1 << 2), Err(HsmError::InvalidParam(_))));
    }
}
