//! Permission authorities

use serde::{Deserialize, Serialize};

use crate::action::PermissionLevel;
use crate::codec::{DataStream, Pack, Unpack};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyWeight {
    pub key: String,
    pub weight: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevelWeight {
    pub permission: PermissionLevel,
    pub weight: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitWeight {
    pub wait_sec: u32,
    pub weight: u16,
}

/// Weighted threshold over keys, delegated permissions and delays
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Authority {
    pub threshold: u32,
    #[serde(default)]
    pub keys: Vec<KeyWeight>,
    #[serde(default)]
    pub accounts: Vec<PermissionLevelWeight>,
    #[serde(default)]
    pub waits: Vec<WaitWeight>,
}

impl Authority {
    /// Single-key authority with threshold 1
    pub fn from_key(key: impl Into<String>) -> Self {
        Self {
            threshold: 1,
            keys: vec![KeyWeight {
                key: key.into(),
                weight: 1,
            }],
            accounts: Vec::new(),
            waits: Vec::new(),
        }
    }

    /// Single delegated permission with threshold 1
    pub fn from_permission(permission: PermissionLevel) -> Self {
        Self {
            threshold: 1,
            keys: Vec::new(),
            accounts: vec![PermissionLevelWeight {
                permission,
                weight: 1,
            }],
            waits: Vec::new(),
        }
    }

    /// Threshold is reachable and no weight is zero
    pub fn validate(&self) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut total: u64 = 0;
        for weight in self
            .keys
            .iter()
            .map(|k| k.weight)
            .chain(self.accounts.iter().map(|a| a.weight))
            .chain(self.waits.iter().map(|w| w.weight))
        {
            if weight == 0 {
                return false;
            }
            total += weight as u64;
        }
        total >= self.threshold as u64
    }
}

impl Pack for KeyWeight {
    fn pack(&self, out: &mut Vec<u8>) {
        self.key.pack(out);
        self.weight.pack(out);
    }
}

impl Unpack for KeyWeight {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            key: String::unpack(stream)?,
            weight: u16::unpack(stream)?,
        })
    }
}

impl Pack for PermissionLevelWeight {
    fn pack(&self, out: &mut Vec<u8>) {
        self.permission.pack(out);
        self.weight.pack(out);
    }
}

impl Unpack for PermissionLevelWeight {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            permission: PermissionLevel::unpack(stream)?,
            weight: u16::unpack(stream)?,
        })
    }
}

impl Pack for WaitWeight {
    fn pack(&self, out: &mut Vec<u8>) {
        self.wait_sec.pack(out);
        self.weight.pack(out);
    }
}

impl Unpack for WaitWeight {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            wait_sec: u32::unpack(stream)?,
            weight: u16::unpack(stream)?,
        })
    }
}

impl Pack for Authority {
    fn pack(&self, out: &mut Vec<u8>) {
        self.threshold.pack(out);
        self.keys.pack(out);
        self.accounts.pack(out);
        self.waits.pack(out);
    }
}

impl Unpack for Authority {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Self {
            threshold: u32::unpack(stream)?,
            keys: Vec::unpack(stream)?,
            accounts: Vec::unpack(stream)?,
            waits: Vec::unpack(stream)?,
        })
    }
}
