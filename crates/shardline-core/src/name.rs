//! Account and action names
//!
//! A `Name` is a 64-bit integer rendered as up to 13 characters drawn from
//! `.12345abcdefghijklmnopqrstuvwxyz`. The first 12 characters use 5 bits
//! each, most significant first; the 13th uses the low 4 bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const CHARMAP: &[u8; 32] = b".12345abcdefghijklmnopqrstuvwxyz";

/// 64-bit encoded account, action, permission or shard name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name(u64);

const fn symbol(c: u8) -> Option<u64> {
    match c {
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'.' => Some(0),
        _ => None,
    }
}

impl Name {
    pub const fn from_raw(value: u64) -> Self {
        Name(value)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Compile-time constructor for well-known names.
    ///
    /// Panics during const evaluation when `s` is not a valid name.
    pub const fn from_const(s: &str) -> Self {
        match Self::encode(s.as_bytes()) {
            Some(value) => Name(value),
            None => panic!("invalid name literal"),
        }
    }

    const fn encode(bytes: &[u8]) -> Option<u64> {
        if bytes.len() > 13 {
            return None;
        }
        let mut value: u64 = 0;
        let mut i = 0;
        while i < bytes.len() {
            let sym = match symbol(bytes[i]) {
                Some(sym) => sym,
                None => return None,
            };
            if i < 12 {
                value |= (sym & 0x1f) << (64 - 5 * (i + 1));
            } else {
                if sym > 0x0f {
                    return None;
                }
                value |= sym;
            }
            i += 1;
        }
        Some(value)
    }

    /// Length of the rendered form
    pub fn length(&self) -> usize {
        self.to_string().len()
    }

    /// Suffix after the last `.`, or the whole name
    pub fn suffix(&self) -> Name {
        let rendered = self.to_string();
        match rendered.rfind('.') {
            Some(pos) => rendered[pos + 1..].parse().unwrap_or(*self),
            None => *self,
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = [b'.'; 13];
        let mut tmp = self.0;
        for i in 0..13 {
            let (mask, shift) = if i == 0 { (0x0f, 4) } else { (0x1f, 5) };
            out[12 - i] = CHARMAP[(tmp & mask) as usize];
            tmp >>= shift;
        }
        let end = out.iter().rposition(|c| *c != b'.').map_or(0, |p| p + 1);
        // CHARMAP is ASCII
        f.write_str(std::str::from_utf8(&out[..end]).map_err(|_| fmt::Error)?)
    }
}

impl FromStr for Name {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value = Name::encode(s.as_bytes())
            .ok_or_else(|| Error::Codec(format!("invalid name '{}'", s)))?;
        let name = Name(value);
        if name.to_string() != s {
            return Err(Error::Codec(format!(
                "name not properly normalized (name: {}, normalized: {})",
                s, name
            )));
        }
        Ok(name)
    }
}

impl From<Name> for u64 {
    fn from(name: Name) -> u64 {
        name.0
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
