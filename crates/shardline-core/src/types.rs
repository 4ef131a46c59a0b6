//! Primitive value types shared across the crate

use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::codec::{self, Pack};
use crate::error::{Error, Result};

// ── Digest ─────────────────────────────────────────────

/// 32-byte SHA-256 digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; 32]);

/// Transaction identifiers are digests of the packed transaction
pub type TransactionId = Digest;

/// Block identifiers
pub type BlockId = Digest;

impl Digest {
    pub fn hash(data: &[u8]) -> Self {
        Digest(Sha256::digest(data).into())
    }

    /// Digest of the packed encoding of `value`
    pub fn of<T: Pack + ?Sized>(value: &T) -> Self {
        Self::hash(&codec::pack(value))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Little-endian 64-bit word at `index` (0..4)
    pub fn word(&self, index: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[index * 8..index * 8 + 8]);
        u64::from_le_bytes(buf)
    }
}

/// Incremental SHA-256 writer, used where hashing must interleave with
/// deadline checks
#[derive(Default)]
pub struct DigestWriter(Sha256);

impl DigestWriter {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finish(self) -> Digest {
        Digest(self.0.finalize().into())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::Codec(format!("invalid digest: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Codec("digest must be 32 bytes".into()))?;
        Ok(Digest(arr))
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Time ───────────────────────────────────────────────

/// Signed duration in microseconds
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Microseconds(pub i64);

impl Microseconds {
    pub const fn seconds(s: i64) -> Self {
        Microseconds(s * 1_000_000)
    }

    pub const fn millis(ms: i64) -> Self {
        Microseconds(ms * 1_000)
    }

    pub const fn count(&self) -> i64 {
        self.0
    }

    pub const fn to_seconds(&self) -> i64 {
        self.0 / 1_000_000
    }
}

impl Add for Microseconds {
    type Output = Microseconds;

    fn add(self, rhs: Microseconds) -> Microseconds {
        Microseconds(self.0.saturating_add(rhs.0))
    }
}

/// Microseconds since the Unix epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimePoint(pub i64);

impl TimePoint {
    pub const fn from_seconds(s: i64) -> Self {
        TimePoint(s * 1_000_000)
    }

    pub const fn time_since_epoch(&self) -> Microseconds {
        Microseconds(self.0)
    }

    pub const fn sec_since_epoch(&self) -> u32 {
        (self.0 / 1_000_000) as u32
    }
}

impl Add<Microseconds> for TimePoint {
    type Output = TimePoint;

    fn add(self, rhs: Microseconds) -> TimePoint {
        TimePoint(self.0.saturating_add(rhs.0))
    }
}

impl Sub for TimePoint {
    type Output = Microseconds;

    fn sub(self, rhs: TimePoint) -> Microseconds {
        Microseconds(self.0.saturating_sub(rhs.0))
    }
}

/// Seconds since the Unix epoch, the precision of transaction expirations
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TimePointSec(pub u32);

impl TimePointSec {
    pub const fn sec_since_epoch(&self) -> u32 {
        self.0
    }
}

impl From<TimePoint> for TimePointSec {
    fn from(tp: TimePoint) -> Self {
        TimePointSec(tp.sec_since_epoch())
    }
}

impl From<TimePointSec> for TimePoint {
    fn from(tp: TimePointSec) -> Self {
        TimePoint::from_seconds(tp.0 as i64)
    }
}

impl Add<Microseconds> for TimePointSec {
    type Output = TimePointSec;

    fn add(self, rhs: Microseconds) -> TimePointSec {
        TimePointSec((self.0 as i64 + rhs.to_seconds()).clamp(0, u32::MAX as i64) as u32)
    }
}

// ── Serde helpers ──────────────────────────────────────

/// Hex encoding for opaque byte payloads in JSON
pub mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Hex encoding for lists of opaque byte payloads
pub mod hex_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(items: &[Vec<u8>], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(items.iter().map(hex::encode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<Vec<u8>>, D::Error> {
        let items = Vec::<String>::deserialize(deserializer)?;
        items
            .into_iter()
            .map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
