//! Canonical binary encoding
//!
//! Integers are little-endian, lengths and a few header fields use LEB128
//! `varuint32`, sequences are a length prefix followed by their elements.
//! Every digest in the system is taken over this encoding, so it must stay
//! byte-exact.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::name::Name;
use crate::types::{Digest, Microseconds, TimePoint, TimePointSec};

/// Types with a canonical binary encoding
pub trait Pack {
    fn pack(&self, out: &mut Vec<u8>);

    fn packed_size(&self) -> usize {
        let mut buf = Vec::new();
        self.pack(&mut buf);
        buf.len()
    }
}

/// Types decodable from their canonical binary encoding
pub trait Unpack: Sized {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self>;
}

pub fn pack<T: Pack + ?Sized>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    value.pack(&mut out);
    out
}

/// Decode `bytes`, requiring that the whole buffer is consumed
pub fn unpack<T: Unpack>(bytes: &[u8]) -> Result<T> {
    let mut stream = DataStream::new(bytes);
    let value = T::unpack(&mut stream)?;
    if !stream.is_empty() {
        return Err(Error::Codec(format!(
            "{} trailing bytes after decoding",
            stream.remaining()
        )));
    }
    Ok(value)
}

/// Read cursor over a byte slice
pub struct DataStream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DataStream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::Codec(format!(
                "unexpected end of stream: wanted {} bytes, {} left",
                len,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.read_bytes(N)?);
        Ok(arr)
    }
}

// ── varuint32 ──────────────────────────────────────────

/// LEB128-encoded unsigned 32-bit integer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VarUint32(pub u32);

impl Pack for VarUint32 {
    fn pack(&self, out: &mut Vec<u8>) {
        let mut v = self.0 as u64;
        loop {
            let mut b = (v & 0x7f) as u8;
            v >>= 7;
            if v > 0 {
                b |= 0x80;
            }
            out.push(b);
            if v == 0 {
                break;
            }
        }
    }
}

impl Unpack for VarUint32 {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        let mut v: u64 = 0;
        let mut shift = 0;
        loop {
            let [b] = stream.read_array::<1>()?;
            v |= ((b & 0x7f) as u64) << shift;
            shift += 7;
            if b & 0x80 == 0 {
                break;
            }
            if shift >= 35 {
                return Err(Error::Codec("varuint32 is too long".into()));
            }
        }
        let value = u32::try_from(v).map_err(|_| Error::Codec("varuint32 overflow".into()))?;
        Ok(VarUint32(value))
    }
}

pub(crate) fn pack_len(len: usize, out: &mut Vec<u8>) {
    VarUint32(len as u32).pack(out);
}

fn unpack_len(stream: &mut DataStream<'_>) -> Result<usize> {
    Ok(VarUint32::unpack(stream)?.0 as usize)
}

// ── Scalars ────────────────────────────────────────────

macro_rules! impl_le_int {
    ($($ty:ty),*) => {
        $(
            impl Pack for $ty {
                fn pack(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn packed_size(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }

            impl Unpack for $ty {
                fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
                    Ok(<$ty>::from_le_bytes(stream.read_array()?))
                }
            }
        )*
    };
}

impl_le_int!(u8, u16, u32, u64, u128, i32, i64);

impl Pack for bool {
    fn pack(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }
}

impl Unpack for bool {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        match u8::unpack(stream)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::Codec(format!("invalid bool byte {}", other))),
        }
    }
}

impl Pack for Name {
    fn pack(&self, out: &mut Vec<u8>) {
        self.as_u64().pack(out);
    }
}

impl Unpack for Name {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Name::from_raw(u64::unpack(stream)?))
    }
}

impl Pack for Digest {
    fn pack(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Unpack for Digest {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Digest(stream.read_array()?))
    }
}

impl Pack for TimePoint {
    fn pack(&self, out: &mut Vec<u8>) {
        self.0.pack(out);
    }
}

impl Unpack for TimePoint {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(TimePoint(i64::unpack(stream)?))
    }
}

impl Pack for TimePointSec {
    fn pack(&self, out: &mut Vec<u8>) {
        self.0.pack(out);
    }
}

impl Unpack for TimePointSec {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(TimePointSec(u32::unpack(stream)?))
    }
}

impl Pack for Microseconds {
    fn pack(&self, out: &mut Vec<u8>) {
        self.0.pack(out);
    }
}

impl Unpack for Microseconds {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok(Microseconds(i64::unpack(stream)?))
    }
}

// ── Containers ─────────────────────────────────────────

impl Pack for str {
    fn pack(&self, out: &mut Vec<u8>) {
        pack_len(self.len(), out);
        out.extend_from_slice(self.as_bytes());
    }
}

impl Pack for String {
    fn pack(&self, out: &mut Vec<u8>) {
        self.as_str().pack(out);
    }
}

impl Unpack for String {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        let len = unpack_len(stream)?;
        let bytes = stream.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::Codec(format!("invalid utf-8: {}", e)))
    }
}

impl<T: Pack> Pack for [T] {
    fn pack(&self, out: &mut Vec<u8>) {
        pack_len(self.len(), out);
        for item in self {
            item.pack(out);
        }
    }
}

impl<T: Pack> Pack for Vec<T> {
    fn pack(&self, out: &mut Vec<u8>) {
        self.as_slice().pack(out);
    }
}

impl<T: Unpack> Unpack for Vec<T> {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        let len = unpack_len(stream)?;
        // never trust the prefix for preallocation
        let mut items = Vec::with_capacity(len.min(stream.remaining()));
        for _ in 0..len {
            items.push(T::unpack(stream)?);
        }
        Ok(items)
    }
}

impl<T: Pack> Pack for Option<T> {
    fn pack(&self, out: &mut Vec<u8>) {
        match self {
            Some(value) => {
                out.push(1);
                value.pack(out);
            }
            None => out.push(0),
        }
    }
}

impl<T: Unpack> Unpack for Option<T> {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        if bool::unpack(stream)? {
            Ok(Some(T::unpack(stream)?))
        } else {
            Ok(None)
        }
    }
}

impl<A: Pack, B: Pack> Pack for (A, B) {
    fn pack(&self, out: &mut Vec<u8>) {
        self.0.pack(out);
        self.1.pack(out);
    }
}

impl<A: Unpack, B: Unpack> Unpack for (A, B) {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        Ok((A::unpack(stream)?, B::unpack(stream)?))
    }
}

impl<K: Pack, V: Pack> Pack for BTreeMap<K, V> {
    fn pack(&self, out: &mut Vec<u8>) {
        pack_len(self.len(), out);
        for (k, v) in self {
            k.pack(out);
            v.pack(out);
        }
    }
}

impl<K: Unpack + Ord, V: Unpack> Unpack for BTreeMap<K, V> {
    fn unpack(stream: &mut DataStream<'_>) -> Result<Self> {
        let len = unpack_len(stream)?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let k = K::unpack(stream)?;
            let v = V::unpack(stream)?;
            map.insert(k, v);
        }
        Ok(map)
    }
}

impl<T: Pack> Pack for BTreeSet<T> {
    fn pack(&self, out: &mut Vec<u8>) {
        pack_len(self.len(), out);
        for item in self {
            item.pack(out);
        }
    }
}
