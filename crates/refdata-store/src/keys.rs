//! Byte layouts of the index keys.
//!
//! ```text
//! KeyValueStoreKey: [uid: 4][utf8 key: N]
//! RangeStoreKey:    [uid: 4][from: 8][to: 8]
//! ValueStoreKey:    [value hash: 8][unique id: 2]
//! ```
//!
//! All integers are big-endian so byte order matches numeric order. Range
//! bounds are signed, so the sign bit is flipped before encoding.

use std::fmt;

use refdata_types::{KeyRange, Uid, UidRef, UnsignedBytes, UID_LEN};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

const BOUND_CODEC: UnsignedBytes = UnsignedBytes::EIGHT;
const BOUND_LEN: usize = 8;

/// Serialize a record with bincode.
pub fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Deserialize a bincode record.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Order-preserving encoding of a signed bound.
fn put_bound(buf: &mut Vec<u8>, value: i64) -> StoreResult<()> {
    let start = buf.len();
    buf.resize(start + BOUND_LEN, 0);
    BOUND_CODEC.put(&mut buf[start..], (value as u64) ^ (1 << 63))?;
    Ok(())
}

fn get_bound(bytes: &[u8]) -> StoreResult<i64> {
    Ok((BOUND_CODEC.get(bytes)? ^ (1 << 63)) as i64)
}

/// Key of the exact-key store: a map UID plus the lookup key string.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyValueStoreKey {
    pub map_uid: Uid,
    pub key: String,
}

impl KeyValueStoreKey {
    pub fn new(map_uid: Uid, key: impl Into<String>) -> Self {
        Self {
            map_uid,
            key: key.into(),
        }
    }

    /// Append the encoded key to `buf`.
    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.map_uid.as_bytes());
        buf.extend_from_slice(self.key.as_bytes());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(UID_LEN + self.key.len());
        self.write_to(&mut buf);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let map_uid = UidRef::wrap_prefix(bytes)?.to_uid();
        let key = std::str::from_utf8(&bytes[UID_LEN..])
            .map_err(|e| StoreError::InvalidKey(format!("lookup key is not UTF-8: {e}")))?;
        Ok(Self::new(map_uid, key))
    }
}

/// Key of the range store: a map UID plus a half-open numeric range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RangeStoreKey {
    pub map_uid: Uid,
    pub range: KeyRange,
}

impl RangeStoreKey {
    pub const LEN: usize = UID_LEN + 2 * BOUND_LEN;

    pub fn new(map_uid: Uid, range: KeyRange) -> Self {
        Self { map_uid, range }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> StoreResult<()> {
        buf.extend_from_slice(self.map_uid.as_bytes());
        put_bound(buf, self.range.from())?;
        put_bound(buf, self.range.to())
    }

    pub fn to_bytes(&self) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::LEN);
        self.write_to(&mut buf)?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != Self::LEN {
            return Err(StoreError::InvalidKey(format!(
                "range store key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let map_uid = UidRef::wrap_prefix(bytes)?.to_uid();
        let from = get_bound(&bytes[UID_LEN..])?;
        let to = get_bound(&bytes[UID_LEN + BOUND_LEN..])?;
        Ok(Self::new(map_uid, KeyRange::new(from, to)?))
    }

    /// Upper search bound for a point lookup: the greatest key of the map
    /// whose range starts at `key`.
    pub fn search_upper_bound(map_uid: Uid, key: i64) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::LEN);
        buf.extend_from_slice(map_uid.as_bytes());
        put_bound(&mut buf, key)?;
        put_bound(&mut buf, i64::MAX)?;
        Ok(buf)
    }
}

/// Address of a stored value: truncated content hash plus a collision
/// disambiguator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueStoreKey {
    pub value_hash: u64,
    pub unique_id: u16,
}

impl ValueStoreKey {
    pub const LEN: usize = 10;
    pub const HASH_LEN: usize = 8;

    pub fn new(value_hash: u64, unique_id: u16) -> Self {
        Self {
            value_hash,
            unique_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..Self::HASH_LEN].copy_from_slice(&self.value_hash.to_be_bytes());
        buf[Self::HASH_LEN..].copy_from_slice(&self.unique_id.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        let array: [u8; Self::LEN] = bytes.try_into().map_err(|_| {
            StoreError::InvalidKey(format!(
                "value store key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            ))
        })?;
        let mut hash = [0u8; Self::HASH_LEN];
        hash.copy_from_slice(&array[..Self::HASH_LEN]);
        Ok(Self::new(
            u64::from_be_bytes(hash),
            u16::from_be_bytes([array[8], array[9]]),
        ))
    }

    /// Prefix shared by every key with this hash.
    pub fn hash_prefix(value_hash: u64) -> [u8; Self::HASH_LEN] {
        value_hash.to_be_bytes()
    }
}

impl fmt::Debug for ValueStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueStoreKey({:016x}:{})", self.value_hash, self.unique_id)
    }
}

impl fmt::Display for ValueStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}
