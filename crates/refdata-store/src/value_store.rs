use redb::{ReadableTable, WriteTransaction};
use refdata_types::{TypedBytes, UnsignedBytes};
use tracing::trace;

use crate::env::{entries_with_prefix, BytesRead, BytesTable, TxnRead, VALUE_STORE, VALUE_STORE_META};
use crate::error::{StoreError, StoreResult};
use crate::hasher::ValueHasher;
use crate::keys::ValueStoreKey;

const REF_COUNT_CODEC: UnsignedBytes = UnsignedBytes::THREE;

/// Companion record of a stored value: its type and how many entries use it.
///
/// ```text
/// [type id: 1][reference count: 3]
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValueStoreMeta {
    pub type_id: u8,
    pub reference_count: u32,
}

impl ValueStoreMeta {
    pub const LEN: usize = 4;

    pub fn new(type_id: u8, reference_count: u32) -> Self {
        Self {
            type_id,
            reference_count,
        }
    }

    pub fn to_bytes(&self) -> StoreResult<[u8; Self::LEN]> {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.type_id;
        REF_COUNT_CODEC.put(&mut buf[1..], u64::from(self.reference_count))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        if bytes.len() != Self::LEN {
            return Err(StoreError::Corruption(format!(
                "value meta must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let reference_count = REF_COUNT_CODEC.get(&bytes[1..])? as u32;
        Ok(Self::new(bytes[0], reference_count))
    }

    /// Copy with one more reference, failing once the 3-byte count is full.
    pub fn incremented(&self, key: &ValueStoreKey) -> StoreResult<Self> {
        let next = u64::from(self.reference_count) + 1;
        if next > REF_COUNT_CODEC.max_value() {
            return Err(StoreError::ReferenceCountOverflow(key.to_string()));
        }
        Ok(Self::new(self.type_id, next as u32))
    }
}

/// Content-addressed, reference-counted value storage.
///
/// Identical `{type id, bytes}` payloads are stored once. The value table
/// holds the bytes and the meta table holds [`ValueStoreMeta`] under the
/// same [`ValueStoreKey`]; the two are always written and deleted together.
#[derive(Clone, Copy)]
pub struct ValueStore {
    values: BytesTable,
    meta: BytesTable,
    hasher: &'static ValueHasher,
}

impl Default for ValueStore {
    fn default() -> Self {
        Self {
            values: VALUE_STORE,
            meta: VALUE_STORE_META,
            hasher: &ValueHasher::VALUE,
        }
    }
}

impl std::fmt::Debug for ValueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValueStore")
            .field("hash_domain", &self.hasher.domain())
            .finish()
    }
}

impl ValueStore {
    /// Key of the stored copy of `value`, adding a reference to it.
    ///
    /// An identical stored value gains one reference. Otherwise the value is
    /// inserted with a single reference under the lowest unique id not yet
    /// taken by another value with the same hash.
    pub fn get_or_create_key(&self, txn: &WriteTransaction, value: &TypedBytes) -> StoreResult<ValueStoreKey> {
        let hash = self.hasher.hash(value);
        let mut values = txn.open_table(self.values)?;
        let mut meta = txn.open_table(self.meta)?;

        let mut next_free_id: u32 = 0;
        for (key_bytes, stored) in entries_with_prefix(&values, &ValueStoreKey::hash_prefix(hash))? {
            let key = ValueStoreKey::from_bytes(&key_bytes)?;
            let current = read_meta(&meta, &key)?.ok_or_else(|| missing_meta(&key))?;
            if current.type_id == value.type_id && stored == value.bytes {
                let updated = current.incremented(&key)?;
                meta.insert(key_bytes.as_slice(), updated.to_bytes()?.as_slice())?;
                trace!(key = ?key, references = updated.reference_count, "reused stored value");
                return Ok(key);
            }
            if u32::from(key.unique_id) == next_free_id {
                next_free_id += 1;
            }
        }

        let unique_id = u16::try_from(next_free_id).map_err(|_| StoreError::UniqueIdExhausted(hash))?;
        let key = ValueStoreKey::new(hash, unique_id);
        let key_bytes = key.to_bytes();
        values.insert(key_bytes.as_slice(), value.bytes.as_slice())?;
        meta.insert(
            key_bytes.as_slice(),
            ValueStoreMeta::new(value.type_id, 1).to_bytes()?.as_slice(),
        )?;
        trace!(key = ?key, bytes = value.len(), "stored new value");
        Ok(key)
    }

    /// Whether the value stored under `key` equals `value`.
    pub fn are_values_equal<R: TxnRead>(&self, txn: &R, key: &ValueStoreKey, value: &TypedBytes) -> StoreResult<bool> {
        let stored = self
            .get(txn, key)?
            .ok_or_else(|| StoreError::Corruption(format!("entry points at missing value {key}")))?;
        Ok(stored == *value)
    }

    /// Drop one reference to `key`, deleting the value with its last one.
    ///
    /// Returns `true` if the value was deleted.
    pub fn de_reference_or_delete_value(&self, txn: &WriteTransaction, key: &ValueStoreKey) -> StoreResult<bool> {
        let key_bytes = key.to_bytes();
        let mut meta = txn.open_table(self.meta)?;
        let current = read_meta(&meta, key)?.ok_or_else(|| missing_meta(key))?;

        if current.reference_count <= 1 {
            meta.remove(key_bytes.as_slice())?;
            let mut values = txn.open_table(self.values)?;
            if values.remove(key_bytes.as_slice())?.is_none() {
                return Err(StoreError::Corruption(format!("value {key} has meta but no value")));
            }
            trace!(key = ?key, "deleted value with last reference");
            Ok(true)
        } else {
            let updated = ValueStoreMeta::new(current.type_id, current.reference_count - 1);
            meta.insert(key_bytes.as_slice(), updated.to_bytes()?.as_slice())?;
            trace!(key = ?key, references = updated.reference_count, "dereferenced value");
            Ok(false)
        }
    }

    /// The stored value, looked up meta first.
    ///
    /// Meta without a value is corruption and is reported, never repaired.
    pub fn get<R: TxnRead>(&self, txn: &R, key: &ValueStoreKey) -> StoreResult<Option<TypedBytes>> {
        let meta = txn.open_bytes(self.meta)?;
        let Some(current) = read_meta(&meta, key)? else {
            return Ok(None);
        };
        let values = txn.open_bytes(self.values)?;
        let bytes = match values.get(key.to_bytes().as_slice())? {
            Some(value) => value.value().to_vec(),
            None => {
                return Err(StoreError::Corruption(format!("value {key} has meta but no value")));
            }
        };
        Ok(Some(TypedBytes::new(current.type_id, bytes)))
    }

    pub fn get_meta<R: TxnRead>(&self, txn: &R, key: &ValueStoreKey) -> StoreResult<Option<ValueStoreMeta>> {
        let meta = txn.open_bytes(self.meta)?;
        read_meta(&meta, key)
    }

    /// Number of distinct stored values; fails if value and meta disagree.
    pub fn get_entry_count<R: TxnRead>(&self, txn: &R) -> StoreResult<u64> {
        let values = crate::env::table_len(txn, self.values)?;
        let meta = crate::env::table_len(txn, self.meta)?;
        if values != meta {
            return Err(StoreError::Consistency(format!(
                "value store has {values} entries but value meta has {meta}"
            )));
        }
        Ok(values)
    }
}

fn read_meta<T: BytesRead>(table: &T, key: &ValueStoreKey) -> StoreResult<Option<ValueStoreMeta>> {
    let meta = match table.get(key.to_bytes().as_slice())? {
        Some(value) => Some(ValueStoreMeta::from_bytes(value.value())?),
        None => None,
    };
    Ok(meta)
}

fn missing_meta(key: &ValueStoreKey) -> StoreError {
    StoreError::Corruption(format!("value {key} has no meta entry"))
}
