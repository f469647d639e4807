use std::fmt;

use redb::{ReadableTable, TableHandle, WriteTransaction};
use refdata_types::{KeyRange, Uid};

use crate::env::{entries_with_prefix, keys_with_prefix, table_len, BytesTable, TxnRead, KEY_VALUE_STORE, RANGE_STORE};
use crate::error::StoreResult;
use crate::keys::{KeyValueStoreKey, RangeStoreKey, ValueStoreKey};

/// An index from (map UID, lookup key) to the [`ValueStoreKey`] holding
/// the entry's value.
///
/// The exact-key and range stores differ only in their key type and layout;
/// everything that works on encoded keys is shared here.
pub trait EntryStore {
    /// The lookup key within one map.
    type Key: ?Sized;

    fn table(&self) -> BytesTable;

    /// Append the encoded key for `key` in map `map_uid` to `buf`.
    fn write_key(&self, map_uid: Uid, key: &Self::Key, buf: &mut Vec<u8>) -> StoreResult<()>;

    fn get_value_key<R: TxnRead>(&self, txn: &R, key: &[u8]) -> StoreResult<Option<ValueStoreKey>> {
        let table = txn.open_bytes(self.table())?;
        let value_key = match table.get(key)? {
            Some(value) => Some(ValueStoreKey::from_bytes(value.value())?),
            None => None,
        };
        Ok(value_key)
    }

    fn put_value_key(&self, txn: &WriteTransaction, key: &[u8], value_key: &ValueStoreKey) -> StoreResult<()> {
        let mut table = txn.open_table(self.table())?;
        table.insert(key, value_key.to_bytes().as_slice())?;
        Ok(())
    }

    /// Returns `true` if an entry was removed.
    fn delete(&self, txn: &WriteTransaction, key: &[u8]) -> StoreResult<bool> {
        let mut table = txn.open_table(self.table())?;
        let removed = table.remove(key)?.is_some();
        Ok(removed)
    }

    /// Every entry of one map as (encoded key, value key).
    fn entries_for_map<R: TxnRead>(&self, txn: &R, map_uid: Uid) -> StoreResult<Vec<(Vec<u8>, ValueStoreKey)>> {
        let table = txn.open_bytes(self.table())?;
        entries_with_prefix(&table, map_uid.as_bytes())?
            .into_iter()
            .map(|(key, value)| Ok((key, ValueStoreKey::from_bytes(&value)?)))
            .collect()
    }

    fn contains_map<R: TxnRead>(&self, txn: &R, map_uid: Uid) -> StoreResult<bool> {
        let table = txn.open_bytes(self.table())?;
        let found = match table.range(map_uid.as_bytes().as_slice()..)?.next() {
            Some(item) => item?.0.value().starts_with(map_uid.as_bytes()),
            None => false,
        };
        Ok(found)
    }

    fn map_entry_count<R: TxnRead>(&self, txn: &R, map_uid: Uid) -> StoreResult<usize> {
        let table = txn.open_bytes(self.table())?;
        Ok(keys_with_prefix(&table, map_uid.as_bytes())?.len())
    }

    fn entry_count<R: TxnRead>(&self, txn: &R) -> StoreResult<u64> {
        table_len(txn, self.table())
    }
}

/// Exact-key index: (map UID, string key) -> value key.
#[derive(Clone, Copy)]
pub struct KeyValueStoreDb {
    table: BytesTable,
}

impl Default for KeyValueStoreDb {
    fn default() -> Self {
        Self { table: KEY_VALUE_STORE }
    }
}

impl fmt::Debug for KeyValueStoreDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyValueStoreDb")
            .field("table", &self.table.name())
            .finish()
    }
}

impl EntryStore for KeyValueStoreDb {
    type Key = str;

    fn table(&self) -> BytesTable {
        self.table
    }

    fn write_key(&self, map_uid: Uid, key: &str, buf: &mut Vec<u8>) -> StoreResult<()> {
        KeyValueStoreKey::new(map_uid, key).write_to(buf);
        Ok(())
    }
}

/// Range index: (map UID, `[from, to)`) -> value key.
#[derive(Clone, Copy)]
pub struct RangeStoreDb {
    table: BytesTable,
}

impl Default for RangeStoreDb {
    fn default() -> Self {
        Self { table: RANGE_STORE }
    }
}

impl fmt::Debug for RangeStoreDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeStoreDb")
            .field("table", &self.table.name())
            .finish()
    }
}

impl EntryStore for RangeStoreDb {
    type Key = KeyRange;

    fn table(&self) -> BytesTable {
        self.table
    }

    fn write_key(&self, map_uid: Uid, key: &KeyRange, buf: &mut Vec<u8>) -> StoreResult<()> {
        RangeStoreKey::new(map_uid, *key).write_to(buf)
    }
}

impl RangeStoreDb {
    /// Value key of the range in map `map_uid` that contains `key`.
    ///
    /// Ranges sort by `from` then `to`, so scanning backwards from the
    /// greatest possible key starting at `key` visits every range with
    /// `from <= key`, nearest first. Where ranges overlap, the one with the
    /// greatest `from` (then greatest `to`) wins.
    pub fn find_containing<R: TxnRead>(&self, txn: &R, map_uid: Uid, key: i64) -> StoreResult<Option<ValueStoreKey>> {
        let table = txn.open_bytes(self.table)?;
        let upper = RangeStoreKey::search_upper_bound(map_uid, key)?;
        for item in table.range(..=upper.as_slice())?.rev() {
            let (entry_key, value) = item?;
            let entry_key = entry_key.value();
            if !entry_key.starts_with(map_uid.as_bytes()) {
                break;
            }
            if RangeStoreKey::from_bytes(entry_key)?.range.contains(key) {
                return Ok(Some(ValueStoreKey::from_bytes(value.value())?));
            }
        }
        Ok(None)
    }
}
