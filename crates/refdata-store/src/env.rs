use std::fs;
use std::path::{Path, PathBuf};

use redb::{
    Database, ReadOnlyTable, ReadTransaction, ReadableTable, ReadableTableMetadata, Table,
    TableDefinition, WriteTransaction,
};
use tracing::debug;

use crate::error::StoreResult;

/// Every index is a byte-keyed, byte-valued table.
pub type BytesTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Read access to a byte table, from either a read or a write transaction.
pub trait BytesRead: ReadableTable<&'static [u8], &'static [u8]> {}

impl<T: ReadableTable<&'static [u8], &'static [u8]>> BytesRead for T {}

/// A transaction that byte tables can be read through.
///
/// Lets lookups run unchanged inside a loader's write transaction (seeing
/// its uncommitted puts) or inside a reader's snapshot.
pub trait TxnRead {
    type Table<'t>: BytesRead
    where
        Self: 't;

    fn open_bytes(&self, table: BytesTable) -> StoreResult<Self::Table<'_>>;
}

impl TxnRead for ReadTransaction {
    type Table<'t> = ReadOnlyTable<&'static [u8], &'static [u8]>;

    fn open_bytes(&self, table: BytesTable) -> StoreResult<Self::Table<'_>> {
        Ok(self.open_table(table)?)
    }
}

impl TxnRead for WriteTransaction {
    type Table<'t> = Table<'t, &'static [u8], &'static [u8]>;

    fn open_bytes(&self, table: BytesTable) -> StoreResult<Self::Table<'_>> {
        Ok(self.open_table(table)?)
    }
}

/// MapDefinition -> UID.
pub const MAP_UID_FORWARD: BytesTable = TableDefinition::new("MapUidForward");
/// UID -> MapDefinition.
pub const MAP_UID_REVERSE: BytesTable = TableDefinition::new("MapUidReverse");
/// ValueStoreKey -> serialized value bytes.
pub const VALUE_STORE: BytesTable = TableDefinition::new("ValueStore");
/// ValueStoreKey -> type id and reference count.
pub const VALUE_STORE_META: BytesTable = TableDefinition::new("ValueStoreMeta");
/// (UID, key) -> ValueStoreKey.
pub const KEY_VALUE_STORE: BytesTable = TableDefinition::new("KeyValueStore");
/// (UID, range) -> ValueStoreKey.
pub const RANGE_STORE: BytesTable = TableDefinition::new("RangeStore");
/// RefStreamDefinition -> ProcessingInfo.
pub const PROCESSING_INFO: BytesTable = TableDefinition::new("ProcessingInfo");

pub const ALL_TABLES: [BytesTable; 7] = [
    MAP_UID_FORWARD,
    MAP_UID_REVERSE,
    VALUE_STORE,
    VALUE_STORE_META,
    KEY_VALUE_STORE,
    RANGE_STORE,
    PROCESSING_INFO,
];

/// The shared transactional environment holding every index.
///
/// redb admits one write transaction at a time: `begin_write` blocks while
/// another is live. Readers see the last committed state and never block.
pub struct RefDataEnv {
    db: Database,
    path: PathBuf,
}

impl RefDataEnv {
    /// Open (or create) the database file and make sure every table exists.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        for table in ALL_TABLES {
            write_txn.open_table(table)?;
        }
        write_txn.commit()?;

        debug!(path = %path.display(), "opened reference data environment");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    pub fn begin_write(&self) -> StoreResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    pub fn begin_read(&self) -> StoreResult<ReadTransaction> {
        Ok(self.db.begin_read()?)
    }

    /// Number of entries in the given table, as of the last commit.
    pub fn entry_count(&self, table: BytesTable) -> StoreResult<u64> {
        let read_txn = self.begin_read()?;
        table_len(&read_txn, table)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Number of entries in `table` as seen by `txn`.
pub fn table_len<R: TxnRead>(txn: &R, table: BytesTable) -> StoreResult<u64> {
    Ok(txn.open_bytes(table)?.len()?)
}

/// Collect the keys of every entry whose key starts with `prefix`.
pub(crate) fn keys_with_prefix<T: BytesRead>(table: &T, prefix: &[u8]) -> StoreResult<Vec<Vec<u8>>> {
    let mut keys = Vec::new();
    for item in table.range(prefix..)? {
        let (key, _) = item?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        keys.push(key.to_vec());
    }
    Ok(keys)
}

/// Collect every entry whose key starts with `prefix`.
pub(crate) fn entries_with_prefix<T: BytesRead>(
    table: &T,
    prefix: &[u8],
) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = Vec::new();
    for item in table.range(prefix..)? {
        let (key, value) = item?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        entries.push((key.to_vec(), value.value().to_vec()));
    }
    Ok(entries)
}
