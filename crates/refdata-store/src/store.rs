use std::time::Duration;

use redb::ReadTransaction;
use refdata_types::{
    now_ms, MapDefinition, ProcessingInfo, ProcessingState, RefDataValue, RefStreamDefinition, TypedBytes, Uid,
};
use tracing::{debug, error, info, warn};

use crate::config::ReferenceDataConfig;
use crate::consumer::ValueConsumerRegistry;
use crate::entry_store::{EntryStore, KeyValueStoreDb, RangeStoreDb};
use crate::env::RefDataEnv;
use crate::error::{StoreError, StoreResult};
use crate::keys::{KeyValueStoreKey, ValueStoreKey};
use crate::loader::RefDataLoader;
use crate::lock::{InterruptFlag, StripedLock};
use crate::map_uid::MapDefinitionUidStore;
use crate::pool::ByteBufferPool;
use crate::processing_info::ProcessingInfoDb;
use crate::value_store::ValueStore;

/// What a purge removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub streams: u64,
    pub maps: u64,
    pub entries: u64,
    pub values_deleted: u64,
    pub failures: u64,
}

impl PurgeCounts {
    fn add(&mut self, other: PurgeCounts) {
        self.streams += other.streams;
        self.maps += other.maps;
        self.entries += other.entries;
        self.values_deleted += other.values_deleted;
        self.failures += other.failures;
    }
}

/// Entry counts of every index, as of the last commit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntryCounts {
    pub maps: u64,
    pub key_values: u64,
    pub ranges: u64,
    pub values: u64,
    pub streams: u64,
}

/// The reference data store.
///
/// Loads go through a [`RefDataLoader`], which holds the stream's lock and
/// the store's single write transaction. Reads open their own read
/// transactions and see the last committed state.
pub struct RefDataStore {
    pub(crate) env: RefDataEnv,
    pub(crate) config: ReferenceDataConfig,
    pub(crate) locks: StripedLock,
    pub(crate) pool: ByteBufferPool,
    pub(crate) uid_store: MapDefinitionUidStore,
    pub(crate) value_store: ValueStore,
    pub(crate) key_value_store: KeyValueStoreDb,
    pub(crate) range_store: RangeStoreDb,
    pub(crate) processing_info: ProcessingInfoDb,
    consumers: ValueConsumerRegistry,
}

impl RefDataStore {
    /// Open the store described by `config`, with the built-in value consumers.
    pub fn open(config: ReferenceDataConfig) -> StoreResult<Self> {
        Self::open_with_consumers(config, ValueConsumerRegistry::with_defaults())
    }

    pub fn open_with_consumers(config: ReferenceDataConfig, consumers: ValueConsumerRegistry) -> StoreResult<Self> {
        config.validate()?;
        let env = RefDataEnv::open(&config.db_path())?;
        info!(
            path = %env.path().display(),
            stripes = config.loading_lock_stripes,
            "opened reference data store"
        );
        Ok(Self {
            locks: StripedLock::new(config.loading_lock_stripes, config.lock_poll_interval),
            pool: ByteBufferPool::new(config.buffer_pool_max_size),
            env,
            config,
            uid_store: MapDefinitionUidStore::default(),
            value_store: ValueStore::default(),
            key_value_store: KeyValueStoreDb::default(),
            range_store: RangeStoreDb::default(),
            processing_info: ProcessingInfoDb::default(),
            consumers,
        })
    }

    pub fn config(&self) -> &ReferenceDataConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &ByteBufferPool {
        &self.pool
    }

    // ---- loading ----

    /// Loader for `stream`, blocking until no other loader holds its lock.
    pub fn loader(&self, stream: RefStreamDefinition, effective_time_ms: i64) -> StoreResult<RefDataLoader<'_>> {
        self.loader_interruptibly(stream, effective_time_ms, &InterruptFlag::new())
    }

    /// Like [`loader`](Self::loader), giving up with
    /// [`StoreError::Interrupted`] once `interrupt` is raised.
    pub fn loader_interruptibly(
        &self,
        stream: RefStreamDefinition,
        effective_time_ms: i64,
        interrupt: &InterruptFlag,
    ) -> StoreResult<RefDataLoader<'_>> {
        RefDataLoader::acquire(self, stream, effective_time_ms, interrupt)
    }

    /// Run `work` with a loader for `stream` unless the stream is already
    /// loaded.
    ///
    /// The completeness check happens after the stream lock is taken, so a
    /// load that finished while this call was waiting is not repeated. The
    /// loader is closed exactly once whether `work` succeeds or fails.
    /// Returns whether `work` ran.
    pub fn do_with_loader_unless_complete<F>(
        &self,
        stream: &RefStreamDefinition,
        effective_time_ms: i64,
        work: F,
    ) -> StoreResult<bool>
    where
        F: FnOnce(&mut RefDataLoader<'_>) -> StoreResult<()>,
    {
        let mut loader = self.loader(stream.clone(), effective_time_ms)?;
        let result = if self.is_data_loaded(stream)? {
            debug!(stream = %stream, "reference data already loaded, skipping");
            Ok(false)
        } else {
            work(&mut loader).map(|()| true)
        };
        if let Err(err) = &result {
            error!(stream = %stream, effective_time_ms, error = %err, "reference data load failed");
        }
        let closed = loader.close();
        let ran = result?;
        closed?;
        Ok(ran)
    }

    // ---- reads ----

    /// Value for `key` in `map`.
    ///
    /// The exact-key index is tried first. If it has no entry and the map
    /// has ranges, `key` must parse as an integer and is looked up in the
    /// range index; a non-numeric key is then an error.
    pub fn get_value(&self, map: &MapDefinition, key: &str) -> StoreResult<Option<RefDataValue>> {
        match self.get_typed_value(map, key)? {
            Some(typed) => Ok(Some(self.consumers.decode(&typed)?)),
            None => Ok(None),
        }
    }

    /// Append the text form of the value for `key` to `out`.
    ///
    /// Returns whether a value was found.
    pub fn consume_value_bytes(&self, map: &MapDefinition, key: &str, out: &mut String) -> StoreResult<bool> {
        match self.get_typed_value(map, key)? {
            Some(typed) => {
                self.consumers.consume(&typed, out)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// The stored `{type id, bytes}` for `key` in `map`.
    pub fn get_typed_value(&self, map: &MapDefinition, key: &str) -> StoreResult<Option<TypedBytes>> {
        let txn = self.env.begin_read()?;
        let Some(map_uid) = self.uid_store.get_uid(&txn, map)? else {
            return Ok(None);
        };
        let value_key = match self.find_value_key(&txn, map_uid, key)? {
            Some(value_key) => value_key,
            None => return Ok(None),
        };
        let typed = self.value_store.get(&txn, &value_key)?.ok_or_else(|| {
            StoreError::Corruption(format!("entry for '{key}' in {map} points at a missing value"))
        })?;
        Ok(Some(typed))
    }

    fn find_value_key(
        &self,
        txn: &ReadTransaction,
        map_uid: Uid,
        key: &str,
    ) -> StoreResult<Option<ValueStoreKey>> {
        let exact = KeyValueStoreKey::new(map_uid, key).to_bytes();
        if let Some(value_key) = self.key_value_store.get_value_key(txn, &exact)? {
            return Ok(Some(value_key));
        }
        if !self.range_store.contains_map(txn, map_uid)? {
            return Ok(None);
        }
        let numeric: i64 = key.parse().map_err(|_| {
            StoreError::InvalidKey(format!("key '{key}' is not numeric and the map holds ranges"))
        })?;
        self.range_store.find_containing(txn, map_uid, numeric)
    }

    pub fn get_processing_info(&self, stream: &RefStreamDefinition) -> StoreResult<Option<ProcessingInfo>> {
        let txn = self.env.begin_read()?;
        self.processing_info.get(&txn, stream)
    }

    /// Processing info for `stream`, refreshing its last-access time when
    /// that is older than the configured update delay.
    ///
    /// The refresh needs the write transaction, so it waits for any loader
    /// that currently holds it.
    pub fn get_and_touch_processing_info(&self, stream: &RefStreamDefinition) -> StoreResult<Option<ProcessingInfo>> {
        let Some(info) = self.get_processing_info(stream)? else {
            return Ok(None);
        };
        let now = now_ms();
        let min_age = duration_ms(self.config.processing_info_update_delay);
        if now.saturating_sub(info.last_update_time_ms) < min_age {
            return Ok(Some(info));
        }
        let txn = self.env.begin_write()?;
        let touched = self.processing_info.touch(&txn, stream, now, min_age)?;
        txn.commit()?;
        Ok(touched)
    }

    /// Load state of `stream`. Asking counts as an access, so the record is
    /// touched as in [`get_and_touch_processing_info`](Self::get_and_touch_processing_info).
    pub fn get_load_state(&self, stream: &RefStreamDefinition) -> StoreResult<Option<ProcessingState>> {
        Ok(self.get_and_touch_processing_info(stream)?.map(|info| info.state))
    }

    pub fn is_data_loaded(&self, stream: &RefStreamDefinition) -> StoreResult<bool> {
        Ok(self.get_load_state(stream)? == Some(ProcessingState::Complete))
    }

    /// Whether `map` has a UID. Says nothing about the state of its stream's
    /// load; use [`is_data_loaded`](Self::is_data_loaded) for that.
    pub fn exists(&self, map: &MapDefinition) -> StoreResult<bool> {
        let txn = self.env.begin_read()?;
        self.uid_store.exists(&txn, map)
    }

    pub fn get_map_names(&self, stream: &RefStreamDefinition) -> StoreResult<Vec<String>> {
        let txn = self.env.begin_read()?;
        self.uid_store.get_map_names(&txn, stream)
    }

    pub fn list_processing_info(&self) -> StoreResult<Vec<(RefStreamDefinition, ProcessingInfo)>> {
        let txn = self.env.begin_read()?;
        self.processing_info.list(&txn)
    }

    /// Entry counts of every index; fails if paired indices disagree.
    pub fn entry_counts(&self) -> StoreResult<EntryCounts> {
        let txn = self.env.begin_read()?;
        Ok(EntryCounts {
            maps: self.uid_store.get_entry_count(&txn)?,
            key_values: self.key_value_store.entry_count(&txn)?,
            ranges: self.range_store.entry_count(&txn)?,
            values: self.value_store.get_entry_count(&txn)?,
            streams: crate::env::table_len(&txn, crate::env::PROCESSING_INFO)?,
        })
    }

    pub fn key_value_entry_count(&self) -> StoreResult<u64> {
        Ok(self.entry_counts()?.key_values)
    }

    pub fn range_value_entry_count(&self) -> StoreResult<u64> {
        Ok(self.entry_counts()?.ranges)
    }

    // ---- purging ----

    /// Remove every stream not accessed within `purge_age` of `now_ms`,
    /// then any abandoned partial loads.
    pub fn purge_old_data(&self, now_ms: i64, purge_age: Duration) -> StoreResult<PurgeCounts> {
        let cutoff = now_ms.saturating_sub(duration_ms(purge_age));
        info!(cutoff_ms = cutoff, "purging reference data");

        let mut counts = PurgeCounts::default();
        for (stream, info) in self.list_processing_info()? {
            if info.last_update_time_ms >= cutoff {
                continue;
            }
            let _guard = self.locks.lock_interruptibly(&stream, &InterruptFlag::new())?;
            counts.add(self.purge_stream_if(&stream, |info| info.last_update_time_ms < cutoff)?);
        }
        counts.add(self.purge_partial_loads()?);

        info!(
            streams = counts.streams,
            maps = counts.maps,
            entries = counts.entries,
            values_deleted = counts.values_deleted,
            failures = counts.failures,
            "purge finished"
        );
        Ok(counts)
    }

    /// Purge using the configured purge age.
    pub fn purge_old_data_now(&self) -> StoreResult<PurgeCounts> {
        self.purge_old_data(now_ms(), self.config.purge_age)
    }

    /// Remove streams whose load or purge never finished: LOAD_IN_PROGRESS,
    /// TERMINATED, PURGE_IN_PROGRESS and READY_FOR_PURGE.
    ///
    /// A stream whose lock is held has a live loader and is left alone.
    pub fn purge_partial_loads(&self) -> StoreResult<PurgeCounts> {
        let mut counts = PurgeCounts::default();
        for (stream, info) in self.list_processing_info()? {
            if !info.state.is_partial() {
                continue;
            }
            let Some(_guard) = self.locks.try_lock(&stream) else {
                debug!(stream = %stream, "load in progress, not purging");
                continue;
            };
            warn!(stream = %stream, "purging partially loaded stream");
            counts.add(self.purge_stream_if(&stream, |info| info.state.is_partial())?);
        }
        Ok(counts)
    }

    /// Purge one stream. The caller holds the stream lock.
    ///
    /// `still_eligible` is re-checked against the current record, which may
    /// have changed while the lock was awaited. A failed purge is rolled
    /// back and the stream marked PURGE_FAILED.
    fn purge_stream_if<P>(&self, stream: &RefStreamDefinition, still_eligible: P) -> StoreResult<PurgeCounts>
    where
        P: Fn(&ProcessingInfo) -> bool,
    {
        match self.get_processing_info(stream)? {
            Some(info) if still_eligible(&info) => {}
            _ => return Ok(PurgeCounts::default()),
        }

        let txn = self.env.begin_write()?;
        match self.purge_stream_in(&txn, stream) {
            Ok(counts) => {
                txn.commit()?;
                info!(stream = %stream, maps = counts.maps, entries = counts.entries, "purged stream");
                Ok(counts)
            }
            Err(err) => {
                error!(stream = %stream, error = %err, "failed to purge stream");
                drop(txn);
                let txn = self.env.begin_write()?;
                self.processing_info
                    .update_state(&txn, stream, ProcessingState::PurgeFailed, now_ms())?;
                txn.commit()?;
                Ok(PurgeCounts {
                    failures: 1,
                    ..PurgeCounts::default()
                })
            }
        }
    }

    fn purge_stream_in(&self, txn: &redb::WriteTransaction, stream: &RefStreamDefinition) -> StoreResult<PurgeCounts> {
        let mut counts = PurgeCounts {
            streams: 1,
            ..PurgeCounts::default()
        };
        self.processing_info
            .update_state(txn, stream, ProcessingState::PurgeInProgress, now_ms())?;

        for (map, map_uid) in self.uid_store.get_maps_for_stream(txn, stream)? {
            let entries = self.purge_entries(txn, &self.key_value_store, map_uid)?;
            let ranges = self.purge_entries(txn, &self.range_store, map_uid)?;
            counts.entries += entries.0 + ranges.0;
            counts.values_deleted += entries.1 + ranges.1;
            self.uid_store.delete_pair(txn, map_uid)?;
            counts.maps += 1;
            debug!(stream = %stream, map = %map.map_name, uid = %map_uid, "purged map");
        }

        self.processing_info.delete(txn, stream)?;
        Ok(counts)
    }

    /// Delete every entry of one map, dropping its value references.
    /// Returns (entries removed, values deleted).
    fn purge_entries<S: EntryStore>(
        &self,
        txn: &redb::WriteTransaction,
        entry_store: &S,
        map_uid: Uid,
    ) -> StoreResult<(u64, u64)> {
        let mut removed = 0;
        let mut deleted = 0;
        for (key, value_key) in entry_store.entries_for_map(txn, map_uid)? {
            if self.value_store.de_reference_or_delete_value(txn, &value_key)? {
                deleted += 1;
            }
            entry_store.delete(txn, &key)?;
            removed += 1;
        }
        Ok((removed, deleted))
    }
}

impl std::fmt::Debug for RefDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefDataStore")
            .field("path", &self.env.path())
            .field("locks", &self.locks)
            .field("consumers", &self.consumers)
            .finish()
    }
}

fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use refdata_types::KeyRange;
    use serde_json::json;

    use crate::loader::{LoaderState, PutOutcome};
    use crate::value_store::ValueStoreMeta;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn open_store() -> (TempDir, RefDataStore) {
        tracing_subscriber::fmt().with_test_writer().try_init().ok();
        let dir = tempfile::tempdir().unwrap();
        let store = RefDataStore::open(ReferenceDataConfig::in_dir(dir.path())).unwrap();
        (dir, store)
    }

    fn stream(id: i64) -> RefStreamDefinition {
        RefStreamDefinition::single_part(Uuid::nil(), "1", id)
    }

    fn text(value: &str) -> RefDataValue {
        RefDataValue::string(value)
    }

    /// Complete load of `entries` into map `map_name` of `stream`.
    fn load(store: &RefDataStore, stream: &RefStreamDefinition, map_name: &str, entries: &[(&str, &str)]) {
        let map = stream.map(map_name);
        let mut loader = store.loader(stream.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        for (key, value) in entries {
            assert!(loader.put_key_value(&map, key, &text(value)).unwrap().is_success());
        }
        loader.complete_processing().unwrap();
        loader.close().unwrap();
    }

    fn backdate(store: &RefDataStore, stream: &RefStreamDefinition, last_update_time_ms: i64) {
        let txn = store.env.begin_write().unwrap();
        let info = store.processing_info.get(&txn, stream).unwrap().unwrap();
        let info = ProcessingInfo {
            last_update_time_ms,
            ..info
        };
        store.processing_info.put(&txn, stream, &info, true).unwrap();
        txn.commit().unwrap();
    }

    // ---- key / value puts ----

    #[test]
    fn existing_entry_kept_without_overwrite() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("mapA");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        assert!(loader.initialise(false).unwrap());
        assert_eq!(loader.put_key_value(&map, "key1", &text("valueX")).unwrap(), PutOutcome::success());
        let second = loader.put_key_value(&map, "key1", &text("valueY")).unwrap();
        assert!(!second.success);
        assert!(second.previous_value_existed);
        loader.complete_processing().unwrap();
        assert_eq!(loader.counts().ignored, 1);
        loader.close().unwrap();

        assert_eq!(store.get_value(&map, "key1").unwrap(), Some(text("valueX")));
    }

    #[test]
    fn overwrite_replaces_and_releases_old_value() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("mapA");
        load(&store, &s, "mapA", &[("key1", "valueX")]);

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(true).unwrap();
        assert_eq!(
            loader.put_key_value(&map, "key1", &text("valueY")).unwrap(),
            PutOutcome::replaced_entry()
        );
        loader.complete_processing().unwrap();
        assert_eq!(loader.counts().replaced_entries, 1);
        drop(loader);

        assert_eq!(store.get_value(&map, "key1").unwrap(), Some(text("valueY")));
        let counts = store.entry_counts().unwrap();
        assert_eq!(counts.key_values, 1);
        assert_eq!(counts.values, 1);
    }

    #[test]
    fn identical_overwrite_changes_nothing() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");
        load(&store, &s, "m", &[("k", "same")]);

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(true).unwrap();
        assert_eq!(loader.put_key_value(&map, "k", &text("same")).unwrap(), PutOutcome::replaced_entry());
        assert_eq!(loader.counts().unchanged_entries, 1);
        loader.complete_processing().unwrap();
        drop(loader);

        let txn = store.env.begin_read().unwrap();
        let uid = store.uid_store.get_uid(&txn, &map).unwrap().unwrap();
        let key = KeyValueStoreKey::new(uid, "k").to_bytes();
        let value_key = store.key_value_store.get_value_key(&txn, &key).unwrap().unwrap();
        assert_eq!(store.value_store.get_meta(&txn, &value_key).unwrap().unwrap().reference_count, 1);
    }

    #[test]
    fn null_puts() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");
        load(&store, &s, "m", &[("a", "shared"), ("b", "shared")]);

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(true).unwrap();
        assert_eq!(loader.put_key_value(&map, "absent", &RefDataValue::Null).unwrap(), PutOutcome::success());
        assert_eq!(loader.put_key_value(&map, "a", &RefDataValue::Null).unwrap(), PutOutcome::replaced_entry());
        let counts = loader.counts();
        assert_eq!(counts.ignored_nulls, 1);
        assert_eq!(counts.removed_entries, 1);
        loader.complete_processing().unwrap();
        drop(loader);

        assert_eq!(store.get_value(&map, "a").unwrap(), None);
        assert_eq!(store.get_value(&map, "absent").unwrap(), None);
        assert_eq!(store.get_value(&map, "b").unwrap(), Some(text("shared")));
        let counts = store.entry_counts().unwrap();
        assert_eq!(counts.key_values, 1);
        assert_eq!(counts.values, 1);
    }

    #[test]
    fn identical_values_stored_once() {
        let (_dir, store) = open_store();
        let s = stream(1);
        load(&store, &s, "m1", &[("a", "v"), ("b", "v"), ("c", "other")]);
        load(&store, &stream(2), "m2", &[("a", "v")]);

        let counts = store.entry_counts().unwrap();
        assert_eq!(counts.key_values, 4);
        assert_eq!(counts.values, 2);
        assert_eq!(counts.maps, 2);
        assert_eq!(counts.streams, 2);
    }

    #[test]
    fn structured_values() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");
        let doc = json!({"site": "north", "floors": [1, 2]});

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader.put_key_value(&map, "k", &RefDataValue::from(doc.clone())).unwrap();
        loader.complete_processing().unwrap();
        drop(loader);

        assert_eq!(store.get_value(&map, "k").unwrap(), Some(RefDataValue::Structured(doc)));
        let mut out = String::new();
        assert!(store.consume_value_bytes(&map, "k", &mut out).unwrap());
        assert_eq!(out, r#"{"floors":[1,2],"site":"north"}"#);
        assert!(!store.consume_value_bytes(&map, "missing", &mut out).unwrap());
    }

    // ---- range lookups ----

    #[test]
    fn range_lookup() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("ranges");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader
            .put_range_value(&map, KeyRange::new(10, 20).unwrap(), &text("teens"))
            .unwrap();
        loader.complete_processing().unwrap();
        drop(loader);

        assert_eq!(store.get_value(&map, "15").unwrap(), Some(text("teens")));
        assert_eq!(store.get_value(&map, "10").unwrap(), Some(text("teens")));
        assert_eq!(store.get_value(&map, "20").unwrap(), None);
        assert_eq!(store.get_value(&map, "25").unwrap(), None);
        let err = store.get_value(&map, "abc").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        let err = store.get_value(&map, " 15").unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
        assert_eq!(store.range_value_entry_count().unwrap(), 1);
    }

    #[test]
    fn exact_key_checked_before_ranges() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("mixed");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader.put_key_value(&map, "15", &text("exact")).unwrap();
        loader
            .put_range_value(&map, KeyRange::new(10, 20).unwrap(), &text("range"))
            .unwrap();
        loader.complete_processing().unwrap();
        drop(loader);

        assert_eq!(store.get_value(&map, "15").unwrap(), Some(text("exact")));
        assert_eq!(store.get_value(&map, "16").unwrap(), Some(text("range")));
    }

    #[test]
    fn non_numeric_key_without_ranges_is_a_miss() {
        let (_dir, store) = open_store();
        let s = stream(1);
        load(&store, &s, "m", &[("a", "v")]);
        assert_eq!(store.get_value(&s.map("m"), "abc").unwrap(), None);
        assert_eq!(store.get_value(&s.map("unknown"), "a").unwrap(), None);
    }

    // ---- loader lifecycle ----

    #[test]
    fn state_machine_is_enforced() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        assert_eq!(loader.state(), LoaderState::New);
        assert!(matches!(
            loader.put_key_value(&map, "k", &text("v")),
            Err(StoreError::IllegalState(_))
        ));
        assert!(matches!(loader.complete_processing(), Err(StoreError::IllegalState(_))));

        loader.initialise(false).unwrap();
        assert_eq!(loader.state(), LoaderState::Initialised);
        assert!(matches!(loader.initialise(false), Err(StoreError::IllegalState(_))));

        loader.complete_processing().unwrap();
        assert_eq!(loader.state(), LoaderState::Completed);
        assert!(matches!(loader.complete_processing(), Err(StoreError::IllegalState(_))));

        loader.close().unwrap();
        assert_eq!(loader.state(), LoaderState::Closed);
        loader.close().unwrap();
        assert!(matches!(
            loader.put_key_value(&map, "k", &text("v")),
            Err(StoreError::IllegalState(_))
        ));
    }

    #[test]
    fn initialise_keeps_existing_status_without_overwrite() {
        let (_dir, store) = open_store();
        let s = stream(1);
        load(&store, &s, "m", &[]);

        let mut loader = store.loader(s.clone(), 0).unwrap();
        assert!(!loader.initialise(false).unwrap());
        drop(loader);
        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::Complete));
    }

    #[test]
    fn commit_interval_publishes_batches() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        assert!(matches!(loader.set_commit_interval(0), Err(StoreError::InvalidArgument(_))));
        loader.set_commit_interval(2).unwrap();
        loader.initialise(false).unwrap();
        loader.put_key_value(&map, "k1", &text("1")).unwrap();
        loader.put_key_value(&map, "k2", &text("2")).unwrap();
        loader.put_key_value(&map, "k3", &text("3")).unwrap();

        assert_eq!(store.get_value(&map, "k1").unwrap(), Some(text("1")));
        assert_eq!(store.get_value(&map, "k3").unwrap(), None);
        assert!(store.exists(&map).unwrap());
        assert!(!store.is_data_loaded(&s).unwrap());

        loader.complete_processing().unwrap();
        loader.close().unwrap();
        assert_eq!(store.get_value(&map, "k3").unwrap(), Some(text("3")));
        assert!(store.exists(&map).unwrap());
    }

    #[test]
    fn closing_incomplete_load_keeps_progress() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader.put_key_value(&map, "k", &text("v")).unwrap();
        loader.close().unwrap();

        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::LoadInProgress));
        assert!(!store.is_data_loaded(&s).unwrap());
        assert!(store.exists(&map).unwrap());
        assert!(!store.exists(&s.map("other")).unwrap());
        assert_eq!(store.get_value(&map, "k").unwrap(), Some(text("v")));
    }

    #[test]
    fn failed_completion_state() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader.complete_processing_as(ProcessingState::Failed).unwrap();
        drop(loader);

        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::Failed));
        assert!(!store.is_data_loaded(&s).unwrap());
    }

    #[test]
    fn failed_put_rolls_back_batch() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");
        load(&store, &s, "m", &[("key1", "valueX")]);

        // Store valueY with a full reference count so taking another fails.
        let full = text("valueY").to_typed_bytes().unwrap().unwrap();
        let txn = store.env.begin_write().unwrap();
        let full_key = store.value_store.get_or_create_key(&txn, &full).unwrap();
        {
            let mut meta = txn.open_table(crate::env::VALUE_STORE_META).unwrap();
            let saturated = ValueStoreMeta::new(full.type_id, 0xFF_FFFF).to_bytes().unwrap();
            meta.insert(full_key.to_bytes().as_slice(), saturated.as_slice()).unwrap();
        }
        txn.commit().unwrap();
        let before = store.entry_counts().unwrap();

        let mut loader = store.loader(s.clone(), 0).unwrap();
        loader.initialise(true).unwrap();
        assert!(loader.put_key_value(&map, "key2", &text("valueZ")).unwrap().is_success());
        let err = loader.put_key_value(&map, "key1", &text("valueY")).unwrap_err();
        assert!(matches!(err, StoreError::ReferenceCountOverflow(_)));
        assert!(loader.has_failed());

        let err = loader.put_key_value(&map, "key3", &text("v")).unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
        let err = loader.complete_processing().unwrap_err();
        assert!(matches!(err, StoreError::IllegalState(_)));
        loader.close().unwrap();

        assert_eq!(store.get_value(&map, "key1").unwrap(), Some(text("valueX")));
        assert_eq!(store.get_value(&map, "key2").unwrap(), None);
        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::Failed));
        assert_eq!(store.entry_counts().unwrap(), before);

        let ran = store
            .do_with_loader_unless_complete(&s, 0, |loader| {
                loader.initialise(true)?;
                loader.put_key_value(&map, "key1", &text("valueZ"))?;
                loader.complete_processing()
            })
            .unwrap();
        assert!(ran);
        assert_eq!(store.get_value(&map, "key1").unwrap(), Some(text("valueZ")));
        assert!(store.is_data_loaded(&s).unwrap());
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = ReferenceDataConfig::in_dir(dir.path());
        let s = stream(1);
        {
            let store = RefDataStore::open(config.clone()).unwrap();
            load(&store, &s, "m", &[("k", "v")]);
        }
        let store = RefDataStore::open(config).unwrap();
        assert!(store.is_data_loaded(&s).unwrap());
        assert_eq!(store.get_value(&s.map("m"), "k").unwrap(), Some(text("v")));
    }

    // ---- load once ----

    #[test]
    fn do_with_loader_skips_loaded_stream() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");

        let ran = store
            .do_with_loader_unless_complete(&s, 0, |loader| {
                loader.initialise(false)?;
                loader.put_key_value(&map, "k", &text("v"))?;
                loader.complete_processing()
            })
            .unwrap();
        assert!(ran);

        let ran = store
            .do_with_loader_unless_complete(&s, 0, |_| panic!("stream is already loaded"))
            .unwrap();
        assert!(!ran);
        assert!(store.exists(&map).unwrap());
        assert_eq!(store.get_map_names(&s).unwrap(), vec!["m".to_string()]);
    }

    #[test]
    fn failed_work_still_closes_loader() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let map = s.map("m");

        let err = store
            .do_with_loader_unless_complete(&s, 0, |loader| {
                loader.initialise(false)?;
                loader.put_key_value(&map, "k", &text("v"))?;
                Err(StoreError::InvalidArgument("bad input".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::LoadInProgress));

        let ran = store
            .do_with_loader_unless_complete(&s, 0, |loader| {
                loader.initialise(true)?;
                loader.complete_processing()
            })
            .unwrap();
        assert!(ran);
        assert!(store.is_data_loaded(&s).unwrap());
    }

    #[test]
    fn concurrent_loads_of_one_stream_run_once() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let runs = AtomicUsize::new(0);

        let ran: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        store
                            .do_with_loader_unless_complete(&s, 0, |loader| {
                                runs.fetch_add(1, Ordering::SeqCst);
                                loader.initialise(false)?;
                                loader.put_key_value(&s.map("m"), "k", &text("v"))?;
                                thread::sleep(Duration::from_millis(20));
                                loader.complete_processing()
                            })
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ran.iter().filter(|ran| **ran).count(), 1);
        assert_eq!(store.key_value_entry_count().unwrap(), 1);
    }

    #[test]
    fn concurrent_loads_of_different_streams_all_finish() {
        let (_dir, store) = open_store();

        thread::scope(|scope| {
            for id in 0..4 {
                let store = &store;
                scope.spawn(move || {
                    let s = stream(id);
                    let key = id.to_string();
                    load(store, &s, "m", &[(key.as_str(), "shared")]);
                });
            }
        });

        for id in 0..4 {
            assert!(store.is_data_loaded(&stream(id)).unwrap());
        }
        let counts = store.entry_counts().unwrap();
        assert_eq!(counts.maps, 4);
        assert_eq!(counts.key_values, 4);
        assert_eq!(counts.values, 1);
    }

    #[test]
    fn waiting_loader_can_be_interrupted() {
        let (_dir, store) = open_store();
        let s = stream(1);
        let holder = store.loader(s.clone(), 0).unwrap();
        let flag = InterruptFlag::new();

        let result = thread::scope(|scope| {
            let waiter = scope.spawn(|| store.loader_interruptibly(s.clone(), 0, &flag).map(|_| ()));
            thread::sleep(Duration::from_millis(50));
            flag.interrupt();
            waiter.join().unwrap()
        });
        assert!(matches!(result, Err(StoreError::Interrupted(_))));

        drop(holder);
        assert!(store.loader(s, 0).is_ok());
    }

    // ---- processing info ----

    #[test]
    fn touch_refreshes_stale_access_time() {
        let (_dir, store) = open_store();
        let s = stream(1);
        load(&store, &s, "m", &[]);

        let before = store.get_processing_info(&s).unwrap().unwrap();
        let fresh = store.get_and_touch_processing_info(&s).unwrap().unwrap();
        assert_eq!(fresh.last_update_time_ms, before.last_update_time_ms);

        backdate(&store, &s, 0);
        let touched = store.get_and_touch_processing_info(&s).unwrap().unwrap();
        assert!(touched.last_update_time_ms > 0);
        assert_eq!(touched.create_time_ms, before.create_time_ms);
        assert_eq!(store.get_processing_info(&s).unwrap(), Some(touched));

        assert_eq!(store.get_and_touch_processing_info(&stream(9)).unwrap(), None);
    }

    #[test]
    fn load_state_query_touches_record() {
        let (_dir, store) = open_store();
        let s = stream(1);
        load(&store, &s, "m", &[]);

        backdate(&store, &s, 0);
        assert_eq!(store.get_load_state(&s).unwrap(), Some(ProcessingState::Complete));
        assert!(store.get_processing_info(&s).unwrap().unwrap().last_update_time_ms > 0);

        backdate(&store, &s, 0);
        assert!(store.is_data_loaded(&s).unwrap());
        assert!(store.get_processing_info(&s).unwrap().unwrap().last_update_time_ms > 0);
    }

    // ---- purging ----

    #[test]
    fn purge_removes_stale_streams_only() {
        let (_dir, store) = open_store();
        let old = stream(1);
        let current = stream(2);
        load(&store, &old, "m", &[("a", "shared"), ("b", "only-old")]);
        load(&store, &current, "m", &[("a", "shared")]);
        backdate(&store, &old, 0);

        let counts = store.purge_old_data(now_ms(), Duration::from_secs(3600)).unwrap();
        assert_eq!(
            counts,
            PurgeCounts {
                streams: 1,
                maps: 1,
                entries: 2,
                values_deleted: 1,
                failures: 0,
            }
        );

        assert_eq!(store.get_processing_info(&old).unwrap(), None);
        assert_eq!(store.get_value(&old.map("m"), "a").unwrap(), None);
        assert_eq!(store.get_value(&current.map("m"), "a").unwrap(), Some(text("shared")));
        let entries = store.entry_counts().unwrap();
        assert_eq!(entries.maps, 1);
        assert_eq!(entries.key_values, 1);
        assert_eq!(entries.values, 1);
        assert_eq!(entries.streams, 1);
    }

    #[test]
    fn purge_of_fresh_store_is_empty() {
        let (_dir, store) = open_store();
        load(&store, &stream(1), "m", &[("a", "v")]);
        assert_eq!(store.purge_old_data_now().unwrap(), PurgeCounts::default());
        assert!(store.is_data_loaded(&stream(1)).unwrap());
    }

    #[test]
    fn purge_partial_loads_skips_live_loaders() {
        let (_dir, store) = open_store();
        let abandoned = stream(1);
        // The live stream must not share a lock stripe with the abandoned one.
        let live = (2..)
            .map(stream)
            .find(|s| store.locks.stripe_for(s) != store.locks.stripe_for(&abandoned))
            .unwrap();

        let mut loader = store.loader(abandoned.clone(), 0).unwrap();
        loader.initialise(false).unwrap();
        loader.put_key_value(&abandoned.map("m"), "k", &text("v")).unwrap();
        loader.close().unwrap();

        let mut live_loader = store.loader(live.clone(), 0).unwrap();
        live_loader.set_commit_interval(1).unwrap();
        live_loader.initialise(false).unwrap();
        live_loader.put_key_value(&live.map("m"), "k", &text("v")).unwrap();

        let counts = store.purge_partial_loads().unwrap();
        assert_eq!(counts.streams, 1);
        assert_eq!(counts.entries, 1);
        assert_eq!(store.get_load_state(&abandoned).unwrap(), None);
        assert_eq!(store.get_load_state(&live).unwrap(), Some(ProcessingState::LoadInProgress));

        live_loader.complete_processing().unwrap();
        live_loader.close().unwrap();
        assert!(store.is_data_loaded(&live).unwrap());
    }

    #[test]
    fn purge_partial_loads_removes_unfinished_streams() {
        let (_dir, store) = open_store();
        let finished = stream(1);
        let terminated = stream(2);
        let ready = stream(3);
        load(&store, &finished, "m", &[("k", "v")]);
        load(&store, &terminated, "m", &[("k", "v"), ("j", "w")]);
        load(&store, &ready, "m", &[("k", "other")]);

        let txn = store.env.begin_write().unwrap();
        store
            .processing_info
            .update_state(&txn, &terminated, ProcessingState::Terminated, now_ms())
            .unwrap();
        store
            .processing_info
            .update_state(&txn, &ready, ProcessingState::ReadyForPurge, now_ms())
            .unwrap();
        txn.commit().unwrap();

        let counts = store.purge_partial_loads().unwrap();
        assert_eq!(counts.streams, 2);
        assert_eq!(counts.maps, 2);
        assert_eq!(counts.entries, 3);
        assert_eq!(counts.failures, 0);
        assert_eq!(store.get_load_state(&terminated).unwrap(), None);
        assert_eq!(store.get_load_state(&ready).unwrap(), None);
        assert!(store.is_data_loaded(&finished).unwrap());
        assert_eq!(store.get_value(&finished.map("m"), "k").unwrap(), Some(text("v")));
        assert!(!store.exists(&terminated.map("m")).unwrap());
    }
}
