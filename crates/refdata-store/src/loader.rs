use std::collections::HashMap;
use std::fmt;

use redb::WriteTransaction;
use refdata_types::{now_ms, KeyRange, MapDefinition, ProcessingInfo, ProcessingState, RefDataValue, RefStreamDefinition, Uid};
use tracing::{debug, error, info, trace, warn};

use crate::entry_store::EntryStore;
use crate::error::{StoreError, StoreResult};
use crate::lock::{InterruptFlag, StripeGuard};
use crate::pool::PooledBuffer;
use crate::store::RefDataStore;

/// Result of a single put.
///
/// A put that finds an existing entry and may not overwrite it is not an
/// error: it reports `success == false` and changes nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutOutcome {
    pub success: bool,
    pub previous_value_existed: bool,
}

impl PutOutcome {
    /// Written, nothing was there before.
    pub fn success() -> Self {
        Self {
            success: true,
            previous_value_existed: false,
        }
    }

    /// An existing entry was replaced, removed or left identical.
    pub fn replaced_entry() -> Self {
        Self {
            success: true,
            previous_value_existed: true,
        }
    }

    /// An entry exists and overwriting is off.
    pub fn failed() -> Self {
        Self {
            success: false,
            previous_value_existed: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderState {
    New,
    Initialised,
    Completed,
    Closed,
}

impl fmt::Display for LoaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Initialised => "INITIALISED",
            Self::Completed => "COMPLETED",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// What the puts of one load did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub puts: u64,
    pub new_entries: u64,
    pub replaced_entries: u64,
    pub unchanged_entries: u64,
    pub removed_entries: u64,
    /// Puts against existing entries with overwriting off.
    pub ignored: u64,
    /// Null puts against absent keys.
    pub ignored_nulls: u64,
}

/// Transactional bulk loader for one reference stream.
///
/// Holds the stream's lock from construction until [`close`](Self::close),
/// and a single write transaction that is committed every
/// `commit_interval` successful puts (if set) and when the loader closes.
/// Dropping the loader closes it.
///
/// Once a write fails the loader refuses further work. Closing it rolls
/// back the uncommitted batch and marks the stream FAILED, so the whole
/// stream can be loaded again.
///
/// Only one loader may be live per thread: redb's write transaction is
/// process-wide, so a second loader on the same thread would wait on itself.
pub struct RefDataLoader<'a> {
    store: &'a RefDataStore,
    stream: RefStreamDefinition,
    effective_time_ms: i64,
    state: LoaderState,
    overwrite_existing: bool,
    txn: Option<WriteTransaction>,
    uid_cache: HashMap<MapDefinition, Uid>,
    key_buffer: Option<PooledBuffer>,
    commit_interval: Option<usize>,
    puts_since_commit: usize,
    counts: LoadCounts,
    failed: bool,
    lock: Option<StripeGuard<'a>>,
}

impl<'a> RefDataLoader<'a> {
    /// Block on the stream lock, then build a loader in state NEW.
    pub(crate) fn acquire(
        store: &'a RefDataStore,
        stream: RefStreamDefinition,
        effective_time_ms: i64,
        interrupt: &InterruptFlag,
    ) -> StoreResult<Self> {
        let lock = store.locks.lock_interruptibly(&stream, interrupt)?;
        let commit_interval = match store.config.max_puts_before_commit {
            0 => None,
            n => Some(n),
        };
        Ok(Self {
            store,
            stream,
            effective_time_ms,
            state: LoaderState::New,
            overwrite_existing: false,
            txn: None,
            uid_cache: HashMap::new(),
            key_buffer: Some(store.pool.acquire()),
            commit_interval,
            puts_since_commit: 0,
            counts: LoadCounts::default(),
            failed: false,
            lock: Some(lock),
        })
    }

    pub fn stream(&self) -> &RefStreamDefinition {
        &self.stream
    }

    pub fn effective_time_ms(&self) -> i64 {
        self.effective_time_ms
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn counts(&self) -> LoadCounts {
        self.counts
    }

    /// Whether a write of this load has failed.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    /// Commit after every `puts` successful puts. Must be at least one.
    pub fn set_commit_interval(&mut self, puts: usize) -> StoreResult<()> {
        if puts == 0 {
            return Err(StoreError::InvalidArgument(
                "commit interval must be at least 1".to_string(),
            ));
        }
        self.commit_interval = Some(puts);
        Ok(())
    }

    /// Record the load as in progress. Valid only from NEW.
    ///
    /// Returns whether the processing info record was written; an existing
    /// record is left alone unless `overwrite_existing` is set.
    pub fn initialise(&mut self, overwrite_existing: bool) -> StoreResult<bool> {
        self.require_state(LoaderState::New, "initialise")?;
        debug!(stream = %self.stream, overwrite_existing, "initialising loader");
        self.overwrite_existing = overwrite_existing;

        let written = self.guarded(|loader| {
            loader.begin_if_needed()?;
            let txn = loader.open_txn()?;
            let info = ProcessingInfo::new(now_ms(), loader.effective_time_ms, ProcessingState::LoadInProgress);
            loader
                .store
                .processing_info
                .put(txn, &loader.stream, &info, overwrite_existing)
        })?;

        self.state = LoaderState::Initialised;
        Ok(written)
    }

    /// Put a value against an exact key.
    pub fn put_key_value(&mut self, map: &MapDefinition, key: &str, value: &RefDataValue) -> StoreResult<PutOutcome> {
        trace!(map = %map.map_name, key, "put key value");
        let entry_store = self.store.key_value_store;
        self.put_entry(&entry_store, map, key, value)
    }

    /// Put a value against a key range.
    pub fn put_range_value(
        &mut self,
        map: &MapDefinition,
        range: KeyRange,
        value: &RefDataValue,
    ) -> StoreResult<PutOutcome> {
        trace!(map = %map.map_name, range = %range, "put range value");
        let entry_store = self.store.range_store;
        self.put_entry(&entry_store, map, &range, value)
    }

    /// Mark the load COMPLETE. Valid only from INITIALISED.
    pub fn complete_processing(&mut self) -> StoreResult<()> {
        self.complete_processing_as(ProcessingState::Complete)
    }

    /// Finish the load with the given final state (e.g. FAILED).
    pub fn complete_processing_as(&mut self, state: ProcessingState) -> StoreResult<()> {
        self.require_state(LoaderState::Initialised, "complete processing")?;
        self.guarded(|loader| {
            loader.begin_if_needed()?;
            let txn = loader.open_txn()?;
            loader
                .store
                .processing_info
                .update_state(txn, &loader.stream, state, now_ms())
        })?;
        self.state = LoaderState::Completed;

        let counts = &self.counts;
        info!(
            stream = %self.stream,
            state = %state,
            maps = self.uid_cache.len(),
            puts = counts.puts,
            new = counts.new_entries,
            replaced = counts.replaced_entries,
            unchanged = counts.unchanged_entries,
            removed = counts.removed_entries,
            ignored = counts.ignored,
            ignored_nulls = counts.ignored_nulls,
            "reference data load finished"
        );
        Ok(())
    }

    /// Commit any open transaction, return pooled buffers and release the
    /// stream lock, in that order.
    ///
    /// Closing a loader that was initialised but never completed logs a
    /// warning and still commits, so partial progress is kept and the
    /// stream stays LOAD_IN_PROGRESS. After a failed write the open batch
    /// is rolled back instead and the stream is marked FAILED. Closing
    /// twice is a no-op.
    pub fn close(&mut self) -> StoreResult<()> {
        if self.state == LoaderState::Closed {
            return Ok(());
        }
        if self.failed {
            warn!(
                stream = %self.stream,
                puts = self.counts.puts,
                "rolling back failed load"
            );
        } else if self.state == LoaderState::Initialised {
            warn!(
                stream = %self.stream,
                puts = self.counts.puts,
                "loader closed before processing completed"
            );
        }

        let committed = match self.txn.take() {
            Some(txn) if self.failed => txn
                .abort()
                .map_err(StoreError::from)
                .and_then(|()| self.record_failure()),
            Some(txn) => txn.commit().map_err(StoreError::from),
            None if self.failed => self.record_failure(),
            None => Ok(()),
        };
        self.key_buffer = None;
        self.uid_cache.clear();
        self.state = LoaderState::Closed;
        self.lock = None;
        debug!(stream = %self.stream, "loader closed");
        committed
    }

    /// Mark the stream FAILED in a fresh transaction, if it has a record.
    fn record_failure(&self) -> StoreResult<()> {
        let txn = self.store.env.begin_write()?;
        if self.store.processing_info.get(&txn, &self.stream)?.is_some() {
            self.store
                .processing_info
                .update_state(&txn, &self.stream, ProcessingState::Failed, now_ms())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Run a step that writes to the open transaction, remembering a failure
    /// so the batch is rolled back rather than committed.
    fn guarded<T>(&mut self, step: impl FnOnce(&mut Self) -> StoreResult<T>) -> StoreResult<T> {
        let result = step(self);
        if let Err(err) = &result {
            error!(stream = %self.stream, error = %err, "reference data load step failed");
            self.failed = true;
        }
        result
    }

    fn put_entry<S: EntryStore>(
        &mut self,
        entry_store: &S,
        map: &MapDefinition,
        key: &S::Key,
        value: &RefDataValue,
    ) -> StoreResult<PutOutcome> {
        self.require_state(LoaderState::Initialised, "put")?;
        self.guarded(|loader| loader.apply_put(entry_store, map, key, value))
    }

    fn apply_put<S: EntryStore>(
        &mut self,
        entry_store: &S,
        map: &MapDefinition,
        key: &S::Key,
        value: &RefDataValue,
    ) -> StoreResult<PutOutcome> {
        self.counts.puts += 1;
        self.begin_if_needed()?;
        let map_uid = self.uid_for(map)?;
        let typed = value.to_typed_bytes()?;

        let mut key_buffer = self.key_buffer.take().unwrap_or_else(|| self.store.pool.acquire());
        key_buffer.clear();
        entry_store.write_key(map_uid, key, &mut key_buffer)?;

        let value_store = &self.store.value_store;
        let txn = open_txn(&self.txn, &self.stream)?;
        let existing = entry_store.get_value_key(txn, &key_buffer)?;

        let outcome = match (existing, typed) {
            (None, None) => {
                self.counts.ignored_nulls += 1;
                PutOutcome::success()
            }
            (None, Some(typed)) => {
                let value_key = value_store.get_or_create_key(txn, &typed)?;
                entry_store.put_value_key(txn, &key_buffer, &value_key)?;
                self.counts.new_entries += 1;
                PutOutcome::success()
            }
            (Some(_), _) if !self.overwrite_existing => {
                self.counts.ignored += 1;
                PutOutcome::failed()
            }
            (Some(old_key), None) => {
                value_store.de_reference_or_delete_value(txn, &old_key)?;
                entry_store.delete(txn, &key_buffer)?;
                self.counts.removed_entries += 1;
                PutOutcome::replaced_entry()
            }
            (Some(old_key), Some(typed)) => {
                if value_store.are_values_equal(txn, &old_key, &typed)? {
                    self.counts.unchanged_entries += 1;
                } else {
                    // Take the new reference before the old one can be deleted.
                    let value_key = value_store.get_or_create_key(txn, &typed)?;
                    value_store.de_reference_or_delete_value(txn, &old_key)?;
                    entry_store.put_value_key(txn, &key_buffer, &value_key)?;
                    self.counts.replaced_entries += 1;
                }
                PutOutcome::replaced_entry()
            }
        };

        key_buffer.clear();
        self.key_buffer = Some(key_buffer);
        if outcome.is_success() {
            self.puts_since_commit += 1;
            self.commit_if_required()?;
        }
        Ok(outcome)
    }

    /// UID of `map`, from the loader's cache or the UID store.
    fn uid_for(&mut self, map: &MapDefinition) -> StoreResult<Uid> {
        if let Some(uid) = self.uid_cache.get(map) {
            return Ok(*uid);
        }
        let txn = self.open_txn()?;
        let uid = self.store.uid_store.get_or_create_uid(txn, map)?;
        self.uid_cache.insert(map.clone(), uid);
        Ok(uid)
    }

    fn commit_if_required(&mut self) -> StoreResult<()> {
        match self.commit_interval {
            Some(interval) if self.puts_since_commit >= interval => {
                if let Some(txn) = self.txn.take() {
                    txn.commit()?;
                    debug!(
                        stream = %self.stream,
                        put_count = self.counts.puts,
                        "committed intermediate batch"
                    );
                }
                self.puts_since_commit = 0;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn begin_if_needed(&mut self) -> StoreResult<()> {
        if self.txn.is_none() {
            self.txn = Some(self.store.env.begin_write()?);
        }
        Ok(())
    }

    fn open_txn(&self) -> StoreResult<&WriteTransaction> {
        open_txn(&self.txn, &self.stream)
    }

    fn require_state(&self, expected: LoaderState, action: &str) -> StoreResult<()> {
        if self.failed {
            return Err(StoreError::IllegalState(format!(
                "cannot {action}, an earlier write of this load failed"
            )));
        }
        if self.state == expected {
            Ok(())
        } else {
            Err(StoreError::IllegalState(format!(
                "cannot {action} in state {}, expected {expected}",
                self.state
            )))
        }
    }
}

/// The open write transaction, borrowed on its own so the loader's counters
/// stay mutable while it is in use.
fn open_txn<'t>(txn: &'t Option<WriteTransaction>, stream: &RefStreamDefinition) -> StoreResult<&'t WriteTransaction> {
    txn.as_ref()
        .ok_or_else(|| StoreError::IllegalState(format!("no open write transaction for {stream}")))
}

impl fmt::Debug for RefDataLoader<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefDataLoader")
            .field("stream", &self.stream)
            .field("state", &self.state)
            .field("counts", &self.counts)
            .field("failed", &self.failed)
            .finish()
    }
}

impl Drop for RefDataLoader<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            error!(stream = %self.stream, error = %err, "failed to close loader");
        }
    }
}
