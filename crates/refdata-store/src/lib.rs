//! Transactional reference data store.
//!
//! Reference data is loaded in bulk, one reference stream at a time, and
//! then looked up by (map, key) during processing. Everything lives in a
//! single redb database so it survives restarts and is shared by every
//! thread of the process.
//!
//! # Indices
//!
//! - [`MapDefinitionUidStore`] -- interns each map definition as a 4-byte [`Uid`](refdata_types::Uid)
//! - [`KeyValueStoreDb`] -- (map UID, key) to value key
//! - [`RangeStoreDb`] -- (map UID, `[from, to)`) to value key
//! - [`ValueStore`] -- content-addressed, reference-counted value bytes
//! - [`ProcessingInfoDb`] -- load status per reference stream
//!
//! # Loading
//!
//! A [`RefDataLoader`] holds the stream's lock and the database's write
//! transaction. It moves NEW -> INITIALISED -> COMPLETED, and may be closed
//! from any state. Use [`RefDataStore::do_with_loader_unless_complete`] so
//! concurrent requests for the same stream load it once.
//!
//! # Design Rules
//!
//! 1. Identical values are stored once; every entry holds one reference.
//! 2. A value is deleted when its last reference goes.
//! 3. Forward and reverse UID maps always hold the same pairs.
//! 4. Loads of one stream are serialized; other streams wait only on the
//!    database writer.
//! 5. Readers see the last committed state, never a loader's open batch.

pub mod config;
pub mod consumer;
pub mod entry_store;
pub mod env;
pub mod error;
pub mod hasher;
pub mod keys;
pub mod loader;
pub mod lock;
pub mod map_uid;
pub mod pool;
pub mod processing_info;
pub mod store;
pub mod value_store;

// Re-export primary types at crate root for ergonomic imports.
pub use config::ReferenceDataConfig;
pub use consumer::{StringValueConsumer, StructuredValueConsumer, ValueConsumer, ValueConsumerRegistry};
pub use entry_store::{EntryStore, KeyValueStoreDb, RangeStoreDb};
pub use env::RefDataEnv;
pub use error::{StoreError, StoreResult};
pub use hasher::ValueHasher;
pub use keys::{KeyValueStoreKey, RangeStoreKey, ValueStoreKey};
pub use loader::{LoadCounts, LoaderState, PutOutcome, RefDataLoader};
pub use lock::{InterruptFlag, StripeGuard, StripedLock};
pub use map_uid::MapDefinitionUidStore;
pub use pool::{ByteBufferPool, PooledBuffer};
pub use processing_info::ProcessingInfoDb;
pub use store::{EntryCounts, PurgeCounts, RefDataStore};
pub use value_store::{ValueStore, ValueStoreMeta};
