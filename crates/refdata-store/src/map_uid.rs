use std::fmt;

use redb::{ReadableTable, ReadableTableMetadata, TableHandle, WriteTransaction};
use refdata_types::{MapDefinition, RefStreamDefinition, Uid, UidRef};
use tracing::{debug, trace};

use crate::env::{entries_with_prefix, BytesTable, TxnRead, MAP_UID_FORWARD, MAP_UID_REVERSE};
use crate::error::{StoreError, StoreResult};
use crate::keys::{decode, encode};

/// Two-way mapping between map definitions and their UIDs.
///
/// The forward table maps the encoded [`MapDefinition`] to its UID and the
/// reverse table maps the UID back. Both are written in the same write
/// transaction and must always hold the same number of entries.
///
/// New UIDs are `highest + 1` from the reverse table (or zero when it is
/// empty). The read of the highest UID and the two inserts all happen in
/// the caller's write transaction, and redb allows only one write
/// transaction at a time, so two loaders can never allocate the same UID
/// even when they hold different stream locks.
#[derive(Clone, Copy)]
pub struct MapDefinitionUidStore {
    forward: BytesTable,
    reverse: BytesTable,
}

impl Default for MapDefinitionUidStore {
    fn default() -> Self {
        Self {
            forward: MAP_UID_FORWARD,
            reverse: MAP_UID_REVERSE,
        }
    }
}

impl fmt::Debug for MapDefinitionUidStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapDefinitionUidStore")
            .field("forward", &self.forward.name())
            .field("reverse", &self.reverse.name())
            .finish()
    }
}

impl MapDefinitionUidStore {
    /// UID for `map_definition`, if one has been allocated.
    pub fn get_uid<R: TxnRead>(&self, txn: &R, map_definition: &MapDefinition) -> StoreResult<Option<Uid>> {
        let key = encode(map_definition)?;
        let forward = txn.open_bytes(self.forward)?;
        let uid = match forward.get(key.as_slice())? {
            Some(value) => Some(Uid::copy_of(value.value())?),
            None => None,
        };
        Ok(uid)
    }

    /// Map definition a UID was allocated to.
    pub fn get_map_definition<R: TxnRead>(&self, txn: &R, uid: UidRef<'_>) -> StoreResult<Option<MapDefinition>> {
        let reverse = txn.open_bytes(self.reverse)?;
        let definition = match reverse.get(uid.backing_bytes())? {
            Some(value) => Some(decode(value.value())?),
            None => None,
        };
        Ok(definition)
    }

    pub fn exists<R: TxnRead>(&self, txn: &R, map_definition: &MapDefinition) -> StoreResult<bool> {
        Ok(self.get_uid(txn, map_definition)?.is_some())
    }

    /// UID for `map_definition`, allocating the next one if there is none.
    pub fn get_or_create_uid(&self, txn: &WriteTransaction, map_definition: &MapDefinition) -> StoreResult<Uid> {
        let key = encode(map_definition)?;
        let mut forward = txn.open_table(self.forward)?;
        if let Some(existing) = forward.get(key.as_slice())? {
            return Ok(Uid::copy_of(existing.value())?);
        }

        let mut reverse = txn.open_table(self.reverse)?;
        let uid = match reverse.last()? {
            Some((highest, _)) => UidRef::wrap(highest.value())?.next()?,
            None => Uid::ZERO,
        };

        reverse.insert(uid.as_bytes().as_slice(), key.as_slice())?;
        forward.insert(key.as_slice(), uid.as_bytes().as_slice())?;
        debug!(uid = %uid, map = %map_definition.map_name, "allocated map UID");
        Ok(uid)
    }

    /// Remove both entries for `uid`, returning the definition it stood for.
    ///
    /// A missing reverse entry is reported as [`StoreError::NotFound`]; a
    /// reverse entry without its forward partner is a consistency violation.
    pub fn delete_pair(&self, txn: &WriteTransaction, uid: Uid) -> StoreResult<MapDefinition> {
        let mut reverse = txn.open_table(self.reverse)?;
        let key = reverse
            .remove(uid.as_bytes().as_slice())?
            .map(|value| value.value().to_vec())
            .ok_or_else(|| StoreError::NotFound(format!("no map definition for UID {uid}")))?;

        let mut forward = txn.open_table(self.forward)?;
        if forward.remove(key.as_slice())?.is_none() {
            return Err(StoreError::Consistency(format!(
                "UID {uid} has a reverse entry but no forward entry"
            )));
        }
        let definition: MapDefinition = decode(&key)?;
        trace!(uid = %uid, map = %definition.map_name, "deleted map UID pair");
        Ok(definition)
    }

    /// Number of mapped definitions; fails if the two tables disagree.
    pub fn get_entry_count<R: TxnRead>(&self, txn: &R) -> StoreResult<u64> {
        let forward = txn.open_bytes(self.forward)?.len()?;
        let reverse = txn.open_bytes(self.reverse)?.len()?;
        if forward != reverse {
            return Err(StoreError::Consistency(format!(
                "forward UID map has {forward} entries but reverse has {reverse}"
            )));
        }
        Ok(forward)
    }

    /// Every map of `stream` that has a UID, in key order.
    pub fn get_maps_for_stream<R: TxnRead>(
        &self,
        txn: &R,
        stream: &RefStreamDefinition,
    ) -> StoreResult<Vec<(MapDefinition, Uid)>> {
        let prefix = encode(stream)?;
        let forward = txn.open_bytes(self.forward)?;
        let mut maps = Vec::new();
        for (key, value) in entries_with_prefix(&forward, &prefix)? {
            let definition: MapDefinition = decode(&key)?;
            if &definition.ref_stream_definition == stream {
                maps.push((definition, Uid::copy_of(&value)?));
            }
        }
        Ok(maps)
    }

    pub fn get_map_names<R: TxnRead>(&self, txn: &R, stream: &RefStreamDefinition) -> StoreResult<Vec<String>> {
        Ok(self
            .get_maps_for_stream(txn, stream)?
            .into_iter()
            .map(|(definition, _)| definition.map_name)
            .collect())
    }
}
