use std::fmt;

use redb::{ReadableTable, TableHandle, WriteTransaction};
use refdata_types::{ProcessingInfo, ProcessingState, RefStreamDefinition};
use tracing::trace;

use crate::env::{BytesTable, TxnRead, PROCESSING_INFO};
use crate::error::{StoreError, StoreResult};
use crate::keys::{decode, encode};

/// Encoded size of a processing info record.
///
/// ```text
/// [create time: 8][last update time: 8][effective time: 8][state id: 1]
/// ```
const RECORD_LEN: usize = 25;

fn encode_info(info: &ProcessingInfo) -> [u8; RECORD_LEN] {
    let mut buf = [0u8; RECORD_LEN];
    buf[0..8].copy_from_slice(&info.create_time_ms.to_be_bytes());
    buf[8..16].copy_from_slice(&info.last_update_time_ms.to_be_bytes());
    buf[16..24].copy_from_slice(&info.effective_time_ms.to_be_bytes());
    buf[24] = info.state.id();
    buf
}

fn decode_info(bytes: &[u8]) -> StoreResult<ProcessingInfo> {
    let record: &[u8; RECORD_LEN] = bytes.try_into().map_err(|_| {
        StoreError::Corruption(format!(
            "processing info must be {RECORD_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    let field = |at: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&record[at..at + 8]);
        i64::from_be_bytes(raw)
    };
    Ok(ProcessingInfo {
        create_time_ms: field(0),
        last_update_time_ms: field(8),
        effective_time_ms: field(16),
        state: ProcessingState::from_id(record[24])?,
    })
}

/// Load status per reference stream.
#[derive(Clone, Copy)]
pub struct ProcessingInfoDb {
    table: BytesTable,
}

impl Default for ProcessingInfoDb {
    fn default() -> Self {
        Self {
            table: PROCESSING_INFO,
        }
    }
}

impl fmt::Debug for ProcessingInfoDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessingInfoDb")
            .field("table", &self.table.name())
            .finish()
    }
}

impl ProcessingInfoDb {
    /// Write `info` for `stream`. An existing record is only replaced when
    /// `overwrite` is set; returns whether the record was written.
    pub fn put(
        &self,
        txn: &WriteTransaction,
        stream: &RefStreamDefinition,
        info: &ProcessingInfo,
        overwrite: bool,
    ) -> StoreResult<bool> {
        let key = encode(stream)?;
        let mut table = txn.open_table(self.table)?;
        if !overwrite && table.get(key.as_slice())?.is_some() {
            return Ok(false);
        }
        table.insert(key.as_slice(), encode_info(info).as_slice())?;
        trace!(stream = %stream, state = %info.state, "wrote processing info");
        Ok(true)
    }

    pub fn get<R: TxnRead>(&self, txn: &R, stream: &RefStreamDefinition) -> StoreResult<Option<ProcessingInfo>> {
        let key = encode(stream)?;
        let table = txn.open_bytes(self.table)?;
        let info = match table.get(key.as_slice())? {
            Some(value) => Some(decode_info(value.value())?),
            None => None,
        };
        Ok(info)
    }

    /// Set the state of an existing record, stamping `now_ms` as its update time.
    pub fn update_state(
        &self,
        txn: &WriteTransaction,
        stream: &RefStreamDefinition,
        state: ProcessingState,
        now_ms: i64,
    ) -> StoreResult<ProcessingInfo> {
        let current = self
            .get(txn, stream)?
            .ok_or_else(|| StoreError::NotFound(format!("no processing info for {stream}")))?;
        let updated = current.with_state(state, now_ms);
        self.put(txn, stream, &updated, true)?;
        Ok(updated)
    }

    /// Refresh the last-access time if it is older than `min_age_ms`.
    ///
    /// Returns the record as stored after the call.
    pub fn touch(
        &self,
        txn: &WriteTransaction,
        stream: &RefStreamDefinition,
        now_ms: i64,
        min_age_ms: i64,
    ) -> StoreResult<Option<ProcessingInfo>> {
        let Some(current) = self.get(txn, stream)? else {
            return Ok(None);
        };
        if now_ms.saturating_sub(current.last_update_time_ms) < min_age_ms {
            return Ok(Some(current));
        }
        let touched = current.touched(now_ms);
        self.put(txn, stream, &touched, true)?;
        Ok(Some(touched))
    }

    /// Every record, in key order.
    pub fn list<R: TxnRead>(&self, txn: &R) -> StoreResult<Vec<(RefStreamDefinition, ProcessingInfo)>> {
        let table = txn.open_bytes(self.table)?;
        let mut records = Vec::new();
        for item in table.range::<&[u8]>(..)? {
            let (key, value) = item?;
            records.push((decode(key.value())?, decode_info(value.value())?));
        }
        Ok(records)
    }

    /// Returns `true` if a record was removed.
    pub fn delete(&self, txn: &WriteTransaction, stream: &RefStreamDefinition) -> StoreResult<bool> {
        let key = encode(stream)?;
        let mut table = txn.open_table(self.table)?;
        let removed = table.remove(key.as_slice())?.is_some();
        Ok(removed)
    }
}
