use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Current wall-clock time in milliseconds since the UNIX epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Load status of a reference stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessingState {
    LoadInProgress,
    Complete,
    Failed,
    Terminated,
    PurgeInProgress,
    PurgeFailed,
    /// Marked for removal by the next purge.
    ReadyForPurge,
}

impl ProcessingState {
    pub const ALL: [ProcessingState; 7] = [
        Self::LoadInProgress,
        Self::Complete,
        Self::Failed,
        Self::Terminated,
        Self::PurgeInProgress,
        Self::PurgeFailed,
        Self::ReadyForPurge,
    ];

    /// Stable byte id used in persisted records.
    pub fn id(&self) -> u8 {
        match self {
            Self::LoadInProgress => 0,
            Self::Complete => 1,
            Self::Failed => 2,
            Self::Terminated => 3,
            Self::PurgeInProgress => 4,
            Self::PurgeFailed => 5,
            Self::ReadyForPurge => 6,
        }
    }

    /// States a stream is left in when its load or purge never finished.
    pub fn is_partial(&self) -> bool {
        matches!(
            self,
            Self::LoadInProgress | Self::PurgeInProgress | Self::Terminated | Self::ReadyForPurge
        )
    }

    pub fn from_id(id: u8) -> Result<Self, TypeError> {
        Self::ALL
            .into_iter()
            .find(|state| state.id() == id)
            .ok_or(TypeError::UnknownProcessingState(id))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::LoadInProgress => "LOAD_IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Terminated => "TERMINATED",
            Self::PurgeInProgress => "PURGE_IN_PROGRESS",
            Self::PurgeFailed => "PURGE_FAILED",
            Self::ReadyForPurge => "READY_FOR_PURGE",
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-stream load record.
///
/// `last_update_time_ms` doubles as the last-access time: readers touch it
/// so that purging can tell streams in use from abandoned ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub create_time_ms: i64,
    pub last_update_time_ms: i64,
    pub effective_time_ms: i64,
    pub state: ProcessingState,
}

impl ProcessingInfo {
    pub fn new(create_time_ms: i64, effective_time_ms: i64, state: ProcessingState) -> Self {
        Self {
            create_time_ms,
            last_update_time_ms: create_time_ms,
            effective_time_ms,
            state,
        }
    }

    /// Copy with a new state and update time.
    pub fn with_state(&self, state: ProcessingState, update_time_ms: i64) -> Self {
        Self {
            state,
            last_update_time_ms: update_time_ms,
            ..*self
        }
    }

    /// Copy with only the update time changed.
    pub fn touched(&self, update_time_ms: i64) -> Self {
        Self {
            last_update_time_ms: update_time_ms,
            ..*self
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ProcessingState::Complete
    }
}
