use serde::{Deserialize, Serialize};

/// DatasetStatus is the single source of truth for what must happen next to
/// a dataset. Workers poll by status and advance it through compare-and-set
/// writes; only transitions present in [`DatasetStatus::transitions`] are
/// legal.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Submitted,
    UploadQueued,
    Uploading,
    Unzipping,
    SyncQueued,
    Syncing,
    ConversionQueued,
    Converting,
    Done,
    UploadError,
    SyncError,
    ConversionError,
    ConversionFailed,
    Cancelled,
}

use DatasetStatus::*;

// The static transition table. Cycles exist only through error -> retry
// resets and the converting -> conversion_queued requeue.
const TRANSITIONS: &[(DatasetStatus, &[DatasetStatus])] = &[
    (Submitted, &[UploadQueued, SyncQueued, Uploading, Cancelled]),
    (UploadQueued, &[Uploading, UploadError, Cancelled]),
    (
        Uploading,
        &[Unzipping, ConversionQueued, Done, UploadError, Cancelled],
    ),
    (Unzipping, &[ConversionQueued, Done, UploadError, Cancelled]),
    (SyncQueued, &[Syncing, SyncError, Cancelled]),
    (Syncing, &[ConversionQueued, Done, SyncError, Cancelled]),
    (UploadError, &[UploadQueued, Uploading, Cancelled]),
    (SyncError, &[SyncQueued, Cancelled]),
    (ConversionQueued, &[Converting, Cancelled]),
    (
        Converting,
        &[
            Done,
            ConversionQueued,
            ConversionError,
            ConversionFailed,
            Cancelled,
        ],
    ),
    (ConversionError, &[ConversionQueued, Cancelled]),
    (Done, &[]),
    (ConversionFailed, &[]),
    (Cancelled, &[]),
];

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Submitted => "submitted",
            UploadQueued => "upload_queued",
            Uploading => "uploading",
            Unzipping => "unzipping",
            SyncQueued => "sync_queued",
            Syncing => "syncing",
            ConversionQueued => "conversion_queued",
            Converting => "converting",
            Done => "done",
            UploadError => "upload_error",
            SyncError => "sync_error",
            ConversionError => "conversion_error",
            ConversionFailed => "conversion_failed",
            Cancelled => "cancelled",
        }
    }

    pub fn all() -> impl Iterator<Item = DatasetStatus> {
        TRANSITIONS.iter().map(|(from, _)| *from)
    }

    /// Statuses reachable from `self` in a single legal transition.
    pub fn transitions(&self) -> &'static [DatasetStatus] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .map(|(_, to)| *to)
            .unwrap_or(&[])
    }

    pub fn can_transition_to(&self, to: DatasetStatus) -> bool {
        self.transitions().contains(&to)
    }

    /// Terminal statuses are never touched by the dispatcher again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Done | ConversionFailed | Cancelled)
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TRANSITIONS
            .iter()
            .map(|(from, _)| *from)
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("invalid dataset status {s:?}"))
    }
}

impl std::fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a chunked upload session.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Completing,
    Complete,
    Aborted,
    Expired,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Open => "open",
            SessionState::Completing => "completing",
            SessionState::Complete => "complete",
            SessionState::Aborted => "aborted",
            SessionState::Expired => "expired",
        }
    }
}

impl std::str::FromStr for SessionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(SessionState::Open),
            "completing" => Ok(SessionState::Completing),
            "complete" => Ok(SessionState::Complete),
            "aborted" => Ok(SessionState::Aborted),
            "expired" => Ok(SessionState::Expired),
            other => Err(format!("invalid session state {other:?}")),
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
