//! Engine error types.

use rulesync_api::{Rule, RuleKey};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

use crate::mirror::MirrorError;
use crate::primary::PrimaryError;

/// A rule that could not be rewritten after a whole-store clear.
///
/// The rule has been dropped from the mirror as well.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayFailure {
    pub rule: Rule,
    pub error: PrimaryError,
}

impl fmt::Display for ReplayFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rule, self.error)
    }
}

/// Engine errors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// A single rule write was rejected. The mirror was not touched.
    #[error("failed to write rule {key}: {source}")]
    WriteFailed {
        key: RuleKey,
        #[source]
        source: PrimaryError,
    },

    /// The whole-store clear failed. No rules were replayed; the mirror
    /// already reflects the removal, the remote state is unknown.
    #[error("failed to clear remote rules: {0}")]
    ClearFailed(#[source] PrimaryError),

    /// One or more rules could not be replayed after a clear.
    #[error("{} rule(s) lost while rebuilding remote rules: {}", .failures.len(), join_failures(.failures))]
    ReplayFailed { failures: Vec<ReplayFailure> },

    /// A rename's new rule and the restore of the old rule both failed.
    /// Neither rule exists in the mirror or the remote store.
    #[error("{original}; restoring the previous rule also failed: {restore}")]
    DoubleFailure {
        original: Box<SyncError>,
        restore: Box<SyncError>,
    },

    /// A rename's rebuild failed and the new rule could not be written
    /// either. `write` is the write (or restore) error, `rebuild` the
    /// clear or replay error that preceded it.
    #[error("{write}; removing the previous rule also failed: {rebuild}")]
    RenameFailed {
        write: Box<SyncError>,
        rebuild: Box<SyncError>,
    },

    /// The local mirror medium failed.
    #[error(transparent)]
    Mirror(#[from] MirrorError),
}

fn join_failures(failures: &[ReplayFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl SyncError {
    /// The settled transaction state this error represents
    pub fn outcome(&self) -> Outcome {
        match self {
            Self::DoubleFailure { .. } => Outcome::PartiallyFailed,
            Self::RenameFailed { write, .. } => write.outcome(),
            _ => Outcome::Failed,
        }
    }

    pub fn is_double_failure(&self) -> bool {
        match self {
            Self::DoubleFailure { .. } => true,
            Self::RenameFailed { write, .. } => write.is_double_failure(),
            _ => false,
        }
    }

    /// Rules dropped from the mirror by a failed replay
    pub fn replay_failures(&self) -> &[ReplayFailure] {
        match self {
            Self::ReplayFailed { failures } => failures,
            Self::RenameFailed { rebuild, .. } => rebuild.replay_failures(),
            _ => &[],
        }
    }
}

/// How a top-level operation settled.
///
/// An operation is pending while its future is in flight and settles into
/// exactly one of these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Committed,
    Failed,
    /// Only produced by a rename whose compensating restore also failed
    PartiallyFailed,
}

impl Outcome {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Self::Committed,
            Err(e) => e.outcome(),
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Committed => f.write_str("committed"),
            Self::Failed => f.write_str("failed"),
            Self::PartiallyFailed => f.write_str("partially failed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
