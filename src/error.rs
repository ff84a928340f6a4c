//! Error taxonomy shared by the contest components.
//!
//! Three families are kept apart because they propagate differently:
//! - [`ContestError`] aborts the run before (or instead of) dispatching anything.
//! - [`ExecutionFault`] never leaves the scheduler: it is turned into a match outcome.
//! - [`ArchiveFault`] is downgraded to a warning by the archive manager.

use thiserror::Error;

use crate::contest::{MatchId, MatchStatus};

/// Fatal errors: malformed configuration, impossible plans, resume mismatches.
#[derive(Debug, Error)]
pub enum ContestError {
    /// Malformed roster, impossible split, missing layouts, bad worker file...
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The resume manifest was produced by a different plan.
    #[error("resume manifest does not match the current plan: {0}")]
    ResumeMismatch(String),

    /// A status change that would move a match backwards.
    #[error("illegal transition for match {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        /// Match concerned.
        id: MatchId,
        /// Status before the attempted change.
        from: MatchStatus,
        /// Requested status.
        to: MatchStatus,
    },

    /// Manifest or working directory I/O.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization.
    #[error("manifest format error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContestError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ContestError::Configuration(msg.into())
    }
}

/// Why a single remote execution did not produce a regular result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionFault {
    /// Host unreachable, transfer failure, timeout not attributable to an agent. Retryable.
    #[error("connectivity fault: {0}")]
    Connectivity(String),

    /// The engine reported an agent crash or illegal behaviour. Terminal.
    #[error("game fault (red crashed: {red_crashed}, blue crashed: {blue_crashed}): {detail}")]
    Game {
        /// The red agent is at fault.
        red_crashed: bool,
        /// The blue agent is at fault.
        blue_crashed: bool,
        /// Engine line that reported the fault.
        detail: String,
    },

    /// The operator asked for a forced stop while the match was running.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionFault {
    /// Only transport-level faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutionFault::Connectivity(_))
    }
}

/// Packaging or upload failure. Never fatal for the run.
#[derive(Debug, Error)]
pub enum ArchiveFault {
    /// Building a tarball or writing the stats file failed.
    #[error("packaging failed for {what}: {source}")]
    Packaging {
        /// Which artifact was being built.
        what: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The remote store rejected or never answered the upload.
    #[error("upload failed: {0}")]
    Upload(String),
}
