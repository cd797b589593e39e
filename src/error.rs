//! zbsched error types

use std::time::Duration;

use crate::distributed::pipeline::schedule::{OpKind, TransferKind};
use crate::optimizer::fingerprint::Fingerprint;

/// zbsched result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error type returned by user-supplied compute, optimizer and snapshot callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// zbsched errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid static parameter, detected before any iteration runs
    #[error("invalid configuration '{parameter}': {reason}")]
    Configuration {
        /// Offending parameter
        parameter: &'static str,
        /// Invariant it violates
        reason: String,
    },

    /// Scheduler-internal defect (e.g. a negative pending-backward count)
    #[error("invariant violated on rank {rank}: {reason}")]
    InvariantViolation {
        /// Rank that detected the violation
        rank: usize,
        /// Description of what went wrong
        reason: String,
    },

    /// A required receive never arrived
    #[error(
        "rank {rank} stalled waiting for {kind}{} from rank {peer} (timeout {timeout:?})",
        .microbatch.map(|mb| format!(" of micro-batch {mb}")).unwrap_or_default()
    )]
    StallTimeout {
        /// Waiting rank
        rank: usize,
        /// Rank the payload was expected from
        peer: usize,
        /// Micro-batch the payload belongs to; `None` for fingerprints
        microbatch: Option<usize>,
        /// What was being waited for
        kind: TransferKind,
        /// Configured receive timeout
        timeout: Duration,
    },

    /// Failure propagated verbatim from a compute callback
    #[error("compute error on rank {rank} during {op} (stage {stage}, micro-batch {microbatch:?}): {source}")]
    Compute {
        /// Rank executing the operation
        rank: usize,
        /// Logical pipeline stage
        stage: usize,
        /// Micro-batch, if the operation is per micro-batch
        microbatch: Option<usize>,
        /// Operation kind
        op: OpKind,
        /// Callback error, untouched
        #[source]
        source: BoxError,
    },

    /// Two consecutive post-validation mismatches
    #[error("numeric divergence after {retries} retry: local fingerprint {local}, remote fingerprint {remote}")]
    NumericDivergence {
        /// This rank's fingerprint on the failing attempt
        local: Fingerprint,
        /// Disagreeing fingerprint from the validation group
        remote: Fingerprint,
        /// Rollback-retries performed before giving up
        retries: usize,
    },

    /// Non-timeout transport failure
    #[error("transport error on rank {rank} (peer {peer}): {reason}")]
    Transport {
        /// Local rank
        rank: usize,
        /// Remote rank
        peer: usize,
        /// Description of what went wrong
        reason: String,
    },

    /// I/O error from a config file or observability sink
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn config(parameter: &'static str, reason: impl Into<String>) -> Self {
        Error::Configuration {
            parameter,
            reason: reason.into(),
        }
    }

    pub(crate) fn invariant(rank: usize, reason: impl Into<String>) -> Self {
        Error::InvariantViolation {
            rank,
            reason: reason.into(),
        }
    }

    /// Whether the error aborts training outright rather than just the current iteration.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Configuration { .. }
                | Error::InvariantViolation { .. }
                | Error::NumericDivergence { .. }
        )
    }
}
