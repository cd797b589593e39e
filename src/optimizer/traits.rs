//! Callback traits for the optimizer side of a training step.

use super::fingerprint::Fingerprint;
use crate::error::BoxError;

/// Result type of user-supplied callbacks.
pub type ComputeResult<T> = std::result::Result<T, BoxError>;

/// Applies the accumulated gradients to this rank's parameters.
pub trait OptimizerApply: Send {
    /// Run the optimizer update and fingerprint the updated state.
    fn optimizer_apply(&mut self) -> ComputeResult<Fingerprint>;
}

/// Opaque handle to a parameter snapshot held by a [`SnapshotProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotHandle(pub u64);

/// Saves and restores pre-step parameters for post-validation rollback.
pub trait SnapshotProvider: Send {
    fn snapshot_params(&mut self) -> ComputeResult<SnapshotHandle>;

    fn restore(&mut self, handle: SnapshotHandle) -> ComputeResult<()>;
}
