//! Stage compute callbacks.
//!
//! The runtime never looks inside payloads: a [`StageCompute`] implementation
//! owns the model chunk(s) of one rank and must save whatever it needs for
//! `backward` when `forward` runs, keyed by `(stage, microbatch)`.

use super::topology::StageId;
use crate::optimizer::traits::ComputeResult;

/// Per-rank compute for every stage the rank owns.
pub trait StageCompute<T>: Send {
    /// Forward pass of one micro-batch through `stage`.
    ///
    /// `input` is the upstream activation, or the caller-supplied micro-batch
    /// on the first logical stage (`None` if the caller supplied no inputs).
    fn forward(&mut self, stage: StageId, microbatch: usize, input: Option<T>) -> ComputeResult<T>;

    /// Input-gradient backward of one micro-batch.
    ///
    /// `grad_output` is `None` on the last logical stage, where the loss is
    /// local. Unless the schedule splits the backward, weight gradients are
    /// accumulated here too.
    fn backward(&mut self, stage: StageId, microbatch: usize, grad_output: Option<T>) -> ComputeResult<T>;

    /// Deferred weight-gradient pass (split backward only).
    fn backward_weights(&mut self, _stage: StageId, _microbatch: usize) -> ComputeResult<()> {
        Ok(())
    }

    /// Drop saved activations and accumulated gradients of the current step.
    ///
    /// Called before a rolled-back step is retried.
    fn discard(&mut self) -> ComputeResult<()> {
        Ok(())
    }
}
