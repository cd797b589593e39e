//! Optimizer-step collaborators: callbacks, fingerprints and post-validation.

pub mod fingerprint;
pub mod post_validation;
pub mod traits;

pub use fingerprint::{Fingerprint, FingerprintBuilder, MatchMode};
pub use post_validation::{
    FingerprintExchange, PostValidationConfig, PostValidator, StageFingerprint, StepAction, StepState,
    StepValidation, TransportExchange, ValidationOutcome,
};
pub use traits::{ComputeResult, OptimizerApply, SnapshotHandle, SnapshotProvider};
