//! # zbsched
//!
//! **Zero-bubble pipeline-parallel execution scheduler.**
//!
//! zbsched plans and drives the per-rank operation order of pipeline-parallel
//! training: memory-bounded forward/backward interleaving, optional virtual
//! stages, split weight-gradient passes, and a post-validated optimizer step.
//! Model compute, optimizer state and transport are injected; payloads are
//! opaque.
//!
//! ## Flow
//!
//! ```text
//! ┌────────────────┐    ┌─────────────────┐    ┌──────────────────────┐
//! │ StageTopology  │───►│ ScheduleBuilder │───►│ Schedule (per rank)  │
//! │ (P, V, layers) │    │ (simulated clock│    │ F / B / W / send /   │
//! └────────────────┘    │  + mem limit)   │    │ recv / opt / sync    │
//!                       └─────────────────┘    └──────────┬───────────┘
//!                                                         │
//!              ┌──────────────────────────────────────────▼───────────┐
//!              │ RankRuntime (one thread per rank)                     │
//!              │  PendingBackwardLimiter · Transport · TimingRecorder  │
//!              │  StageCompute · OptimizerApply · PostValidator        │
//!              └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Immutable plan**: a [`Schedule`] is built once, verified, and shared by `Arc`
//! - **Deferral, not spinning**: a forward the limiter refuses waits in a per-rank queue
//! - **Explicit rollback**: post-validation walks [`StepState`], retrying at most once

pub mod distributed;
pub mod error;
pub mod optimizer;

pub use distributed::pipeline::{
    CostModel, IterationResult, MemoryLimit, OpKind, Operation, PipelineConfig, ProfilingWindow, RankRuntime,
    Schedule, ScheduleBuilder, StageCompute, StageId, StageTopology, StepReport,
};
pub use distributed::transport::{ChannelTransport, Transport, TransportError};
pub use error::{BoxError, Error, Result};
pub use optimizer::{
    ComputeResult, Fingerprint, FingerprintBuilder, OptimizerApply, PostValidationConfig, PostValidator,
    SnapshotHandle, SnapshotProvider, StepState, ValidationOutcome,
};
