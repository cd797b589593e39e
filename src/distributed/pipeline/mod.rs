pub mod clock;
pub mod comm;
pub mod config;
pub mod limiter;
pub mod runtime;
pub mod schedule;
pub mod stage;
pub mod timers;
pub mod topology;

pub use clock::{CostModel, PipelineAction, PipelineClock, TimedAction};
pub use comm::{epoch_tag, is_stale, recv_transfer, send_transfer, tag_epoch, transfer_tag};
pub use config::{MemoryLimit, PipelineConfig};
pub use limiter::PendingBackwardLimiter;
pub use runtime::{IterationResult, RankRuntime, StepReport, DEFAULT_RECV_TIMEOUT};
pub use schedule::{
    build, OpKind, Operation, RankSchedule, Schedule, ScheduleBuilder, ScheduleStats, Transfer, TransferKind,
};
pub use stage::StageCompute;
pub use timers::{
    JsonLinesSink, MemorySink, NullSink, ObservabilitySink, ProfilingWindow, TimingRecord, TimingRecorder,
    TimingSummary, TracingSink,
};
pub use topology::{Placement, StageId, StageTopology, VirtualLayout};
