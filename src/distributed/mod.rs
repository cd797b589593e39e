pub mod pipeline;
pub mod transport;

pub use pipeline::{PipelineConfig, RankRuntime, Schedule, ScheduleBuilder, StageCompute, StageTopology};
pub use transport::{ChannelTransport, Transport, TransportError};
