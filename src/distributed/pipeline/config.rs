//! Pipeline configuration.
//!
//! [`PipelineConfig`] is the launcher surface as data: pipeline depth,
//! micro-batch count, memory limit, interleaving (round-robin or ZB-V),
//! post-validation and the profiling window. It loads from YAML or JSON and
//! builds the schedule.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::CostModel;
use super::schedule::{Schedule, ScheduleBuilder};
use super::timers::ProfilingWindow;
use super::topology::{Placement, StageTopology};
use crate::error::{Error, Result};
use crate::optimizer::post_validation::PostValidationConfig;

/// Maximum pending backwards per rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "MemoryLimitRepr", into = "MemoryLimitRepr")]
pub enum MemoryLimit {
    /// `pipeline_depth * interleave_factor`: the 1F1B activation budget.
    #[default]
    Auto,
    Fixed(usize),
}

impl MemoryLimit {
    pub fn resolve(self, pipeline_depth: usize, interleave_factor: usize) -> usize {
        match self {
            MemoryLimit::Auto => pipeline_depth * interleave_factor,
            MemoryLimit::Fixed(n) => n,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum MemoryLimitRepr {
    Fixed(usize),
    Named(String),
}

impl TryFrom<MemoryLimitRepr> for MemoryLimit {
    type Error = String;

    fn try_from(repr: MemoryLimitRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            MemoryLimitRepr::Fixed(n) => Ok(MemoryLimit::Fixed(n)),
            MemoryLimitRepr::Named(s) if s.eq_ignore_ascii_case("auto") => Ok(MemoryLimit::Auto),
            MemoryLimitRepr::Named(s) => Err(format!("expected a number or \"auto\", got {s:?}")),
        }
    }
}

impl From<MemoryLimit> for MemoryLimitRepr {
    fn from(limit: MemoryLimit) -> Self {
        match limit {
            MemoryLimit::Auto => MemoryLimitRepr::Named("auto".into()),
            MemoryLimit::Fixed(n) => MemoryLimitRepr::Fixed(n),
        }
    }
}

/// Static scheduler configuration. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of pipeline ranks (`P`).
    pub pipeline_depth: usize,
    /// Model layers, split evenly over ranks and chunks.
    pub num_layers: usize,
    /// Micro-batches per iteration (`M`).
    pub num_microbatches: usize,
    /// Pending backwards allowed per rank.
    pub memory_limit: MemoryLimit,
    /// Virtual stages per rank (`V`). Must be 1 or 2 with `v_schedule`.
    pub interleave_factor: usize,
    /// ZB-V placement: two chunks per rank, folded into a V.
    pub v_schedule: bool,
    /// Run weight-gradient passes separately to fill bubbles.
    pub split_backward: bool,
    pub post_validation: PostValidationConfig,
    pub profiling: ProfilingWindow,
    /// How long a receive may block before [`Error::StallTimeout`].
    pub recv_timeout_ms: u64,
    /// Tick costs used to plan the schedule.
    pub cost: CostModel,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 1,
            num_layers: 1,
            num_microbatches: 1,
            memory_limit: MemoryLimit::Auto,
            interleave_factor: 1,
            v_schedule: false,
            split_backward: false,
            post_validation: PostValidationConfig::default(),
            profiling: ProfilingWindow::default(),
            recv_timeout_ms: 60_000,
            cost: CostModel::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config("config", format!("YAML parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::config("config", format!("JSON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(Error::config(
                "config",
                format!("unsupported config file extension: {}", path.display()),
            )),
        }
    }

    /// Resolved memory limit.
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
            .resolve(self.pipeline_depth, self.virtual_stages())
    }

    /// Virtual stages per rank actually scheduled; `v_schedule` forces 2.
    pub fn virtual_stages(&self) -> usize {
        if self.v_schedule {
            2
        } else {
            self.interleave_factor
        }
    }

    pub fn placement(&self) -> Placement {
        if self.v_schedule {
            Placement::VShape
        } else {
            Placement::Interleaved
        }
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_microbatches < 1 {
            return Err(Error::config("num_microbatches", "must be >= 1, got 0"));
        }
        if self.memory_limit() < 1 {
            return Err(Error::config("memory_limit", "must be >= 1, got 0"));
        }
        if self.recv_timeout_ms == 0 {
            return Err(Error::config("recv_timeout_ms", "must be > 0"));
        }
        if self.profiling.start_iteration > self.profiling.end_iteration {
            tracing::debug!(
                start = self.profiling.start_iteration,
                end = self.profiling.end_iteration,
                "profiling window is empty"
            );
        }
        if self.v_schedule && !matches!(self.interleave_factor, 1 | 2) {
            return Err(Error::config(
                "interleave_factor",
                format!("v_schedule runs 2 virtual stages per rank, got {}", self.interleave_factor),
            ));
        }
        self.post_validation.validate()?;
        self.cost.validate()?;
        self.topology()?
            .layout_with(self.virtual_stages(), self.placement())?;
        Ok(())
    }

    pub fn topology(&self) -> Result<StageTopology> {
        StageTopology::new(self.pipeline_depth, self.num_layers)
    }

    pub fn schedule_builder(&self) -> Result<ScheduleBuilder> {
        Ok(ScheduleBuilder::new(
            self.topology()?,
            self.num_microbatches,
            self.memory_limit(),
            self.virtual_stages(),
        )
        .placement(self.placement())
        .split_backward(self.split_backward)
        .post_validation(self.post_validation.enabled)
        .cost_model(self.cost))
    }

    pub fn build_schedule(&self) -> Result<Schedule> {
        self.validate()?;
        self.schedule_builder()?.build()
    }
}
