//! Shared helpers for multi-rank tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use zbsched::distributed::pipeline::StageId;
use zbsched::{
    ChannelTransport, ComputeResult, Fingerprint, FingerprintBuilder, IterationResult, OptimizerApply, RankRuntime,
    Schedule, SnapshotHandle, SnapshotProvider, StageCompute, Transport,
};

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Doubles on forward and on backward; records every call.
#[derive(Debug, Default)]
pub struct Doubler {
    pub calls: Vec<String>,
    pub weight_passes: usize,
    pub discards: usize,
}

impl StageCompute<f64> for Doubler {
    fn forward(&mut self, stage: StageId, microbatch: usize, input: Option<f64>) -> ComputeResult<f64> {
        self.calls.push(format!("F{microbatch}@{}", stage.logical));
        Ok(input.unwrap_or(microbatch as f64) * 2.0)
    }

    fn backward(&mut self, stage: StageId, microbatch: usize, grad_output: Option<f64>) -> ComputeResult<f64> {
        self.calls.push(format!("B{microbatch}@{}", stage.logical));
        Ok(grad_output.unwrap_or(1.0) * 2.0)
    }

    fn backward_weights(&mut self, stage: StageId, microbatch: usize) -> ComputeResult<()> {
        self.calls.push(format!("W{microbatch}@{}", stage.logical));
        self.weight_passes += 1;
        Ok(())
    }

    fn discard(&mut self) -> ComputeResult<()> {
        self.discards += 1;
        Ok(())
    }
}

/// Fingerprints a fixed parameter vector; `skew` perturbs the first
/// `skewed_calls` applications.
#[derive(Debug)]
pub struct ToyOptimizer {
    pub params: Vec<f32>,
    pub skew: f32,
    pub skewed_calls: usize,
    pub calls: usize,
}

impl ToyOptimizer {
    pub fn new(params: Vec<f32>) -> Self {
        Self {
            params,
            skew: 0.0,
            skewed_calls: 0,
            calls: 0,
        }
    }

    pub fn skewed(mut self, skew: f32, calls: usize) -> Self {
        self.skew = skew;
        self.skewed_calls = calls;
        self
    }
}

impl OptimizerApply for ToyOptimizer {
    fn optimizer_apply(&mut self) -> ComputeResult<Fingerprint> {
        self.calls += 1;
        let mut updated = self.params.clone();
        if self.calls <= self.skewed_calls {
            updated[0] += self.skew;
        }
        Ok(FingerprintBuilder::new().update_f32(&updated).finish())
    }
}

#[derive(Debug, Default)]
pub struct CountingSnapshots {
    pub taken: usize,
    pub restored: Vec<SnapshotHandle>,
}

impl SnapshotProvider for CountingSnapshots {
    fn snapshot_params(&mut self) -> ComputeResult<SnapshotHandle> {
        self.taken += 1;
        Ok(SnapshotHandle(self.taken as u64))
    }

    fn restore(&mut self, handle: SnapshotHandle) -> ComputeResult<()> {
        self.restored.push(handle);
        Ok(())
    }
}

/// Run one iteration on every rank of `schedule`, one thread per rank.
///
/// Rank 0 gets `0.0, 1.0, ...` as micro-batch inputs.
pub fn run_all_ranks(schedule: &Arc<Schedule>) -> Vec<(IterationResult<f64>, Doubler)> {
    let m = schedule.num_microbatches();
    let mesh = ChannelTransport::<f64>::mesh(schedule.num_ranks());
    thread::scope(|s| {
        let handles: Vec<_> = mesh
            .into_iter()
            .map(|transport| {
                let schedule = Arc::clone(schedule);
                s.spawn(move || {
                    let rank = transport.rank();
                    let mut runtime = RankRuntime::new(schedule, transport)
                        .unwrap()
                        .with_recv_timeout(TIMEOUT);
                    let mut compute = Doubler::default();
                    let mut optimizer = ToyOptimizer::new(vec![1.0, 2.0]);
                    let inputs = (rank == 0).then(|| (0..m).map(|mb| mb as f64).collect());
                    let result = runtime.run_iteration(&mut compute, &mut optimizer, inputs).unwrap();
                    (result, compute)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
