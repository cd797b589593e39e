//! Per-rank execution engine.
//!
//! [`RankRuntime`] drains one rank's [`RankSchedule`](super::schedule::RankSchedule)
//! in order. Compute operations call into [`StageCompute`], transfers go
//! through the [`Transport`], and the optimizer step and post-validation
//! close the iteration.
//!
//! Suspension follows the plan:
//!
//! - `CommRecv` blocks until the payload arrives or the receive timeout
//!   expires ([`Error::StallTimeout`]);
//! - an operation that is not ready (a forward the limiter refuses, a send
//!   whose payload does not exist yet, the optimizer step before the last
//!   backward) is deferred and retried before the next scheduled operation.
//!
//! [`RankRuntime::run_step`] wraps an iteration with the post-validation
//! rollback cycle.
//!
//! Every execution attempt runs in its own epoch, derived from the iteration
//! id and the retry count, and all of its traffic is tagged with it. Ranks
//! stay in step because they run the same iterations and retries; payloads
//! left behind by an aborted attempt can never satisfy a later one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::comm::{is_stale, recv_transfer, send_transfer};
use super::limiter::PendingBackwardLimiter;
use super::schedule::{OpKind, Operation, Schedule, Transfer, TransferKind};
use super::stage::StageCompute;
use super::timers::{NullSink, ObservabilitySink, ProfilingWindow, TimingRecorder};
use super::topology::StageId;
use crate::distributed::transport::Transport;
use crate::error::{BoxError, Error, Result};
use crate::optimizer::fingerprint::Fingerprint;
use crate::optimizer::post_validation::{
    PostValidator, StepAction, StepState, StepValidation, ValidationOutcome,
};
use crate::optimizer::traits::{OptimizerApply, SnapshotHandle, SnapshotProvider};

/// Default receive timeout.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// What one rank produced in one iteration.
#[derive(Debug)]
pub struct IterationResult<T> {
    pub rank: usize,
    /// Iteration id, shared by every rank.
    pub iteration: u64,
    /// `(microbatch, output)` of the last logical stage, in execution order.
    pub outputs: Vec<(usize, T)>,
    /// `(microbatch, gradient)` w.r.t. the first logical stage's input.
    pub input_grads: Vec<(usize, T)>,
    /// Fingerprint returned by the optimizer step.
    pub fingerprint: Option<Fingerprint>,
    /// Post-validation outcome, when the schedule validates.
    pub validation: Option<ValidationOutcome>,
    /// Operations executed.
    pub executed: usize,
    /// Times an operation was deferred because it was not ready.
    pub deferred: usize,
    /// Highest pending-backward count reached.
    pub peak_pending: usize,
}

/// Outcome of [`RankRuntime::run_step`].
#[derive(Debug)]
pub struct StepReport<T> {
    /// The committed attempt.
    pub result: IterationResult<T>,
    /// 1, or 2 after a rollback.
    pub attempts: usize,
    /// Always [`StepState::Committed`] for a returned report.
    pub state: StepState,
}

/// Payload slot: `(kind, receiving logical stage, microbatch)`.
type Slot = (TransferKind, usize, usize);

struct IterationState<T> {
    epoch: u32,
    inputs: Vec<Option<T>>,
    inbox: HashMap<Slot, T>,
    outbox: HashMap<Transfer, T>,
    forwarded: HashSet<(usize, usize)>,
    backwarded: HashSet<(usize, usize)>,
    weighted: usize,
    outputs: Vec<(usize, T)>,
    input_grads: Vec<(usize, T)>,
    fingerprint: Option<Fingerprint>,
    validation: Option<ValidationOutcome>,
    executed: usize,
    deferred: usize,
}

impl<T> IterationState<T> {
    fn new(epoch: u32, inputs: Vec<Option<T>>) -> Self {
        Self {
            epoch,
            inputs,
            inbox: HashMap::new(),
            outbox: HashMap::new(),
            forwarded: HashSet::new(),
            backwarded: HashSet::new(),
            weighted: 0,
            outputs: Vec::new(),
            input_grads: Vec::new(),
            fingerprint: None,
            validation: None,
            executed: 0,
            deferred: 0,
        }
    }
}

/// Drives one rank of the pipeline.
pub struct RankRuntime<T, X> {
    rank: usize,
    schedule: Arc<Schedule>,
    transport: X,
    limiter: PendingBackwardLimiter,
    validator: PostValidator,
    recorder: TimingRecorder,
    sink: Box<dyn ObservabilitySink>,
    recv_timeout: Duration,
    iteration: u64,
    _payload: PhantomData<fn() -> T>,
}

impl<T, X: Transport<T>> RankRuntime<T, X> {
    /// The transport's rank selects which schedule this runtime executes.
    pub fn new(schedule: Arc<Schedule>, transport: X) -> Result<Self> {
        let rank = transport.rank();
        if transport.world_size() != schedule.num_ranks() {
            return Err(Error::config(
                "pipeline_depth",
                format!(
                    "schedule has {} ranks but the transport group has {}",
                    schedule.num_ranks(),
                    transport.world_size()
                ),
            ));
        }
        if schedule.rank(rank).is_none() {
            return Err(Error::invariant(rank, "no schedule for this rank"));
        }
        let limiter = PendingBackwardLimiter::new(schedule.num_ranks(), schedule.memory_limit())?;
        Ok(Self {
            rank,
            schedule,
            transport,
            limiter,
            validator: PostValidator::disabled(),
            recorder: TimingRecorder::new(ProfilingWindow::disabled()),
            sink: Box::new(NullSink),
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            iteration: 0,
            _payload: PhantomData,
        })
    }

    /// Enable post-validation. The schedule must carry the sync operation.
    pub fn with_validator(mut self, validator: PostValidator) -> Result<Self> {
        if validator.is_enabled() && !self.schedule.post_validation() {
            return Err(Error::config(
                "post_validation",
                "validator enabled but the schedule was built without a post-validation sync",
            ));
        }
        self.validator = validator;
        Ok(self)
    }

    pub fn with_profiling(mut self, window: ProfilingWindow, sink: Box<dyn ObservabilitySink>) -> Self {
        self.recorder = TimingRecorder::new(window);
        self.sink = sink;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    /// Start counting iterations from `iteration` (e.g. after a resume).
    pub fn with_iteration(mut self, iteration: u64) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn transport(&self) -> &X {
        &self.transport
    }

    /// Run one iteration of this rank's schedule.
    ///
    /// `inputs` are the micro-batches fed to the first logical stage, indexed
    /// by micro-batch; ranks that do not own it pass `None`.
    pub fn run_iteration<C, O>(
        &mut self,
        compute: &mut C,
        optimizer: &mut O,
        inputs: Option<Vec<T>>,
    ) -> Result<IterationResult<T>>
    where
        C: StageCompute<T> + ?Sized,
        O: OptimizerApply + ?Sized,
    {
        let iteration = self.iteration;
        self.iteration += 1;
        self.execute(iteration, attempt_epoch(iteration, 0), compute, optimizer, inputs)
    }

    /// Run one training step with post-validation.
    ///
    /// With validation enabled, parameters are snapshotted first. On a
    /// mismatch they are restored, the compute state is discarded and the
    /// step is retried once with the same micro-batches; a second mismatch
    /// is [`Error::NumericDivergence`]. Any failed step, a divergence or an
    /// aborted attempt, leaves the parameters at the snapshot.
    pub fn run_step<C, O, S>(
        &mut self,
        compute: &mut C,
        optimizer: &mut O,
        snapshots: &mut S,
        inputs: Option<Vec<T>>,
    ) -> Result<StepReport<T>>
    where
        T: Clone,
        C: StageCompute<T> + ?Sized,
        O: OptimizerApply + ?Sized,
        S: SnapshotProvider + ?Sized,
    {
        let iteration = self.iteration;
        self.iteration += 1;

        if !self.validator.is_enabled() {
            let result = self.execute(iteration, attempt_epoch(iteration, 0), compute, optimizer, inputs)?;
            return Ok(StepReport {
                result,
                attempts: 1,
                state: StepState::Committed,
            });
        }

        let handle = snapshots
            .snapshot_params()
            .map_err(|source| self.optimizer_error(source))?;
        let rank = self.rank;
        let mut step = StepValidation::new(rank);
        let mut attempts = 0;

        loop {
            let epoch = attempt_epoch(iteration, attempts);
            attempts += 1;
            let decided = self
                .execute(iteration, epoch, compute, optimizer, inputs.clone())
                .and_then(|result| {
                    let outcome = result
                        .validation
                        .ok_or_else(|| Error::invariant(rank, "iteration finished without post-validation"))?;
                    if step.state() == StepState::Applied {
                        step.begin_validation()?;
                    }
                    Ok((step.on_outcome(outcome)?, outcome, result))
                });

            match decided {
                Ok((StepAction::Commit, _, result)) => {
                    info!(rank, iteration, attempts, "step committed");
                    return Ok(StepReport {
                        result,
                        attempts,
                        state: step.state(),
                    });
                }
                Ok((StepAction::RollbackAndRetry, outcome, _)) => {
                    if let ValidationOutcome::Mismatch { local, remote } = outcome {
                        warn!(rank, iteration, %local, %remote, "post-validation mismatch, rolling back");
                    }
                    self.roll_back(compute, snapshots, handle)?;
                    step.begin_retry()?;
                }
                Err(e) => {
                    error!(rank, iteration, attempts, error = %e, "step failed, restoring parameters");
                    if let Err(rollback) = self.roll_back(compute, snapshots, handle) {
                        error!(rank, iteration, error = %rollback, "restore after failed step failed");
                    }
                    return Err(e);
                }
            }
        }
    }

    fn roll_back<C, S>(&self, compute: &mut C, snapshots: &mut S, handle: SnapshotHandle) -> Result<()>
    where
        C: StageCompute<T> + ?Sized,
        S: SnapshotProvider + ?Sized,
    {
        snapshots
            .restore(handle)
            .map_err(|source| self.optimizer_error(source))?;
        compute.discard().map_err(|source| self.optimizer_error(source))
    }

    fn execute<C, O>(
        &mut self,
        iteration: u64,
        epoch: u32,
        compute: &mut C,
        optimizer: &mut O,
        inputs: Option<Vec<T>>,
    ) -> Result<IterationResult<T>>
    where
        C: StageCompute<T> + ?Sized,
        O: OptimizerApply + ?Sized,
    {
        let span = tracing::info_span!("iteration", rank = self.rank, iteration, epoch);
        let _enter = span.enter();

        let m = self.schedule.num_microbatches();
        let inputs: Vec<Option<T>> = match inputs {
            Some(v) if v.len() != m => {
                return Err(Error::config(
                    "inputs",
                    format!("expected {m} micro-batches, got {}", v.len()),
                ));
            }
            Some(v) => v.into_iter().map(Some).collect(),
            None => (0..m).map(|_| None).collect(),
        };

        let dropped = self.transport.discard_stale(&|tag| is_stale(tag, epoch));
        if dropped > 0 {
            debug!(rank = self.rank, dropped, "dropped payloads of an aborted attempt");
        }
        self.limiter.reset();
        self.recorder.begin_iteration(iteration);

        let mut state = IterationState::new(epoch, inputs);
        let outcome = self.drain(&mut state, compute, optimizer);
        if outcome.is_err() {
            self.limiter.reset();
        }
        if let Err(e) = self.recorder.flush(self.sink.as_mut()) {
            warn!(rank = self.rank, error = %e, "failed to flush timings");
        }
        outcome?;

        info!(
            rank = self.rank,
            executed = state.executed,
            deferred = state.deferred,
            peak_pending = self.limiter.peak(self.rank),
            "iteration complete"
        );
        Ok(IterationResult {
            rank: self.rank,
            iteration,
            outputs: state.outputs,
            input_grads: state.input_grads,
            fingerprint: state.fingerprint,
            validation: state.validation,
            executed: state.executed,
            deferred: state.deferred,
            peak_pending: self.limiter.peak(self.rank),
        })
    }

    /// Walk the schedule, retrying deferred operations first.
    fn drain<C, O>(&mut self, state: &mut IterationState<T>, compute: &mut C, optimizer: &mut O) -> Result<()>
    where
        C: StageCompute<T> + ?Sized,
        O: OptimizerApply + ?Sized,
    {
        let schedule = Arc::clone(&self.schedule);
        let ops = schedule
            .rank(self.rank)
            .ok_or_else(|| Error::invariant(self.rank, "no schedule for this rank"))?
            .ops();
        let mut cursor = 0;
        let mut deferred: VecDeque<Operation> = VecDeque::new();

        loop {
            if let Some(pos) = deferred.iter().position(|op| self.is_ready(op, state)) {
                if let Some(op) = deferred.remove(pos) {
                    self.run_op(&op, state, compute, optimizer)?;
                }
                continue;
            }
            if let Some(op) = ops.get(cursor) {
                cursor += 1;
                if self.is_ready(op, state) {
                    self.run_op(op, state, compute, optimizer)?;
                } else {
                    debug!(rank = self.rank, %op, "deferred");
                    state.deferred += 1;
                    deferred.push_back(*op);
                }
                continue;
            }
            if deferred.is_empty() {
                return Ok(());
            }
            let stuck: Vec<String> = deferred.iter().map(ToString::to_string).collect();
            return Err(Error::invariant(
                self.rank,
                format!("schedule cannot make progress, stuck on [{}]", stuck.join(", ")),
            ));
        }
    }

    fn is_ready(&self, op: &Operation, state: &IterationState<T>) -> bool {
        let layout = self.schedule.layout();
        match *op {
            Operation::Forward { stage, microbatch } => {
                self.limiter.can_admit(self.rank)
                    && (layout.is_first(stage)
                        || state
                            .inbox
                            .contains_key(&(TransferKind::Activation, stage.logical, microbatch)))
            }
            Operation::Backward { stage, microbatch } => {
                state.forwarded.contains(&(stage.logical, microbatch))
                    && (layout.is_last(stage)
                        || state
                            .inbox
                            .contains_key(&(TransferKind::Gradient, stage.logical, microbatch)))
            }
            Operation::BackwardWeights { stage, microbatch } => {
                state.backwarded.contains(&(stage.logical, microbatch))
            }
            Operation::CommSend { transfer, .. } => state.outbox.contains_key(&transfer),
            Operation::CommRecv { .. } => true,
            Operation::OptimizerStep => {
                let expected = self.schedule.num_microbatches() * layout.chunks();
                state.forwarded.len() == expected
                    && state.backwarded.len() == expected
                    && (!self.schedule.split_backward() || state.weighted == expected)
                    && self.limiter.pending(self.rank) == 0
            }
            Operation::PostValidationSync => state.fingerprint.is_some(),
        }
    }

    fn run_op<C, O>(
        &mut self,
        op: &Operation,
        state: &mut IterationState<T>,
        compute: &mut C,
        optimizer: &mut O,
    ) -> Result<()>
    where
        C: StageCompute<T> + ?Sized,
        O: OptimizerApply + ?Sized,
    {
        let start = self.recorder.is_active(self.rank).then(Instant::now);
        debug!(rank = self.rank, %op, "execute");

        match *op {
            Operation::Forward { stage, microbatch } => {
                self.forward(stage, microbatch, state, compute)?
            }
            Operation::Backward { stage, microbatch } => {
                self.backward(stage, microbatch, state, compute)?
            }
            Operation::BackwardWeights { stage, microbatch } => {
                compute
                    .backward_weights(stage, microbatch)
                    .map_err(|source| self.compute_error(stage, Some(microbatch), OpKind::BackwardWeights, source))?;
                state.weighted += 1;
            }
            Operation::CommSend { peer, transfer } => {
                let payload = state
                    .outbox
                    .remove(&transfer)
                    .ok_or_else(|| Error::invariant(self.rank, format!("nothing to {op}")))?;
                send_transfer(
                    &mut self.transport,
                    peer,
                    &transfer,
                    self.schedule.num_microbatches(),
                    state.epoch,
                    payload,
                )?;
            }
            Operation::CommRecv { peer, transfer } => {
                let payload = recv_transfer(
                    &mut self.transport,
                    peer,
                    &transfer,
                    self.schedule.num_microbatches(),
                    state.epoch,
                    self.recv_timeout,
                )
                .map_err(|e| {
                    if matches!(e, Error::StallTimeout { .. }) {
                        error!(rank = self.rank, %op, timeout = ?self.recv_timeout, "receive stalled");
                    }
                    e
                })?;
                state
                    .inbox
                    .insert((transfer.kind, transfer.to.logical, transfer.microbatch), payload);
            }
            Operation::OptimizerStep => {
                let fp = optimizer
                    .optimizer_apply()
                    .map_err(|source| self.optimizer_error(source))?;
                debug!(rank = self.rank, fingerprint = %fp, "optimizer applied");
                state.fingerprint = Some(fp);
            }
            Operation::PostValidationSync => {
                let fp = state
                    .fingerprint
                    .ok_or_else(|| Error::invariant(self.rank, "post-validation before optimizer step"))?;
                state.validation = Some(self.validator.validate_at(state.epoch, fp)?);
            }
        }

        state.executed += 1;
        if let Some(start) = start {
            self.recorder.record(self.rank, op, start, Instant::now());
        }
        Ok(())
    }

    fn forward<C>(
        &mut self,
        stage: StageId,
        microbatch: usize,
        state: &mut IterationState<T>,
        compute: &mut C,
    ) -> Result<()>
    where
        C: StageCompute<T> + ?Sized,
    {
        let layout = *self.schedule.layout();
        let input = if layout.is_first(stage) {
            state.inputs.get_mut(microbatch).and_then(Option::take)
        } else {
            let slot = (TransferKind::Activation, stage.logical, microbatch);
            Some(state.inbox.remove(&slot).ok_or_else(|| {
                Error::invariant(self.rank, format!("F{microbatch}@{stage} ran without its activation"))
            })?)
        };

        if !self.limiter.try_admit_forward(self.rank) {
            return Err(Error::invariant(
                self.rank,
                format!("F{microbatch}@{stage} exceeds memory_limit {}", self.limiter.limit()),
            ));
        }
        let output = compute
            .forward(stage, microbatch, input)
            .map_err(|source| self.compute_error(stage, Some(microbatch), OpKind::Forward, source))?;
        state.forwarded.insert((stage.logical, microbatch));

        match layout.next(stage) {
            Some(next) if layout.rank_of(next) == self.rank => {
                state
                    .inbox
                    .insert((TransferKind::Activation, next.logical, microbatch), output);
            }
            Some(next) => {
                state
                    .outbox
                    .insert(Transfer::activation(stage, next, microbatch), output);
            }
            None => state.outputs.push((microbatch, output)),
        }
        Ok(())
    }

    fn backward<C>(
        &mut self,
        stage: StageId,
        microbatch: usize,
        state: &mut IterationState<T>,
        compute: &mut C,
    ) -> Result<()>
    where
        C: StageCompute<T> + ?Sized,
    {
        let layout = *self.schedule.layout();
        let grad_output = if layout.is_last(stage) {
            None
        } else {
            let slot = (TransferKind::Gradient, stage.logical, microbatch);
            Some(state.inbox.remove(&slot).ok_or_else(|| {
                Error::invariant(self.rank, format!("B{microbatch}@{stage} ran without its gradient"))
            })?)
        };

        let grad_input = compute
            .backward(stage, microbatch, grad_output)
            .map_err(|source| self.compute_error(stage, Some(microbatch), OpKind::Backward, source))?;
        self.limiter.on_backward_complete(self.rank)?;
        state.backwarded.insert((stage.logical, microbatch));

        match layout.prev(stage) {
            Some(prev) if layout.rank_of(prev) == self.rank => {
                state
                    .inbox
                    .insert((TransferKind::Gradient, prev.logical, microbatch), grad_input);
            }
            Some(prev) => {
                state
                    .outbox
                    .insert(Transfer::gradient(stage, prev, microbatch), grad_input);
            }
            None => state.input_grads.push((microbatch, grad_input)),
        }
        Ok(())
    }

    fn compute_error(&self, stage: StageId, microbatch: Option<usize>, op: OpKind, source: BoxError) -> Error {
        Error::Compute {
            rank: self.rank,
            stage: stage.logical,
            microbatch,
            op,
            source,
        }
    }

    /// Optimizer, snapshot and rollback failures, attributed to the rank's first stage.
    fn optimizer_error(&self, source: BoxError) -> Error {
        let stage = self.schedule.layout().stage(self.rank, 0);
        self.compute_error(stage, None, OpKind::OptimizerStep, source)
    }
}

/// Epoch of the `attempt`-th execution of `iteration`. Wraps.
fn attempt_epoch(iteration: u64, attempt: usize) -> u32 {
    ((iteration << 1) | (attempt as u64 & 1)) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::pipeline::schedule::ScheduleBuilder;
    use crate::distributed::pipeline::timers::MemorySink;
    use crate::distributed::pipeline::topology::StageTopology;
    use crate::distributed::transport::ChannelTransport;
    use crate::optimizer::traits::ComputeResult;

    /// Adds the logical stage index on forward, echoes on backward.
    struct AddStage {
        calls: Vec<String>,
    }

    impl StageCompute<i64> for AddStage {
        fn forward(&mut self, stage: StageId, microbatch: usize, input: Option<i64>) -> ComputeResult<i64> {
            self.calls.push(format!("F{microbatch}@{}", stage.logical));
            Ok(input.unwrap_or(microbatch as i64 * 100) + stage.logical as i64)
        }

        fn backward(&mut self, stage: StageId, microbatch: usize, grad: Option<i64>) -> ComputeResult<i64> {
            self.calls.push(format!("B{microbatch}@{}", stage.logical));
            Ok(grad.unwrap_or(1) * 2)
        }
    }

    struct FixedOptimizer(Fingerprint);

    impl OptimizerApply for FixedOptimizer {
        fn optimizer_apply(&mut self) -> ComputeResult<Fingerprint> {
            Ok(self.0)
        }
    }

    fn single_rank(m: usize, v: usize, limit: usize) -> Arc<Schedule> {
        let topo = StageTopology::new(1, 4).unwrap();
        Arc::new(ScheduleBuilder::new(topo, m, limit, v).build().unwrap())
    }

    #[test]
    fn test_single_rank_runs_all_microbatches() {
        let schedule = single_rank(3, 1, 1);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(7, 1.0));

        let result = rt.run_iteration(&mut compute, &mut opt, Some(vec![10, 20, 30])).unwrap();
        assert_eq!(result.outputs, vec![(0, 10), (1, 20), (2, 30)]);
        assert_eq!(result.input_grads, vec![(0, 2), (1, 2), (2, 2)]);
        assert_eq!(result.fingerprint, Some(Fingerprint::new(7, 1.0)));
        assert_eq!(result.peak_pending, 1);
        assert_eq!(result.validation, None);
        assert_eq!(compute.calls, ["F0@0", "B0@0", "F1@0", "B1@0", "F2@0", "B2@0"]);
        assert_eq!(rt.iteration(), 1);
    }

    #[test]
    fn test_local_virtual_stages_hand_off_in_process() {
        // One rank owning two chunks: activations and gradients never leave the rank.
        let schedule = single_rank(2, 2, 2);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));

        let result = rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        let mut outputs = result.outputs;
        outputs.sort();
        assert_eq!(outputs, vec![(0, 1), (1, 101)]);
        let mut grads = result.input_grads;
        grads.sort();
        assert_eq!(grads, vec![(0, 4), (1, 4)]);
        assert_eq!(rt.transport().buffered(), 0);
    }

    /// Rank 0's plan rearranged to `order`, indexing the original ops.
    fn reordered(schedule: &Schedule, order: &[usize]) -> Arc<Schedule> {
        let mut value = serde_json::to_value(schedule).unwrap();
        let ops = value["ranks"][0]["ops"].as_array().unwrap().clone();
        value["ranks"][0]["ops"] = order.iter().map(|&i| ops[i].clone()).collect();
        Arc::new(serde_json::from_value(value).unwrap())
    }

    #[test]
    fn test_refused_forward_waits_for_backward() {
        // F0 B0 F1 B1 opt, replayed as F0 F1 B0 B1 opt with room for one pending backward
        let schedule = reordered(&single_rank(2, 1, 1), &[0, 2, 1, 3, 4]);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));

        let result = rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        assert_eq!(compute.calls, ["F0@0", "B0@0", "F1@0", "B1@0"]);
        assert_eq!(result.deferred, 1);
        assert_eq!(result.executed, 5);
        assert_eq!(result.peak_pending, 1);
    }

    #[test]
    fn test_early_optimizer_step_is_deferred_to_the_end() {
        let schedule = reordered(&single_rank(2, 1, 1), &[4, 0, 1, 2, 3]);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(3, 1.0));

        let result = rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        assert_eq!(compute.calls, ["F0@0", "B0@0", "F1@0", "B1@0"]);
        assert_eq!(result.deferred, 1);
        assert_eq!(result.fingerprint, Some(Fingerprint::new(3, 1.0)));
    }

    #[test]
    fn test_plan_that_never_unblocks_is_invariant_violation() {
        // B0 is missing: F1 can never be admitted and the optimizer step never becomes ready
        let schedule = reordered(&single_rank(2, 1, 1), &[0, 2, 4]);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));

        match rt.run_iteration(&mut compute, &mut opt, None).unwrap_err() {
            Error::InvariantViolation { rank, reason } => {
                assert_eq!(rank, 0);
                assert!(reason.contains("cannot make progress"), "{reason}");
                assert!(reason.contains("F1@0/c0"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(compute.calls, ["F0@0"]);
    }

    #[test]
    fn test_wrong_input_count_is_configuration_error() {
        let schedule = single_rank(2, 1, 1);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));
        assert!(matches!(
            rt.run_iteration(&mut compute, &mut opt, Some(vec![1])),
            Err(Error::Configuration { parameter: "inputs", .. })
        ));
    }

    #[test]
    fn test_compute_error_carries_context() {
        struct Failing;
        impl StageCompute<i64> for Failing {
            fn forward(&mut self, _: StageId, mb: usize, _: Option<i64>) -> ComputeResult<i64> {
                if mb == 1 {
                    return Err("boom".into());
                }
                Ok(0)
            }
            fn backward(&mut self, _: StageId, _: usize, _: Option<i64>) -> ComputeResult<i64> {
                Ok(0)
            }
        }

        let schedule = single_rank(2, 1, 2);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let mut rt = RankRuntime::new(schedule, transport).unwrap();
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));
        let err = rt.run_iteration(&mut Failing, &mut opt, None).unwrap_err();
        match err {
            Error::Compute {
                rank,
                microbatch,
                op,
                source,
                ..
            } => {
                assert_eq!(rank, 0);
                assert_eq!(microbatch, Some(1));
                assert_eq!(op, OpKind::Forward);
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected error: {other}"),
        }

        // The aborted iteration must not leak pending backwards into the next one.
        let mut compute = AddStage { calls: Vec::new() };
        rt.run_iteration(&mut compute, &mut opt, None).unwrap();
    }

    #[test]
    fn test_profiling_records_inside_window_only() {
        let schedule = single_rank(1, 1, 1);
        let transport = ChannelTransport::<i64>::mesh(1).pop().unwrap();
        let sink = MemorySink::new();
        let mut rt = RankRuntime::new(schedule, transport)
            .unwrap()
            .with_profiling(ProfilingWindow::new(1, 1), Box::new(sink.clone()));
        let mut compute = AddStage { calls: Vec::new() };
        let mut opt = FixedOptimizer(Fingerprint::new(0, 0.0));

        rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        assert!(sink.records().is_empty());
        rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        let records = sink.records();
        let kinds: Vec<_> = records.iter().map(|r| r.operation.kind()).collect();
        assert_eq!(kinds, [OpKind::Forward, OpKind::Backward, OpKind::OptimizerStep]);
        assert!(records.iter().all(|r| r.iteration == 1));
        rt.run_iteration(&mut compute, &mut opt, None).unwrap();
        assert_eq!(sink.records().len(), 3);
    }

    #[test]
    fn test_world_size_mismatch_rejected() {
        let topo = StageTopology::new(2, 2).unwrap();
        let schedule = Arc::new(ScheduleBuilder::new(topo, 2, 2, 1).build().unwrap());
        let transport = ChannelTransport::<i64>::mesh(3).pop().unwrap();
        assert!(matches!(
            RankRuntime::new(schedule, transport),
            Err(Error::Configuration { .. })
        ));
    }
}
