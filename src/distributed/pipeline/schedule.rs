//! Schedule construction.
//!
//! [`ScheduleBuilder`] turns a [`StageTopology`], a micro-batch count and a
//! memory limit into one ordered [`RankSchedule`] per rank. Compute order
//! comes from the simulated [`PipelineClock`]; this module wraps it with the
//! point-to-point transfers each compute operation needs and appends the
//! optimizer step (and post-validation sync) at the end.
//!
//! Building is a pure function of its inputs: identical inputs give
//! structurally equal schedules.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::clock::{CostModel, PipelineAction, PipelineClock, TimedAction};
use super::limiter::PendingBackwardLimiter;
use super::topology::{Placement, StageId, StageTopology, VirtualLayout};
use crate::error::{Error, Result};

/// Payload direction of a point-to-point transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    /// Forward activation, flows downstream.
    Activation,
    /// Input gradient, flows upstream.
    Gradient,
    /// Post-validation fingerprint, exchanged between replicas. Never part of a schedule.
    Fingerprint,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Activation => f.write_str("activation"),
            TransferKind::Gradient => f.write_str("gradient"),
            TransferKind::Fingerprint => f.write_str("fingerprint"),
        }
    }
}

/// A payload moving between two adjacent logical stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transfer {
    pub kind: TransferKind,
    /// Producing stage.
    pub from: StageId,
    /// Consuming stage; tags are keyed on it.
    pub to: StageId,
    pub microbatch: usize,
}

impl Transfer {
    pub fn activation(from: StageId, to: StageId, microbatch: usize) -> Self {
        Self {
            kind: TransferKind::Activation,
            from,
            to,
            microbatch,
        }
    }

    pub fn gradient(from: StageId, to: StageId, microbatch: usize) -> Self {
        Self {
            kind: TransferKind::Gradient,
            from,
            to,
            microbatch,
        }
    }
}

/// Operation kind, used for logging, timing and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Forward,
    Backward,
    BackwardWeights,
    CommSend,
    CommRecv,
    OptimizerStep,
    PostValidationSync,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Forward => "forward",
            OpKind::Backward => "backward",
            OpKind::BackwardWeights => "backward_weights",
            OpKind::CommSend => "send",
            OpKind::CommRecv => "recv",
            OpKind::OptimizerStep => "optimizer_step",
            OpKind::PostValidationSync => "post_validation_sync",
        };
        f.write_str(name)
    }
}

/// One scheduled unit of work on a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Forward { stage: StageId, microbatch: usize },
    /// Input-gradient backward. Also computes weight gradients unless split.
    Backward { stage: StageId, microbatch: usize },
    /// Deferred weight-gradient pass (split backward only).
    BackwardWeights { stage: StageId, microbatch: usize },
    CommSend { peer: usize, transfer: Transfer },
    CommRecv { peer: usize, transfer: Transfer },
    OptimizerStep,
    PostValidationSync,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Forward { .. } => OpKind::Forward,
            Operation::Backward { .. } => OpKind::Backward,
            Operation::BackwardWeights { .. } => OpKind::BackwardWeights,
            Operation::CommSend { .. } => OpKind::CommSend,
            Operation::CommRecv { .. } => OpKind::CommRecv,
            Operation::OptimizerStep => OpKind::OptimizerStep,
            Operation::PostValidationSync => OpKind::PostValidationSync,
        }
    }

    pub fn microbatch(&self) -> Option<usize> {
        match *self {
            Operation::Forward { microbatch, .. }
            | Operation::Backward { microbatch, .. }
            | Operation::BackwardWeights { microbatch, .. } => Some(microbatch),
            Operation::CommSend { transfer, .. } | Operation::CommRecv { transfer, .. } => {
                Some(transfer.microbatch)
            }
            Operation::OptimizerStep | Operation::PostValidationSync => None,
        }
    }

    /// Local stage the operation works on, if any.
    pub fn stage(&self) -> Option<StageId> {
        match *self {
            Operation::Forward { stage, .. }
            | Operation::Backward { stage, .. }
            | Operation::BackwardWeights { stage, .. } => Some(stage),
            Operation::CommSend { transfer, .. } => Some(transfer.from),
            Operation::CommRecv { transfer, .. } => Some(transfer.to),
            Operation::OptimizerStep | Operation::PostValidationSync => None,
        }
    }

    pub fn is_compute(&self) -> bool {
        matches!(
            self,
            Operation::Forward { .. } | Operation::Backward { .. } | Operation::BackwardWeights { .. }
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Forward { stage, microbatch } => write!(f, "F{microbatch}@{stage}"),
            Operation::Backward { stage, microbatch } => write!(f, "B{microbatch}@{stage}"),
            Operation::BackwardWeights { stage, microbatch } => write!(f, "W{microbatch}@{stage}"),
            Operation::CommSend { peer, transfer } => {
                write!(f, "send {} mb{} -> rank {peer}", transfer.kind, transfer.microbatch)
            }
            Operation::CommRecv { peer, transfer } => {
                write!(f, "recv {} mb{} <- rank {peer}", transfer.kind, transfer.microbatch)
            }
            Operation::OptimizerStep => f.write_str("optimizer_step"),
            Operation::PostValidationSync => f.write_str("post_validation_sync"),
        }
    }
}

/// Ordered operations for one rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSchedule {
    rank: usize,
    ops: Vec<Operation>,
}

impl RankSchedule {
    /// Rank that executes these operations.
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Operations in execution order, transfers included.
    pub fn ops(&self) -> &[Operation] {
        &self.ops
    }

    /// Number of operations, transfers included.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of operations of `kind`.
    pub fn count(&self, kind: OpKind) -> usize {
        self.ops.iter().filter(|op| op.kind() == kind).count()
    }

    /// Compute and optimizer operations only, in order (transfers dropped).
    pub fn compute_ops(&self) -> impl Iterator<Item = &Operation> {
        self.ops
            .iter()
            .filter(|op| !matches!(op, Operation::CommSend { .. } | Operation::CommRecv { .. }))
    }
}

/// Simulated-clock statistics of a built schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleStats {
    /// Tick at which the last rank finishes its last compute operation.
    pub makespan: u64,
    /// Busy ticks per rank.
    pub busy: Vec<u64>,
    /// Idle ticks per rank within the makespan.
    pub bubble: Vec<u64>,
}

impl ScheduleStats {
    fn from_timelines(timelines: &[Vec<TimedAction>]) -> Self {
        let makespan = timelines
            .iter()
            .filter_map(|t| t.last().map(|a| a.end))
            .max()
            .unwrap_or(0);
        let busy: Vec<u64> = timelines
            .iter()
            .map(|t| t.iter().map(|a| a.end - a.start).sum())
            .collect();
        let bubble = busy.iter().map(|b| makespan - b).collect();
        Self {
            makespan,
            busy,
            bubble,
        }
    }

    /// Fraction of rank-ticks spent idle.
    pub fn bubble_ratio(&self) -> f64 {
        let total = self.makespan * self.busy.len() as u64;
        if total == 0 {
            return 0.0;
        }
        self.bubble.iter().sum::<u64>() as f64 / total as f64
    }
}

/// Immutable per-rank execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    layout: VirtualLayout,
    num_microbatches: usize,
    memory_limit: usize,
    split_backward: bool,
    post_validation: bool,
    ranks: Vec<RankSchedule>,
    stats: ScheduleStats,
}

impl Schedule {
    pub fn layout(&self) -> &VirtualLayout {
        &self.layout
    }

    pub fn num_ranks(&self) -> usize {
        self.ranks.len()
    }

    pub fn num_microbatches(&self) -> usize {
        self.num_microbatches
    }

    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn interleave_factor(&self) -> usize {
        self.layout.chunks()
    }

    pub fn split_backward(&self) -> bool {
        self.split_backward
    }

    pub fn post_validation(&self) -> bool {
        self.post_validation
    }

    pub fn rank(&self, rank: usize) -> Option<&RankSchedule> {
        self.ranks.get(rank)
    }

    pub fn ranks(&self) -> &[RankSchedule] {
        &self.ranks
    }

    pub fn stats(&self) -> &ScheduleStats {
        &self.stats
    }

    /// Check the structural invariants of the plan.
    ///
    /// - every owned stage runs exactly one forward and one backward per micro-batch
    ///   (and one weight pass when split), backward after forward;
    /// - the pending-backward count never exceeds the memory limit at any prefix;
    /// - each transfer is sent once and received once by the right peers;
    /// - the optimizer step (then post-validation sync) closes every rank.
    pub fn verify(&self) -> Result<()> {
        let mut limiter = PendingBackwardLimiter::new(self.ranks.len(), self.memory_limit)?;
        let mut sent: HashSet<(usize, usize, Transfer)> = HashSet::new();
        let mut received: HashSet<(usize, usize, Transfer)> = HashSet::new();

        for rs in &self.ranks {
            let rank = rs.rank;
            let mut forwarded = HashSet::new();
            let mut backwarded = HashSet::new();
            let mut weighted = HashSet::new();

            for op in &rs.ops {
                match *op {
                    Operation::Forward { stage, microbatch } => {
                        self.check_owned(rank, stage)?;
                        if !forwarded.insert((stage.logical, microbatch)) {
                            return Err(Error::invariant(rank, format!("duplicate {op}")));
                        }
                        if !limiter.try_admit_forward(rank) {
                            return Err(Error::invariant(
                                rank,
                                format!("{op} exceeds memory_limit {}", self.memory_limit),
                            ));
                        }
                    }
                    Operation::Backward { stage, microbatch } => {
                        self.check_owned(rank, stage)?;
                        if !forwarded.contains(&(stage.logical, microbatch)) {
                            return Err(Error::invariant(rank, format!("{op} before its forward")));
                        }
                        if !backwarded.insert((stage.logical, microbatch)) {
                            return Err(Error::invariant(rank, format!("duplicate {op}")));
                        }
                        limiter.on_backward_complete(rank)?;
                    }
                    Operation::BackwardWeights { stage, microbatch } => {
                        if !self.split_backward {
                            return Err(Error::invariant(rank, format!("{op} in a fused-backward schedule")));
                        }
                        if !backwarded.contains(&(stage.logical, microbatch))
                            || !weighted.insert((stage.logical, microbatch))
                        {
                            return Err(Error::invariant(rank, format!("misplaced {op}")));
                        }
                    }
                    Operation::CommSend { peer, transfer } => {
                        if !sent.insert((rank, peer, transfer)) {
                            return Err(Error::invariant(rank, format!("duplicate {op}")));
                        }
                    }
                    Operation::CommRecv { peer, transfer } => {
                        if !received.insert((peer, rank, transfer)) {
                            return Err(Error::invariant(rank, format!("duplicate {op}")));
                        }
                    }
                    Operation::OptimizerStep | Operation::PostValidationSync => {}
                }
            }

            let expected = self.num_microbatches * self.layout.chunks();
            if forwarded.len() != expected || backwarded.len() != expected {
                return Err(Error::invariant(
                    rank,
                    format!(
                        "expected {expected} forwards and backwards, got {} and {}",
                        forwarded.len(),
                        backwarded.len()
                    ),
                ));
            }
            if self.split_backward && weighted.len() != expected {
                return Err(Error::invariant(
                    rank,
                    format!("expected {expected} weight passes, got {}", weighted.len()),
                ));
            }

            let mut tail = vec![Operation::OptimizerStep];
            if self.post_validation {
                tail.push(Operation::PostValidationSync);
            }
            if !rs.ops.ends_with(&tail) || rs.count(OpKind::OptimizerStep) != 1 {
                return Err(Error::invariant(rank, "schedule must end with a single optimizer step"));
            }
        }

        if sent != received {
            return Err(Error::invariant(
                0,
                format!(
                    "unmatched transfers: {} sends vs {} receives",
                    sent.len(),
                    received.len()
                ),
            ));
        }
        Ok(())
    }

    fn check_owned(&self, rank: usize, stage: StageId) -> Result<()> {
        if self.layout.rank_of(stage) != rank || self.layout.stage_at(stage.logical) != stage {
            return Err(Error::invariant(rank, format!("stage {stage} is not owned by this rank")));
        }
        Ok(())
    }
}

/// Configures and builds a [`Schedule`].
#[derive(Debug, Clone)]
pub struct ScheduleBuilder {
    topology: StageTopology,
    num_microbatches: usize,
    memory_limit: usize,
    interleave_factor: usize,
    placement: Placement,
    split_backward: bool,
    post_validation: bool,
    cost: CostModel,
}

impl ScheduleBuilder {
    pub fn new(
        topology: StageTopology,
        num_microbatches: usize,
        memory_limit: usize,
        interleave_factor: usize,
    ) -> Self {
        Self {
            topology,
            num_microbatches,
            memory_limit,
            interleave_factor,
            placement: Placement::Interleaved,
            split_backward: false,
            post_validation: false,
            cost: CostModel::default(),
        }
    }

    /// Assign virtual stages to ranks with `placement`. [`Placement::VShape`]
    /// needs an interleave factor of 2.
    pub fn placement(mut self, placement: Placement) -> Self {
        self.placement = placement;
        self
    }

    /// Split each backward into input-gradient and weight-gradient passes.
    pub fn split_backward(mut self, enabled: bool) -> Self {
        self.split_backward = enabled;
        self
    }

    /// Append a post-validation sync after the optimizer step.
    pub fn post_validation(mut self, enabled: bool) -> Self {
        self.post_validation = enabled;
        self
    }

    pub fn cost_model(mut self, cost: CostModel) -> Self {
        self.cost = cost;
        self
    }

    pub fn build(&self) -> Result<Schedule> {
        if self.memory_limit < 1 {
            return Err(Error::config("memory_limit", "must be >= 1, got 0"));
        }
        if self.num_microbatches < 1 {
            return Err(Error::config("num_microbatches", "must be >= 1, got 0"));
        }
        self.cost.validate()?;
        let layout = self.topology.layout_with(self.interleave_factor, self.placement)?;

        let clock = PipelineClock::new(
            layout,
            self.num_microbatches,
            self.memory_limit,
            self.split_backward,
            self.cost,
        );
        let timelines = clock.simulate()?;

        let ranks = timelines
            .iter()
            .enumerate()
            .map(|(rank, timeline)| RankSchedule {
                rank,
                ops: self.expand(&layout, rank, timeline),
            })
            .collect();

        let schedule = Schedule {
            layout,
            num_microbatches: self.num_microbatches,
            memory_limit: self.memory_limit,
            split_backward: self.split_backward,
            post_validation: self.post_validation,
            ranks,
            stats: ScheduleStats::from_timelines(&timelines),
        };
        schedule.verify()?;
        Ok(schedule)
    }

    /// Wrap compute actions with the receives they wait on and the sends they feed.
    fn expand(&self, layout: &VirtualLayout, rank: usize, timeline: &[TimedAction]) -> Vec<Operation> {
        let mut ops = Vec::with_capacity(timeline.len() * 3 + 2);
        let remote = |stage: StageId| {
            let peer = layout.rank_of(stage);
            (peer != rank).then_some(peer)
        };

        for timed in timeline {
            match timed.action {
                PipelineAction::Forward(stage, mb) => {
                    if let Some(prev) = layout.prev(stage) {
                        if let Some(peer) = remote(prev) {
                            ops.push(Operation::CommRecv {
                                peer,
                                transfer: Transfer::activation(prev, stage, mb),
                            });
                        }
                    }
                    ops.push(Operation::Forward { stage, microbatch: mb });
                    if let Some(next) = layout.next(stage) {
                        if let Some(peer) = remote(next) {
                            ops.push(Operation::CommSend {
                                peer,
                                transfer: Transfer::activation(stage, next, mb),
                            });
                        }
                    }
                }
                PipelineAction::Backward(stage, mb) => {
                    if let Some(next) = layout.next(stage) {
                        if let Some(peer) = remote(next) {
                            ops.push(Operation::CommRecv {
                                peer,
                                transfer: Transfer::gradient(next, stage, mb),
                            });
                        }
                    }
                    ops.push(Operation::Backward { stage, microbatch: mb });
                    if let Some(prev) = layout.prev(stage) {
                        if let Some(peer) = remote(prev) {
                            ops.push(Operation::CommSend {
                                peer,
                                transfer: Transfer::gradient(stage, prev, mb),
                            });
                        }
                    }
                }
                PipelineAction::BackwardWeights(stage, mb) => {
                    ops.push(Operation::BackwardWeights { stage, microbatch: mb });
                }
            }
        }

        ops.push(Operation::OptimizerStep);
        if self.post_validation {
            ops.push(Operation::PostValidationSync);
        }
        ops
    }
}

/// Build a schedule with default options (fused backward, no post-validation).
pub fn build(
    topology: &StageTopology,
    num_microbatches: usize,
    memory_limit: usize,
    interleave_factor: usize,
) -> Result<Schedule> {
    ScheduleBuilder::new(topology.clone(), num_microbatches, memory_limit, interleave_factor).build()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo(p: usize) -> StageTopology {
        StageTopology::new(p, p * 4).unwrap()
    }

    #[test]
    fn test_rejects_bad_parameters() {
        let t = topo(2);
        assert!(matches!(
            build(&t, 4, 0, 1),
            Err(Error::Configuration {
                parameter: "memory_limit",
                ..
            })
        ));
        assert!(matches!(
            build(&t, 0, 2, 1),
            Err(Error::Configuration {
                parameter: "num_microbatches",
                ..
            })
        ));
        assert!(matches!(
            build(&t, 4, 2, 3),
            Err(Error::Configuration {
                parameter: "interleave_factor",
                ..
            })
        ));
    }

    #[test]
    fn test_two_stage_plan_with_transfers() {
        let s = build(&topo(2), 2, 2, 1).unwrap();
        let r0 = s.rank(0).unwrap();
        let layout = s.layout();
        let s0 = layout.stage(0, 0);
        let s1 = layout.stage(1, 0);
        assert_eq!(
            r0.ops(),
            &[
                Operation::Forward { stage: s0, microbatch: 0 },
                Operation::CommSend {
                    peer: 1,
                    transfer: Transfer::activation(s0, s1, 0)
                },
                Operation::Forward { stage: s0, microbatch: 1 },
                Operation::CommSend {
                    peer: 1,
                    transfer: Transfer::activation(s0, s1, 1)
                },
                Operation::CommRecv {
                    peer: 1,
                    transfer: Transfer::gradient(s1, s0, 0)
                },
                Operation::Backward { stage: s0, microbatch: 0 },
                Operation::CommRecv {
                    peer: 1,
                    transfer: Transfer::gradient(s1, s0, 1)
                },
                Operation::Backward { stage: s0, microbatch: 1 },
                Operation::OptimizerStep,
            ]
        );
    }

    #[test]
    fn test_interleaved_same_rank_handoff_has_no_transfer() {
        // P=1, V=2: both chunks live on rank 0
        let t = StageTopology::new(1, 4).unwrap();
        let s = build(&t, 2, 4, 2).unwrap();
        let r0 = s.rank(0).unwrap();
        assert_eq!(r0.count(OpKind::CommSend), 0);
        assert_eq!(r0.count(OpKind::CommRecv), 0);
        assert_eq!(r0.count(OpKind::Forward), 4);
        assert_eq!(r0.count(OpKind::Backward), 4);
    }

    #[test]
    fn test_v_shape_turn_stays_on_last_rank() {
        let s = ScheduleBuilder::new(topo(2), 4, 4, 2)
            .placement(Placement::VShape)
            .build()
            .unwrap();
        let layout = s.layout();
        assert!(layout.is_first(layout.stage(0, 0)));
        assert!(layout.is_last(layout.stage(0, 1)));

        for rs in s.ranks() {
            // one activation and one gradient stream per rank, both crossing ranks
            assert_eq!(rs.count(OpKind::CommSend), 8, "rank {}", rs.rank());
            assert_eq!(rs.count(OpKind::CommRecv), 8, "rank {}", rs.rank());
        }
        let turn_crosses = s.ranks()[1].ops().iter().any(|op| match op {
            Operation::CommSend { transfer, .. } => transfer.from.logical == 1 && transfer.to.logical == 2,
            _ => false,
        });
        assert!(!turn_crosses);
    }

    #[test]
    fn test_v_shape_rejects_other_interleave_factors() {
        let err = ScheduleBuilder::new(topo(2), 4, 4, 1)
            .placement(Placement::VShape)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration {
                parameter: "interleave_factor",
                ..
            }
        ));
    }

    #[test]
    fn test_post_validation_closes_schedule() {
        let s = ScheduleBuilder::new(topo(2), 3, 2, 1)
            .post_validation(true)
            .build()
            .unwrap();
        for rs in s.ranks() {
            let tail = &rs.ops()[rs.len() - 2..];
            assert_eq!(tail, &[Operation::OptimizerStep, Operation::PostValidationSync]);
        }
    }

    #[test]
    fn test_verify_catches_tampering() {
        let mut s = build(&topo(2), 2, 2, 1).unwrap();
        s.ranks[0].ops.retain(|op| op.kind() != OpKind::Backward);
        assert!(matches!(s.verify(), Err(Error::InvariantViolation { .. })));
    }

    #[test]
    fn test_operation_display() {
        let stage = StageId { chunk: 0, logical: 1 };
        let op = Operation::Forward { stage, microbatch: 3 };
        assert_eq!(op.to_string(), "F3@1/c0");
        assert_eq!(op.kind().to_string(), "forward");
    }

    #[test]
    fn test_stats_account_every_tick() {
        let s = build(&topo(4), 8, 4, 1).unwrap();
        let stats = s.stats();
        for (busy, bubble) in stats.busy.iter().zip(&stats.bubble) {
            assert_eq!(busy + bubble, stats.makespan);
            assert_eq!(*busy, 16);
        }
        assert!(stats.bubble_ratio() < 0.5);
    }
}
