//! Simulated pipeline clock.
//!
//! [`PipelineClock`] orders every rank's compute work by list-scheduling it
//! over simulated time. Each rank walks two fixed work lists (forwards in
//! pipeline order, backwards oldest micro-batch first) and at every step picks
//! the operation whose inputs are already produced and that can start
//! earliest:
//!
//! - a forward is only a candidate while the rank has fewer than
//!   `memory_limit` pending backwards, and wins ties against a backward;
//! - a backward needs the downstream gradient (or, on the last logical stage,
//!   its own forward);
//! - with split backward, weight-gradient passes only fill idle gaps.
//!
//! Committing the globally earliest candidate keeps simulated start times
//! monotone, so the resulting per-rank orders are realizable and free of
//! cross-rank deadlock. Warm-up, steady state and cool-down fall out of the
//! memory limit:
//!
//! ```text
//! P=2, M=4, memory_limit=2:
//!   rank 0: F0 F1 .. B0 F2 B1 F3 B2 B3
//!   rank 1:    F0 F1 B0 B1 F2 B2 F3 B3
//! ```

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::topology::{StageId, VirtualLayout};
use crate::error::{Error, Result};

/// Operation costs in simulated ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Forward pass of one chunk for one micro-batch.
    pub forward: u64,
    /// Input-gradient backward (the whole backward unless split).
    pub backward: u64,
    /// Weight-gradient pass, when the backward is split.
    pub weight: u64,
    /// Latency of a transfer between two ranks; same-rank hand-offs are free.
    pub comm: u64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            forward: 1,
            backward: 1,
            weight: 1,
            comm: 0,
        }
    }
}

impl CostModel {
    pub fn validate(&self) -> Result<()> {
        if self.forward == 0 {
            return Err(Error::config("cost.forward", "must be >= 1 tick"));
        }
        if self.backward == 0 {
            return Err(Error::config("cost.backward", "must be >= 1 tick"));
        }
        if self.weight == 0 {
            return Err(Error::config("cost.weight", "must be >= 1 tick"));
        }
        Ok(())
    }
}

/// A compute action placed on a rank's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineAction {
    Forward(StageId, usize),
    Backward(StageId, usize),
    BackwardWeights(StageId, usize),
}

/// An action with its simulated start/end ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedAction {
    pub action: PipelineAction,
    /// First simulated tick of the action.
    pub start: u64,
    /// Tick at which the action's output is available.
    pub end: u64,
}

/// Forward work list for `rank`.
///
/// Without interleaving this is micro-batches `0..M` in order. With `V`
/// virtual stages, micro-batches are taken in groups of `P`; each group
/// visits chunks `0..V` before the next group starts. The same order serves
/// both placements, since only the chunk-to-stage mapping differs.
/// Either way a rank needs `(V-1)*P + 1` pending backwards before its first
/// backward can run.
pub fn forward_order(layout: &VirtualLayout, rank: usize, num_micro_batches: usize) -> Vec<(StageId, usize)> {
    work_order(layout, rank, num_micro_batches, false)
}

/// Backward work list for `rank`: same grouping, chunks visited `V-1..0`.
pub fn backward_order(layout: &VirtualLayout, rank: usize, num_micro_batches: usize) -> Vec<(StageId, usize)> {
    work_order(layout, rank, num_micro_batches, true)
}

fn work_order(
    layout: &VirtualLayout,
    rank: usize,
    num_micro_batches: usize,
    reverse_chunks: bool,
) -> Vec<(StageId, usize)> {
    let chunks = layout.chunks();
    let group = layout.pipeline_depth().max(1);
    let mut order = Vec::with_capacity(num_micro_batches * chunks);
    let mut group_start = 0;
    while group_start < num_micro_batches {
        let group_end = (group_start + group).min(num_micro_batches);
        for c in 0..chunks {
            let chunk = if reverse_chunks { chunks - 1 - c } else { c };
            let stage = layout.stage(rank, chunk);
            for mb in group_start..group_end {
                order.push((stage, mb));
            }
        }
        group_start = group_end;
    }
    order
}

struct RankClock {
    forwards: Vec<(StageId, usize)>,
    backwards: Vec<(StageId, usize)>,
    next_fwd: usize,
    next_bwd: usize,
    weights: VecDeque<(StageId, usize)>,
    pending: usize,
    free_at: u64,
    timeline: Vec<TimedAction>,
}

impl RankClock {
    fn done(&self) -> bool {
        self.next_fwd == self.forwards.len()
            && self.next_bwd == self.backwards.len()
            && self.weights.is_empty()
    }
}

/// List scheduler over simulated time for all ranks of a pipeline.
pub struct PipelineClock {
    layout: VirtualLayout,
    num_micro_batches: usize,
    memory_limit: usize,
    split_backward: bool,
    cost: CostModel,
}

impl PipelineClock {
    pub fn new(
        layout: VirtualLayout,
        num_micro_batches: usize,
        memory_limit: usize,
        split_backward: bool,
        cost: CostModel,
    ) -> Self {
        Self {
            layout,
            num_micro_batches,
            memory_limit,
            split_backward,
            cost,
        }
    }

    pub fn num_stages(&self) -> usize {
        self.layout.num_logical_stages()
    }

    pub fn num_micro_batches(&self) -> usize {
        self.num_micro_batches
    }

    /// Simulate the whole pipeline and return each rank's compute timeline.
    ///
    /// Fails with a configuration error when no rank can make progress, which
    /// happens when `memory_limit` is too small for the chunked work order.
    pub fn simulate(&self) -> Result<Vec<Vec<TimedAction>>> {
        let ranks = self.layout.pipeline_depth();
        let m = self.num_micro_batches;
        let stages = self.num_stages();

        let mut clocks: Vec<RankClock> = (0..ranks)
            .map(|rank| RankClock {
                forwards: forward_order(&self.layout, rank, m),
                backwards: backward_order(&self.layout, rank, m),
                next_fwd: 0,
                next_bwd: 0,
                weights: VecDeque::new(),
                pending: 0,
                free_at: 0,
                timeline: Vec::with_capacity(3 * m * self.layout.chunks()),
            })
            .collect();

        // Completion tick per (logical stage, micro-batch).
        let mut fwd_end: Vec<Vec<Option<u64>>> = vec![vec![None; m]; stages];
        let mut bwd_end: Vec<Vec<Option<u64>>> = vec![vec![None; m]; stages];

        loop {
            if clocks.iter().all(RankClock::done) {
                break;
            }

            let mut best: Option<(u64, usize, PipelineAction)> = None;
            for (rank, clock) in clocks.iter().enumerate() {
                if let Some((start, action)) = self.candidate(rank, clock, &fwd_end, &bwd_end) {
                    if best.map_or(true, |(b, _, _)| start < b) {
                        best = Some((start, rank, action));
                    }
                }
            }

            let (start, rank, action) = best.ok_or_else(|| {
                let stuck: Vec<String> = clocks
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !c.done())
                    .map(|(r, c)| format!("rank {r} ({} pending)", c.pending))
                    .collect();
                Error::config(
                    "memory_limit",
                    format!(
                        "memory_limit {} cannot sustain this schedule: {} stalled",
                        self.memory_limit,
                        stuck.join(", ")
                    ),
                )
            })?;

            let clock = &mut clocks[rank];
            let end = match action {
                PipelineAction::Forward(stage, mb) => {
                    let end = start + self.cost.forward;
                    fwd_end[stage.logical][mb] = Some(end);
                    clock.next_fwd += 1;
                    clock.pending += 1;
                    end
                }
                PipelineAction::Backward(stage, mb) => {
                    let end = start + self.cost.backward;
                    bwd_end[stage.logical][mb] = Some(end);
                    clock.next_bwd += 1;
                    clock.pending -= 1;
                    if self.split_backward {
                        clock.weights.push_back((stage, mb));
                    }
                    end
                }
                PipelineAction::BackwardWeights(..) => {
                    clock.weights.pop_front();
                    start + self.cost.weight
                }
            };
            clock.free_at = end;
            clock.timeline.push(TimedAction { action, start, end });
        }

        Ok(clocks.into_iter().map(|c| c.timeline).collect())
    }

    /// Earliest-startable action for one rank, if any input is ready.
    fn candidate(
        &self,
        rank: usize,
        clock: &RankClock,
        fwd_end: &[Vec<Option<u64>>],
        bwd_end: &[Vec<Option<u64>>],
    ) -> Option<(u64, PipelineAction)> {
        let forward = clock
            .forwards
            .get(clock.next_fwd)
            .filter(|_| clock.pending < self.memory_limit)
            .and_then(|&(stage, mb)| {
                let ready = match self.layout.prev(stage) {
                    None => Some(0),
                    Some(prev) => fwd_end[prev.logical][mb].map(|t| t + self.hop(rank, prev)),
                };
                ready.map(|t| (t.max(clock.free_at), PipelineAction::Forward(stage, mb)))
            });

        let backward = clock.backwards.get(clock.next_bwd).and_then(|&(stage, mb)| {
            let ready = match self.layout.next(stage) {
                None => fwd_end[stage.logical][mb],
                Some(next) => bwd_end[next.logical][mb].map(|t| t + self.hop(rank, next)),
            };
            ready.map(|t| (t.max(clock.free_at), PipelineAction::Backward(stage, mb)))
        });

        let critical = match (forward, backward) {
            (Some(f), Some(b)) => Some(if f.0 <= b.0 { f } else { b }),
            (f, b) => f.or(b),
        };

        let weight = clock
            .weights
            .front()
            .map(|&(stage, mb)| (clock.free_at, PipelineAction::BackwardWeights(stage, mb)));

        match (critical, weight) {
            (Some(c), Some(w)) => {
                // W only goes into a gap that fits it entirely.
                if c.0 >= clock.free_at + self.cost.weight {
                    Some(w)
                } else {
                    Some(c)
                }
            }
            (Some(c), None) => Some(c),
            // Blocked on a neighbour (or only W left): fill the wait.
            (None, Some(w)) => Some(w),
            (None, None) => None,
        }
    }

    /// Transfer latency from `peer`'s stage to `rank`.
    fn hop(&self, rank: usize, peer: StageId) -> u64 {
        if self.layout.rank_of(peer) == rank {
            0
        } else {
            self.cost.comm
        }
    }
}
