//! Per-operation timing inside a profiling window.
//!
//! [`TimingRecorder`] keeps start/end timestamps only for iterations in
//! `[start_iteration, end_iteration]` on the configured ranks; everywhere else
//! `record` returns immediately. Records are handed to an
//! [`ObservabilitySink`] at every iteration boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use super::clock::CostModel;
use super::schedule::{OpKind, Operation};
use crate::error::Result;

/// Iterations and ranks for which timings are kept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilingWindow {
    pub start_iteration: u64,
    /// Inclusive.
    pub end_iteration: u64,
    /// `None` means every rank.
    pub ranks: Option<BTreeSet<usize>>,
}

impl Default for ProfilingWindow {
    fn default() -> Self {
        Self {
            start_iteration: 100,
            end_iteration: 110,
            ranks: None,
        }
    }
}

impl ProfilingWindow {
    pub fn new(start_iteration: u64, end_iteration: u64) -> Self {
        Self {
            start_iteration,
            end_iteration,
            ranks: None,
        }
    }

    /// A window that never records.
    pub fn disabled() -> Self {
        Self {
            start_iteration: 1,
            end_iteration: 0,
            ranks: None,
        }
    }

    pub fn with_ranks(mut self, ranks: impl IntoIterator<Item = usize>) -> Self {
        self.ranks = Some(ranks.into_iter().collect());
        self
    }

    pub fn contains(&self, iteration: u64, rank: usize) -> bool {
        (self.start_iteration..=self.end_iteration).contains(&iteration)
            && self.ranks.as_ref().map_or(true, |r| r.contains(&rank))
    }
}

/// One timed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub iteration: u64,
    pub rank: usize,
    pub operation: Operation,
    /// Microseconds since the recorder was created.
    pub start_us: u64,
    pub end_us: u64,
}

impl TimingRecord {
    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }
}

/// Receives flushed timing records.
pub trait ObservabilitySink: Send {
    fn flush(&mut self, records: &[TimingRecord]) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ObservabilitySink for NullSink {
    fn flush(&mut self, _records: &[TimingRecord]) -> Result<()> {
        Ok(())
    }
}

/// Emits one `tracing` event per record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn flush(&mut self, records: &[TimingRecord]) -> Result<()> {
        for r in records {
            tracing::info!(
                target: "zbsched::timing",
                iteration = r.iteration,
                rank = r.rank,
                op = %r.operation,
                start_us = r.start_us,
                duration_us = r.duration_us(),
                "op timing"
            );
        }
        Ok(())
    }
}

/// Writes records as JSON lines.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ObservabilitySink for JsonLinesSink<W> {
    fn flush(&mut self, records: &[TimingRecord]) -> Result<()> {
        for r in records {
            serde_json::to_writer(&mut self.writer, r).map_err(std::io::Error::from)?;
            self.writer.write_all(b"\n")?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// Collects records in memory. Clones share the buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<TimingRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<TimingRecord> {
        match self.records.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl ObservabilitySink for MemorySink {
    fn flush(&mut self, records: &[TimingRecord]) -> Result<()> {
        let mut guard = match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.extend_from_slice(records);
        Ok(())
    }
}

/// Aggregated durations per (rank, operation kind).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TimingSummary {
    totals: BTreeMap<(usize, OpKind), (u64, u64)>,
}

impl TimingSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, record: &TimingRecord) {
        let entry = self
            .totals
            .entry((record.rank, record.operation.kind()))
            .or_insert((0, 0));
        entry.0 += 1;
        entry.1 += record.duration_us();
    }

    pub fn count(&self, rank: usize, kind: OpKind) -> u64 {
        self.totals.get(&(rank, kind)).map_or(0, |&(n, _)| n)
    }

    /// Mean duration in microseconds.
    pub fn mean_us(&self, rank: usize, kind: OpKind) -> Option<u64> {
        self.totals
            .get(&(rank, kind))
            .filter(|(n, _)| *n > 0)
            .map(|&(n, total)| total / n)
    }

    /// Median across ranks of each rank's mean, `None` if never recorded.
    fn median_us(&self, kind: OpKind) -> Option<u64> {
        let mut means: Vec<u64> = self
            .totals
            .keys()
            .filter(|(_, k)| *k == kind)
            .filter_map(|&(rank, k)| self.mean_us(rank, k))
            .collect();
        if means.is_empty() {
            return None;
        }
        means.sort_unstable();
        Some(means[means.len() / 2])
    }

    /// Measured cost model in microsecond ticks, for rebuilding a schedule.
    ///
    /// Kinds never recorded keep the default cost; compute costs are at
    /// least one tick.
    pub fn cost_model(&self) -> CostModel {
        let default = CostModel::default();
        let weight = self
            .median_us(OpKind::BackwardWeights)
            .map_or(default.weight, |us| us.max(1));
        CostModel {
            forward: self.median_us(OpKind::Forward).map_or(default.forward, |us| us.max(1)),
            backward: self.median_us(OpKind::Backward).map_or(default.backward, |us| us.max(1)),
            weight,
            comm: self.median_us(OpKind::CommSend).unwrap_or(default.comm),
        }
    }
}

impl ObservabilitySink for TimingSummary {
    fn flush(&mut self, records: &[TimingRecord]) -> Result<()> {
        records.iter().for_each(|r| self.add(r));
        Ok(())
    }
}

/// Buffers timings for the current iteration of one rank.
#[derive(Debug, Clone)]
pub struct TimingRecorder {
    window: ProfilingWindow,
    epoch: Instant,
    iteration: u64,
    buffer: Vec<TimingRecord>,
}

impl TimingRecorder {
    pub fn new(window: ProfilingWindow) -> Self {
        Self {
            window,
            epoch: Instant::now(),
            iteration: 0,
            buffer: Vec::new(),
        }
    }

    pub fn window(&self) -> &ProfilingWindow {
        &self.window
    }

    pub fn begin_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    pub fn is_active(&self, rank: usize) -> bool {
        self.window.contains(self.iteration, rank)
    }

    /// Keep one operation's timestamps if inside the window.
    pub fn record(&mut self, rank: usize, operation: &Operation, start: Instant, end: Instant) {
        if !self.is_active(rank) {
            return;
        }
        let since = |t: Instant| t.saturating_duration_since(self.epoch).as_micros() as u64;
        self.buffer.push(TimingRecord {
            iteration: self.iteration,
            rank,
            operation: *operation,
            start_us: since(start),
            end_us: since(end),
        });
    }

    pub fn buffered(&self) -> &[TimingRecord] {
        &self.buffer
    }

    /// Hand buffered records to `sink` and clear the buffer.
    pub fn flush(&mut self, sink: &mut dyn ObservabilitySink) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.buffer);
        sink.flush(&records)
    }
}
