//! Pending-backward limiter.
//!
//! Every forward keeps activations alive until its backward runs. The limiter
//! counts, per rank, forwards whose backward has not completed and refuses
//! admission once the count reaches the memory limit. A refusal means
//! "defer", never "fail".

use crate::error::{Error, Result};

/// Per-rank pending-backward counters bounded by a memory limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBackwardLimiter {
    limit: usize,
    pending: Vec<usize>,
    peak: Vec<usize>,
}

impl PendingBackwardLimiter {
    pub fn new(num_ranks: usize, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::config("memory_limit", "must be >= 1, got 0"));
        }
        Ok(Self {
            limit,
            pending: vec![0; num_ranks],
            peak: vec![0; num_ranks],
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether a forward on `rank` would be admitted right now.
    pub fn can_admit(&self, rank: usize) -> bool {
        self.pending.get(rank).is_some_and(|&p| p < self.limit)
    }

    /// Admit a forward on `rank`, incrementing its counter.
    ///
    /// Returns `false` when the rank is at its limit; the caller must defer the forward.
    pub fn try_admit_forward(&mut self, rank: usize) -> bool {
        match self.pending.get_mut(rank) {
            Some(p) if *p < self.limit => {
                *p += 1;
                if *p > self.peak[rank] {
                    self.peak[rank] = *p;
                }
                true
            }
            _ => false,
        }
    }

    /// Record a completed backward on `rank`.
    ///
    /// Underflow means the schedule ran a backward without its forward, which
    /// is a scheduler defect.
    pub fn on_backward_complete(&mut self, rank: usize) -> Result<()> {
        let pending = self
            .pending
            .get_mut(rank)
            .ok_or_else(|| Error::invariant(rank, "backward completed on a rank the limiter does not track"))?;
        if *pending == 0 {
            return Err(Error::invariant(
                rank,
                "backward completed with no pending forward (pending-backward count would go negative)",
            ));
        }
        *pending -= 1;
        Ok(())
    }

    pub fn pending(&self, rank: usize) -> usize {
        self.pending.get(rank).copied().unwrap_or(0)
    }

    /// Highest pending count observed on `rank` since the last reset.
    pub fn peak(&self, rank: usize) -> usize {
        self.peak.get(rank).copied().unwrap_or(0)
    }

    /// True when no rank holds a pending backward.
    pub fn is_drained(&self) -> bool {
        self.pending.iter().all(|&p| p == 0)
    }

    /// Clear all counters (iteration boundary or aborted iteration).
    pub fn reset(&mut self) {
        self.pending.iter_mut().for_each(|p| *p = 0);
        self.peak.iter_mut().for_each(|p| *p = 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_limit_rejected() {
        assert!(PendingBackwardLimiter::new(2, 0).is_err());
    }

    #[test]
    fn test_admission_stops_at_limit() {
        let mut limiter = PendingBackwardLimiter::new(2, 2).unwrap();
        assert!(limiter.try_admit_forward(0));
        assert!(limiter.try_admit_forward(0));
        assert!(!limiter.can_admit(0));
        assert!(!limiter.try_admit_forward(0));
        assert_eq!(limiter.pending(0), 2);

        // ranks are independent
        assert!(limiter.try_admit_forward(1));

        limiter.on_backward_complete(0).unwrap();
        assert!(limiter.try_admit_forward(0));
        assert_eq!(limiter.peak(0), 2);
    }

    #[test]
    fn test_underflow_is_invariant_violation() {
        let mut limiter = PendingBackwardLimiter::new(1, 1).unwrap();
        let err = limiter.on_backward_complete(0).unwrap_err();
        assert!(matches!(err, Error::InvariantViolation { rank: 0, .. }));
    }

    #[test]
    fn test_unknown_rank() {
        let mut limiter = PendingBackwardLimiter::new(1, 1).unwrap();
        assert!(!limiter.try_admit_forward(3));
        assert!(limiter.on_backward_complete(3).is_err());
    }

    #[test]
    fn test_reset_drains() {
        let mut limiter = PendingBackwardLimiter::new(2, 4).unwrap();
        limiter.try_admit_forward(0);
        limiter.try_admit_forward(1);
        assert!(!limiter.is_drained());
        limiter.reset();
        assert!(limiter.is_drained());
        assert_eq!(limiter.peak(0), 0);
    }
}
