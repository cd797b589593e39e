//! Numeric fingerprints of optimizer state.
//!
//! A [`Fingerprint`] condenses a replica's updated parameters (or gradients)
//! into a bit-exact checksum plus an L2 norm, so replicas can be compared
//! without moving the tensors. Reduced-precision buffers (`f16`, `bf16`) are
//! folded by their bit patterns, so any rounding difference between replicas
//! changes the checksum.

use std::fmt;

use half::{bf16, f16};
use serde::{Deserialize, Serialize};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Compact summary of a replica's numeric state after an optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub checksum: u64,
    pub l2_norm: f64,
    /// NaN or Inf was folded in (e.g. fp16 overflow).
    pub non_finite: bool,
}

impl Fingerprint {
    pub fn new(checksum: u64, l2_norm: f64) -> Self {
        Self {
            checksum,
            l2_norm,
            non_finite: !l2_norm.is_finite(),
        }
    }

    pub fn is_finite(&self) -> bool {
        !self.non_finite && self.l2_norm.is_finite()
    }

    /// Compare against another replica's fingerprint.
    ///
    /// Non-finite fingerprints never match.
    pub fn matches(&self, other: &Fingerprint, mode: MatchMode) -> bool {
        if !self.is_finite() || !other.is_finite() {
            return false;
        }
        match mode {
            MatchMode::Exact => self.checksum == other.checksum,
            MatchMode::Tolerance { relative } => {
                let scale = self.l2_norm.abs().max(other.l2_norm.abs());
                (self.l2_norm - other.l2_norm).abs() <= relative * scale
            }
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x} (l2 {:.6e}", self.checksum, self.l2_norm)?;
        if self.non_finite {
            f.write_str(", non-finite")?;
        }
        f.write_str(")")
    }
}

/// How strictly replica fingerprints must agree.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// Bit-identical state required.
    Exact,
    /// L2 norms within a relative tolerance.
    Tolerance { relative: f64 },
}

/// Incrementally folds buffers into a [`Fingerprint`].
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    hash: u64,
    sum_sq: f64,
    non_finite: bool,
    count: usize,
}

impl Default for FingerprintBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintBuilder {
    pub fn new() -> Self {
        Self {
            hash: FNV_OFFSET,
            sum_sq: 0.0,
            non_finite: false,
            count: 0,
        }
    }

    fn fold_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.hash ^= u64::from(b);
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
    }

    fn fold_value(&mut self, v: f64) {
        if v.is_finite() {
            self.sum_sq += v * v;
        } else {
            self.non_finite = true;
        }
        self.count += 1;
    }

    pub fn update_f32(&mut self, values: &[f32]) -> &mut Self {
        for &v in values {
            self.fold_bytes(&v.to_bits().to_le_bytes());
            self.fold_value(f64::from(v));
        }
        self
    }

    pub fn update_f64(&mut self, values: &[f64]) -> &mut Self {
        for &v in values {
            self.fold_bytes(&v.to_bits().to_le_bytes());
            self.fold_value(v);
        }
        self
    }

    pub fn update_f16(&mut self, values: &[f16]) -> &mut Self {
        for &v in values {
            self.fold_bytes(&v.to_bits().to_le_bytes());
            self.fold_value(v.to_f64());
        }
        self
    }

    pub fn update_bf16(&mut self, values: &[bf16]) -> &mut Self {
        for &v in values {
            self.fold_bytes(&v.to_bits().to_le_bytes());
            self.fold_value(v.to_f64());
        }
        self
    }

    /// Number of scalars folded so far.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(&self) -> Fingerprint {
        Fingerprint {
            checksum: self.hash,
            l2_norm: self.sum_sq.sqrt(),
            non_finite: self.non_finite,
        }
    }
}
