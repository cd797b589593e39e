//! Optimizer post-validation.
//!
//! After the optimizer step every rank publishes a [`Fingerprint`] of its
//! updated state. Replicas of the same pipeline stage must agree; any
//! disagreement anywhere in the group rolls the whole step back so all
//! ranks stay on the same parameters.
//!
//! ```text
//! Applied -> Validating -> Committed
//!                 |
//!                 v
//!            RolledBack -> Retrying -> Committed
//!                              |
//!                              v
//!                          Divergent
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::fingerprint::{Fingerprint, MatchMode};
use crate::distributed::pipeline::comm::{epoch_tag, is_stale};
use crate::distributed::pipeline::schedule::TransferKind;
use crate::distributed::transport::{Transport, TransportError};
use crate::error::{Error, Result};

/// Low 32 bits of the tag used for fingerprint traffic on a dedicated
/// validation transport. The high 32 bits carry the epoch.
pub const VALIDATION_TAG: u32 = 0x7a62_0001;

/// Post-validation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostValidationConfig {
    /// Exchange and compare fingerprints after every optimizer step.
    pub enabled: bool,
    /// Require bit-identical checksums instead of a norm tolerance.
    pub exact_numeric_match: bool,
    /// Allowed relative L2-norm difference when not matching exactly.
    pub relative_tolerance: f64,
}

impl Default for PostValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            exact_numeric_match: false,
            relative_tolerance: 1e-6,
        }
    }
}

impl PostValidationConfig {
    pub fn match_mode(&self) -> MatchMode {
        if self.exact_numeric_match {
            MatchMode::Exact
        } else {
            MatchMode::Tolerance {
                relative: self.relative_tolerance,
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.exact_numeric_match && !(self.relative_tolerance >= 0.0 && self.relative_tolerance.is_finite()) {
            return Err(Error::config(
                "post_validation.relative_tolerance",
                format!("must be a finite value >= 0, got {}", self.relative_tolerance),
            ));
        }
        Ok(())
    }
}

/// Result of comparing fingerprints across the validation group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValidationOutcome {
    Consistent,
    /// First disagreeing pair found; `local` is this rank's fingerprint when
    /// the disagreement is in its own stage.
    Mismatch { local: Fingerprint, remote: Fingerprint },
}

impl ValidationOutcome {
    pub fn is_consistent(&self) -> bool {
        matches!(self, ValidationOutcome::Consistent)
    }
}

/// One rank's published fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageFingerprint {
    /// Pipeline rank (stage) within its replica.
    pub stage: usize,
    /// Data-parallel replica index.
    pub replica: usize,
    pub fingerprint: Fingerprint,
}

/// All-gather of fingerprints across the validation group.
///
/// Every member must call it once per `epoch`; it acts as the
/// post-validation barrier. Fingerprints published in an earlier epoch
/// (by a peer whose attempt aborted) must never be returned.
pub trait FingerprintExchange: Send {
    fn all_gather(&mut self, epoch: u32, local: StageFingerprint) -> Result<Vec<StageFingerprint>>;
}

/// [`FingerprintExchange`] over a dedicated [`Transport`].
pub struct TransportExchange<X> {
    transport: X,
    timeout: Duration,
}

impl<X: Transport<StageFingerprint>> TransportExchange<X> {
    pub fn new(transport: X, timeout: Duration) -> Self {
        Self { transport, timeout }
    }
}

impl<X: Transport<StageFingerprint>> FingerprintExchange for TransportExchange<X> {
    fn all_gather(&mut self, epoch: u32, local: StageFingerprint) -> Result<Vec<StageFingerprint>> {
        let rank = self.transport.rank();
        let world_size = self.transport.world_size();
        let tag = epoch_tag(epoch, VALIDATION_TAG);
        self.transport.discard_stale(&|t| is_stale(t, epoch));

        for peer in (0..world_size).filter(|&p| p != rank) {
            self.transport
                .send(peer, tag, local)
                .map_err(|e| exchange_error(rank, peer, e))?;
        }

        let mut gathered = Vec::with_capacity(world_size);
        for peer in 0..world_size {
            if peer == rank {
                gathered.push(local);
                continue;
            }
            let fp = self
                .transport
                .recv(peer, tag, self.timeout)
                .map_err(|e| exchange_error(rank, peer, e))?;
            gathered.push(fp);
        }
        Ok(gathered)
    }
}

fn exchange_error(rank: usize, peer: usize, err: TransportError) -> Error {
    match err {
        TransportError::Timeout(timeout) => Error::StallTimeout {
            rank,
            peer,
            microbatch: None,
            kind: TransferKind::Fingerprint,
            timeout,
        },
        other => Error::Transport {
            rank,
            peer,
            reason: format!("fingerprint exchange: {other}"),
        },
    }
}

/// Compares this rank's fingerprint with the rest of the group.
pub struct PostValidator {
    config: PostValidationConfig,
    stage: usize,
    replica: usize,
    exchange: Option<Box<dyn FingerprintExchange>>,
}

impl fmt::Debug for PostValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostValidator")
            .field("config", &self.config)
            .field("stage", &self.stage)
            .field("replica", &self.replica)
            .finish_non_exhaustive()
    }
}

impl PostValidator {
    /// Validator that accepts everything.
    pub fn disabled() -> Self {
        Self {
            config: PostValidationConfig::default(),
            stage: 0,
            replica: 0,
            exchange: None,
        }
    }

    pub fn new(
        config: PostValidationConfig,
        stage: usize,
        replica: usize,
        exchange: Box<dyn FingerprintExchange>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            stage,
            replica,
            exchange: Some(exchange),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.exchange.is_some()
    }

    /// Validate outside any pipeline run; every call uses epoch 0.
    pub fn validate(&mut self, local: Fingerprint) -> Result<ValidationOutcome> {
        self.validate_at(0, local)
    }

    /// Validate the fingerprint produced by the execution attempt `epoch`.
    pub fn validate_at(&mut self, epoch: u32, local: Fingerprint) -> Result<ValidationOutcome> {
        if !self.config.enabled {
            return Ok(ValidationOutcome::Consistent);
        }
        let Some(exchange) = self.exchange.as_mut() else {
            return Ok(ValidationOutcome::Consistent);
        };

        let gathered = exchange.all_gather(epoch, StageFingerprint {
            stage: self.stage,
            replica: self.replica,
            fingerprint: local,
        })?;
        Ok(compare(&gathered, self.stage, self.replica, self.config.match_mode()))
    }
}

/// Compare every stage's replicas; own stage first so `local` is meaningful.
fn compare(gathered: &[StageFingerprint], stage: usize, replica: usize, mode: MatchMode) -> ValidationOutcome {
    let mut groups: BTreeMap<usize, Vec<&StageFingerprint>> = BTreeMap::new();
    for fp in gathered {
        groups.entry(fp.stage).or_default().push(fp);
    }
    for members in groups.values_mut() {
        members.sort_by_key(|m| m.replica);
    }

    if let Some(own) = groups.get(&stage) {
        let local = own.iter().find(|m| m.replica == replica);
        if let Some(local) = local {
            for other in own.iter().filter(|m| m.replica != replica) {
                if !local.fingerprint.matches(&other.fingerprint, mode) {
                    return ValidationOutcome::Mismatch {
                        local: local.fingerprint,
                        remote: other.fingerprint,
                    };
                }
            }
            if !local.fingerprint.is_finite() {
                return ValidationOutcome::Mismatch {
                    local: local.fingerprint,
                    remote: local.fingerprint,
                };
            }
        }
    }

    for (_, members) in groups.iter().filter(|(s, _)| **s != stage) {
        let Some((first, rest)) = members.split_first() else {
            continue;
        };
        if !first.fingerprint.is_finite() {
            return ValidationOutcome::Mismatch {
                local: first.fingerprint,
                remote: first.fingerprint,
            };
        }
        for other in rest {
            if !first.fingerprint.matches(&other.fingerprint, mode) {
                return ValidationOutcome::Mismatch {
                    local: first.fingerprint,
                    remote: other.fingerprint,
                };
            }
        }
    }
    ValidationOutcome::Consistent
}

/// Where a step is in the validate / rollback / retry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Applied,
    Validating,
    Committed,
    RolledBack,
    Retrying,
    Divergent,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Applied => "applied",
            StepState::Validating => "validating",
            StepState::Committed => "committed",
            StepState::RolledBack => "rolled_back",
            StepState::Retrying => "retrying",
            StepState::Divergent => "divergent",
        };
        f.write_str(name)
    }
}

/// What the step driver has to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Commit,
    RollbackAndRetry,
}

/// Per-step post-validation state machine. Allows at most one retry.
#[derive(Debug, Clone)]
pub struct StepValidation {
    rank: usize,
    state: StepState,
    retries: usize,
}

impl StepValidation {
    pub const MAX_RETRIES: usize = 1;

    /// Starts in `Applied`: the optimizer update has run.
    pub fn new(rank: usize) -> Self {
        Self {
            rank,
            state: StepState::Applied,
            retries: 0,
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn begin_validation(&mut self) -> Result<()> {
        self.transition(StepState::Applied, StepState::Validating)
    }

    pub fn begin_retry(&mut self) -> Result<()> {
        self.transition(StepState::RolledBack, StepState::Retrying)?;
        self.retries += 1;
        Ok(())
    }

    /// Feed a validation outcome. A mismatch while retrying is fatal.
    pub fn on_outcome(&mut self, outcome: ValidationOutcome) -> Result<StepAction> {
        match (self.state, outcome) {
            (StepState::Validating | StepState::Retrying, ValidationOutcome::Consistent) => {
                self.state = StepState::Committed;
                Ok(StepAction::Commit)
            }
            (StepState::Validating, ValidationOutcome::Mismatch { .. }) => {
                self.state = StepState::RolledBack;
                Ok(StepAction::RollbackAndRetry)
            }
            (StepState::Retrying, ValidationOutcome::Mismatch { local, remote }) => {
                self.state = StepState::Divergent;
                Err(Error::NumericDivergence {
                    local,
                    remote,
                    retries: self.retries,
                })
            }
            (state, _) => Err(Error::invariant(
                self.rank,
                format!("validation outcome received in state {state}"),
            )),
        }
    }

    fn transition(&mut self, from: StepState, to: StepState) -> Result<()> {
        if self.state != from {
            return Err(Error::invariant(
                self.rank,
                format!("cannot move to {to} from {}", self.state),
            ));
        }
        self.state = to;
        Ok(())
    }
}
