//! Per-observation decision: Sent, Debounced, or Ignored.

use crate::audit::{AuditRecord, OutcomeTag, UNKNOWN_NAME};
use crate::known_set::KnownIdentitySet;
use crate::ledger::DedupLedger;
use crate::matcher::{EuclideanMatcher, MatchResult, Matcher};
use crate::types::Observation;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("match tolerance must be finite and non-negative, got {0}")]
    InvalidTolerance(f64),
    #[error("dedup cooldown must be non-negative, got {0}s")]
    NegativeCooldown(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    NoMatch,
    EmptyRoster,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Sent { identity_id: i64, confidence: f64 },
    Debounced { identity_id: i64, confidence: f64 },
    Ignored { reason: IgnoreReason },
}

impl Outcome {
    pub fn tag(&self) -> OutcomeTag {
        match self {
            Outcome::Sent { .. } => OutcomeTag::Sent,
            Outcome::Debounced { .. } => OutcomeTag::Debounced,
            Outcome::Ignored {
                reason: IgnoreReason::NoMatch,
            } => OutcomeTag::Ignored,
            Outcome::Ignored {
                reason: IgnoreReason::EmptyRoster,
            } => OutcomeTag::IgnoredEmptyRoster,
        }
    }
}

/// Outcome of one observation plus the context its audit record needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub captured_at: DateTime<Utc>,
    pub outcome: Outcome,
    /// Name of the matched identity; `None` when ignored.
    pub display_name: Option<String>,
    /// Distance to the nearest identity; `None` for an empty roster.
    pub distance: Option<f64>,
}

impl Decision {
    pub fn audit_record(&self) -> AuditRecord {
        let (identity_id, confidence) = match self.outcome {
            Outcome::Sent {
                identity_id,
                confidence,
            }
            | Outcome::Debounced {
                identity_id,
                confidence,
            } => (Some(identity_id), Some(confidence)),
            Outcome::Ignored { .. } => (None, None),
        };

        AuditRecord {
            timestamp: self.captured_at,
            identity_id,
            display_name: self
                .display_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_NAME.to_string()),
            distance: self.distance,
            confidence,
            event: self.outcome.tag(),
        }
    }
}

/// Combines a matcher with the cooldown ledger.
///
/// The ledger is injected so callers control its lifetime and sharing; the
/// known set is passed per call so a roster refresh never needs the engine.
pub struct DecisionEngine<M = EuclideanMatcher> {
    matcher: M,
    ledger: Arc<DedupLedger>,
    tolerance: f64,
    cooldown: Duration,
}

impl DecisionEngine<EuclideanMatcher> {
    pub fn new(
        ledger: Arc<DedupLedger>,
        tolerance: f64,
        cooldown: Duration,
    ) -> Result<Self, EngineError> {
        Self::with_matcher(EuclideanMatcher, ledger, tolerance, cooldown)
    }
}

impl<M: Matcher> DecisionEngine<M> {
    pub fn with_matcher(
        matcher: M,
        ledger: Arc<DedupLedger>,
        tolerance: f64,
        cooldown: Duration,
    ) -> Result<Self, EngineError> {
        if !tolerance.is_finite() || tolerance < 0.0 {
            return Err(EngineError::InvalidTolerance(tolerance));
        }
        if cooldown < Duration::zero() {
            return Err(EngineError::NegativeCooldown(cooldown.num_seconds()));
        }
        Ok(Self {
            matcher,
            ledger,
            tolerance,
            cooldown,
        })
    }

    pub fn ledger(&self) -> &DedupLedger {
        &self.ledger
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Classify one observation.
    ///
    /// On the Sent path the ledger is updated before this returns, so the
    /// next observation of the same identity sees the emission.
    pub fn evaluate(&self, known: &KnownIdentitySet, observation: &Observation) -> Decision {
        let captured_at = observation.captured_at;

        if known.is_empty() {
            tracing::debug!("observation ignored: roster is empty");
            return Decision {
                captured_at,
                outcome: Outcome::Ignored {
                    reason: IgnoreReason::EmptyRoster,
                },
                display_name: None,
                distance: None,
            };
        }

        match self
            .matcher
            .compare(&observation.vector, known, self.tolerance)
        {
            MatchResult::NoMatch { nearest_distance } => {
                tracing::debug!(distance = ?nearest_distance, "observation ignored: no match");
                Decision {
                    captured_at,
                    outcome: Outcome::Ignored {
                        reason: IgnoreReason::NoMatch,
                    },
                    display_name: None,
                    distance: nearest_distance,
                }
            }
            MatchResult::Matched {
                identity_id,
                display_name,
                distance,
                confidence,
            } => {
                let outcome = if self.ledger.try_emit(identity_id, captured_at, self.cooldown) {
                    tracing::debug!(identity_id, confidence, "observation sent");
                    Outcome::Sent {
                        identity_id,
                        confidence,
                    }
                } else {
                    tracing::debug!(identity_id, confidence, "observation debounced");
                    Outcome::Debounced {
                        identity_id,
                        confidence,
                    }
                };
                Decision {
                    captured_at,
                    outcome,
                    display_name: Some(display_name),
                    distance: Some(distance),
                }
            }
        }
    }
}
