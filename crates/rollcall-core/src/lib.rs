//! rollcall-core: identity matching and attendance decisions.
//!
//! Matches face feature vectors against an enrolled roster, suppresses
//! repeat emissions per identity within a cooldown window, and produces one
//! audit record per observation.

pub mod audit;
pub mod decision;
pub mod known_set;
pub mod ledger;
pub mod matcher;
pub mod types;

pub use audit::{AuditError, AuditRecord, AuditSink, OutcomeTag};
pub use decision::{Decision, DecisionEngine, EngineError, IgnoreReason, Outcome};
pub use known_set::{KnownIdentitySet, KnownSetError, SharedKnownSet};
pub use ledger::DedupLedger;
pub use matcher::{confidence_from_distance, EuclideanMatcher, MatchResult, Matcher};
pub use types::{BoundingBox, FeatureVector, IdentityEntry, Observation, VectorError, FEATURE_DIM};
