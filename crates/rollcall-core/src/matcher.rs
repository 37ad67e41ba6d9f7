//! Probe-vs-roster matching with a distance tolerance.

use crate::known_set::KnownIdentitySet;
use crate::types::FeatureVector;

/// Result of matching a probe vector against the known set.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        identity_id: i64,
        display_name: String,
        distance: f64,
        confidence: f64,
    },
    /// No identity within tolerance. `nearest_distance` is the best distance
    /// that failed the check, or `None` if the set was empty.
    NoMatch { nearest_distance: Option<f64> },
}

/// Map a distance onto the `[0, 1]` confidence scale consumed downstream.
///
/// Not a calibrated probability: just `max(0, 1 - distance)`.
pub fn confidence_from_distance(distance: f64) -> f64 {
    (1.0 - distance).max(0.0)
}

/// Strategy for comparing a probe vector against the enrolled roster.
pub trait Matcher {
    fn compare(&self, probe: &FeatureVector, known: &KnownIdentitySet, tolerance: f64)
        -> MatchResult;
}

/// Nearest-neighbour Euclidean matcher. `distance <= tolerance` matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn compare(
        &self,
        probe: &FeatureVector,
        known: &KnownIdentitySet,
        tolerance: f64,
    ) -> MatchResult {
        match known.nearest(probe) {
            Some(nearest) if nearest.distance <= tolerance => MatchResult::Matched {
                identity_id: nearest.identity_id,
                display_name: nearest.display_name.to_string(),
                distance: nearest.distance,
                confidence: confidence_from_distance(nearest.distance),
            },
            Some(nearest) => MatchResult::NoMatch {
                nearest_distance: Some(nearest.distance),
            },
            None => MatchResult::NoMatch {
                nearest_distance: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{axis_vector, unit_on};
    use crate::types::IdentityEntry;
    use proptest::prelude::*;

    fn alice_set() -> KnownIdentitySet {
        KnownIdentitySet::build(vec![IdentityEntry {
            identity_id: 1,
            display_name: "Alice".into(),
            reference_vector: axis_vector(0.0),
        }])
        .unwrap()
    }

    #[test]
    fn test_empty_set_never_matches() {
        let result = EuclideanMatcher.compare(&axis_vector(0.0), &KnownIdentitySet::empty(), 10.0);
        assert_eq!(
            result,
            MatchResult::NoMatch {
                nearest_distance: None
            }
        );
    }

    #[test]
    fn test_match_within_tolerance() {
        let result = EuclideanMatcher.compare(&axis_vector(0.3), &alice_set(), 0.5);
        let MatchResult::Matched {
            identity_id,
            display_name,
            distance,
            confidence,
        } = result
        else {
            panic!("expected a match, got {result:?}");
        };
        assert_eq!(identity_id, 1);
        assert_eq!(display_name, "Alice");
        assert!((distance - 0.3).abs() < 1e-9);
        assert!((confidence - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_beyond_tolerance_is_no_match() {
        let result = EuclideanMatcher.compare(&axis_vector(0.6), &alice_set(), 0.5);
        let MatchResult::NoMatch {
            nearest_distance: Some(distance),
        } = result
        else {
            panic!("expected no match, got {result:?}");
        };
        assert!((distance - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_tolerance_is_inclusive() {
        // 0.5 is exactly representable, so the distance equals the tolerance.
        let result = EuclideanMatcher.compare(&axis_vector(0.5), &alice_set(), 0.5);
        assert!(matches!(result, MatchResult::Matched { .. }));
    }

    #[test]
    fn test_self_match_has_full_confidence() {
        let result = EuclideanMatcher.compare(&axis_vector(0.0), &alice_set(), 0.5);
        assert!(matches!(
            result,
            MatchResult::Matched { distance, confidence, .. } if distance == 0.0 && confidence == 1.0
        ));
    }

    #[test]
    fn test_confidence_floors_at_zero() {
        assert_eq!(confidence_from_distance(1.7), 0.0);
        let result = EuclideanMatcher.compare(&unit_on(3, 1.5), &alice_set(), 2.0);
        assert!(matches!(result, MatchResult::Matched { confidence, .. } if confidence == 0.0));
    }

    proptest! {
        #[test]
        fn confidence_strictly_decreases_within_tolerance(
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
        ) {
            // Closer than f64 resolution near 1.0 the two values round together.
            prop_assume!(b - a > 1e-9);
            prop_assert!(confidence_from_distance(a) > confidence_from_distance(b));
        }

        #[test]
        fn empty_set_is_always_no_match(offset in -10.0f64..10.0, tolerance in 0.0f64..5.0) {
            let result = EuclideanMatcher.compare(
                &axis_vector(offset),
                &KnownIdentitySet::empty(),
                tolerance,
            );
            prop_assert_eq!(result, MatchResult::NoMatch { nearest_distance: None });
        }
    }
}
