//! Known identity set: the enrolled roster as a dense reference matrix.

use crate::types::{euclidean, FeatureVector, IdentityEntry, FEATURE_DIM};
use ndarray::{Array2, ArrayView1};
use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KnownSetError {
    #[error("identity {0} appears more than once in the roster")]
    DuplicateIdentity(i64),
}

/// Closest enrolled identity to a probe vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest<'a> {
    pub identity_id: i64,
    pub display_name: &'a str,
    pub distance: f64,
}

/// Immutable set of enrolled identities.
///
/// Row `i` of the matrix is the reference vector of entry `i`. The set is
/// never edited after `build`; a roster refresh builds a new one.
#[derive(Debug, Clone)]
pub struct KnownIdentitySet {
    entries: Vec<IdentityEntry>,
    matrix: Array2<f64>,
}

impl KnownIdentitySet {
    /// Build a set from roster entries, preserving their order.
    ///
    /// An empty roster is valid and yields an empty set. Duplicate identity
    /// ids are rejected.
    pub fn build<I, E>(roster: I) -> Result<Self, KnownSetError>
    where
        I: IntoIterator<Item = E>,
        E: Into<IdentityEntry>,
    {
        let entries: Vec<IdentityEntry> = roster.into_iter().map(Into::into).collect();

        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if !seen.insert(entry.identity_id) {
                return Err(KnownSetError::DuplicateIdentity(entry.identity_id));
            }
        }

        let mut matrix = Array2::<f64>::zeros((entries.len(), FEATURE_DIM));
        for (row, entry) in entries.iter().enumerate() {
            matrix
                .row_mut(row)
                .assign(&ArrayView1::from(entry.reference_vector.as_slice()));
        }

        Ok(Self { entries, matrix })
    }

    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            matrix: Array2::zeros((0, FEATURE_DIM)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IdentityEntry] {
        &self.entries
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    /// Find the enrolled identity closest to `probe`.
    ///
    /// Scans every row. On an exact distance tie the lowest identity id wins,
    /// independent of roster order.
    pub fn nearest(&self, probe: &FeatureVector) -> Option<Nearest<'_>> {
        let mut best: Option<(usize, f64)> = None;

        for (idx, row) in self.matrix.rows().into_iter().enumerate() {
            let distance = match row.as_slice() {
                Some(slice) => euclidean(slice, probe.as_slice()),
                None => euclidean(&row.to_vec(), probe.as_slice()),
            };

            let is_better = match best {
                None => true,
                Some((best_idx, best_distance)) => {
                    distance < best_distance
                        || (distance == best_distance
                            && self.entries[idx].identity_id
                                < self.entries[best_idx].identity_id)
                }
            };
            if is_better {
                best = Some((idx, distance));
            }
        }

        best.map(|(idx, distance)| Nearest {
            identity_id: self.entries[idx].identity_id,
            display_name: &self.entries[idx].display_name,
            distance,
        })
    }
}

impl Default for KnownIdentitySet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Current known set, replaced wholesale on roster refresh.
///
/// Readers take an `Arc` snapshot and keep using it for the whole frame, so a
/// concurrent refresh is never observed half-applied.
#[derive(Debug, Default)]
pub struct SharedKnownSet {
    current: RwLock<Arc<KnownIdentitySet>>,
}

impl SharedKnownSet {
    pub fn new(set: KnownIdentitySet) -> Self {
        Self {
            current: RwLock::new(Arc::new(set)),
        }
    }

    /// Snapshot of the current set.
    pub fn load(&self) -> Arc<KnownIdentitySet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new set, returning the one it replaced.
    pub fn replace(&self, set: KnownIdentitySet) -> Arc<KnownIdentitySet> {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, Arc::new(set))
    }
}
