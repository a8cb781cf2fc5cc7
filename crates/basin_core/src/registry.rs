use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Append-only list of reference signatures, one per attractor class.
///
/// Lyapunov spectra estimated from two trajectories in the same basin
/// agree only to integration accuracy, so membership is decided by a
/// componentwise tolerance comparison against canonicalized references
/// rather than exact equality. Class indices are stable: references are
/// never reordered or removed within a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignatureRegistry {
    references: Vec<Vec<f64>>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of classes registered so far.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    pub fn references(&self) -> &[Vec<f64>] {
        &self.references
    }

    pub fn reference(&self, class: usize) -> Option<&[f64]> {
        self.references.get(class).map(|r| r.as_slice())
    }

    /// Canonical form used for matching: components sorted descending.
    /// Any non-finite component collapses the whole signature to the
    /// +infinity sentinel, so every failed trajectory lands in a single
    /// degenerate class.
    pub fn canonicalize(signature: &[f64]) -> Vec<f64> {
        if signature.iter().any(|value| !value.is_finite()) {
            return vec![f64::INFINITY; signature.len()];
        }
        let mut canonical = signature.to_vec();
        canonical.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        canonical
    }

    /// Index of the first registered class matching `signature`, appending
    /// a new reference when nothing matches. First match wins, so the
    /// outcome is deterministic for a given registry state even when the
    /// tolerance band overlaps several references.
    pub fn classify(&mut self, signature: &[f64], tolerance: f64) -> usize {
        let canonical = Self::canonicalize(signature);
        if let Some(class) = self
            .references
            .iter()
            .position(|reference| matches(reference, &canonical, tolerance))
        {
            return class;
        }
        self.references.push(canonical);
        self.references.len() - 1
    }

    /// Classifies a whole batch in order.
    pub fn align(&mut self, signatures: &[Vec<f64>], tolerance: f64) -> Vec<usize> {
        signatures
            .iter()
            .map(|signature| self.classify(signature, tolerance))
            .collect()
    }
}

/// Componentwise comparison on canonical forms. The equality arm admits
/// the infinite sentinel, whose differences are NaN.
fn matches(reference: &[f64], canonical: &[f64], tolerance: f64) -> bool {
    reference.len() == canonical.len()
        && reference
            .iter()
            .zip(canonical)
            .all(|(&a, &b)| a == b || (a - b).abs() <= tolerance)
}
