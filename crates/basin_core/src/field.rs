use crate::grid::CellId;
use crate::worker::BoundaryAccumulator;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    /// Every weight reached zero or stopped being finite; the growth and
    /// shrink factors or the grid resolution are misconfigured.
    #[error("Probability field degenerated: no drawable weight remains among {cells} cells.")]
    DegenerateProbabilityField { cells: usize },
    #[error("Cell id {id} lies outside the field of {cells} weights.")]
    UnknownCell { id: CellId, cells: usize },
    #[error("Update arrays disagree in length: {ids} ids, {classes} classes, {neighbor_sets} neighbor sets.")]
    LengthMismatch {
        ids: usize,
        classes: usize,
        neighbor_sets: usize,
    },
}

/// Normalized sampling weight per grid cell. All updates are
/// multiplicative followed by renormalization, so the weights always sum
/// to one and a cell's weight can shrink toward zero but never leave the
/// support entirely in a single update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbabilityField {
    weights: Vec<f64>,
}

impl ProbabilityField {
    pub fn uniform(cells: usize) -> Self {
        let weight = if cells == 0 { 0.0 } else { 1.0 / cells as f64 };
        Self {
            weights: vec![weight; cells],
        }
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn weight(&self, id: CellId) -> Option<f64> {
        self.weights.get(id).copied()
    }

    /// Draws `count` cell ids with replacement, proportionally to the
    /// current weights.
    pub fn draw<R: Rng>(&self, count: usize, rng: &mut R) -> Result<Vec<CellId>, FieldError> {
        let distribution =
            WeightedIndex::new(&self.weights).map_err(|_| FieldError::DegenerateProbabilityField {
                cells: self.weights.len(),
            })?;
        Ok((0..count).map(|_| distribution.sample(rng)).collect())
    }

    /// Folds one evaluated group's classes into the weights.
    ///
    /// Each group cell is compared against the recorded classes of its
    /// neighbors: any disagreement marks both cells as boundary and grows
    /// their weights by `eta_grow` (once per distinct pair); a cell whose
    /// compared neighbors all agree shrinks by `eta_shrink`. Neighbors
    /// never recorded are not compared. Returns the disagreeing pairs,
    /// smaller id first.
    pub fn update_from_classes(
        &mut self,
        group_ids: &[CellId],
        group_classes: &[usize],
        group_neighbors: &[Vec<CellId>],
        recorded: &HashMap<CellId, usize>,
        eta_grow: f64,
        eta_shrink: f64,
    ) -> Result<BTreeSet<(CellId, CellId)>, FieldError> {
        if group_ids.len() != group_classes.len() || group_ids.len() != group_neighbors.len() {
            return Err(FieldError::LengthMismatch {
                ids: group_ids.len(),
                classes: group_classes.len(),
                neighbor_sets: group_neighbors.len(),
            });
        }

        let mut pairs = BTreeSet::new();
        for slot in 0..group_ids.len() {
            let id = group_ids[slot];
            self.check(id)?;
            let class = group_classes[slot];
            let mut disagreed = false;
            for &neighbor in &group_neighbors[slot] {
                self.check(neighbor)?;
                if let Some(&other) = recorded.get(&neighbor) {
                    if other != class {
                        disagreed = true;
                        pairs.insert((id.min(neighbor), id.max(neighbor)));
                    }
                }
            }
            if !disagreed {
                self.weights[id] *= eta_shrink;
            }
        }

        for &(a, b) in &pairs {
            self.weights[a] *= eta_grow;
            self.weights[b] *= eta_grow;
        }

        self.normalize()?;
        Ok(pairs)
    }

    /// Applies the trajectory decay statistic: each visited cell's weight
    /// is scaled by its decay/weight ratio, which is 1 near slow dynamics
    /// and small deep inside a fast-converging basin.
    pub fn apply_boundary(&mut self, accumulator: &BoundaryAccumulator) -> Result<(), FieldError> {
        for (&id, stat) in accumulator {
            self.check(id)?;
            if stat.weight > 0.0 {
                let ratio = stat.decay / stat.weight;
                if ratio.is_finite() {
                    self.weights[id] *= ratio;
                }
            }
        }
        self.normalize()
    }

    fn check(&self, id: CellId) -> Result<(), FieldError> {
        if id >= self.weights.len() {
            return Err(FieldError::UnknownCell {
                id,
                cells: self.weights.len(),
            });
        }
        Ok(())
    }

    fn normalize(&mut self) -> Result<(), FieldError> {
        let total: f64 = self.weights.iter().sum();
        if !total.is_finite() || total <= 0.0 {
            return Err(FieldError::DegenerateProbabilityField {
                cells: self.weights.len(),
            });
        }
        for weight in &mut self.weights {
            *weight /= total;
        }
        Ok(())
    }
}
