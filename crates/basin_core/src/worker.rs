use crate::grid::{CellId, Grid, GridError};
use crate::simulate::{Simulator, TrajectoryRecord};
use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Neighborhood shape shared by sampling and boundary bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleParams {
    pub radius: f64,
    pub norm_order: f64,
    /// Per-dimension distance scaling; None leaves distances unscaled.
    pub anisotropy: Option<Vec<f64>>,
}

/// Time-weighted decay statistic charged to a grid point while
/// trajectories pass nearby. The ratio decay/weight approaches 1 for
/// points hugging slow (boundary-like) dynamics and 0 deep inside a
/// fast-converging basin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryStat {
    pub decay: f64,
    pub weight: f64,
}

pub type BoundaryAccumulator = HashMap<CellId, BoundaryStat>;

/// Folds `from` into `into`. Entries are plain sums, so any merge order
/// produces the same totals.
pub fn merge_boundary(into: &mut BoundaryAccumulator, from: &BoundaryAccumulator) {
    for (&id, stat) in from {
        let entry = into.entry(id).or_default();
        entry.decay += stat.decay;
        entry.weight += stat.weight;
    }
}

/// Everything one worker reports for a sampled grid point: the evaluated
/// group (center first), per-member trajectory summaries, and the decay
/// statistics gathered along the way.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub cell_ids: Vec<CellId>,
    pub starts: Vec<Vec<f64>>,
    pub signatures: Vec<Vec<f64>>,
    pub endpoints: Vec<Vec<f64>>,
    pub boundary: BoundaryAccumulator,
}

/// Integrates one trajectory for the center cell and each of its spatial
/// neighbors. Workers only read shared state, so any number of groups can
/// be evaluated concurrently.
pub fn evaluate_group(
    simulator: &dyn Simulator,
    grid: &Grid,
    center: &[usize],
    params: &SampleParams,
) -> Result<GroupOutcome> {
    let neighbors = grid.neighbors(
        center,
        params.radius,
        params.norm_order,
        params.anisotropy.as_deref(),
    )?;

    let mut indices = Vec::with_capacity(neighbors.len() + 1);
    indices.push(center.to_vec());
    indices.extend(neighbors.into_iter().map(|neighbor| neighbor.index));

    let mut cell_ids = Vec::with_capacity(indices.len());
    let mut starts = Vec::with_capacity(indices.len());
    for index in &indices {
        cell_ids.push(grid.index_to_id(index)?);
        starts.push(grid.index_to_point(index, true)?);
    }

    let mut boundary = BoundaryAccumulator::new();
    let mut signatures = Vec::with_capacity(starts.len());
    let mut endpoints = Vec::with_capacity(starts.len());
    for (slot, start) in starts.iter().enumerate() {
        let record = simulator
            .run(start)
            .with_context(|| format!("simulation failed for cell id {}", cell_ids[slot]))?;
        if record.states.len() != record.steps.len() {
            bail!(
                "Simulator record arrays disagree for cell id {}: {} states, {} steps.",
                cell_ids[slot],
                record.states.len(),
                record.steps.len()
            );
        }
        let endpoint = record
            .endpoint()
            .map(<[f64]>::to_vec)
            .ok_or_else(|| {
                anyhow!(
                    "Simulator returned an empty trajectory for cell id {}.",
                    cell_ids[slot]
                )
            })?;
        accumulate_decay(grid, &record, &mut boundary)?;
        endpoints.push(endpoint);
        signatures.push(record.exponents);
    }

    Ok(GroupOutcome {
        cell_ids,
        starts,
        signatures,
        endpoints,
        boundary,
    })
}

/// Walks one trajectory and charges exp(-c * t/T) * dt to every in-grid
/// corner of the cell currently containing the state, where c is the
/// largest exponent magnitude, t the time of the visit and T the total
/// elapsed time. The monitored corner set is only rebuilt once the state
/// drifts more than one cell diagonal from a current corner.
fn accumulate_decay(
    grid: &Grid,
    record: &TrajectoryRecord,
    boundary: &mut BoundaryAccumulator,
) -> Result<(), GridError> {
    // A degenerate spectrum would poison every weight it touches, and its
    // states need not be finite. Gate on the record itself: a max fold over
    // the exponents would let NaN through.
    if record.is_degenerate() {
        debug!("skipping decay accumulation for a degenerate record");
        return Ok(());
    }
    let rate = record
        .exponents
        .iter()
        .fold(0.0f64, |max, value| value.abs().max(max));
    let count = record.states.len();
    if count == 0 {
        return Ok(());
    }

    let mut elapsed = Vec::with_capacity(count);
    elapsed.push(0.0);
    for k in 1..count {
        elapsed.push(elapsed[k - 1] + record.steps[k - 1]);
    }
    let total = elapsed[count - 1];

    let mut cube = grid.surrounding_cube(&record.states[0])?;
    let mut corner_points = corner_coordinates(grid, &cube)?;

    for (k, state) in record.states.iter().enumerate() {
        let escaped = corner_points
            .iter()
            .any(|corner| euclidean(state, corner) > grid.diagonal());
        if escaped {
            cube = grid.surrounding_cube(state)?;
            corner_points = corner_coordinates(grid, &cube)?;
        }

        let weight = record.steps[k];
        let factor = if total > 0.0 {
            (-rate * elapsed[k] / total).exp()
        } else {
            1.0
        };
        for corner in &cube {
            if let Some(id) = grid.raw_to_id(corner) {
                let stat = boundary.entry(id).or_default();
                stat.decay += factor * weight;
                stat.weight += weight;
            }
        }
    }

    Ok(())
}

fn corner_coordinates(grid: &Grid, cube: &[Vec<i64>]) -> Result<Vec<Vec<f64>>, GridError> {
    cube.iter()
        .map(|corner| grid.raw_corner_point(corner))
        .collect()
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}
