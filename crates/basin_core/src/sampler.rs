use crate::field::ProbabilityField;
use crate::grid::{CellId, Grid};
use crate::registry::SignatureRegistry;
use crate::simulate::Simulator;
use crate::worker::{
    evaluate_group, merge_boundary, BoundaryAccumulator, GroupOutcome, SampleParams,
};
use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Knobs for one sampling run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerOptions {
    /// Worker threads for trajectory evaluation; 1 or less runs each
    /// batch sequentially on the caller's thread.
    pub pool_size: usize,
    /// Hard cap on sampling rounds.
    pub iteration_limit: usize,
    /// Stop once the cumulative boundary-pair density drops to this.
    pub convergence_threshold: f64,
    /// Weight multiplier for cells caught disagreeing with a neighbor.
    pub growth_factor: f64,
    /// Weight multiplier for cells whose compared neighbors all agree.
    pub shrink_factor: f64,
    /// Componentwise tolerance for matching signatures to classes.
    pub cluster_tolerance: f64,
    /// Grid points drawn per round.
    pub batch_size: usize,
    /// Radius of the spatial neighbor ball around each drawn point.
    pub neighbor_radius: f64,
    /// Minkowski order of the neighbor ball.
    pub neighbor_norm_order: f64,
    /// Per-dimension distance scaling for the neighbor ball; None is
    /// the identity.
    pub anisotropy: Option<Vec<f64>>,
    /// Master seed for the draw generator.
    pub seed: u64,
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            iteration_limit: 1,
            convergence_threshold: 0.01,
            growth_factor: 1.2,
            shrink_factor: 0.95,
            cluster_tolerance: 1.0,
            batch_size: 1,
            neighbor_radius: 1.1,
            neighbor_norm_order: 2.0,
            anisotropy: None,
            seed: 0,
        }
    }
}

impl SamplerOptions {
    fn validate(&self, grid: &Grid) -> Result<()> {
        if self.iteration_limit == 0 {
            bail!("iteration_limit must be at least 1.");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1.");
        }
        if self.convergence_threshold <= 0.0 || !self.convergence_threshold.is_finite() {
            bail!("convergence_threshold must be positive and finite.");
        }
        if self.growth_factor <= 1.0 || !self.growth_factor.is_finite() {
            bail!("growth_factor must exceed 1.");
        }
        if self.shrink_factor <= 0.0 || self.shrink_factor > 1.0 || self.shrink_factor.is_nan() {
            bail!("shrink_factor must lie in (0, 1].");
        }
        if self.cluster_tolerance < 0.0 || !self.cluster_tolerance.is_finite() {
            bail!("cluster_tolerance must be non-negative and finite.");
        }
        if self.neighbor_radius <= 0.0 || !self.neighbor_radius.is_finite() {
            bail!("neighbor_radius must be positive and finite.");
        }
        if self.neighbor_norm_order < 1.0 || !self.neighbor_norm_order.is_finite() {
            bail!("neighbor_norm_order must be finite and at least 1.");
        }
        if let Some(scale) = &self.anisotropy {
            if scale.len() != grid.dimension() {
                bail!(
                    "anisotropy has {} entries for a {}-dimensional grid.",
                    scale.len(),
                    grid.dimension()
                );
            }
            if scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
                bail!("anisotropy entries must be positive and finite.");
            }
        }
        Ok(())
    }
}

/// Why a sampling run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// The boundary-pair density fell to the configured threshold.
    Converged,
    /// The round cap was reached first.
    IterationLimitReached,
}

/// One classified trajectory start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasinSample {
    pub cell_id: CellId,
    pub start: Vec<f64>,
    pub endpoint: Vec<f64>,
}

/// Everything a finished sampling run reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasinReport {
    pub registry: SignatureRegistry,
    /// Classified samples, indexed by registry class.
    pub samples: Vec<Vec<BasinSample>>,
    pub field: ProbabilityField,
    pub iterations: usize,
    /// Final cumulative boundary-pair density.
    pub boundary_density: f64,
    /// Cells caught disagreeing with a neighbor at least once.
    pub boundary_ids: BTreeSet<CellId>,
    /// Cells drawn as batch centers at least once.
    pub sampled_ids: BTreeSet<CellId>,
    pub termination: Termination,
}

/// Estimates the basins of attraction of `simulator`'s dynamics over
/// `grid`.
///
/// Each round draws batch centers from the probability field, evaluates
/// every center together with its spatial neighbors, classifies the
/// resulting signatures, and feeds class disagreements and trajectory
/// decay back into the field so later rounds concentrate near basin
/// boundaries. The run stops at the iteration cap or once the cumulative
/// density of distinct disagreeing pairs falls to the threshold; the
/// density check is skipped while no pair has been seen at all.
pub fn estimate_basins(
    simulator: &dyn Simulator,
    grid: &Grid,
    options: &SamplerOptions,
) -> Result<BasinReport> {
    options.validate(grid)?;
    if simulator.dimension() != grid.dimension() {
        bail!(
            "Simulator dimension {} does not match grid dimension {}.",
            simulator.dimension(),
            grid.dimension()
        );
    }

    let pool = build_pool(options.pool_size)?;
    let params = SampleParams {
        radius: options.neighbor_radius,
        norm_order: options.neighbor_norm_order,
        anisotropy: options.anisotropy.clone(),
    };

    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut field = ProbabilityField::uniform(grid.cells());
    let mut registry = SignatureRegistry::new();
    let mut samples: Vec<Vec<BasinSample>> = Vec::new();
    let mut recorded: HashMap<CellId, usize> = HashMap::new();
    let mut sampled_ids: BTreeSet<CellId> = BTreeSet::new();
    let mut boundary_ids: BTreeSet<CellId> = BTreeSet::new();
    let mut counted_pairs: BTreeSet<(CellId, CellId)> = BTreeSet::new();
    let mut iteration = 0usize;
    let mut density = f64::INFINITY;

    let termination = loop {
        if iteration >= options.iteration_limit {
            break Termination::IterationLimitReached;
        }
        if !counted_pairs.is_empty() && density <= options.convergence_threshold {
            break Termination::Converged;
        }

        let centers = field
            .draw(options.batch_size, &mut rng)
            .with_context(|| format!("drawing batch {iteration} failed"))?;
        sampled_ids.extend(centers.iter().copied());
        let mut center_indices = Vec::with_capacity(centers.len());
        for &id in &centers {
            center_indices.push(grid.id_to_index(id)?);
        }
        debug!("iteration {iteration}: drew cells {centers:?}");

        let outcomes = run_batch(pool.as_ref(), simulator, grid, &center_indices, &params)
            .with_context(|| format!("worker batch failed in iteration {iteration}"))?;

        let mut round_boundary = BoundaryAccumulator::new();
        for outcome in &outcomes {
            merge_boundary(&mut round_boundary, &outcome.boundary);
        }

        // First pass: settle the registry and capture classified samples.
        for outcome in &outcomes {
            for (slot, signature) in outcome.signatures.iter().enumerate() {
                let class = registry.classify(signature, options.cluster_tolerance);
                if class == samples.len() {
                    samples.push(Vec::new());
                }
                samples[class].push(BasinSample {
                    cell_id: outcome.cell_ids[slot],
                    start: outcome.starts[slot].clone(),
                    endpoint: outcome.endpoints[slot].clone(),
                });
            }
        }

        // Second pass: align each group against the settled registry and
        // fold its disagreements into the weights. Groups see the classes
        // recorded by earlier groups of the same round.
        for outcome in &outcomes {
            let classes = registry.align(&outcome.signatures, options.cluster_tolerance);
            for (&id, &class) in outcome.cell_ids.iter().zip(&classes) {
                recorded.insert(id, class);
            }
            let group_neighbors = neighbor_ids(grid, &outcome.cell_ids, &params)?;
            let pairs = field.update_from_classes(
                &outcome.cell_ids,
                &classes,
                &group_neighbors,
                &recorded,
                options.growth_factor,
                options.shrink_factor,
            )?;
            for pair in pairs {
                boundary_ids.insert(pair.0);
                boundary_ids.insert(pair.1);
                counted_pairs.insert(pair);
            }
        }

        field
            .apply_boundary(&round_boundary)
            .with_context(|| format!("probability update failed in iteration {iteration}"))?;

        iteration += 1;
        density = counted_pairs.len() as f64
            / ((options.neighbor_norm_order + 1.0) * options.batch_size as f64 * iteration as f64);
        info!(
            "iteration {iteration}: {} classes, {} distinct boundary pairs, density {density:.6}",
            registry.len(),
            counted_pairs.len()
        );
    };

    info!(
        "sampling stopped after {iteration} iterations: {termination:?}, {} classes",
        registry.len()
    );

    Ok(BasinReport {
        registry,
        samples,
        field,
        iterations: iteration,
        boundary_density: density,
        boundary_ids,
        sampled_ids,
        termination,
    })
}

fn build_pool(pool_size: usize) -> Result<Option<ThreadPool>> {
    if pool_size <= 1 {
        return Ok(None);
    }
    let pool = ThreadPoolBuilder::new()
        .num_threads(pool_size)
        .build()
        .context("failed to build the sampling worker pool")?;
    Ok(Some(pool))
}

/// Evaluates one batch of groups, on the scoped pool when there is one.
/// Outcome order always matches the draw order.
fn run_batch(
    pool: Option<&ThreadPool>,
    simulator: &dyn Simulator,
    grid: &Grid,
    centers: &[Vec<usize>],
    params: &SampleParams,
) -> Result<Vec<GroupOutcome>> {
    match pool {
        Some(pool) => pool.install(|| {
            centers
                .par_iter()
                .map(|center| evaluate_group(simulator, grid, center, params))
                .collect()
        }),
        None => centers
            .iter()
            .map(|center| evaluate_group(simulator, grid, center, params))
            .collect(),
    }
}

fn neighbor_ids(grid: &Grid, cell_ids: &[CellId], params: &SampleParams) -> Result<Vec<Vec<CellId>>> {
    let mut sets = Vec::with_capacity(cell_ids.len());
    for &id in cell_ids {
        let index = grid.id_to_index(id)?;
        let neighbors = grid.neighbors(
            &index,
            params.radius,
            params.norm_order,
            params.anisotropy.as_deref(),
        )?;
        let ids = neighbors
            .into_iter()
            .map(|neighbor| grid.index_to_id(&neighbor.index))
            .collect::<Result<Vec<_>, _>>()?;
        sets.push(ids);
    }
    Ok(sets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridAxis;
    use crate::simulate::TrajectoryRecord;

    /// Stationary 1-D system with two basins split at x = 5.
    struct SplitSim;

    impl Simulator for SplitSim {
        fn dimension(&self) -> usize {
            1
        }

        fn run(&self, start: &[f64]) -> Result<TrajectoryRecord> {
            let sign = if start[0] < 5.0 { -1.0 } else { 1.0 };
            Ok(TrajectoryRecord {
                states: vec![start.to_vec()],
                steps: vec![1.0],
                exponents: vec![sign],
            })
        }
    }

    /// Stationary 2-D system with two basins split at x = 2.
    struct PlaneSim;

    impl Simulator for PlaneSim {
        fn dimension(&self) -> usize {
            2
        }

        fn run(&self, start: &[f64]) -> Result<TrajectoryRecord> {
            let sign = if start[0] < 2.0 { -1.0 } else { 1.0 };
            Ok(TrajectoryRecord {
                states: vec![start.to_vec()],
                steps: vec![1.0],
                exponents: vec![sign, sign],
            })
        }
    }

    /// Diverges from every start: the trajectory ends in NaN and the
    /// signature is NaN.
    struct NanSim;

    impl Simulator for NanSim {
        fn dimension(&self) -> usize {
            1
        }

        fn run(&self, start: &[f64]) -> Result<TrajectoryRecord> {
            Ok(TrajectoryRecord {
                states: vec![start.to_vec(), vec![f64::NAN]],
                steps: vec![1.0, 1.0],
                exponents: vec![f64::NAN],
            })
        }
    }

    fn line_grid() -> Grid {
        Grid::new(vec![GridAxis::new(0.0, 10.0, 11)]).expect("axes should validate")
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn default_options_match_the_documented_knobs() {
        let options = SamplerOptions::default();
        assert_eq!(options.pool_size, 8);
        assert_eq!(options.iteration_limit, 1);
        assert_eq!(options.convergence_threshold, 0.01);
        assert_eq!(options.growth_factor, 1.2);
        assert_eq!(options.shrink_factor, 0.95);
        assert_eq!(options.cluster_tolerance, 1.0);
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.neighbor_radius, 1.1);
        assert_eq!(options.neighbor_norm_order, 2.0);
        assert!(options.anisotropy.is_none());
        assert_eq!(options.seed, 0);
    }

    #[test]
    fn option_validation_rejects_bad_knobs() {
        let grid = line_grid();
        let run = |mutate: fn(&mut SamplerOptions)| {
            let mut options = SamplerOptions {
                pool_size: 1,
                ..SamplerOptions::default()
            };
            mutate(&mut options);
            estimate_basins(&SplitSim, &grid, &options)
        };

        assert_err_contains(run(|o| o.iteration_limit = 0), "iteration_limit");
        assert_err_contains(run(|o| o.batch_size = 0), "batch_size");
        assert_err_contains(run(|o| o.growth_factor = 1.0), "growth_factor");
        assert_err_contains(run(|o| o.shrink_factor = 0.0), "shrink_factor");
        assert_err_contains(run(|o| o.shrink_factor = 1.5), "shrink_factor");
        assert_err_contains(run(|o| o.convergence_threshold = 0.0), "convergence_threshold");
        assert_err_contains(run(|o| o.neighbor_radius = -1.0), "neighbor_radius");
        assert_err_contains(run(|o| o.neighbor_norm_order = 0.5), "neighbor_norm_order");
        assert_err_contains(run(|o| o.cluster_tolerance = f64::NAN), "cluster_tolerance");
        assert_err_contains(
            run(|o| o.anisotropy = Some(vec![1.0, 1.0])),
            "anisotropy",
        );
    }

    #[test]
    fn mismatched_simulator_dimension_is_rejected() {
        let grid = line_grid();
        let options = SamplerOptions {
            pool_size: 1,
            ..SamplerOptions::default()
        };
        assert_err_contains(
            estimate_basins(&PlaneSim, &grid, &options),
            "does not match grid dimension",
        );
    }

    #[test]
    fn two_basin_line_finds_the_boundary() {
        let grid = line_grid();
        let options = SamplerOptions {
            pool_size: 1,
            iteration_limit: 20,
            batch_size: 5,
            ..SamplerOptions::default()
        };
        let report = estimate_basins(&SplitSim, &grid, &options).expect("run should succeed");

        assert_eq!(report.termination, Termination::Converged);
        assert!(
            report.iterations >= 7 && report.iterations < 20,
            "converged after {} iterations",
            report.iterations
        );
        assert!(report.boundary_density <= 0.01);

        // Exactly the two stationary classes, never a degenerate one.
        assert_eq!(report.registry.len(), 2);
        assert_eq!(report.samples.len(), 2);
        let classes: BTreeSet<i64> = report
            .registry
            .references()
            .iter()
            .map(|r| r[0] as i64)
            .collect();
        assert_eq!(classes, BTreeSet::from([-1, 1]));

        // The split between cells 4 and 5 is the only disagreeing pair.
        assert_eq!(report.boundary_ids, BTreeSet::from([4, 5]));

        // Boundary cells end up strictly heavier than the far interior.
        let weight = |id: usize| report.field.weight(id).unwrap();
        assert!(weight(4) > weight(0));
        assert!(weight(5) > weight(10));
        let total: f64 = report.field.weights().iter().sum();
        assert!((total - 1.0).abs() < 1e-12);

        // Every sample landed in the class its start point belongs to.
        for (class, samples) in report.samples.iter().enumerate() {
            let reference = report.registry.reference(class).unwrap()[0];
            for sample in samples {
                assert_eq!(sample.endpoint, sample.start);
                if reference < 0.0 {
                    assert!(sample.start[0] < 5.0);
                } else {
                    assert!(sample.start[0] >= 5.0);
                }
            }
        }

        assert!(!report.sampled_ids.is_empty());
        assert!(report.sampled_ids.iter().all(|&id| id < grid.cells()));
    }

    #[test]
    fn degenerate_signatures_do_not_crash_the_loop() {
        let grid = line_grid();
        let options = SamplerOptions {
            pool_size: 1,
            ..SamplerOptions::default()
        };
        let report = estimate_basins(&NanSim, &grid, &options).expect("run should succeed");

        assert_eq!(report.termination, Termination::IterationLimitReached);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.registry.len(), 1);
        assert!(report.registry.reference(0).unwrap()[0].is_infinite());
        assert!(report.boundary_ids.is_empty());
        assert_eq!(report.boundary_density, 0.0);
        assert!(!report.samples[0].is_empty());
        for sample in &report.samples[0] {
            assert!(sample.endpoint[0].is_nan());
        }
    }

    #[test]
    fn iteration_limit_caps_the_run() {
        let grid = line_grid();
        let options = SamplerOptions {
            pool_size: 1,
            iteration_limit: 4,
            batch_size: 5,
            convergence_threshold: 1e-12,
            ..SamplerOptions::default()
        };
        let report = estimate_basins(&SplitSim, &grid, &options).expect("run should succeed");
        assert_eq!(report.termination, Termination::IterationLimitReached);
        assert_eq!(report.iterations, 4);
    }

    #[test]
    fn parallel_and_sequential_runs_agree() {
        let axes = vec![GridAxis::new(0.0, 4.0, 5), GridAxis::new(0.0, 4.0, 5)];
        let grid = Grid::new(axes).expect("axes should validate");
        let base = SamplerOptions {
            iteration_limit: 3,
            batch_size: 4,
            convergence_threshold: 1e-9,
            seed: 42,
            ..SamplerOptions::default()
        };

        let sequential = estimate_basins(
            &PlaneSim,
            &grid,
            &SamplerOptions {
                pool_size: 1,
                ..base.clone()
            },
        )
        .expect("sequential run should succeed");
        let parallel = estimate_basins(
            &PlaneSim,
            &grid,
            &SamplerOptions {
                pool_size: 4,
                ..base
            },
        )
        .expect("parallel run should succeed");

        assert_eq!(sequential.iterations, parallel.iterations);
        assert_eq!(sequential.termination, parallel.termination);
        assert_eq!(
            sequential.registry.references(),
            parallel.registry.references()
        );
        assert_eq!(sequential.boundary_ids, parallel.boundary_ids);
        assert_eq!(sequential.sampled_ids, parallel.sampled_ids);
        assert_eq!(sequential.field.weights(), parallel.field.weights());
        let sizes = |report: &BasinReport| -> Vec<usize> {
            report.samples.iter().map(Vec::len).collect()
        };
        assert_eq!(sizes(&sequential), sizes(&parallel));
    }
}
