use crate::{
    projection::Projection,
    solvers::{Euler, HeunEuler},
    traits::{EmbeddedSteppable, Steppable, VectorField},
};
use anyhow::{anyhow, bail, Result};
use log::warn;
use nalgebra::linalg::QR;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrajectoryStepper {
    /// Fixed-step forward Euler; the step size stays at dt_init.
    Euler,
    /// Adaptive embedded pair with accept/reject step control.
    #[default]
    HeunEuler,
}

impl TrajectoryStepper {
    fn build(self, dim: usize) -> InternalStepper {
        match self {
            TrajectoryStepper::Euler => InternalStepper::Euler(Euler::new(dim)),
            TrajectoryStepper::HeunEuler => InternalStepper::HeunEuler(HeunEuler::new(dim)),
        }
    }
}

enum InternalStepper {
    Euler(Euler<f64>),
    HeunEuler(HeunEuler<f64>),
}

impl InternalStepper {
    /// Advances one step and returns the local error estimate, or 0.0 when
    /// the stepper has no embedded estimate.
    fn step(
        &mut self,
        field: &impl VectorField<f64>,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> f64 {
        match self {
            InternalStepper::Euler(s) => {
                s.step(field, t, state, dt);
                0.0
            }
            InternalStepper::HeunEuler(s) => s.step_with_error(field, t, state, dt),
        }
    }
}

/// Settings for trajectory integration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulatorSettings {
    pub stepper: TrajectoryStepper,
    /// Initial step size; also the fixed step for non-adaptive steppers.
    pub dt_init: f64,
    pub dt_min: f64,
    pub dt_max: f64,
    /// Local error tolerance for adaptive step control.
    pub error_tol: f64,
    /// Hard cap on accepted steps.
    pub max_steps: usize,
    /// Accepted steps between tangent re-orthonormalizations.
    pub qr_stride: usize,
    /// The trajectory is considered settled once the displacement per unit
    /// time drops below this.
    pub settle_tol: f64,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            stepper: TrajectoryStepper::HeunEuler,
            dt_init: 1e-2,
            dt_min: 1e-9,
            dt_max: 1.0,
            error_tol: 1e-1,
            max_steps: 100_000,
            qr_stride: 10,
            settle_tol: 1e-8,
        }
    }
}

/// One integrated trajectory: the visited states, the step size taken from
/// each state, and the Lyapunov-exponent signature.
///
/// `steps[k]` is the step size used to leave `states[k]`; the final entry
/// carries the step the solver would have taken next, keeping the two
/// arrays the same length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub states: Vec<Vec<f64>>,
    pub steps: Vec<f64>,
    pub exponents: Vec<f64>,
}

impl TrajectoryRecord {
    /// A record standing in for a run that failed to stay finite. The
    /// sentinel exponents bucket every such run into one signature class.
    pub fn degenerate(states: Vec<Vec<f64>>, steps: Vec<f64>, dim: usize) -> Self {
        debug_assert_eq!(states.len(), steps.len());
        Self {
            states,
            steps,
            exponents: vec![f64::INFINITY; dim],
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.exponents.iter().any(|value| !value.is_finite())
    }

    pub fn endpoint(&self) -> Option<&[f64]> {
        self.states.last().map(|state| state.as_slice())
    }
}

/// Produces one trajectory record from a starting point.
///
/// Numerical failure must not surface as an error: implementations return
/// a degenerate record instead, so the caller can treat it as data. `Err`
/// is reserved for caller faults and infrastructure failures.
pub trait Simulator: Sync {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    fn run(&self, start: &[f64]) -> Result<TrajectoryRecord>;
}

/// Integrates a vector field while propagating an orthonormal tangent
/// basis, estimating the Lyapunov spectrum from the QR-accumulated
/// stretch factors. States are projected back onto the feasible set after
/// every accepted step.
#[derive(Debug)]
pub struct LyapunovSimulator<F, P> {
    field: F,
    projection: P,
    settings: SimulatorSettings,
}

impl<F, P> LyapunovSimulator<F, P>
where
    F: VectorField<f64> + Sync,
    P: Projection,
{
    pub fn new(field: F, projection: P, settings: SimulatorSettings) -> Result<Self> {
        if field.dimension() == 0 {
            bail!("Vector field must have positive dimension.");
        }
        if settings.dt_init <= 0.0 || !settings.dt_init.is_finite() {
            bail!("Initial step size dt_init must be positive and finite.");
        }
        if settings.dt_min <= 0.0 || settings.dt_min > settings.dt_max {
            bail!("Step bounds must satisfy 0 < dt_min <= dt_max.");
        }
        if settings.error_tol <= 0.0 {
            bail!("Error tolerance must be positive.");
        }
        if settings.max_steps == 0 {
            bail!("Integration requires at least one step.");
        }
        if settings.qr_stride == 0 {
            bail!("qr_stride must be at least 1.");
        }
        Ok(Self {
            field,
            projection,
            settings,
        })
    }
}

impl<F, P> Simulator for LyapunovSimulator<F, P>
where
    F: VectorField<f64> + Sync,
    P: Projection,
{
    fn dimension(&self) -> usize {
        self.field.dimension()
    }

    fn run(&self, start: &[f64]) -> Result<TrajectoryRecord> {
        let dim = self.field.dimension();
        if start.len() != dim {
            bail!(
                "Starting point has dimension {}, expected {}.",
                start.len(),
                dim
            );
        }

        // Augmented state: [x | Phi] with Phi the tangent basis, row-major.
        let aug_dim = dim + dim * dim;
        let mut augmented = vec![0.0; aug_dim];
        augmented[..dim].copy_from_slice(start);
        for i in 0..dim {
            augmented[dim + i * dim + i] = 1.0;
        }
        self.projection.project(&mut augmented[..dim]);

        let tangent_field = TangentField::new(&self.field, dim);
        let mut stepper = self.settings.stepper.build(aug_dim);
        let mut states = vec![augmented[..dim].to_vec()];
        let mut steps: Vec<f64> = Vec::new();
        let mut accum = vec![0.0; dim];
        let mut t = 0.0;
        let mut dt = self.settings.dt_init.min(self.settings.dt_max);
        let mut since_last_qr = 0usize;
        let mut accepted = 0usize;

        while accepted < self.settings.max_steps {
            let mut trial = augmented.clone();
            let mut t_trial = t;
            let estimate = stepper.step(&tangent_field, &mut t_trial, &mut trial, dt);

            if !estimate.is_finite() || trial.iter().any(|value| !value.is_finite()) {
                // Halving may still rescue the step.
                dt *= 0.5;
                if dt < self.settings.dt_min {
                    warn!("trajectory left the finite domain at t = {t}");
                    steps.push(dt);
                    return Ok(TrajectoryRecord::degenerate(states, steps, dim));
                }
                continue;
            }

            if estimate > self.settings.error_tol && dt > self.settings.dt_min {
                let scale = 0.9 * (self.settings.error_tol / estimate).sqrt();
                dt = (dt * scale.max(0.1)).max(self.settings.dt_min);
                continue;
            }

            self.projection.project(&mut trial[..dim]);
            let displacement = max_abs_difference(&trial[..dim], &states[accepted]);
            augmented = trial;
            t = t_trial;
            steps.push(dt);
            states.push(augmented[..dim].to_vec());
            accepted += 1;
            since_last_qr += 1;

            if since_last_qr == self.settings.qr_stride {
                if apply_qr(&mut augmented[dim..], dim, &mut accum).is_err() {
                    warn!("tangent basis collapsed at t = {t}");
                    steps.push(dt);
                    return Ok(TrajectoryRecord::degenerate(states, steps, dim));
                }
                since_last_qr = 0;
            }

            if displacement <= self.settings.settle_tol * dt {
                break;
            }

            if estimate > 0.0 {
                let scale = 0.9 * (self.settings.error_tol / estimate).sqrt();
                dt = (dt * scale.clamp(0.1, 5.0)).clamp(self.settings.dt_min, self.settings.dt_max);
            }
        }

        if since_last_qr > 0 && apply_qr(&mut augmented[dim..], dim, &mut accum).is_err() {
            warn!("tangent basis collapsed at t = {t}");
            steps.push(dt);
            return Ok(TrajectoryRecord::degenerate(states, steps, dim));
        }

        steps.push(dt);
        let exponents = if t > 0.0 {
            accum.iter().map(|value| value / t).collect()
        } else {
            vec![0.0; dim]
        };

        Ok(TrajectoryRecord {
            states,
            steps,
            exponents,
        })
    }
}

/// Augments a field with its linearization: the leading dim components
/// evolve by F, the trailing dim^2 (row-major Phi) by J(x) * Phi.
struct TangentField<'a, F> {
    field: &'a F,
    dim: usize,
    jacobian: RefCell<Vec<f64>>,
}

impl<'a, F: VectorField<f64>> TangentField<'a, F> {
    fn new(field: &'a F, dim: usize) -> Self {
        Self {
            field,
            dim,
            jacobian: RefCell::new(vec![0.0; dim * dim]),
        }
    }
}

impl<'a, F: VectorField<f64>> VectorField<f64> for TangentField<'a, F> {
    fn dimension(&self) -> usize {
        self.dim + self.dim * self.dim
    }

    fn eval(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let dim = self.dim;
        self.field.eval(t, &x[..dim], &mut out[..dim]);

        let mut jacobian = self.jacobian.borrow_mut();
        self.field.jacobian(t, &x[..dim], &mut jacobian);

        // Phi' = J * Phi, row-major.
        for i in 0..dim {
            for j in 0..dim {
                let mut accum = 0.0;
                for k in 0..dim {
                    accum += jacobian[i * dim + k] * x[dim + k * dim + j];
                }
                out[dim + i * dim + j] = accum;
            }
        }
    }
}

fn max_abs_difference(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .fold(0.0, |max, (x, y)| (x - y).abs().max(max))
}

fn apply_qr(phi_slice: &mut [f64], dim: usize, accum: &mut [f64]) -> Result<()> {
    if phi_slice.len() != dim * dim {
        bail!("Tangent matrix slice has incorrect size.");
    }
    let matrix = DMatrix::from_row_slice(dim, dim, phi_slice);
    let qr = QR::new(matrix);
    let (q, r) = qr.unpack();
    for i in 0..dim {
        let diag = r[(i, i)].abs();
        if diag <= f64::EPSILON {
            return Err(anyhow!(
                "Encountered near-singular R matrix during orthonormalization."
            ));
        }
        accum[i] += diag.ln();
    }
    // Write Q back in ROW-MAJOR order; nalgebra stores column-major, so
    // q.as_slice() would hand back transposed data relative to our layout.
    for i in 0..dim {
        for j in 0..dim {
            phi_slice[i * dim + j] = q[(i, j)];
        }
    }
    Ok(())
}
