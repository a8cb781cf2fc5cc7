/// Maps a state onto the feasible set in place.
///
/// Constrained systems evolve inside a feasible region; the integrator
/// applies the projection after every accepted step so the vector field is
/// only ever evaluated at feasible states.
pub trait Projection: Sync {
    fn project(&self, state: &mut [f64]);
}

/// No-op projection for unconstrained systems.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityProjection;

impl Projection for IdentityProjection {
    fn project(&self, _state: &mut [f64]) {}
}

/// Componentwise clamp onto a box. Either bound may be absent, leaving
/// that side unconstrained.
#[derive(Debug, Clone, Default)]
pub struct BoxProjection {
    low: Option<Vec<f64>>,
    high: Option<Vec<f64>>,
}

impl BoxProjection {
    /// Builds a box with explicit per-component bounds.
    pub fn new(low: Option<Vec<f64>>, high: Option<Vec<f64>>) -> Self {
        Self { low, high }
    }

    /// Builds a box applying the same scalar bounds to every component.
    pub fn uniform(dim: usize, low: Option<f64>, high: Option<f64>) -> Self {
        Self {
            low: low.map(|b| vec![b; dim]),
            high: high.map(|b| vec![b; dim]),
        }
    }
}

impl Projection for BoxProjection {
    fn project(&self, state: &mut [f64]) {
        if let Some(low) = &self.low {
            for (x, &bound) in state.iter_mut().zip(low) {
                if *x < bound {
                    *x = bound;
                }
            }
        }
        if let Some(high) = &self.high {
            for (x, &bound) in state.iter_mut().zip(high) {
                if *x > bound {
                    *x = bound;
                }
            }
        }
    }
}
