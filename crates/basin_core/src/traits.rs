use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars in our dynamical systems.
/// Must support basic arithmetic, debug printing, and conversion from f64.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Represents a smooth vector field dx/dt = F(t, x).
pub trait VectorField<T: Scalar> {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt
    fn eval(&self, t: T, x: &[T], out: &mut [T]);

    /// Evaluates the Jacobian dF/dx, written row-major into out
    /// (length dimension^2).
    ///
    /// The default uses central finite differences of `eval` with a
    /// per-component step of eps^(1/3) * max(1, |x_j|). Override when an
    /// analytic Jacobian is available.
    fn jacobian(&self, t: T, x: &[T], out: &mut [T]) {
        let dim = self.dimension();
        let cbrt_eps = T::epsilon().cbrt();
        let mut probe = x.to_vec();
        let mut forward = vec![T::zero(); dim];
        let mut backward = vec![T::zero(); dim];
        for j in 0..dim {
            let h = cbrt_eps * T::one().max(x[j].abs());
            probe[j] = x[j] + h;
            self.eval(t, &probe, &mut forward);
            probe[j] = x[j] - h;
            self.eval(t, &probe, &mut backward);
            probe[j] = x[j];
            let span = h + h;
            for i in 0..dim {
                out[i * dim + j] = (forward[i] - backward[i]) / span;
            }
        }
    }
}

/// A trait for solvers that can step a vector field forward.
pub trait Steppable<T: Scalar> {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, field: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T);
}

/// A trait for embedded solver pairs that estimate their own local error.
pub trait EmbeddedSteppable<T: Scalar> {
    /// Performs one step of size dt with the higher-order member of the
    /// pair and returns the max-norm difference between the two members'
    /// solutions as the local error estimate.
    fn step_with_error(
        &mut self,
        field: &impl VectorField<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> T;
}
