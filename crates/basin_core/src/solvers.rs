use crate::traits::{EmbeddedSteppable, Scalar, Steppable, VectorField};

/// Forward Euler Solver
pub struct Euler<T: Scalar> {
    k1: Vec<T>,
}

impl<T: Scalar> Euler<T> {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![T::from_f64(0.0).unwrap(); dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for Euler<T> {
    fn step(&mut self, field: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T) {
        let t0 = *t;

        // k1 = f(t, y)
        field.eval(t0, state, &mut self.k1);

        // y_next = y + dt * k1
        for i in 0..state.len() {
            state[i] = state[i] + dt * self.k1[i];
        }

        *t = t0 + dt;
    }
}

/// Heun-Euler 2(1) embedded pair.
/// The trapezoidal (Heun) solution advances the state; the gap to the
/// Euler solution serves as the local error estimate.
pub struct HeunEuler<T: Scalar> {
    k1: Vec<T>,
    k2: Vec<T>,
    tmp: Vec<T>,
}

impl<T: Scalar> HeunEuler<T> {
    pub fn new(dim: usize) -> Self {
        let z = T::from_f64(0.0).unwrap();
        Self {
            k1: vec![z; dim],
            k2: vec![z; dim],
            tmp: vec![z; dim],
        }
    }
}

impl<T: Scalar> Steppable<T> for HeunEuler<T> {
    fn step(&mut self, field: &impl VectorField<T>, t: &mut T, state: &mut [T], dt: T) {
        self.step_with_error(field, t, state, dt);
    }
}

impl<T: Scalar> EmbeddedSteppable<T> for HeunEuler<T> {
    fn step_with_error(
        &mut self,
        field: &impl VectorField<T>,
        t: &mut T,
        state: &mut [T],
        dt: T,
    ) -> T {
        let half = T::from_f64(0.5).unwrap();
        let t0 = *t;

        // k1 = f(t, y)
        field.eval(t0, state, &mut self.k1);

        // Euler predictor: y~ = y + dt*k1
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i];
        }

        // k2 = f(t + dt, y~)
        field.eval(t0 + dt, &self.tmp, &mut self.k2);

        // y_next = y + dt/2 * (k1 + k2), error = max |y_next - y~|
        let mut error = T::zero();
        for i in 0..state.len() {
            let heun = state[i] + dt * half * (self.k1[i] + self.k2[i]);
            let gap = (heun - self.tmp[i]).abs();
            if gap > error {
                error = gap;
            }
            state[i] = heun;
        }

        *t = t0 + dt;
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
    }

    impl VectorField<f64> for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn eval(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = self.rate * x[0];
        }
    }

    struct Constant;

    impl VectorField<f64> for Constant {
        fn dimension(&self) -> usize {
            1
        }

        fn eval(&self, _t: f64, _x: &[f64], out: &mut [f64]) {
            out[0] = 2.0;
        }
    }

    #[test]
    fn euler_tracks_exponential_decay() {
        let field = Decay { rate: -1.0 };
        let mut stepper = Euler::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        let dt = 1e-3;
        for _ in 0..1000 {
            stepper.step(&field, &mut t, &mut state, dt);
        }
        assert!((t - 1.0).abs() < 1e-9);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-3);
    }

    #[test]
    fn heun_euler_is_exact_on_constant_fields() {
        let mut stepper = HeunEuler::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        let error = stepper.step_with_error(&Constant, &mut t, &mut state, 0.5);
        assert!((state[0] - 2.0).abs() < 1e-12);
        assert!(error.abs() < 1e-12);
    }

    #[test]
    fn heun_euler_error_shrinks_quadratically() {
        let field = Decay { rate: -2.0 };

        let mut coarse = HeunEuler::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        let err_coarse = coarse.step_with_error(&field, &mut t, &mut state, 0.1);

        let mut fine = HeunEuler::new(1);
        t = 0.0;
        state = [1.0];
        let err_fine = fine.step_with_error(&field, &mut t, &mut state, 0.05);

        // error = dt/2 * |k2 - k1| scales like dt^2 on smooth fields
        let ratio = err_coarse / err_fine;
        assert!(
            (3.0..5.0).contains(&ratio),
            "error ratio {ratio} not near 4"
        );
    }
}
