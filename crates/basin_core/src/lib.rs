pub mod field;
pub mod grid;
pub mod projection;
pub mod registry;
pub mod sampler;
pub mod simulate;
pub mod solvers;
/// The `basin_core` crate provides the mathematical engine for basin-of-attraction
/// estimation. It is designed to be generic over the integrated dynamics, supporting
/// any continuous vector field with an optional analytic Jacobian.
///
/// Key components:
/// - **Traits**: `Scalar` (numeric type abstraction), `VectorField` (ODE right-hand sides), `Steppable` (Solvers).
/// - **Grid**: Regular rectangular partition of state space with cell id arithmetic and neighbor enumeration.
/// - **Simulate**: Adaptive trajectory integration with running Lyapunov exponent estimates.
/// - **Sampler**: Importance-sampled basin classification driven by a probability field over grid cells.
pub mod traits;
pub mod worker;
