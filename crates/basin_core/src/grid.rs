use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat identifier of one grid point, assigned row-major.
pub type CellId = usize;

/// One discretized dimension: `count` evenly spaced grid points spanning
/// `[lo, hi]` inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridAxis {
    pub lo: f64,
    pub hi: f64,
    pub count: usize,
}

impl GridAxis {
    pub fn new(lo: f64, hi: f64, count: usize) -> Self {
        Self { lo, hi, count }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GridError {
    #[error("Grid needs at least one axis.")]
    Empty,
    #[error("Axis {dim} must satisfy finite lo < hi and count >= 2, got [{lo}, {hi}] x {count}.")]
    InvalidAxis {
        dim: usize,
        lo: f64,
        hi: f64,
        count: usize,
    },
    #[error("Grid point count overflows usize.")]
    TooManyCells,
    #[error("Expected {expected} index components, got {got}.")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Index component {value} of dimension {dim} lies outside [0, {count}).")]
    OutOfRange { dim: usize, value: i64, count: usize },
    #[error("Cell id {id} lies outside [0, {cells}).")]
    IdOutOfRange { id: CellId, cells: usize },
    #[error("Point component {dim} is not finite.")]
    NonFinitePoint { dim: usize },
}

/// An in-grid neighbor of a cell together with its scaled distance from
/// the cell's grid point.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub index: Vec<usize>,
    pub distance: f64,
}

/// Rectangular discretization of the state space. Cell indices are
/// per-dimension integer tuples; flat ids enumerate the same points
/// row-major, so the two forms are interchangeable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    axes: Vec<GridAxis>,
    widths: Vec<f64>,
    strides: Vec<usize>,
    cells: usize,
    diagonal: f64,
}

impl Grid {
    pub fn new(axes: Vec<GridAxis>) -> Result<Self, GridError> {
        if axes.is_empty() {
            return Err(GridError::Empty);
        }
        for (dim, axis) in axes.iter().enumerate() {
            let ordered = axis.lo.is_finite() && axis.hi.is_finite() && axis.lo < axis.hi;
            if !ordered || axis.count < 2 {
                return Err(GridError::InvalidAxis {
                    dim,
                    lo: axis.lo,
                    hi: axis.hi,
                    count: axis.count,
                });
            }
        }

        let widths: Vec<f64> = axes
            .iter()
            .map(|axis| (axis.hi - axis.lo) / (axis.count - 1) as f64)
            .collect();

        let mut cells = 1usize;
        for axis in &axes {
            cells = cells
                .checked_mul(axis.count)
                .ok_or(GridError::TooManyCells)?;
        }

        // Row-major: the last dimension varies fastest.
        let mut strides = vec![1usize; axes.len()];
        for dim in (0..axes.len().saturating_sub(1)).rev() {
            strides[dim] = strides[dim + 1] * axes[dim + 1].count;
        }

        let diagonal = widths.iter().map(|w| w * w).sum::<f64>().sqrt();

        Ok(Self {
            axes,
            widths,
            strides,
            cells,
            diagonal,
        })
    }

    pub fn dimension(&self) -> usize {
        self.axes.len()
    }

    pub fn axes(&self) -> &[GridAxis] {
        &self.axes
    }

    /// Spacing between adjacent grid points, per dimension.
    pub fn widths(&self) -> &[f64] {
        &self.widths
    }

    /// Total number of grid points.
    pub fn cells(&self) -> usize {
        self.cells
    }

    /// Euclidean norm of the per-dimension spacings; one cell's diagonal.
    pub fn diagonal(&self) -> f64 {
        self.diagonal
    }

    pub fn index_to_id(&self, index: &[usize]) -> Result<CellId, GridError> {
        self.check_dimension(index.len())?;
        let mut id = 0usize;
        for (dim, (&component, axis)) in index.iter().zip(&self.axes).enumerate() {
            if component >= axis.count {
                return Err(GridError::OutOfRange {
                    dim,
                    value: component as i64,
                    count: axis.count,
                });
            }
            id += component * self.strides[dim];
        }
        Ok(id)
    }

    pub fn id_to_index(&self, id: CellId) -> Result<Vec<usize>, GridError> {
        if id >= self.cells {
            return Err(GridError::IdOutOfRange {
                id,
                cells: self.cells,
            });
        }
        let mut remainder = id;
        let index = self
            .strides
            .iter()
            .map(|&stride| {
                let component = remainder / stride;
                remainder %= stride;
                component
            })
            .collect();
        Ok(index)
    }

    /// Coordinates of a grid point. With `pull_inward`, points on the grid
    /// boundary are moved half a cell width into the interior so sampled
    /// starts never sit exactly on the domain edge.
    pub fn index_to_point(&self, index: &[usize], pull_inward: bool) -> Result<Vec<f64>, GridError> {
        self.check_dimension(index.len())?;
        let mut point = Vec::with_capacity(index.len());
        for (dim, (&component, axis)) in index.iter().zip(&self.axes).enumerate() {
            if component >= axis.count {
                return Err(GridError::OutOfRange {
                    dim,
                    value: component as i64,
                    count: axis.count,
                });
            }
            let width = self.widths[dim];
            let coordinate = if pull_inward && component == 0 {
                axis.lo + 0.5 * width
            } else if pull_inward && component == axis.count - 1 {
                axis.hi - 0.5 * width
            } else {
                axis.lo + component as f64 * width
            };
            point.push(coordinate);
        }
        Ok(point)
    }

    pub fn id_to_point(&self, id: CellId, pull_inward: bool) -> Result<Vec<f64>, GridError> {
        let index = self.id_to_index(id)?;
        self.index_to_point(&index, pull_inward)
    }

    /// Signed corner indices (2^dimension of them) of the cell
    /// hyper-rectangle containing `point`. Corners may lie outside the
    /// grid when the point does.
    pub fn surrounding_cube(&self, point: &[f64]) -> Result<Vec<Vec<i64>>, GridError> {
        self.check_dimension(point.len())?;
        let mut base = Vec::with_capacity(point.len());
        for (dim, (&coordinate, axis)) in point.iter().zip(&self.axes).enumerate() {
            if !coordinate.is_finite() {
                return Err(GridError::NonFinitePoint { dim });
            }
            base.push(((coordinate - axis.lo) / self.widths[dim]).floor() as i64);
        }

        let dim = base.len();
        let mut corners = Vec::with_capacity(1usize << dim);
        for pattern in 0..(1usize << dim) {
            let corner = base
                .iter()
                .enumerate()
                .map(|(d, &component)| component + ((pattern >> d) & 1) as i64)
                .collect();
            corners.push(corner);
        }
        Ok(corners)
    }

    /// Coordinates of a signed corner index, extrapolated linearly when
    /// the corner lies outside the grid.
    pub fn raw_corner_point(&self, corner: &[i64]) -> Result<Vec<f64>, GridError> {
        self.check_dimension(corner.len())?;
        Ok(corner
            .iter()
            .zip(&self.axes)
            .zip(&self.widths)
            .map(|((&component, axis), width)| axis.lo + component as f64 * width)
            .collect())
    }

    /// Flat id of a signed corner index, or None when any component lies
    /// outside the grid.
    pub fn raw_to_id(&self, corner: &[i64]) -> Option<CellId> {
        debug_assert_eq!(corner.len(), self.axes.len());
        let mut id = 0usize;
        for (dim, (&component, axis)) in corner.iter().zip(&self.axes).enumerate() {
            if component < 0 || component as usize >= axis.count {
                return None;
            }
            id += component as usize * self.strides[dim];
        }
        Some(id)
    }

    /// In-grid neighbors of `center` whose scaled Minkowski distance from
    /// it is at most `radius`. The center itself is excluded.
    ///
    /// Distance between grid points is the q-norm of the componentwise
    /// differences, each scaled by the matching `anisotropy` entry;
    /// `norm_order` may be infinite for the max norm. Passing None for
    /// `anisotropy` leaves distances unscaled.
    pub fn neighbors(
        &self,
        center: &[usize],
        radius: f64,
        norm_order: f64,
        anisotropy: Option<&[f64]>,
    ) -> Result<Vec<Neighbor>, GridError> {
        self.check_dimension(center.len())?;
        if let Some(scale) = anisotropy {
            self.check_dimension(scale.len())?;
        }
        for (dim, (&component, axis)) in center.iter().zip(&self.axes).enumerate() {
            if component >= axis.count {
                return Err(GridError::OutOfRange {
                    dim,
                    value: component as i64,
                    count: axis.count,
                });
            }
        }

        let dim = self.axes.len();
        let scaled_width = |d: usize| -> f64 {
            let scale = anisotropy.map_or(1.0, |s| s[d]);
            scale * self.widths[d]
        };

        // The q-ball inscribes in this offset box for any q >= 1.
        let max_offset: Vec<i64> = (0..dim)
            .map(|d| {
                let reach = (radius / scaled_width(d)).floor();
                reach.min((self.axes[d].count - 1) as f64) as i64
            })
            .collect();

        let mut neighbors = Vec::new();
        let mut offset: Vec<i64> = max_offset.iter().map(|&k| -k).collect();
        if offset.iter().any(|&k| k > 0) {
            // A negative reach leaves nothing to enumerate.
            return Ok(neighbors);
        }

        'enumerate: loop {
            if offset.iter().any(|&k| k != 0) {
                let mut candidate = Vec::with_capacity(dim);
                let mut in_grid = true;
                for d in 0..dim {
                    let component = center[d] as i64 + offset[d];
                    if component < 0 || component as usize >= self.axes[d].count {
                        in_grid = false;
                        break;
                    }
                    candidate.push(component as usize);
                }

                if in_grid {
                    let distance = if norm_order.is_infinite() {
                        (0..dim).fold(0.0f64, |max, d| {
                            (offset[d].unsigned_abs() as f64 * scaled_width(d)).max(max)
                        })
                    } else {
                        (0..dim)
                            .map(|d| {
                                (offset[d].unsigned_abs() as f64 * scaled_width(d))
                                    .powf(norm_order)
                            })
                            .sum::<f64>()
                            .powf(1.0 / norm_order)
                    };
                    if distance <= radius {
                        neighbors.push(Neighbor {
                            index: candidate,
                            distance,
                        });
                    }
                }
            }

            let mut d = dim;
            while d > 0 {
                d -= 1;
                if offset[d] < max_offset[d] {
                    offset[d] += 1;
                    for later in d + 1..dim {
                        offset[later] = -max_offset[later];
                    }
                    continue 'enumerate;
                }
            }
            break;
        }

        Ok(neighbors)
    }

    fn check_dimension(&self, got: usize) -> Result<(), GridError> {
        if got != self.axes.len() {
            return Err(GridError::DimensionMismatch {
                expected: self.axes.len(),
                got,
            });
        }
        Ok(())
    }
}
