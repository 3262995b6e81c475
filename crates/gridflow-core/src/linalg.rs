//! Dense LU backend for the solvers' linear systems.
//!
//! Matrices are assembled sparsely with `sprs` and factorized densely with
//! faer's partial-pivoting LU. A factorization is reusable: the fast-decoupled
//! solver factors B' and B'' once and solves against them every iteration.
//!
//! Partial pivoting does not report rank deficiency on its own, so every
//! solve is checked: a non-finite result, or a result whose size implies a
//! condition number beyond [`MAX_CONDITION`], is reported as
//! [`LinalgError::Singular`].

use crate::error::LinalgError;
use faer::{prelude::*, solvers::PartialPivLu, Mat};
use sprs::{CsMat, TriMat};

/// Largest condition number accepted before a system is treated as singular.
pub const MAX_CONDITION: f64 = 1e14;

pub struct LuFactor {
    dim: usize,
    norm_inf: f64,
    max_condition: f64,
    lu: Option<PartialPivLu<f64>>,
}

impl std::fmt::Debug for LuFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuFactor")
            .field("dim", &self.dim)
            .field("norm_inf", &self.norm_inf)
            .finish()
    }
}

impl LuFactor {
    /// Factor a square CSR/CSC matrix.
    pub fn from_sparse(matrix: &CsMat<f64>) -> Result<Self, LinalgError> {
        let (rows, cols) = matrix.shape();
        if rows != cols {
            return Err(LinalgError::DimensionMismatch {
                expected: rows,
                found: cols,
            });
        }
        let mut dense = Mat::<f64>::zeros(rows, cols);
        for (&value, (i, j)) in matrix.iter() {
            dense.write(i, j, dense.read(i, j) + value);
        }
        Self::from_dense(dense)
    }

    /// Factor from triplets; duplicate entries are summed.
    pub fn from_triplets(triplets: &TriMat<f64>) -> Result<Self, LinalgError> {
        let csr: CsMat<f64> = triplets.to_csr();
        Self::from_sparse(&csr)
    }

    pub fn from_dense(matrix: Mat<f64>) -> Result<Self, LinalgError> {
        let n = matrix.nrows();
        if matrix.ncols() != n {
            return Err(LinalgError::DimensionMismatch {
                expected: n,
                found: matrix.ncols(),
            });
        }
        if n == 0 {
            return Ok(Self {
                dim: 0,
                norm_inf: 0.0,
                max_condition: MAX_CONDITION,
                lu: None,
            });
        }

        let mut norm_inf = 0.0_f64;
        for i in 0..n {
            let mut row_sum = 0.0;
            for j in 0..n {
                let v = matrix.read(i, j);
                if !v.is_finite() {
                    return Err(LinalgError::Singular { dim: n });
                }
                row_sum += v.abs();
            }
            norm_inf = norm_inf.max(row_sum);
        }
        if norm_inf == 0.0 {
            return Err(LinalgError::Singular { dim: n });
        }

        let lu = PartialPivLu::new(matrix.as_ref());
        Ok(Self {
            dim: n,
            norm_inf,
            max_condition: MAX_CONDITION,
            lu: Some(lu),
        })
    }

    /// Override the condition bound used to flag singular solves.
    ///
    /// Interior-point KKT systems become legitimately ill-conditioned as
    /// complementarity tightens; those callers pass `f64::INFINITY` and rely on
    /// the finiteness check alone.
    pub fn with_condition_limit(mut self, limit: f64) -> Self {
        self.max_condition = limit;
        self
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Solve `A x = rhs`.
    pub fn solve(&self, rhs: &[f64]) -> Result<Vec<f64>, LinalgError> {
        if rhs.len() != self.dim {
            return Err(LinalgError::DimensionMismatch {
                expected: self.dim,
                found: rhs.len(),
            });
        }
        let Some(lu) = &self.lu else {
            return Ok(Vec::new());
        };

        let rhs_mat = Mat::from_fn(self.dim, 1, |i, _| rhs[i]);
        let sol = lu.solve(&rhs_mat);
        let x: Vec<f64> = (0..self.dim).map(|i| sol.read(i, 0)).collect();

        if x.iter().any(|v| !v.is_finite()) {
            return Err(LinalgError::Singular { dim: self.dim });
        }

        // ||A|| ||x|| / ||b|| is a lower bound on cond(A)
        let b_norm = rhs.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        let x_norm = x.iter().fold(0.0_f64, |m, v| m.max(v.abs()));
        if b_norm > 0.0 && self.norm_inf * x_norm > self.max_condition * b_norm {
            return Err(LinalgError::Singular { dim: self.dim });
        }

        Ok(x)
    }
}

/// One-shot convenience wrapper.
pub fn solve_sparse(matrix: &CsMat<f64>, rhs: &[f64]) -> Result<Vec<f64>, LinalgError> {
    LuFactor::from_sparse(matrix)?.solve(rhs)
}
