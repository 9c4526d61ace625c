use faer::{
    Mat, Side,
    linalg::solvers::Solve,
    sparse::linalg::solvers::{Llt, SymbolicLlt},
};

use crate::linalg::{LinAlgError, LinAlgResult, NormalEquations};

/// Sparse LLT solver for the normal equations.
#[derive(Debug, Clone, Default)]
pub struct SparseCholeskySolver {
    factorizer: Option<Llt<usize, f64>>,
    dimension: usize,

    /// Cached symbolic factorization and the pattern it was computed for.
    ///
    /// The elimination tree only depends on the sparsity pattern, so it is
    /// reused until an edge adds or removes a block.
    symbolic_factorization: Option<((u64, usize), SymbolicLlt<usize>)>,
}

impl SparseCholeskySolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once a numeric factorization succeeded.
    pub fn is_factorized(&self) -> bool {
        self.factorizer.is_some()
    }

    /// Drop the numeric factorization, keeping the symbolic one.
    pub fn reset(&mut self) {
        self.factorizer = None;
    }

    /// Numeric LLT of `system.hessian`.
    ///
    /// # Errors
    /// `SingularMatrix` if the matrix is not numerically positive definite.
    pub fn factorize(&mut self, system: &NormalEquations) -> LinAlgResult<()> {
        self.factorizer = None;

        let sym = match &self.symbolic_factorization {
            Some((pattern, cached_sym)) if *pattern == system.pattern => cached_sym.clone(),
            _ => {
                let new_sym =
                    SymbolicLlt::try_new(system.hessian.symbolic(), Side::Lower).map_err(|e| {
                        LinAlgError::FactorizationFailed(
                            "Symbolic Cholesky decomposition failed".to_string(),
                        )
                        .log_with_source(e)
                    })?;
                self.symbolic_factorization = Some((system.pattern, new_sym.clone()));
                new_sym
            }
        };

        let cholesky = Llt::try_new_with_symbolic(sym, system.hessian.as_ref(), Side::Lower)
            .map_err(|e| LinAlgError::SingularMatrix.log_with_source(e))?;
        self.factorizer = Some(cholesky);
        self.dimension = system.dimension();
        Ok(())
    }

    /// Solve `H·x = rhs` with the current factorization.
    pub fn solve(&self, rhs: &Mat<f64>) -> LinAlgResult<Mat<f64>> {
        let factorizer = self.factorizer.as_ref().ok_or(LinAlgError::NotFactorized)?;
        let solution = factorizer.solve(rhs);

        let finite = (0..solution.nrows())
            .all(|i| (0..solution.ncols()).all(|j| solution[(i, j)].is_finite()));
        if !finite {
            return Err(LinAlgError::SingularMatrix.log());
        }
        Ok(solution)
    }

    /// Factorize and return the step `Δx = -H⁻¹·b`.
    pub fn solve_step(&mut self, system: &NormalEquations) -> LinAlgResult<Mat<f64>> {
        self.factorize(system)?;
        let rhs = -&system.gradient;
        self.solve(&rhs)
    }

    /// Dense `dim × dim` block of `H⁻¹` starting at `offset`.
    ///
    /// Solves for the `dim` unit columns only, so the full inverse is never
    /// formed.
    pub fn covariance_block(&self, offset: usize, dim: usize) -> LinAlgResult<Mat<f64>> {
        if self.factorizer.is_none() {
            return Err(LinAlgError::NotFactorized);
        }
        let n = self.dimension;
        if offset + dim > n {
            return Err(LinAlgError::FactorizationFailed(format!(
                "covariance block {offset}..{} outside a {n}×{n} system",
                offset + dim
            ))
            .log());
        }

        let unit_columns = Mat::from_fn(n, dim, |i, j| if i == offset + j { 1.0 } else { 0.0 });
        let columns = self.solve(&unit_columns)?;
        Ok(Mat::from_fn(dim, dim, |i, j| columns[(offset + i, j)]))
    }
}
