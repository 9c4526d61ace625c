//! Ingestion-time checks for measurements, information and covariance matrices.

use crate::graph::{GraphError, GraphResult};
use nalgebra::{DMatrix, DVector, SMatrix};

/// Relative tolerance on `|Ω - Ωᵀ|`.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// Relative tolerance on negative eigenvalues of `Ω`.
const EIGENVALUE_TOLERANCE: f64 = 1e-10;

pub(crate) fn validate_measurement(
    measurement: &DVector<f64>,
    expected_dim: usize,
) -> GraphResult<()> {
    if measurement.len() != expected_dim {
        return Err(GraphError::DimensionMismatch {
            what: "measurement",
            expected: expected_dim,
            actual: measurement.len(),
        }
        .log());
    }
    if !measurement.iter().all(|v| v.is_finite()) {
        return Err(GraphError::NonFiniteValue("measurement".to_string()).log());
    }
    Ok(())
}

/// Check that `information` is a finite, symmetric, positive semi-definite
/// `expected_dim × expected_dim` matrix.
pub fn validate_information(information: &DMatrix<f64>, expected_dim: usize) -> GraphResult<()> {
    let (rows, cols) = information.shape();
    if rows != expected_dim || cols != expected_dim {
        return Err(GraphError::DimensionMismatch {
            what: "information matrix",
            expected: expected_dim,
            actual: if rows != expected_dim { rows } else { cols },
        }
        .log());
    }
    if !information.iter().all(|v| v.is_finite()) {
        return Err(GraphError::NonFiniteValue("information matrix".to_string()).log());
    }

    let scale = information.amax().max(1.0);
    let asymmetry = (information - information.transpose()).amax();
    if asymmetry > SYMMETRY_TOLERANCE * scale {
        return Err(GraphError::IllConditioned(format!(
            "information matrix is not symmetric (max asymmetry {asymmetry:.3e})"
        ))
        .log());
    }

    let symmetric = (information + information.transpose()) * 0.5;
    let min_eigenvalue = symmetric.symmetric_eigenvalues().min();
    if min_eigenvalue < -EIGENVALUE_TOLERANCE * scale {
        return Err(GraphError::IllConditioned(format!(
            "information matrix is not positive semi-definite (min eigenvalue {min_eigenvalue:.3e})"
        ))
        .log());
    }

    Ok(())
}

/// Invert a measurement covariance into an information matrix.
///
/// The covariance must be symmetric positive definite.
pub fn information_from_covariance<const D: usize>(
    covariance: &SMatrix<f64, D, D>,
) -> GraphResult<SMatrix<f64, D, D>> {
    let dynamic = DMatrix::from_column_slice(D, D, covariance.as_slice());
    validate_information(&dynamic, D)?;

    let scale = dynamic.amax().max(f64::MIN_POSITIVE);
    let min_eigenvalue = dynamic.symmetric_eigenvalues().min();
    if min_eigenvalue <= EIGENVALUE_TOLERANCE * scale {
        return Err(GraphError::IllConditioned(format!(
            "covariance matrix is singular (min eigenvalue {min_eigenvalue:.3e})"
        ))
        .log());
    }

    let cholesky = dynamic.cholesky().ok_or_else(|| {
        GraphError::IllConditioned("covariance matrix is not positive definite".to_string()).log()
    })?;
    let information = cholesky.inverse();

    Ok(SMatrix::<f64, D, D>::from_column_slice(information.as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Matrix2, Matrix3};

    #[test]
    fn test_accepts_psd_information() {
        let information = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        assert!(validate_information(&information, 2).is_ok());

        // Semi-definite is fine: a zero block just contributes nothing.
        assert!(validate_information(&DMatrix::zeros(3, 3), 3).is_ok());
    }

    #[test]
    fn test_rejects_indefinite_information() {
        let information = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 1.0]);
        let result = validate_information(&information, 2);
        assert!(matches!(result, Err(GraphError::IllConditioned(_))));
    }

    #[test]
    fn test_rejects_asymmetric_information() {
        let information = DMatrix::from_row_slice(2, 2, &[1.0, 0.3, 0.0, 1.0]);
        let result = validate_information(&information, 2);
        assert!(matches!(result, Err(GraphError::IllConditioned(_))));
    }

    #[test]
    fn test_rejects_wrong_dimension() {
        let result = validate_information(&DMatrix::identity(2, 2), 3);
        assert!(matches!(
            result,
            Err(GraphError::DimensionMismatch { expected: 3, actual: 2, .. })
        ));
    }

    #[test]
    fn test_covariance_inversion() -> Result<(), GraphError> {
        let covariance = Matrix3::from_diagonal(&nalgebra::Vector3::new(0.01, 0.04, 0.25));
        let information = information_from_covariance(&covariance)?;
        assert!((information[(0, 0)] - 100.0).abs() < 1e-9);
        assert!((information[(2, 2)] - 4.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_singular_covariance_is_ill_conditioned() {
        let covariance = Matrix2::new(1.0, 1.0, 1.0, 1.0);
        let result = information_from_covariance(&covariance);
        assert!(matches!(result, Err(GraphError::IllConditioned(_))));
    }
}
