// First-order uncertainty propagation through the fitted residual model
//
// At the least-squares solution the estimate moves with a noisy input z as
//
//   dx/dz = -(J^T W J)^-1 J^T W dr/dz
//
// so an input with covariance S contributes A S A^T with A = dx/dz. Inputs are
// independent, hence their contributions add to the solver's own covariance.

use nalgebra as na;
use na::{DMatrix, Matrix2};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::solver::Solution;

/// Kind of a noisy model input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseKind {
    /// RSSI of the query and located fingerprint readings
    ReadingRssi,
    PathLossExponent,
    FingerprintPosition,
    RadioSourcePosition,
    InitialPosition,
}

/// A group of noisy inputs with their sensitivity and covariance.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    pub kind: NoiseKind,
    /// dr/dz, one row per residual and one column per input
    pub sensitivity: DMatrix<f64>,
    /// Covariance of the inputs
    pub covariance: DMatrix<f64>,
}

impl NoiseSource {
    pub fn new(kind: NoiseKind, sensitivity: DMatrix<f64>, covariance: DMatrix<f64>) -> Self {
        Self {
            kind,
            sensitivity,
            covariance,
        }
    }
}

/// Which noise sources are propagated into the output covariance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationSettings {
    pub readings_rssi_standard_deviation: bool,
    pub path_loss_exponent_standard_deviation: bool,
    pub fingerprint_position_covariance: bool,
    pub radio_source_position_covariance: bool,
    pub initial_position_covariance: bool,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            readings_rssi_standard_deviation: true,
            path_loss_exponent_standard_deviation: true,
            fingerprint_position_covariance: true,
            radio_source_position_covariance: true,
            initial_position_covariance: true,
        }
    }
}

impl PropagationSettings {
    /// Only the solver's own covariance.
    pub fn none() -> Self {
        Self {
            readings_rssi_standard_deviation: false,
            path_loss_exponent_standard_deviation: false,
            fingerprint_position_covariance: false,
            radio_source_position_covariance: false,
            initial_position_covariance: false,
        }
    }

    pub fn is_enabled(&self, kind: NoiseKind) -> bool {
        match kind {
            NoiseKind::ReadingRssi => self.readings_rssi_standard_deviation,
            NoiseKind::PathLossExponent => self.path_loss_exponent_standard_deviation,
            NoiseKind::FingerprintPosition => self.fingerprint_position_covariance,
            NoiseKind::RadioSourcePosition => self.radio_source_position_covariance,
            NoiseKind::InitialPosition => self.initial_position_covariance,
        }
    }
}

/// Propagates input noise into the covariance of the device position.
///
/// The device position is expected in the first two parameters of the solution.
pub struct UncertaintyPropagator<'a> {
    solution: &'a Solution,
    /// Rows of (J^T W J)^-1 J^T W for the position parameters
    position_gain: DMatrix<f64>,
}

impl<'a> UncertaintyPropagator<'a> {
    pub fn new(solution: &'a Solution) -> Self {
        let weighted_jt = {
            let mut jt = solution.jacobian.transpose();
            for (j, mut column) in jt.column_iter_mut().enumerate() {
                column *= solution.weights[j];
            }
            jt
        };
        let position_gain = solution.covariance.rows(0, 2) * weighted_jt;
        Self {
            solution,
            position_gain,
        }
    }

    /// Position covariance due to one noise source.
    pub fn contribution(&self, source: &NoiseSource) -> Matrix2<f64> {
        let sensitivity = &self.position_gain * &source.sensitivity;
        let propagated = &sensitivity * &source.covariance * sensitivity.transpose();
        Matrix2::new(
            propagated[(0, 0)],
            propagated[(0, 1)],
            propagated[(1, 0)],
            propagated[(1, 1)],
        )
    }

    /// Solver covariance of the position block.
    pub fn intrinsic(&self) -> Matrix2<f64> {
        let c = &self.solution.covariance;
        Matrix2::new(c[(0, 0)], c[(0, 1)], c[(1, 0)], c[(1, 1)])
    }

    /// Total position covariance: solver covariance plus every enabled noise source.
    ///
    /// # Returns
    /// * `Ok(covariance)` symmetric positive-definite
    /// * `Err(NonPositiveDefiniteCovariance)` otherwise
    pub fn position_covariance(
        &self,
        sources: &[NoiseSource],
        settings: &PropagationSettings,
    ) -> Result<Matrix2<f64>> {
        let mut total = self.intrinsic();
        for source in sources.iter().filter(|s| settings.is_enabled(s.kind)) {
            let contribution = self.contribution(source);
            debug!(kind = ?source.kind, trace = contribution.trace(), "Propagated noise source");
            total += contribution;
        }

        let total = (total + total.transpose()) * 0.5;
        if total.iter().any(|v| !v.is_finite()) || total.cholesky().is_none() {
            return Err(Error::NonPositiveDefiniteCovariance);
        }
        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na::DVector;

    /// Direct observation of both parameters: r = o - x, unit weights.
    fn direct_solution(covariance: DMatrix<f64>) -> Solution {
        Solution {
            parameters: DVector::from_vec(vec![1.0, 2.0]),
            covariance,
            jacobian: -DMatrix::identity(2, 2),
            residuals: DVector::zeros(2),
            weights: DVector::from_element(2, 1.0),
            chi_square: 0.0,
            iterations: 1,
            converged: true,
        }
    }

    fn observation_noise() -> NoiseSource {
        NoiseSource::new(
            NoiseKind::ReadingRssi,
            DMatrix::identity(2, 2),
            DMatrix::from_diagonal(&DVector::from_vec(vec![4.0, 9.0])),
        )
    }

    #[test]
    fn test_contribution_of_direct_observation() {
        let solution = direct_solution(DMatrix::identity(2, 2));
        let propagator = UncertaintyPropagator::new(&solution);

        let contribution = propagator.contribution(&observation_noise());
        assert!((contribution - Matrix2::new(4.0, 0.0, 0.0, 9.0)).norm() < 1e-12);

        let total = propagator
            .position_covariance(&[observation_noise()], &PropagationSettings::default())
            .unwrap();
        assert!((total - Matrix2::new(5.0, 0.0, 0.0, 10.0)).norm() < 1e-12);
    }

    #[test]
    fn test_disabled_sources_are_skipped() {
        let solution = direct_solution(DMatrix::identity(2, 2));
        let propagator = UncertaintyPropagator::new(&solution);
        let sources = vec![observation_noise()];

        let without = propagator
            .position_covariance(&sources, &PropagationSettings::none())
            .unwrap();
        let with = propagator
            .position_covariance(&sources, &PropagationSettings::default())
            .unwrap();
        assert_eq!(without, Matrix2::identity());
        assert!(with.trace() >= without.trace());
    }

    #[test]
    fn test_correlated_inputs() {
        // One input shared by both residuals moves both parameters together
        let solution = direct_solution(DMatrix::identity(2, 2));
        let propagator = UncertaintyPropagator::new(&solution);
        let shared = NoiseSource::new(
            NoiseKind::InitialPosition,
            DMatrix::from_element(2, 1, 1.0),
            DMatrix::from_element(1, 1, 2.0),
        );
        let contribution = propagator.contribution(&shared);
        assert!((contribution - Matrix2::from_element(2.0)).norm() < 1e-12);
    }

    #[test]
    fn test_non_positive_definite_output() {
        let solution = direct_solution(-DMatrix::identity(2, 2));
        let propagator = UncertaintyPropagator::new(&solution);
        assert_eq!(
            propagator
                .position_covariance(&[], &PropagationSettings::default())
                .unwrap_err(),
            Error::NonPositiveDefiniteCovariance
        );
    }

    #[test]
    fn test_settings_toggle_by_kind() {
        let mut settings = PropagationSettings::none();
        assert!(!settings.is_enabled(NoiseKind::FingerprintPosition));
        settings.fingerprint_position_covariance = true;
        assert!(settings.is_enabled(NoiseKind::FingerprintPosition));
        assert!(!settings.is_enabled(NoiseKind::RadioSourcePosition));
        assert!(PropagationSettings::default().is_enabled(NoiseKind::InitialPosition));
    }
}
