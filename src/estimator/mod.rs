// Fingerprint position estimators
//
// Both variants share the same life cycle:
//   NotReady -> Ready -> Locked -> Estimated | Failed
// A listener is notified at the start and at the end of every estimation and
// may read the estimator, but every mutation attempted while locked fails.

mod joint;
mod model;
mod position;

pub use joint::PositionAndRadioSourceEstimator;
pub use position::PositionEstimator;

use std::sync::Arc;

use nalgebra as na;
use na::{Matrix2, Point2};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_MIN_NEAREST_FINGERPRINTS, DEFAULT_PATH_LOSS_EXPONENT,
    FALLBACK_RSSI_STANDARD_DEVIATION, SOLVER_MAX_ITERATIONS,
};
use crate::error::{Error, Result};
use crate::nearest::NearestFingerprintFinder;
use crate::radio::{validate_covariance, Fingerprint, LocatedFingerprint, LocatedRadioSource};
use crate::solver::LevenbergMarquardt;
use crate::uncertainty::{PropagationSettings, UncertaintyPropagator};

use model::{FingerprintModel, ModelOptions, ModelSettings};

/// Estimation life-cycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateEvent {
    Start,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatorState {
    /// A required input is missing
    NotReady,
    Ready,
    /// An estimation is running
    Locked,
    /// Last estimation succeeded
    Estimated,
    /// Last estimation failed
    Failed,
}

/// Callback invoked with the estimator itself at start and end of `estimate()`.
pub type EstimateListener<E> = Box<dyn FnMut(&mut E, EstimateEvent) + Send>;

/// Outcome of a successful estimation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimationResult {
    pub position: Point2<f64>,
    /// Position covariance (m^2)
    pub covariance: Matrix2<f64>,
    /// Weighted sum of squared residuals; only reported when emitters are refined
    pub chi_square: Option<f64>,
    /// Refined emitters; empty for the position-only estimator
    pub located_sources: Vec<LocatedRadioSource>,
    /// Size of the working set the estimate was computed from
    pub nearest_fingerprints: usize,
    pub iterations: usize,
    pub converged: bool,
}

/// Inputs, settings and last outcome shared by the estimator variants.
pub struct EstimatorBase<E> {
    located_fingerprints: Option<Arc<Vec<LocatedFingerprint>>>,
    fingerprint: Option<Arc<Fingerprint>>,
    sources: Option<Arc<Vec<LocatedRadioSource>>>,

    min_nearest_fingerprints: usize,
    max_nearest_fingerprints: Option<usize>,
    path_loss_exponent: f64,
    use_sources_path_loss_exponent_when_available: bool,
    use_no_mean_nearest_fingerprint_finder: bool,
    mean_effect_removed_from_readings: bool,
    fallback_rssi_standard_deviation: f64,
    propagation: PropagationSettings,
    initial_position: Option<Point2<f64>>,
    initial_position_covariance: Option<Matrix2<f64>>,
    max_iterations: usize,
    fail_on_non_convergence: bool,

    listener: Option<EstimateListener<E>>,
    state: EstimatorState,
    nearest_fingerprints: Vec<LocatedFingerprint>,
    result: Option<EstimationResult>,
}

impl<E> Default for EstimatorBase<E> {
    fn default() -> Self {
        Self {
            located_fingerprints: None,
            fingerprint: None,
            sources: None,
            min_nearest_fingerprints: DEFAULT_MIN_NEAREST_FINGERPRINTS,
            max_nearest_fingerprints: None,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            use_sources_path_loss_exponent_when_available: true,
            use_no_mean_nearest_fingerprint_finder: true,
            mean_effect_removed_from_readings: false,
            fallback_rssi_standard_deviation: FALLBACK_RSSI_STANDARD_DEVIATION,
            propagation: PropagationSettings::default(),
            initial_position: None,
            initial_position_covariance: None,
            max_iterations: SOLVER_MAX_ITERATIONS,
            fail_on_non_convergence: false,
            listener: None,
            state: EstimatorState::NotReady,
            nearest_fingerprints: Vec::new(),
            result: None,
        }
    }
}

impl<E> EstimatorBase<E> {
    fn with_data(
        located_fingerprints: impl Into<Arc<Vec<LocatedFingerprint>>>,
        fingerprint: impl Into<Arc<Fingerprint>>,
        sources: impl Into<Arc<Vec<LocatedRadioSource>>>,
    ) -> Result<Self> {
        let mut base = Self::default();
        base.located_fingerprints = Some(non_empty(located_fingerprints.into(), "located fingerprints")?);
        base.fingerprint = Some(fingerprint.into());
        base.sources = Some(non_empty(sources.into(), "radio sources")?);
        base.refresh_state();
        Ok(base)
    }

    fn is_ready(&self) -> bool {
        self.located_fingerprints.as_ref().is_some_and(|f| !f.is_empty())
            && self.fingerprint.is_some()
            && self.sources.as_ref().is_some_and(|s| !s.is_empty())
    }

    fn ensure_unlocked(&self) -> Result<()> {
        if self.state == EstimatorState::Locked {
            return Err(Error::Locked);
        }
        Ok(())
    }

    /// Re-derive readiness after a mutation.
    fn refresh_state(&mut self) {
        if self.state != EstimatorState::Locked {
            self.state = if self.is_ready() {
                EstimatorState::Ready
            } else {
                EstimatorState::NotReady
            };
        }
    }

    fn model_settings(&self) -> ModelSettings {
        ModelSettings {
            path_loss_exponent: self.path_loss_exponent,
            use_sources_path_loss_exponent: self.use_sources_path_loss_exponent_when_available,
            mean_removed: self.mean_effect_removed_from_readings,
            fallback_rssi_standard_deviation: self.fallback_rssi_standard_deviation,
            initial_position: self.initial_position,
            initial_position_covariance: self.initial_position_covariance,
        }
    }

    /// Rank the radio map and grow the working set until the model can be solved.
    ///
    /// Returns the outcome together with the last working set tried.
    fn compute(&self, options: &ModelOptions) -> (Result<EstimationResult>, Vec<LocatedFingerprint>) {
        let (Some(located), Some(query), Some(sources)) =
            (&self.located_fingerprints, &self.fingerprint, &self.sources)
        else {
            return (Err(Error::NotReady), Vec::new());
        };

        let finder = NearestFingerprintFinder::new(located, self.use_no_mean_nearest_fingerprint_finder);
        let ranked = match finder.rank(query) {
            Ok(ranked) => ranked,
            Err(e) => return (Err(e), Vec::new()),
        };

        let max = self
            .max_nearest_fingerprints
            .map_or(ranked.len(), |max| max.min(ranked.len()));
        let min = self.min_nearest_fingerprints.min(max);
        let settings = self.model_settings();

        let mut last_error = Error::NearestFingerprintNotFound;
        let mut tried = 0;
        for k in min..=max {
            tried = k;
            let working: Vec<&LocatedFingerprint> =
                ranked[..k].iter().map(|r| r.fingerprint).collect();
            match self.solve_working_set(query, &working, sources, &settings, options) {
                Ok(result) => {
                    let nearest = working.into_iter().cloned().collect();
                    return (Ok(result), nearest);
                }
                Err(e @ (Error::NotEnoughReadings { .. } | Error::SingularNormalEquations)) => {
                    debug!(nearest = k, error = %e, "Working set unsolvable, growing");
                    last_error = e;
                }
                Err(e) => {
                    let nearest = working.into_iter().cloned().collect();
                    return (Err(e), nearest);
                }
            }
        }

        let nearest = ranked[..tried].iter().map(|r| r.fingerprint.clone()).collect();
        (Err(last_error), nearest)
    }

    fn solve_working_set(
        &self,
        query: &Fingerprint,
        working: &[&LocatedFingerprint],
        sources: &[LocatedRadioSource],
        settings: &ModelSettings,
        options: &ModelOptions,
    ) -> Result<EstimationResult> {
        let model = FingerprintModel::build(query, working, sources, settings, options)?;
        let mut solver = LevenbergMarquardt::new().with_max_iterations(self.max_iterations);
        let solution = solver.solve(&model, &model.initial_parameters())?;

        if !solution.converged {
            if self.fail_on_non_convergence {
                return Err(Error::NotConverged {
                    iterations: solution.iterations,
                });
            }
            warn!(
                iterations = solution.iterations,
                "Iteration cap reached, keeping best-effort estimate"
            );
        }

        let noise = model.noise_sources(&solution.parameters);
        let covariance =
            UncertaintyPropagator::new(&solution).position_covariance(&noise, &self.propagation)?;

        Ok(EstimationResult {
            position: model.device_position(&solution.parameters),
            covariance,
            chi_square: options.estimate_sources.then_some(solution.chi_square),
            located_sources: model.refined_sources(&solution),
            nearest_fingerprints: working.len(),
            iterations: solution.iterations,
            converged: solution.converged,
        })
    }
}

fn non_empty<T>(items: Arc<Vec<T>>, what: &str) -> Result<Arc<Vec<T>>> {
    if items.is_empty() {
        return Err(Error::InvalidArgument(format!("{} must not be empty", what)));
    }
    Ok(items)
}

/// Shared setters, readers and life cycle of the fingerprint estimators.
///
/// Every setter fails with [`Error::Locked`] while an estimation is running and
/// leaves the estimator untouched on any error.
pub trait FingerprintEstimator: Sized {
    fn base(&self) -> &EstimatorBase<Self>;
    fn base_mut(&mut self) -> &mut EstimatorBase<Self>;

    /// Run an estimation with the current inputs.
    fn estimate(&mut self) -> Result<EstimationResult>;

    fn state(&self) -> EstimatorState {
        self.base().state
    }

    fn is_locked(&self) -> bool {
        self.base().state == EstimatorState::Locked
    }

    fn is_ready(&self) -> bool {
        self.base().is_ready()
    }

    fn located_fingerprints(&self) -> Option<&[LocatedFingerprint]> {
        self.base().located_fingerprints.as_deref().map(Vec::as_slice)
    }

    fn fingerprint(&self) -> Option<&Fingerprint> {
        self.base().fingerprint.as_deref()
    }

    fn sources(&self) -> Option<&[LocatedRadioSource]> {
        self.base().sources.as_deref().map(Vec::as_slice)
    }

    fn min_nearest_fingerprints(&self) -> usize {
        self.base().min_nearest_fingerprints
    }

    /// `None` means unbounded.
    fn max_nearest_fingerprints(&self) -> Option<usize> {
        self.base().max_nearest_fingerprints
    }

    fn path_loss_exponent(&self) -> f64 {
        self.base().path_loss_exponent
    }

    fn use_sources_path_loss_exponent_when_available(&self) -> bool {
        self.base().use_sources_path_loss_exponent_when_available
    }

    fn use_no_mean_nearest_fingerprint_finder(&self) -> bool {
        self.base().use_no_mean_nearest_fingerprint_finder
    }

    fn is_mean_effect_removed_from_readings(&self) -> bool {
        self.base().mean_effect_removed_from_readings
    }

    fn fallback_rssi_standard_deviation(&self) -> f64 {
        self.base().fallback_rssi_standard_deviation
    }

    fn propagation_settings(&self) -> PropagationSettings {
        self.base().propagation
    }

    fn initial_position(&self) -> Option<Point2<f64>> {
        self.base().initial_position
    }

    fn initial_position_covariance(&self) -> Option<Matrix2<f64>> {
        self.base().initial_position_covariance
    }

    fn max_iterations(&self) -> usize {
        self.base().max_iterations
    }

    fn fail_on_non_convergence(&self) -> bool {
        self.base().fail_on_non_convergence
    }

    /// Working set of the last estimation.
    fn nearest_fingerprints(&self) -> &[LocatedFingerprint] {
        &self.base().nearest_fingerprints
    }

    fn result(&self) -> Option<&EstimationResult> {
        self.base().result.as_ref()
    }

    fn estimated_position(&self) -> Option<Point2<f64>> {
        self.result().map(|r| r.position)
    }

    fn estimated_position_covariance(&self) -> Option<Matrix2<f64>> {
        self.result().map(|r| r.covariance)
    }

    fn set_located_fingerprints(
        &mut self,
        fingerprints: impl Into<Arc<Vec<LocatedFingerprint>>>,
    ) -> Result<()> {
        self.base().ensure_unlocked()?;
        let fingerprints = non_empty(fingerprints.into(), "located fingerprints")?;
        let base = self.base_mut();
        base.located_fingerprints = Some(fingerprints);
        base.refresh_state();
        Ok(())
    }

    fn set_fingerprint(&mut self, fingerprint: impl Into<Arc<Fingerprint>>) -> Result<()> {
        self.base().ensure_unlocked()?;
        let base = self.base_mut();
        base.fingerprint = Some(fingerprint.into());
        base.refresh_state();
        Ok(())
    }

    fn set_sources(&mut self, sources: impl Into<Arc<Vec<LocatedRadioSource>>>) -> Result<()> {
        self.base().ensure_unlocked()?;
        let sources = non_empty(sources.into(), "radio sources")?;
        let base = self.base_mut();
        base.sources = Some(sources);
        base.refresh_state();
        Ok(())
    }

    /// Bounds on the working-set size; `max = None` leaves it unbounded.
    ///
    /// Requires `1 <= min <= max`.
    fn set_min_max_nearest_fingerprints(&mut self, min: usize, max: Option<usize>) -> Result<()> {
        self.base().ensure_unlocked()?;
        if min == 0 {
            return Err(Error::InvalidArgument(
                "minimum nearest fingerprints must be positive".to_string(),
            ));
        }
        if let Some(max) = max {
            if max < min {
                return Err(Error::InvalidArgument(format!(
                    "maximum nearest fingerprints {} is below minimum {}",
                    max, min
                )));
            }
        }
        let base = self.base_mut();
        base.min_nearest_fingerprints = min;
        base.max_nearest_fingerprints = max;
        Ok(())
    }

    fn set_path_loss_exponent(&mut self, path_loss_exponent: f64) -> Result<()> {
        self.base().ensure_unlocked()?;
        if !(path_loss_exponent.is_finite() && path_loss_exponent > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "path-loss exponent must be positive, got {}",
                path_loss_exponent
            )));
        }
        self.base_mut().path_loss_exponent = path_loss_exponent;
        Ok(())
    }

    fn set_use_sources_path_loss_exponent_when_available(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().use_sources_path_loss_exponent_when_available = enabled;
        Ok(())
    }

    fn set_use_no_mean_nearest_fingerprint_finder(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().use_no_mean_nearest_fingerprint_finder = enabled;
        Ok(())
    }

    fn set_mean_effect_removed_from_readings(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().mean_effect_removed_from_readings = enabled;
        Ok(())
    }

    /// RSSI standard deviation assumed for readings that carry none (dB).
    fn set_fallback_rssi_standard_deviation(&mut self, std: f64) -> Result<()> {
        self.base().ensure_unlocked()?;
        if !(std.is_finite() && std > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "fallback RSSI standard deviation must be positive, got {}",
                std
            )));
        }
        self.base_mut().fallback_rssi_standard_deviation = std;
        Ok(())
    }

    fn set_propagation_settings(&mut self, settings: PropagationSettings) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation = settings;
        Ok(())
    }

    fn set_fingerprint_readings_rssi_standard_deviation_propagated(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation.readings_rssi_standard_deviation = enabled;
        Ok(())
    }

    fn set_path_loss_exponent_standard_deviation_propagated(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation.path_loss_exponent_standard_deviation = enabled;
        Ok(())
    }

    fn set_fingerprint_position_covariance_propagated(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation.fingerprint_position_covariance = enabled;
        Ok(())
    }

    fn set_radio_source_position_covariance_propagated(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation.radio_source_position_covariance = enabled;
        Ok(())
    }

    fn set_initial_position_covariance_propagated(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().propagation.initial_position_covariance = enabled;
        Ok(())
    }

    /// Starting point of the solver; the working-set centroid when `None`.
    fn set_initial_position(&mut self, position: Option<Point2<f64>>) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().initial_position = position;
        Ok(())
    }

    /// Covariance of the initial position; when set together with the initial
    /// position, the latter also enters the fit as a prior.
    fn set_initial_position_covariance(&mut self, covariance: Option<Matrix2<f64>>) -> Result<()> {
        self.base().ensure_unlocked()?;
        if let Some(covariance) = &covariance {
            validate_covariance(covariance)?;
        }
        self.base_mut().initial_position_covariance = covariance;
        Ok(())
    }

    fn set_max_iterations(&mut self, max_iterations: usize) -> Result<()> {
        self.base().ensure_unlocked()?;
        if max_iterations == 0 {
            return Err(Error::InvalidArgument(
                "maximum iterations must be positive".to_string(),
            ));
        }
        self.base_mut().max_iterations = max_iterations;
        Ok(())
    }

    /// Turn an exhausted iteration cap into [`Error::NotConverged`] instead of a warning.
    fn set_fail_on_non_convergence(&mut self, enabled: bool) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().fail_on_non_convergence = enabled;
        Ok(())
    }

    fn set_listener(&mut self, listener: Option<EstimateListener<Self>>) -> Result<()> {
        self.base().ensure_unlocked()?;
        self.base_mut().listener = listener;
        Ok(())
    }
}

/// Life cycle of `estimate()` shared by both variants.
fn run_estimation<E: FingerprintEstimator>(
    estimator: &mut E,
    options: ModelOptions,
) -> Result<EstimationResult> {
    estimator.base().ensure_unlocked()?;
    if !estimator.base().is_ready() {
        return Err(Error::NotReady);
    }

    estimator.base_mut().state = EstimatorState::Locked;
    let mut listener = estimator.base_mut().listener.take();
    if let Some(listener) = listener.as_mut() {
        listener(&mut *estimator, EstimateEvent::Start);
    }

    let (outcome, nearest) = estimator.base().compute(&options);
    {
        let base = estimator.base_mut();
        base.nearest_fingerprints = nearest;
        base.result = outcome.as_ref().ok().cloned();
    }

    if let Some(listener) = listener.as_mut() {
        listener(&mut *estimator, EstimateEvent::End);
    }

    let base = estimator.base_mut();
    base.listener = listener;
    base.state = if outcome.is_ok() {
        EstimatorState::Estimated
    } else {
        EstimatorState::Failed
    };

    match &outcome {
        Ok(result) => debug!(
            x = result.position.x,
            y = result.position.y,
            nearest = result.nearest_fingerprints,
            iterations = result.iterations,
            "Estimated position"
        ),
        Err(e) => debug!(error = %e, "Estimation failed"),
    }
    outcome
}
