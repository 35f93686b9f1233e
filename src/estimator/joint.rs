// Joint estimation of the device position and the emitters it hears

use std::sync::Arc;

use crate::error::Result;
use crate::radio::{Fingerprint, LocatedFingerprint, LocatedRadioSource};

use super::model::ModelOptions;
use super::{run_estimation, EstimateListener, EstimationResult, EstimatorBase, FingerprintEstimator};

/// Estimates the device position while refining the position (and optionally
/// the path-loss exponent) of every emitter shared with the working set.
///
/// Known emitters anchor the refinement through prior residuals weighted by
/// their position covariance and exponent standard deviation.
pub struct PositionAndRadioSourceEstimator {
    base: EstimatorBase<PositionAndRadioSourceEstimator>,
    initial_sources: Option<Arc<Vec<LocatedRadioSource>>>,
    path_loss_estimation_enabled: bool,
}

impl Default for PositionAndRadioSourceEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionAndRadioSourceEstimator {
    pub fn new() -> Self {
        Self {
            base: EstimatorBase::default(),
            initial_sources: None,
            path_loss_estimation_enabled: false,
        }
    }

    pub fn with_data(
        located_fingerprints: impl Into<Arc<Vec<LocatedFingerprint>>>,
        fingerprint: impl Into<Arc<Fingerprint>>,
        sources: impl Into<Arc<Vec<LocatedRadioSource>>>,
    ) -> Result<Self> {
        Ok(Self {
            base: EstimatorBase::with_data(located_fingerprints, fingerprint, sources)?,
            initial_sources: None,
            path_loss_estimation_enabled: false,
        })
    }

    pub fn with_listener(mut self, listener: EstimateListener<Self>) -> Self {
        self.base.listener = Some(listener);
        self
    }

    /// Starting values for the refined emitters; the known emitters when `None`.
    pub fn initial_located_sources(&self) -> Option<&[LocatedRadioSource]> {
        self.initial_sources.as_deref().map(Vec::as_slice)
    }

    pub fn set_initial_located_sources(
        &mut self,
        sources: Option<Vec<LocatedRadioSource>>,
    ) -> Result<()> {
        self.base.ensure_unlocked()?;
        self.initial_sources = sources.map(Arc::new);
        Ok(())
    }

    pub fn is_path_loss_estimation_enabled(&self) -> bool {
        self.path_loss_estimation_enabled
    }

    /// Also estimate one path-loss exponent per emitter.
    pub fn set_path_loss_estimation_enabled(&mut self, enabled: bool) -> Result<()> {
        self.base.ensure_unlocked()?;
        self.path_loss_estimation_enabled = enabled;
        Ok(())
    }

    /// Emitters refined by the last successful estimation.
    pub fn estimated_located_sources(&self) -> &[LocatedRadioSource] {
        self.result()
            .map(|r| r.located_sources.as_slice())
            .unwrap_or(&[])
    }

    pub fn chi_square(&self) -> Option<f64> {
        self.result().and_then(|r| r.chi_square)
    }
}

impl FingerprintEstimator for PositionAndRadioSourceEstimator {
    fn base(&self) -> &EstimatorBase<Self> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EstimatorBase<Self> {
        &mut self.base
    }

    fn estimate(&mut self) -> Result<EstimationResult> {
        let options = ModelOptions {
            estimate_sources: true,
            path_loss_estimation: self.path_loss_estimation_enabled,
            initial_sources: self.initial_sources.clone(),
        };
        run_estimation(self, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::estimator::{EstimateEvent, EstimatorState};
    use crate::simulation::{SceneConfig, SyntheticScene};
    use crate::uncertainty::PropagationSettings;
    use nalgebra::{Matrix2, Point2, Vector2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Mutex;

    fn scene() -> SyntheticScene {
        SyntheticScene::generate(&SceneConfig::default()).unwrap()
    }

    fn estimator_at(
        scene: &SyntheticScene,
        truth: &Point2<f64>,
        bias: f64,
    ) -> PositionAndRadioSourceEstimator {
        PositionAndRadioSourceEstimator::with_data(
            scene.radio_map.clone(),
            scene.fingerprint_at(truth, bias).unwrap(),
            scene.sources.clone(),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let estimator = PositionAndRadioSourceEstimator::new();
        assert_eq!(estimator.path_loss_exponent(), 2.0);
        assert_eq!(estimator.min_nearest_fingerprints(), 1);
        assert_eq!(estimator.max_nearest_fingerprints(), None);
        assert!(!estimator.is_ready());
        assert!(!estimator.is_locked());
        assert!(!estimator.is_path_loss_estimation_enabled());
        assert!(estimator.initial_located_sources().is_none());
        assert!(estimator.estimated_located_sources().is_empty());
        assert!(estimator.chi_square().is_none());
        assert_eq!(estimator.propagation_settings(), PropagationSettings::default());
    }

    #[test]
    fn test_constructor_validation() {
        let scene = scene();
        let query = scene.fingerprint_at(&Point2::new(2.0, 2.0), 0.0).unwrap();
        assert!(PositionAndRadioSourceEstimator::with_data(
            scene.radio_map.clone(),
            query.clone(),
            scene.sources.clone()
        )
        .unwrap()
        .is_ready());
        assert!(matches!(
            PositionAndRadioSourceEstimator::with_data(
                scene.radio_map.clone(),
                query,
                Vec::<LocatedRadioSource>::new(),
            )
            .err(),
            Some(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_round_trip_all_mean_removal_modes() {
        let scene = scene();
        let truth = Point2::new(3.7, 6.2);

        for finder_mean in [false, true] {
            for readings_mean in [false, true] {
                let mut estimator = estimator_at(&scene, &truth, 0.0);
                estimator.set_use_no_mean_nearest_fingerprint_finder(finder_mean).unwrap();
                estimator.set_mean_effect_removed_from_readings(readings_mean).unwrap();
                estimator.set_min_max_nearest_fingerprints(3, None).unwrap();

                let result = estimator.estimate().unwrap();
                assert!(
                    (result.position - truth).norm() < 1e-3,
                    "finder {} readings {} -> {:?}",
                    finder_mean,
                    readings_mean,
                    result.position
                );

                // Exact data leaves the emitters where they are
                assert_eq!(result.located_sources.len(), scene.sources.len());
                for refined in &result.located_sources {
                    let known = scene
                        .sources
                        .iter()
                        .find(|s| s.source() == refined.source())
                        .unwrap();
                    assert!((refined.position() - known.position()).norm() < 1e-3);
                    assert!(refined.position_covariance().is_some());
                }
                assert!(result.chi_square.unwrap() < 1e-6);
            }
        }
    }

    #[test]
    fn test_refines_displaced_seeds() {
        let scene = scene();
        let truth = Point2::new(6.1, 4.4);
        let mut estimator = estimator_at(&scene, &truth, 0.0);
        estimator.set_min_max_nearest_fingerprints(5, None).unwrap();

        let seeds: Vec<LocatedRadioSource> = scene
            .sources
            .iter()
            .map(|s| s.refined(s.position() + Vector2::new(0.8, -0.6), None, None))
            .collect();
        estimator.set_initial_located_sources(Some(seeds)).unwrap();

        let result = estimator.estimate().unwrap();
        assert!(result.converged);
        assert!((result.position - truth).norm() < 1e-3);
        for (refined, known) in result.located_sources.iter().zip(&scene.sources) {
            assert!((refined.position() - known.position()).norm() < 1e-3);
        }
    }

    #[test]
    fn test_path_loss_estimation() {
        let config = SceneConfig {
            path_loss_exponent_standard_deviation: Some(0.2),
            ..SceneConfig::default()
        };
        let scene = SyntheticScene::generate(&config).unwrap();
        let truth = Point2::new(4.9, 3.1);
        let mut estimator = estimator_at(&scene, &truth, 0.0);
        estimator.set_path_loss_estimation_enabled(true).unwrap();
        estimator.set_min_max_nearest_fingerprints(4, None).unwrap();

        let result = estimator.estimate().unwrap();
        assert!((result.position - truth).norm() < 1e-3);
        for refined in &result.located_sources {
            let exponent = refined.path_loss_exponent().unwrap();
            assert!((exponent - 2.0).abs() < 1e-3, "exponent = {}", exponent);
        }
    }

    #[test]
    fn test_bias_robustness() {
        let scene = scene();
        let truths = [Point2::new(2.6, 7.3), Point2::new(7.9, 5.4), Point2::new(5.1, 1.7)];
        let bias = 6.0;

        let mut centred_error = 0.0;
        let mut raw_error = 0.0;
        for truth in &truths {
            for readings_mean in [false, true] {
                let mut estimator = estimator_at(&scene, truth, bias);
                estimator.set_min_max_nearest_fingerprints(3, None).unwrap();
                estimator.set_mean_effect_removed_from_readings(readings_mean).unwrap();
                let error = (estimator.estimate().unwrap().position - truth).norm();
                if readings_mean {
                    centred_error += error;
                } else {
                    raw_error += error;
                }
            }
        }
        assert!(centred_error < raw_error);
    }

    #[test]
    fn test_covariance_monotonicity() {
        let config = SceneConfig {
            rssi_standard_deviation: 0.5,
            fingerprint_position_standard_deviation: Some(0.3),
            source_position_standard_deviation: Some(1.0),
            path_loss_exponent_standard_deviation: Some(0.1),
            seed: 11,
            ..SceneConfig::default()
        };
        let scene = SyntheticScene::generate(&config).unwrap();
        let truth = Point2::new(4.6, 5.3);
        let mut rng = StdRng::seed_from_u64(3);
        let query = scene.noisy_fingerprint_at(&truth, 0.0, &mut rng).unwrap();

        for path_loss_estimation in [false, true] {
            let run = |settings: PropagationSettings| {
                let mut estimator = PositionAndRadioSourceEstimator::with_data(
                    scene.radio_map.clone(),
                    query.clone(),
                    scene.sources.clone(),
                )
                .unwrap();
                estimator.set_min_max_nearest_fingerprints(4, Some(4)).unwrap();
                estimator
                    .set_path_loss_estimation_enabled(path_loss_estimation)
                    .unwrap();
                estimator.set_initial_position(Some(Point2::new(4.5, 5.5))).unwrap();
                estimator
                    .set_initial_position_covariance(Some(Matrix2::identity() * 4.0))
                    .unwrap();
                estimator.set_propagation_settings(settings).unwrap();
                estimator.estimate().unwrap()
            };

            let none = run(PropagationSettings::none());
            let all = run(PropagationSettings::default());
            assert!((none.position - all.position).norm() < 1e-12);
            assert!(all.covariance.trace() >= none.covariance.trace());

            let toggles: [fn(&mut PropagationSettings); 5] = [
                |s| s.readings_rssi_standard_deviation = true,
                |s| s.path_loss_exponent_standard_deviation = true,
                |s| s.fingerprint_position_covariance = true,
                |s| s.radio_source_position_covariance = true,
                |s| s.initial_position_covariance = true,
            ];
            for (i, enable) in toggles.iter().enumerate() {
                let mut settings = PropagationSettings::none();
                enable(&mut settings);
                let one = run(settings);
                assert!((one.position - none.position).norm() < 1e-12);
                assert!(
                    one.covariance.trace() >= none.covariance.trace(),
                    "path-loss estimation {} toggle {} lowered the trace",
                    path_loss_estimation,
                    i
                );
                assert!(all.covariance.trace() >= one.covariance.trace());
                assert!(one.covariance.cholesky().is_some());
            }

            // Emitter anchors add uncertainty whether the exponents are fitted or fixed
            let sources_only = run(PropagationSettings {
                radio_source_position_covariance: true,
                ..PropagationSettings::none()
            });
            let exponents_only = run(PropagationSettings {
                path_loss_exponent_standard_deviation: true,
                ..PropagationSettings::none()
            });
            assert!(sources_only.covariance.trace() > none.covariance.trace());
            assert!(exponents_only.covariance.trace() > none.covariance.trace());
        }
    }

    #[test]
    fn test_listener_and_lock() {
        let scene = scene();
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let mut estimator = estimator_at(&scene, &Point2::new(5.0, 6.0), 0.0).with_listener(
            Box::new(move |estimator: &mut PositionAndRadioSourceEstimator, event: EstimateEvent| {
                let locked = estimator.set_initial_located_sources(None)
                    == Err(Error::Locked)
                    && estimator.set_path_loss_estimation_enabled(true) == Err(Error::Locked)
                    && estimator.set_sources(Vec::<LocatedRadioSource>::new()) == Err(Error::Locked);
                seen.lock().unwrap().push((event, locked));
            }),
        );

        estimator.estimate().unwrap();
        assert_eq!(
            *events.lock().unwrap(),
            vec![(EstimateEvent::Start, true), (EstimateEvent::End, true)]
        );
        assert!(!estimator.is_path_loss_estimation_enabled());
        assert_eq!(estimator.state(), EstimatorState::Estimated);
        assert_eq!(estimator.estimated_located_sources().len(), scene.sources.len());
        assert!(estimator.chi_square().is_some());
    }

    #[test]
    fn test_not_ready() {
        let mut estimator = PositionAndRadioSourceEstimator::new();
        assert_eq!(estimator.estimate().unwrap_err(), Error::NotReady);
        assert_eq!(estimator.state(), EstimatorState::NotReady);
    }
}
