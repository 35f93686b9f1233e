// Fingerprint residual model fitted by both estimators
//
// One residual row per (working-set fingerprint, shared source) pair:
//
//   r = rssi_query - (rssi_fp + 10 n log10(d(fp, source) / d(device, source)))
//
// optionally centred per fingerprint, followed by whitened prior rows for the
// initial position and, when emitters are refined, for each emitter.
//
// Parameter layout: [x, y, (sx, sy, [n]) per refined emitter].

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra as na;
use na::{DMatrix, DVector, Matrix2, Point2, Vector2};

use crate::constants::{
    FALLBACK_PATH_LOSS_EXPONENT_STANDARD_DEVIATION, FALLBACK_SOURCE_POSITION_STANDARD_DEVIATION,
};
use crate::error::{Error, Result};
use crate::pathloss::{predict_from_fingerprint, PredictedRssi};
use crate::radio::{Fingerprint, LocatedFingerprint, LocatedRadioSource, RadioSource, Reading};
use crate::solver::{LeastSquaresProblem, Solution};
use crate::uncertainty::{NoiseKind, NoiseSource};

/// Estimator-wide settings that shape the residual model.
#[derive(Debug, Clone)]
pub(crate) struct ModelSettings {
    pub path_loss_exponent: f64,
    pub use_sources_path_loss_exponent: bool,
    pub mean_removed: bool,
    pub fallback_rssi_standard_deviation: f64,
    pub initial_position: Option<Point2<f64>>,
    pub initial_position_covariance: Option<Matrix2<f64>>,
}

/// What differs between the estimator variants.
#[derive(Debug, Clone, Default)]
pub(crate) struct ModelOptions {
    /// Refine emitter positions together with the device position
    pub estimate_sources: bool,
    /// Also refine one path-loss exponent per emitter (requires `estimate_sources`)
    pub path_loss_estimation: bool,
    /// Starting values for refined emitters
    pub initial_sources: Option<Arc<Vec<LocatedRadioSource>>>,
}

struct Group {
    position: Point2<f64>,
    covariance: Option<Matrix2<f64>>,
    start: usize,
    end: usize,
}

struct Observation {
    term: usize,
    fingerprint_rssi: f64,
    query_rssi: f64,
    fingerprint_variance: f64,
}

struct SourceTerm<'a> {
    located: &'a LocatedRadioSource,
    /// Fixed position, or the starting value when refined
    position: Point2<f64>,
    exponent: f64,
    exponent_std: Option<f64>,
    query_variance: f64,
    position_param: Option<usize>,
    exponent_param: Option<usize>,
}

enum Prior {
    Position {
        param: usize,
        anchor: Point2<f64>,
        whitening: Matrix2<f64>,
        covariance: Matrix2<f64>,
        kind: NoiseKind,
        propagate: bool,
    },
    Exponent {
        param: usize,
        anchor: f64,
        sigma: f64,
        propagate: bool,
    },
}

impl Prior {
    fn rows(&self) -> usize {
        match self {
            Prior::Position { .. } => 2,
            Prior::Exponent { .. } => 1,
        }
    }
}

pub(crate) struct FingerprintModel<'a> {
    groups: Vec<Group>,
    observations: Vec<Observation>,
    terms: Vec<SourceTerm<'a>>,
    priors: Vec<Prior>,
    mean_removed: bool,
    num_parameters: usize,
    initial: DVector<f64>,
}

impl<'a> FingerprintModel<'a> {
    /// Build the model for a query fingerprint and a working set of located fingerprints.
    ///
    /// Readings whose source is unknown, or absent from the query, are skipped.
    /// With mean removal a fingerprint sharing a single source carries no
    /// information and is skipped as well.
    pub(crate) fn build(
        query: &Fingerprint,
        nearest: &[&'a LocatedFingerprint],
        known_sources: &'a [LocatedRadioSource],
        settings: &ModelSettings,
        options: &ModelOptions,
    ) -> Result<Self> {
        let mut index: HashMap<&RadioSource, usize> = HashMap::with_capacity(known_sources.len());
        for (i, located) in known_sources.iter().enumerate() {
            index.entry(located.source()).or_insert(i);
        }

        let variance = |reading: &Reading| {
            let std = reading
                .rssi_standard_deviation()
                .unwrap_or(settings.fallback_rssi_standard_deviation);
            std * std
        };

        let mut terms: Vec<SourceTerm<'a>> = Vec::new();
        let mut term_of: HashMap<usize, usize> = HashMap::new();
        let mut groups = Vec::new();
        let mut observations = Vec::new();

        for fingerprint in nearest {
            let pairs: Vec<(usize, &Reading, &Reading)> = fingerprint
                .readings()
                .iter()
                .filter_map(|reading| {
                    let query_reading = query.reading(reading.source())?;
                    let &k = index.get(reading.source())?;
                    Some((k, reading, query_reading))
                })
                .collect();

            if pairs.is_empty() || (settings.mean_removed && pairs.len() < 2) {
                continue;
            }

            let start = observations.len();
            for (k, reading, query_reading) in pairs {
                let term = *term_of.entry(k).or_insert_with(|| {
                    let located = &known_sources[k];
                    let (exponent, exponent_std) = exponent_for(located, settings);
                    terms.push(SourceTerm {
                        located,
                        position: *located.position(),
                        exponent,
                        exponent_std,
                        query_variance: variance(query_reading),
                        position_param: None,
                        exponent_param: None,
                    });
                    terms.len() - 1
                });
                observations.push(Observation {
                    term,
                    fingerprint_rssi: reading.rssi(),
                    query_rssi: query_reading.rssi(),
                    fingerprint_variance: variance(reading),
                });
            }
            groups.push(Group {
                position: *fingerprint.position(),
                covariance: fingerprint.position_covariance().copied(),
                start,
                end: observations.len(),
            });
        }

        if observations.is_empty() {
            return Err(Error::NotEnoughReadings { rows: 0, unknowns: 2 });
        }

        // Unknowns
        let mut num_parameters = 2;
        if options.estimate_sources {
            for term in terms.iter_mut() {
                term.position_param = Some(num_parameters);
                num_parameters += 2;
                if options.path_loss_estimation {
                    term.exponent_param = Some(num_parameters);
                    num_parameters += 1;
                }
            }
        }

        // Starting point
        let device = settings
            .initial_position
            .unwrap_or_else(|| centroid(nearest));
        let mut initial = DVector::zeros(num_parameters);
        initial[0] = device.x;
        initial[1] = device.y;
        for term in &terms {
            let seed = options.initial_sources.as_ref().and_then(|seeds| {
                seeds
                    .iter()
                    .find(|s| s.source() == term.located.source())
            });
            if let Some(pi) = term.position_param {
                let position = seed.map_or(term.position, |s| *s.position());
                initial[pi] = position.x;
                initial[pi + 1] = position.y;
            }
            if let Some(ei) = term.exponent_param {
                initial[ei] = seed
                    .and_then(|s| s.path_loss_exponent())
                    .unwrap_or(term.exponent);
            }
        }

        // Priors
        let mut priors = Vec::new();
        if let (Some(anchor), Some(covariance)) = (
            settings.initial_position,
            settings.initial_position_covariance,
        ) {
            priors.push(Prior::Position {
                param: 0,
                anchor,
                whitening: whitening(&covariance)?,
                covariance,
                kind: NoiseKind::InitialPosition,
                propagate: true,
            });
        }
        for term in &terms {
            if let Some(pi) = term.position_param {
                let known_covariance = term.located.position_covariance().copied();
                let covariance = known_covariance.unwrap_or_else(|| {
                    Matrix2::identity()
                        * FALLBACK_SOURCE_POSITION_STANDARD_DEVIATION.powi(2)
                });
                priors.push(Prior::Position {
                    param: pi,
                    anchor: term.position,
                    whitening: whitening(&covariance)?,
                    covariance,
                    kind: NoiseKind::RadioSourcePosition,
                    propagate: known_covariance.is_some(),
                });
            }
            if let Some(ei) = term.exponent_param {
                priors.push(Prior::Exponent {
                    param: ei,
                    anchor: term.exponent,
                    sigma: term
                        .exponent_std
                        .filter(|s| *s > 0.0)
                        .unwrap_or(FALLBACK_PATH_LOSS_EXPONENT_STANDARD_DEVIATION),
                    propagate: term.exponent_std.is_some_and(|s| s > 0.0),
                });
            }
        }

        // Centering removes one degree of freedom per fingerprint
        let informative: usize = groups
            .iter()
            .map(|g| g.end - g.start - usize::from(settings.mean_removed))
            .sum::<usize>()
            + priors.iter().map(Prior::rows).sum::<usize>();
        if informative < num_parameters {
            return Err(Error::NotEnoughReadings {
                rows: informative,
                unknowns: num_parameters,
            });
        }

        Ok(Self {
            groups,
            observations,
            terms,
            priors,
            mean_removed: settings.mean_removed,
            num_parameters,
            initial,
        })
    }

    pub(crate) fn initial_parameters(&self) -> DVector<f64> {
        self.initial.clone()
    }

    pub(crate) fn device_position(&self, x: &DVector<f64>) -> Point2<f64> {
        Point2::new(x[0], x[1])
    }

    /// Refined emitters with their solver covariance; empty unless emitters are estimated.
    pub(crate) fn refined_sources(&self, solution: &Solution) -> Vec<LocatedRadioSource> {
        let x = &solution.parameters;
        let c = &solution.covariance;
        self.terms
            .iter()
            .filter_map(|term| {
                let pi = term.position_param?;
                let position = Point2::new(x[pi], x[pi + 1]);
                let covariance = Matrix2::new(
                    c[(pi, pi)],
                    c[(pi, pi + 1)],
                    c[(pi + 1, pi)],
                    c[(pi + 1, pi + 1)],
                );
                let exponent = term.exponent_param.map(|ei| x[ei]);
                Some(term.located.refined(position, Some(covariance), exponent))
            })
            .collect()
    }

    /// Noisy model inputs at `x`, for the uncertainty propagator.
    pub(crate) fn noise_sources(&self, x: &DVector<f64>) -> Vec<NoiseSource> {
        let predictions = self.predictions(x);
        let m = self.num_residuals();
        let mut sources = Vec::new();

        // Reading RSSI: one column per query reading, then one per fingerprint reading
        let n_terms = self.terms.len();
        let n_obs = self.observations.len();
        let mut sensitivity = DMatrix::zeros(m, n_terms + n_obs);
        let mut variances = DVector::zeros(n_terms + n_obs);
        for (t, term) in self.terms.iter().enumerate() {
            variances[t] = term.query_variance;
        }
        for (row, obs) in self.observations.iter().enumerate() {
            sensitivity[(row, obs.term)] = 1.0;
            sensitivity[(row, n_terms + row)] = -1.0;
            variances[n_terms + row] = obs.fingerprint_variance;
        }
        self.center_rows(&mut sensitivity);
        sources.push(NoiseSource::new(
            NoiseKind::ReadingRssi,
            sensitivity,
            DMatrix::from_diagonal(&variances),
        ));

        // Located fingerprint positions
        let located: Vec<&Group> = self.groups.iter().filter(|g| g.covariance.is_some()).collect();
        if !located.is_empty() {
            let mut sensitivity = DMatrix::zeros(m, 2 * located.len());
            let mut covariance = DMatrix::zeros(2 * located.len(), 2 * located.len());
            for (c, group) in located.iter().enumerate() {
                for row in group.start..group.end {
                    let d = predictions[row].d_fingerprint;
                    sensitivity[(row, 2 * c)] = -d.x;
                    sensitivity[(row, 2 * c + 1)] = -d.y;
                }
                if let Some(cov) = group.covariance {
                    covariance.fixed_view_mut::<2, 2>(2 * c, 2 * c).copy_from(&cov);
                }
            }
            self.center_rows(&mut sensitivity);
            sources.push(NoiseSource::new(
                NoiseKind::FingerprintPosition,
                sensitivity,
                covariance,
            ));
        }

        // Fixed emitter positions and exponents
        let fixed_positions: Vec<(usize, Matrix2<f64>)> = self
            .terms
            .iter()
            .enumerate()
            .filter(|(_, term)| term.position_param.is_none())
            .filter_map(|(t, term)| Some((t, *term.located.position_covariance()?)))
            .collect();
        if !fixed_positions.is_empty() {
            let mut sensitivity = DMatrix::zeros(m, 2 * fixed_positions.len());
            let mut covariance = DMatrix::zeros(2 * fixed_positions.len(), 2 * fixed_positions.len());
            for (c, (t, cov)) in fixed_positions.iter().enumerate() {
                for (row, obs) in self.observations.iter().enumerate() {
                    if obs.term == *t {
                        let d = predictions[row].d_source;
                        sensitivity[(row, 2 * c)] = -d.x;
                        sensitivity[(row, 2 * c + 1)] = -d.y;
                    }
                }
                covariance.fixed_view_mut::<2, 2>(2 * c, 2 * c).copy_from(cov);
            }
            self.center_rows(&mut sensitivity);
            sources.push(NoiseSource::new(
                NoiseKind::RadioSourcePosition,
                sensitivity,
                covariance,
            ));
        }

        let fixed_exponents: Vec<(usize, f64)> = self
            .terms
            .iter()
            .enumerate()
            .filter(|(_, term)| term.exponent_param.is_none())
            .filter_map(|(t, term)| Some((t, term.exponent_std?)))
            .collect();
        if !fixed_exponents.is_empty() {
            let mut sensitivity = DMatrix::zeros(m, fixed_exponents.len());
            let mut variances = DVector::zeros(fixed_exponents.len());
            for (c, (t, std)) in fixed_exponents.iter().enumerate() {
                for (row, obs) in self.observations.iter().enumerate() {
                    if obs.term == *t {
                        sensitivity[(row, c)] = -predictions[row].d_exponent;
                    }
                }
                variances[c] = std * std;
            }
            self.center_rows(&mut sensitivity);
            sources.push(NoiseSource::new(
                NoiseKind::PathLossExponent,
                sensitivity,
                DMatrix::from_diagonal(&variances),
            ));
        }

        // Prior anchors: dr/d(anchor) = whitening
        let mut row = n_obs;
        for prior in &self.priors {
            match prior {
                Prior::Position {
                    whitening,
                    covariance,
                    kind,
                    propagate,
                    ..
                } => {
                    if *propagate {
                        let mut sensitivity = DMatrix::zeros(m, 2);
                        sensitivity.fixed_view_mut::<2, 2>(row, 0).copy_from(whitening);
                        let mut cov = DMatrix::zeros(2, 2);
                        cov.copy_from(covariance);
                        sources.push(NoiseSource::new(*kind, sensitivity, cov));
                    }
                }
                Prior::Exponent {
                    sigma, propagate, ..
                } => {
                    if *propagate {
                        let mut sensitivity = DMatrix::zeros(m, 1);
                        sensitivity[(row, 0)] = 1.0 / sigma;
                        sources.push(NoiseSource::new(
                            NoiseKind::PathLossExponent,
                            sensitivity,
                            DMatrix::from_element(1, 1, sigma * sigma),
                        ));
                    }
                }
            }
            row += prior.rows();
        }

        sources
    }

    fn source_state(&self, term: &SourceTerm<'_>, x: &DVector<f64>) -> (Point2<f64>, f64) {
        let position = term
            .position_param
            .map_or(term.position, |pi| Point2::new(x[pi], x[pi + 1]));
        let exponent = term.exponent_param.map_or(term.exponent, |ei| x[ei]);
        (position, exponent)
    }

    fn predictions(&self, x: &DVector<f64>) -> Vec<PredictedRssi> {
        let device = self.device_position(x);
        let mut predictions = Vec::with_capacity(self.observations.len());
        for group in &self.groups {
            for obs in &self.observations[group.start..group.end] {
                let (source, exponent) = self.source_state(&self.terms[obs.term], x);
                predictions.push(predict_from_fingerprint(
                    obs.fingerprint_rssi,
                    &group.position,
                    &device,
                    &source,
                    exponent,
                ));
            }
        }
        predictions
    }

    /// Subtract, per fingerprint, the mean of the observation rows.
    fn center_rows(&self, matrix: &mut DMatrix<f64>) {
        if !self.mean_removed {
            return;
        }
        for group in &self.groups {
            let count = group.end - group.start;
            let mean = matrix.rows(group.start, count).row_mean();
            for row in group.start..group.end {
                let mut r = matrix.row_mut(row);
                r -= &mean;
            }
        }
    }

    fn evaluate(&self, x: &DVector<f64>, with_jacobian: bool) -> (DVector<f64>, Option<DMatrix<f64>>) {
        let m = self.num_residuals();
        let predictions = self.predictions(x);
        let mut residuals = DVector::zeros(m);
        let mut jacobian = with_jacobian.then(|| DMatrix::zeros(m, self.num_parameters));

        for (row, (obs, pred)) in self.observations.iter().zip(&predictions).enumerate() {
            residuals[row] = obs.query_rssi - pred.value;
            if let Some(j) = jacobian.as_mut() {
                let term = &self.terms[obs.term];
                j[(row, 0)] = -pred.d_device.x;
                j[(row, 1)] = -pred.d_device.y;
                if let Some(pi) = term.position_param {
                    j[(row, pi)] = -pred.d_source.x;
                    j[(row, pi + 1)] = -pred.d_source.y;
                }
                if let Some(ei) = term.exponent_param {
                    j[(row, ei)] = -pred.d_exponent;
                }
            }
        }

        if self.mean_removed {
            let mut as_matrix = DMatrix::from_column_slice(m, 1, residuals.as_slice());
            self.center_rows(&mut as_matrix);
            residuals = as_matrix.column(0).into_owned();
            if let Some(j) = jacobian.as_mut() {
                self.center_rows(j);
            }
        }

        let mut row = self.observations.len();
        for prior in &self.priors {
            match prior {
                Prior::Position {
                    param,
                    anchor,
                    whitening,
                    ..
                } => {
                    let value = Vector2::new(x[*param], x[*param + 1]);
                    let r = whitening * (anchor.coords - value);
                    residuals[row] = r.x;
                    residuals[row + 1] = r.y;
                    if let Some(j) = jacobian.as_mut() {
                        j.fixed_view_mut::<2, 2>(row, *param).copy_from(&(-whitening));
                    }
                }
                Prior::Exponent {
                    param,
                    anchor,
                    sigma,
                    ..
                } => {
                    residuals[row] = (anchor - x[*param]) / sigma;
                    if let Some(j) = jacobian.as_mut() {
                        j[(row, *param)] = -1.0 / sigma;
                    }
                }
            }
            row += prior.rows();
        }

        (residuals, jacobian)
    }
}

impl LeastSquaresProblem for FingerprintModel<'_> {
    fn num_parameters(&self) -> usize {
        self.num_parameters
    }

    fn num_residuals(&self) -> usize {
        self.observations.len() + self.priors.iter().map(Prior::rows).sum::<usize>()
    }

    fn residuals(&self, x: &DVector<f64>) -> DVector<f64> {
        self.evaluate(x, false).0
    }

    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64> {
        self.evaluate(x, true)
            .1
            .unwrap_or_else(|| DMatrix::zeros(self.num_residuals(), self.num_parameters))
    }

    fn weights(&self) -> DVector<f64> {
        let mut weights = DVector::from_element(self.num_residuals(), 1.0);
        for (row, obs) in self.observations.iter().enumerate() {
            let query_variance = self.terms[obs.term].query_variance;
            weights[row] = 1.0 / (query_variance + obs.fingerprint_variance);
        }
        weights
    }
}

/// Exponent (and its standard deviation) used for a source.
fn exponent_for(located: &LocatedRadioSource, settings: &ModelSettings) -> (f64, Option<f64>) {
    match located.path_loss_exponent() {
        Some(exponent) if settings.use_sources_path_loss_exponent => {
            (exponent, located.path_loss_exponent_standard_deviation())
        }
        _ => (settings.path_loss_exponent, None),
    }
}

fn centroid(fingerprints: &[&LocatedFingerprint]) -> Point2<f64> {
    if fingerprints.is_empty() {
        return Point2::origin();
    }
    let sum = fingerprints
        .iter()
        .fold(Vector2::zeros(), |acc, f| acc + f.position().coords);
    Point2::from(sum / fingerprints.len() as f64)
}

/// L^-1 for a covariance L L^T.
fn whitening(covariance: &Matrix2<f64>) -> Result<Matrix2<f64>> {
    covariance
        .cholesky()
        .and_then(|c| c.l().try_inverse())
        .ok_or(Error::InvalidCovariance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::{SceneConfig, SyntheticScene};

    fn settings(mean_removed: bool) -> ModelSettings {
        ModelSettings {
            path_loss_exponent: 2.0,
            use_sources_path_loss_exponent: true,
            mean_removed,
            fallback_rssi_standard_deviation: 1.0,
            initial_position: None,
            initial_position_covariance: None,
        }
    }

    fn scene() -> SyntheticScene {
        SyntheticScene::generate(&SceneConfig::default()).unwrap()
    }

    fn numeric_jacobian(model: &FingerprintModel<'_>, x: &DVector<f64>) -> DMatrix<f64> {
        let h = 1e-6;
        let base = model.residuals(x);
        let mut j = DMatrix::zeros(base.len(), x.len());
        for col in 0..x.len() {
            let mut shifted = x.clone();
            shifted[col] += h;
            let plus = model.residuals(&shifted);
            j.set_column(col, &((plus - &base) / h));
        }
        j
    }

    #[test]
    fn test_zero_residual_at_truth() {
        let scene = scene();
        let truth = Point2::new(3.3, 4.1);
        let query = scene.fingerprint_at(&truth, 0.0).unwrap();
        let nearest: Vec<&LocatedFingerprint> = scene.radio_map.iter().take(5).collect();

        for mean_removed in [false, true] {
            let model = FingerprintModel::build(
                &query,
                &nearest,
                &scene.sources,
                &settings(mean_removed),
                &ModelOptions::default(),
            )
            .unwrap();
            let x = DVector::from_vec(vec![truth.x, truth.y]);
            assert!(model.residuals(&x).norm() < 1e-9);
            assert_eq!(model.num_parameters(), 2);
        }
    }

    #[test]
    fn test_analytic_jacobian_matches_numeric() {
        let scene = scene();
        let query = scene.fingerprint_at(&Point2::new(2.0, 6.0), 1.5).unwrap();
        let nearest: Vec<&LocatedFingerprint> = scene.radio_map.iter().skip(3).take(4).collect();
        let options = ModelOptions {
            estimate_sources: true,
            path_loss_estimation: true,
            initial_sources: None,
        };

        for mean_removed in [false, true] {
            let model = FingerprintModel::build(
                &query,
                &nearest,
                &scene.sources,
                &settings(mean_removed),
                &options,
            )
            .unwrap();
            let mut x = model.initial_parameters();
            x[0] = 4.0;
            x[1] = 5.0;
            let analytic = model.jacobian(&x);
            let numeric = numeric_jacobian(&model, &x);
            assert!(
                (analytic - numeric).amax() < 1e-4,
                "mean_removed = {}",
                mean_removed
            );
        }
    }

    #[test]
    fn test_layout_with_refined_sources() {
        let scene = scene();
        let query = scene.fingerprint_at(&Point2::new(5.0, 5.0), 0.0).unwrap();
        let nearest: Vec<&LocatedFingerprint> = scene.radio_map.iter().take(3).collect();
        let n_sources = scene.sources.len();

        let model = FingerprintModel::build(
            &query,
            &nearest,
            &scene.sources,
            &settings(false),
            &ModelOptions {
                estimate_sources: true,
                path_loss_estimation: false,
                initial_sources: None,
            },
        )
        .unwrap();
        assert_eq!(model.num_parameters(), 2 + 2 * n_sources);
        assert_eq!(model.num_residuals(), 3 * n_sources + 2 * n_sources);

        // Starting values come from the known emitters
        let x = model.initial_parameters();
        let first = scene.sources[0].position();
        assert_eq!((x[2], x[3]), (first.x, first.y));
    }

    #[test]
    fn test_single_shared_source_is_uninformative_when_centred() {
        let scene = scene();
        let single = Fingerprint::new(vec![scene.radio_map[0].readings()[0].clone()]).unwrap();
        let nearest: Vec<&LocatedFingerprint> = scene.radio_map.iter().take(4).collect();

        let err = FingerprintModel::build(
            &single,
            &nearest,
            &scene.sources,
            &settings(true),
            &ModelOptions::default(),
        )
        .err();
        assert_eq!(err, Some(Error::NotEnoughReadings { rows: 0, unknowns: 2 }));

        // Without centering four rows determine two unknowns
        assert!(FingerprintModel::build(
            &single,
            &nearest,
            &scene.sources,
            &settings(false),
            &ModelOptions::default(),
        )
        .is_ok());
    }

    #[test]
    fn test_centred_residuals_sum_to_zero_per_fingerprint() {
        let scene = scene();
        let query = scene.fingerprint_at(&Point2::new(7.0, 2.0), -4.0).unwrap();
        let nearest: Vec<&LocatedFingerprint> = scene.radio_map.iter().take(2).collect();
        let model = FingerprintModel::build(
            &query,
            &nearest,
            &scene.sources,
            &settings(true),
            &ModelOptions::default(),
        )
        .unwrap();
        let r = model.residuals(&DVector::from_vec(vec![1.0, 1.0]));
        for group in &model.groups {
            let sum: f64 = r.rows(group.start, group.end - group.start).sum();
            assert!(sum.abs() < 1e-9);
        }
    }
}
