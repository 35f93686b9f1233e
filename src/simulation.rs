// Synthetic radio maps generated from the exact log-distance model
//
// Emitters sit on a circle enclosing a rectangular area; located fingerprints
// are recorded on a regular grid inside it.

use std::f64::consts::PI;

use nalgebra as na;
use na::{Matrix2, Point2, Vector2};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::DEFAULT_PATH_LOSS_EXPONENT;
use crate::error::{Error, Result};
use crate::pathloss::received_power_dbm;
use crate::radio::{Fingerprint, LocatedFingerprint, LocatedRadioSource, RadioSource, Reading};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    /// Area covered by the radio map (m)
    pub width: f64,
    pub height: f64,
    /// Spacing of the located fingerprints (m)
    pub grid_step: f64,
    pub num_sources: usize,
    /// Carrier frequency (Hz)
    pub frequency: f64,
    pub transmitted_power_dbm: f64,
    pub path_loss_exponent: f64,
    /// RSSI noise of the radio map readings (dB); 0 for an exact map
    pub rssi_standard_deviation: f64,
    /// Position covariances attached to the data, which itself stays exact
    pub fingerprint_position_standard_deviation: Option<f64>,
    pub source_position_standard_deviation: Option<f64>,
    pub path_loss_exponent_standard_deviation: Option<f64>,
    pub seed: u64,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            width: 10.0,
            height: 10.0,
            grid_step: 1.0,
            num_sources: 4,
            frequency: 2.4e9,
            transmitted_power_dbm: 20.0,
            path_loss_exponent: DEFAULT_PATH_LOSS_EXPONENT,
            rssi_standard_deviation: 0.0,
            fingerprint_position_standard_deviation: None,
            source_position_standard_deviation: None,
            path_loss_exponent_standard_deviation: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticScene {
    pub config: SceneConfig,
    pub sources: Vec<LocatedRadioSource>,
    pub radio_map: Vec<LocatedFingerprint>,
}

impl SyntheticScene {
    pub fn generate(config: &SceneConfig) -> Result<Self> {
        if config.num_sources == 0 {
            return Err(Error::InvalidArgument("scene needs at least one source".to_string()));
        }
        if !(config.width > 0.0 && config.height > 0.0 && config.grid_step > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "invalid scene area {}x{} with step {}",
                config.width, config.height, config.grid_step
            )));
        }

        let center = Point2::new(config.width / 2.0, config.height / 2.0);
        let radius = 0.5 * config.width.hypot(config.height) + config.grid_step;
        let mut sources = Vec::with_capacity(config.num_sources);
        for i in 0..config.num_sources {
            let angle = 2.0 * PI * i as f64 / config.num_sources as f64 + 0.25;
            let position = center + radius * Vector2::new(angle.cos(), angle.sin());
            let mut located = LocatedRadioSource::new(
                RadioSource::new(format!("source-{}", i), config.frequency)?,
                position,
            )
            .with_transmitted_power(config.transmitted_power_dbm)
            .with_path_loss_exponent(
                config.path_loss_exponent,
                config.path_loss_exponent_standard_deviation,
            )?;
            if let Some(std) = config.source_position_standard_deviation {
                located = located.with_position_covariance(Matrix2::identity() * std * std)?;
            }
            sources.push(located);
        }

        let mut scene = Self {
            config: config.clone(),
            sources,
            radio_map: Vec::new(),
        };

        let mut rng = StdRng::seed_from_u64(config.seed);
        let columns = (config.width / config.grid_step).floor() as usize;
        let rows = (config.height / config.grid_step).floor() as usize;
        for row in 0..=rows {
            for column in 0..=columns {
                let position = Point2::new(
                    column as f64 * config.grid_step,
                    row as f64 * config.grid_step,
                );
                let fingerprint = scene.noisy_fingerprint_at(&position, 0.0, &mut rng)?;
                let located = match config.fingerprint_position_standard_deviation {
                    Some(std) => LocatedFingerprint::with_covariance(
                        fingerprint,
                        position,
                        Matrix2::identity() * std * std,
                    )?,
                    None => LocatedFingerprint::new(fingerprint, position),
                };
                scene.radio_map.push(located);
            }
        }

        debug!(
            sources = scene.sources.len(),
            fingerprints = scene.radio_map.len(),
            "Generated synthetic scene"
        );
        Ok(scene)
    }

    /// Exact RSSI of a source at `position` (dBm).
    pub fn rssi_at(&self, source: &LocatedRadioSource, position: &Point2<f64>) -> f64 {
        let exponent = source
            .path_loss_exponent()
            .unwrap_or(self.config.path_loss_exponent);
        let power = source
            .transmitted_power()
            .unwrap_or(self.config.transmitted_power_dbm);
        received_power_dbm(
            power,
            (position - source.position()).norm(),
            source.source().frequency(),
            exponent,
        )
    }

    /// Exact fingerprint at `position` with a constant `bias` added to every reading.
    pub fn fingerprint_at(&self, position: &Point2<f64>, bias: f64) -> Result<Fingerprint> {
        let readings = self
            .sources
            .iter()
            .map(|s| Reading::new(s.source().clone(), self.rssi_at(s, position) + bias))
            .collect::<Result<Vec<_>>>()?;
        Fingerprint::new(readings)
    }

    /// Fingerprint at `position` with the configured RSSI noise and a constant `bias`.
    ///
    /// Readings carry the noise standard deviation when it is positive.
    pub fn noisy_fingerprint_at<R: Rng>(
        &self,
        position: &Point2<f64>,
        bias: f64,
        rng: &mut R,
    ) -> Result<Fingerprint> {
        let std = self.config.rssi_standard_deviation;
        if std <= 0.0 {
            return self.fingerprint_at(position, bias);
        }
        let noise = Normal::new(0.0, std).map_err(|e| Error::InvalidArgument(e.to_string()))?;
        let readings = self
            .sources
            .iter()
            .map(|s| {
                let rssi = self.rssi_at(s, position) + bias + noise.sample(rng);
                Reading::with_standard_deviation(s.source().clone(), rssi, std)
            })
            .collect::<Result<Vec<_>>>()?;
        Fingerprint::new(readings)
    }
}
