// Radio data model: sources, readings and (located) fingerprints

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use nalgebra as na;
use na::{Matrix2, Point2};
use serde::{Deserialize, Serialize};

use crate::constants::SPEED_OF_LIGHT;
use crate::error::{Error, Result};

/// Relative tolerance for the symmetry check of supplied covariances.
const SYMMETRY_TOLERANCE: f64 = 1e-9;

/// A radio emitter, identified by its address.
///
/// Two sources are equal when their identifiers are equal; the frequency is
/// carried along for the propagation model only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioSource {
    id: String,
    frequency: f64,
}

impl RadioSource {
    /// Create a source from an identifier (e.g. a BSSID) and a carrier frequency in Hz.
    pub fn new(id: impl Into<String>, frequency: f64) -> Result<Self> {
        if !(frequency > 0.0) || !frequency.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "frequency must be positive, got {}",
                frequency
            )));
        }
        Ok(Self {
            id: id.into(),
            frequency,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Carrier frequency in Hz.
    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    /// Carrier wavelength in meters.
    pub fn wavelength(&self) -> f64 {
        SPEED_OF_LIGHT / self.frequency
    }
}

impl PartialEq for RadioSource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RadioSource {}

impl Hash for RadioSource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A radio source with a known (or estimated) position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedRadioSource {
    source: RadioSource,
    position: Point2<f64>,
    position_covariance: Option<Matrix2<f64>>,
    transmitted_power: Option<f64>,
    path_loss_exponent: Option<f64>,
    path_loss_exponent_standard_deviation: Option<f64>,
}

impl LocatedRadioSource {
    pub fn new(source: RadioSource, position: Point2<f64>) -> Self {
        Self {
            source,
            position,
            position_covariance: None,
            transmitted_power: None,
            path_loss_exponent: None,
            path_loss_exponent_standard_deviation: None,
        }
    }

    /// Attach a position covariance, which must be symmetric positive-definite.
    pub fn with_position_covariance(mut self, covariance: Matrix2<f64>) -> Result<Self> {
        validate_covariance(&covariance)?;
        self.position_covariance = Some(covariance);
        Ok(self)
    }

    /// Attach the transmitted power in dBm.
    pub fn with_transmitted_power(mut self, power_dbm: f64) -> Self {
        self.transmitted_power = Some(power_dbm);
        self
    }

    /// Attach a source-specific path-loss exponent and, optionally, its standard deviation.
    pub fn with_path_loss_exponent(
        mut self,
        exponent: f64,
        standard_deviation: Option<f64>,
    ) -> Result<Self> {
        if !(exponent > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "path-loss exponent must be positive, got {}",
                exponent
            )));
        }
        if let Some(std) = standard_deviation {
            if !(std >= 0.0) {
                return Err(Error::InvalidArgument(format!(
                    "standard deviation must be non-negative, got {}",
                    std
                )));
            }
        }
        self.path_loss_exponent = Some(exponent);
        self.path_loss_exponent_standard_deviation = standard_deviation;
        Ok(self)
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn position(&self) -> &Point2<f64> {
        &self.position
    }

    pub fn position_covariance(&self) -> Option<&Matrix2<f64>> {
        self.position_covariance.as_ref()
    }

    /// Transmitted power in dBm, if known.
    pub fn transmitted_power(&self) -> Option<f64> {
        self.transmitted_power
    }

    pub fn path_loss_exponent(&self) -> Option<f64> {
        self.path_loss_exponent
    }

    pub fn path_loss_exponent_standard_deviation(&self) -> Option<f64> {
        self.path_loss_exponent_standard_deviation
    }

    /// Copy of this source moved to a refined position and exponent.
    pub(crate) fn refined(
        &self,
        position: Point2<f64>,
        position_covariance: Option<Matrix2<f64>>,
        path_loss_exponent: Option<f64>,
    ) -> Self {
        let mut refined = self.clone();
        refined.position = position;
        refined.position_covariance = position_covariance;
        if path_loss_exponent.is_some() {
            refined.path_loss_exponent = path_loss_exponent;
        }
        refined
    }
}

/// A single RSSI measurement of a radio source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    source: RadioSource,
    rssi: f64,
    rssi_standard_deviation: Option<f64>,
}

impl Reading {
    /// Create a reading with RSSI in dBm.
    pub fn new(source: RadioSource, rssi: f64) -> Result<Self> {
        validate_rssi(rssi)?;
        Ok(Self {
            source,
            rssi,
            rssi_standard_deviation: None,
        })
    }

    /// Create a reading with a known RSSI standard deviation (dB).
    pub fn with_standard_deviation(
        source: RadioSource,
        rssi: f64,
        standard_deviation: f64,
    ) -> Result<Self> {
        validate_rssi(rssi)?;
        if !(standard_deviation > 0.0) || !standard_deviation.is_finite() {
            return Err(Error::InvalidArgument(format!(
                "RSSI standard deviation must be positive, got {}",
                standard_deviation
            )));
        }
        Ok(Self {
            source,
            rssi,
            rssi_standard_deviation: Some(standard_deviation),
        })
    }

    pub fn source(&self) -> &RadioSource {
        &self.source
    }

    pub fn rssi(&self) -> f64 {
        self.rssi
    }

    pub fn rssi_standard_deviation(&self) -> Option<f64> {
        self.rssi_standard_deviation
    }

    /// Same reading shifted by `offset` dB.
    pub fn with_offset(&self, offset: f64) -> Self {
        Self {
            rssi: self.rssi + offset,
            ..self.clone()
        }
    }
}

/// Readings taken at a single location, at most one per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    readings: Vec<Reading>,
}

impl Fingerprint {
    pub fn new(readings: Vec<Reading>) -> Result<Self> {
        if readings.is_empty() {
            return Err(Error::InvalidArgument(
                "fingerprint must contain at least one reading".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(readings.len());
        for reading in &readings {
            if !seen.insert(reading.source()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate reading for source {}",
                    reading.source().id()
                )));
            }
        }
        Ok(Self { readings })
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Reading of the given source, if present.
    pub fn reading(&self, source: &RadioSource) -> Option<&Reading> {
        self.readings.iter().find(|r| r.source() == source)
    }

    /// Copy with every RSSI shifted by `offset` dB (models a device calibration bias).
    pub fn with_offset(&self, offset: f64) -> Self {
        Self {
            readings: self.readings.iter().map(|r| r.with_offset(offset)).collect(),
        }
    }
}

/// A fingerprint recorded at a known position; an entry of the radio map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocatedFingerprint {
    fingerprint: Fingerprint,
    position: Point2<f64>,
    position_covariance: Option<Matrix2<f64>>,
}

impl LocatedFingerprint {
    pub fn new(fingerprint: Fingerprint, position: Point2<f64>) -> Self {
        Self {
            fingerprint,
            position,
            position_covariance: None,
        }
    }

    /// Create with a position covariance, which must be symmetric positive-definite.
    pub fn with_covariance(
        fingerprint: Fingerprint,
        position: Point2<f64>,
        covariance: Matrix2<f64>,
    ) -> Result<Self> {
        validate_covariance(&covariance)?;
        Ok(Self {
            fingerprint,
            position,
            position_covariance: Some(covariance),
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn readings(&self) -> &[Reading] {
        self.fingerprint.readings()
    }

    pub fn position(&self) -> &Point2<f64> {
        &self.position
    }

    pub fn position_covariance(&self) -> Option<&Matrix2<f64>> {
        self.position_covariance.as_ref()
    }
}

fn validate_rssi(rssi: f64) -> Result<()> {
    if !rssi.is_finite() {
        return Err(Error::InvalidArgument(format!(
            "RSSI must be finite, got {}",
            rssi
        )));
    }
    Ok(())
}

/// Check that a 2x2 covariance is symmetric positive-definite.
pub fn validate_covariance(covariance: &Matrix2<f64>) -> Result<()> {
    if covariance.iter().any(|v| !v.is_finite()) {
        return Err(Error::InvalidCovariance);
    }
    let scale = covariance.abs().max().max(f64::MIN_POSITIVE);
    if (covariance[(0, 1)] - covariance[(1, 0)]).abs() > SYMMETRY_TOLERANCE * scale {
        return Err(Error::InvalidCovariance);
    }
    match covariance.cholesky() {
        Some(_) => Ok(()),
        None => Err(Error::InvalidCovariance),
    }
}
