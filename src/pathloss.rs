// Log-distance path-loss model
//
// Received power follows Pr = Pt * k / d^n with k = (lambda / 4pi)^n, so in
// the logarithmic domain
//
//   Pr[dBm] = Pt[dBm] + 10 n log10(lambda / (4 pi d))
//
// Comparing the same source seen from two positions cancels Pt and k, which is
// what the fingerprint residual model relies on: the RSSI expected at the
// device follows from the RSSI recorded at a located fingerprint.

use std::f64::consts::{LN_10, PI};

use nalgebra as na;
use na::{Point2, Vector2};

use crate::constants::{MIN_DISTANCE, SPEED_OF_LIGHT};

/// Convert power in dBm to Watts.
pub fn dbm_to_power(dbm: f64) -> f64 {
    10.0_f64.powf(dbm / 10.0) * 1e-3
}

/// Convert power in Watts to dBm.
pub fn power_to_dbm(watts: f64) -> f64 {
    10.0 * watts.log10() + 30.0
}

/// Path-loss constant k = (lambda / 4pi)^n for a carrier frequency in Hz.
pub fn path_loss_constant(frequency: f64, path_loss_exponent: f64) -> f64 {
    let wavelength = SPEED_OF_LIGHT / frequency;
    (wavelength / (4.0 * PI)).powf(path_loss_exponent)
}

/// Received power in Watts at `distance` meters from a transmitter of `transmitted_power` Watts.
pub fn received_power(
    transmitted_power: f64,
    distance: f64,
    frequency: f64,
    path_loss_exponent: f64,
) -> f64 {
    let distance = distance.max(MIN_DISTANCE);
    transmitted_power * path_loss_constant(frequency, path_loss_exponent)
        / distance.powf(path_loss_exponent)
}

/// Received power in dBm; same model as [`received_power`] in the log domain.
pub fn received_power_dbm(
    transmitted_power_dbm: f64,
    distance: f64,
    frequency: f64,
    path_loss_exponent: f64,
) -> f64 {
    let distance = distance.max(MIN_DISTANCE);
    let wavelength = SPEED_OF_LIGHT / frequency;
    transmitted_power_dbm + 10.0 * path_loss_exponent * (wavelength / (4.0 * PI * distance)).log10()
}

/// Distance in meters at which a transmitter of `transmitted_power_dbm` is received with `received_power_dbm`.
pub fn distance_from_received_power_dbm(
    transmitted_power_dbm: f64,
    received_power_dbm: f64,
    frequency: f64,
    path_loss_exponent: f64,
) -> f64 {
    let wavelength = SPEED_OF_LIGHT / frequency;
    wavelength / (4.0 * PI)
        * 10.0_f64.powf((transmitted_power_dbm - received_power_dbm) / (10.0 * path_loss_exponent))
}

/// RSSI expected at the device for one source, derived from a located fingerprint,
/// with its partial derivatives.
#[derive(Debug, Clone, Copy)]
pub struct PredictedRssi {
    /// Expected RSSI at the device (dBm)
    pub value: f64,
    /// d value / d device position
    pub d_device: Vector2<f64>,
    /// d value / d fingerprint position
    pub d_fingerprint: Vector2<f64>,
    /// d value / d source position
    pub d_source: Vector2<f64>,
    /// d value / d path-loss exponent
    pub d_exponent: f64,
}

/// Predict the device RSSI of a source from the RSSI recorded at a located fingerprint.
///
/// value = rssi_fp + 10 n log10(d(fp, source) / d(device, source))
///
/// # Arguments
/// * `fingerprint_rssi` - RSSI of the source recorded at the fingerprint (dBm)
/// * `fingerprint_position` - Position of the located fingerprint
/// * `device_position` - Candidate device position
/// * `source_position` - Position of the radio source
/// * `path_loss_exponent` - Path-loss exponent of the source
pub fn predict_from_fingerprint(
    fingerprint_rssi: f64,
    fingerprint_position: &Point2<f64>,
    device_position: &Point2<f64>,
    source_position: &Point2<f64>,
    path_loss_exponent: f64,
) -> PredictedRssi {
    let to_fingerprint = fingerprint_position - source_position;
    let to_device = device_position - source_position;
    let d_fp = to_fingerprint.norm().max(MIN_DISTANCE);
    let d_dev = to_device.norm().max(MIN_DISTANCE);

    let log_ratio = d_fp.log10() - d_dev.log10();
    let scale = 10.0 * path_loss_exponent / LN_10;

    let d_device = -scale * to_device / (d_dev * d_dev);
    let d_fingerprint = scale * to_fingerprint / (d_fp * d_fp);

    PredictedRssi {
        value: fingerprint_rssi + 10.0 * path_loss_exponent * log_ratio,
        d_device,
        d_fingerprint,
        d_source: -(d_device + d_fingerprint),
        d_exponent: 10.0 * log_ratio,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FREQUENCY: f64 = 2.4e9;

    #[test]
    fn test_power_conversions() {
        assert!((dbm_to_power(30.0) - 1.0).abs() < 1e-12);
        assert!((dbm_to_power(0.0) - 1e-3).abs() < 1e-15);
        assert!((power_to_dbm(1e-3)).abs() < 1e-12);
        assert!((power_to_dbm(dbm_to_power(-67.5)) + 67.5).abs() < 1e-9);
    }

    #[test]
    fn test_free_space_loss_at_one_meter() {
        // Friis free-space loss at 2.4 GHz and 1 m is about 40 dB
        let rx = received_power_dbm(0.0, 1.0, FREQUENCY, 2.0);
        assert!((rx + 40.05).abs() < 0.1, "rx = {}", rx);

        let linear = power_to_dbm(received_power(dbm_to_power(0.0), 1.0, FREQUENCY, 2.0));
        assert!((linear - rx).abs() < 1e-9);
    }

    #[test]
    fn test_distance_inverts_received_power() {
        for &n in &[1.6, 2.0, 3.3] {
            let rx = received_power_dbm(15.0, 12.5, FREQUENCY, n);
            let d = distance_from_received_power_dbm(15.0, rx, FREQUENCY, n);
            assert!((d - 12.5).abs() < 1e-9, "n = {}, d = {}", n, d);
        }
    }

    #[test]
    fn test_prediction_matches_absolute_model() {
        let source = Point2::new(2.0, -1.0);
        let fingerprint = Point2::new(5.0, 3.0);
        let device = Point2::new(-1.0, 4.0);
        let n = 2.7;
        let tx = 18.0;

        let rssi_fp = received_power_dbm(tx, (fingerprint - source).norm(), FREQUENCY, n);
        let expected = received_power_dbm(tx, (device - source).norm(), FREQUENCY, n);
        let predicted = predict_from_fingerprint(rssi_fp, &fingerprint, &device, &source, n);
        assert!((predicted.value - expected).abs() < 1e-9);
    }

    #[test]
    fn test_derivatives_match_finite_differences() {
        let source = Point2::new(1.0, 2.0);
        let fingerprint = Point2::new(4.0, -2.0);
        let device = Point2::new(-3.0, 5.0);
        let n = 2.2;
        let h = 1e-6;
        let base = predict_from_fingerprint(-55.0, &fingerprint, &device, &source, n);

        for axis in 0..2 {
            let mut step = Vector2::zeros();
            step[axis] = h;

            let plus = predict_from_fingerprint(-55.0, &fingerprint, &(device + step), &source, n);
            let numeric = (plus.value - base.value) / h;
            assert!((numeric - base.d_device[axis]).abs() < 1e-4);

            let plus = predict_from_fingerprint(-55.0, &(fingerprint + step), &device, &source, n);
            let numeric = (plus.value - base.value) / h;
            assert!((numeric - base.d_fingerprint[axis]).abs() < 1e-4);

            let plus = predict_from_fingerprint(-55.0, &fingerprint, &device, &(source + step), n);
            let numeric = (plus.value - base.value) / h;
            assert!((numeric - base.d_source[axis]).abs() < 1e-4);
        }

        let plus = predict_from_fingerprint(-55.0, &fingerprint, &device, &source, n + h);
        let numeric = (plus.value - base.value) / h;
        assert!((numeric - base.d_exponent).abs() < 1e-4);
    }
}
