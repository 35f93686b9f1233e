// Nearest located fingerprint search in RSSI space

use std::cmp::Ordering;

use tracing::debug;

use crate::error::{Error, Result};
use crate::radio::{Fingerprint, LocatedFingerprint};

/// A located fingerprint together with its dissimilarity to a query.
#[derive(Debug, Clone, Copy)]
pub struct RankedFingerprint<'a> {
    pub fingerprint: &'a LocatedFingerprint,
    /// Euclidean RSSI distance over the shared sources (dB)
    pub distance: f64,
    /// Number of sources shared with the query
    pub shared: usize,
}

/// Ranks the entries of a radio map by RSSI dissimilarity to a query fingerprint.
///
/// Only sources present in both fingerprints take part in a comparison. In
/// mean-removed mode each fingerprint's own mean over those shared readings is
/// subtracted first, which cancels a constant per-device RSSI offset.
#[derive(Debug, Clone, Copy)]
pub struct NearestFingerprintFinder<'a> {
    fingerprints: &'a [LocatedFingerprint],
    mean_removed: bool,
}

impl<'a> NearestFingerprintFinder<'a> {
    pub fn new(fingerprints: &'a [LocatedFingerprint], mean_removed: bool) -> Self {
        Self {
            fingerprints,
            mean_removed,
        }
    }

    /// All candidates sharing at least one source with `query`, by ascending distance.
    ///
    /// Fails with [`Error::NearestFingerprintNotFound`] when no candidate qualifies.
    pub fn rank(&self, query: &Fingerprint) -> Result<Vec<RankedFingerprint<'a>>> {
        let mut ranked: Vec<RankedFingerprint<'a>> = self
            .fingerprints
            .iter()
            .filter_map(|candidate| {
                let (distance, shared) =
                    dissimilarity(candidate.fingerprint(), query, self.mean_removed)?;
                Some(RankedFingerprint {
                    fingerprint: candidate,
                    distance,
                    shared,
                })
            })
            .collect();

        if ranked.is_empty() {
            return Err(Error::NearestFingerprintNotFound);
        }

        ranked.sort_by(|a, b| a.distance.partial_cmp(&b.distance).unwrap_or(Ordering::Equal));
        debug!(
            candidates = self.fingerprints.len(),
            ranked = ranked.len(),
            mean_removed = self.mean_removed,
            "Ranked located fingerprints"
        );
        Ok(ranked)
    }

    /// The `k` nearest candidates (fewer when the radio map has fewer qualifying entries).
    pub fn find_k_nearest(&self, query: &Fingerprint, k: usize) -> Result<Vec<RankedFingerprint<'a>>> {
        if k == 0 {
            return Err(Error::InvalidArgument("k must be positive".to_string()));
        }
        let mut ranked = self.rank(query)?;
        ranked.truncate(k);
        Ok(ranked)
    }

    /// The single nearest candidate.
    pub fn find_nearest(&self, query: &Fingerprint) -> Result<RankedFingerprint<'a>> {
        self.find_k_nearest(query, 1)?
            .into_iter()
            .next()
            .ok_or(Error::NearestFingerprintNotFound)
    }
}

/// RSSI distance between two fingerprints over their shared sources.
///
/// # Returns
/// * `Some((distance, shared))` when at least one source is shared
/// * `None` otherwise
pub fn dissimilarity(a: &Fingerprint, b: &Fingerprint, mean_removed: bool) -> Option<(f64, usize)> {
    let pairs: Vec<(f64, f64)> = a
        .readings()
        .iter()
        .filter_map(|ra| b.reading(ra.source()).map(|rb| (ra.rssi(), rb.rssi())))
        .collect();

    if pairs.is_empty() {
        return None;
    }

    let (mean_a, mean_b) = if mean_removed {
        let n = pairs.len() as f64;
        (
            pairs.iter().map(|p| p.0).sum::<f64>() / n,
            pairs.iter().map(|p| p.1).sum::<f64>() / n,
        )
    } else {
        (0.0, 0.0)
    };

    let sq: f64 = pairs
        .iter()
        .map(|(x, y)| {
            let diff = (x - mean_a) - (y - mean_b);
            diff * diff
        })
        .sum();
    Some((sq.sqrt(), pairs.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radio::{RadioSource, Reading};
    use nalgebra::Point2;

    fn source(id: &str) -> RadioSource {
        RadioSource::new(id, 2.4e9).unwrap()
    }

    fn fingerprint(values: &[(&str, f64)]) -> Fingerprint {
        Fingerprint::new(
            values
                .iter()
                .map(|(id, rssi)| Reading::new(source(id), *rssi).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn located(values: &[(&str, f64)], x: f64) -> LocatedFingerprint {
        LocatedFingerprint::new(fingerprint(values), Point2::new(x, 0.0))
    }

    #[test]
    fn test_dissimilarity_ignores_unshared_sources() {
        let a = fingerprint(&[("a", -50.0), ("b", -60.0), ("c", -10.0)]);
        let b = fingerprint(&[("a", -53.0), ("b", -64.0), ("d", -90.0)]);
        let (d, shared) = dissimilarity(&a, &b, false).unwrap();
        assert_eq!(shared, 2);
        assert!((d - 5.0).abs() < 1e-12);

        let c = fingerprint(&[("x", -50.0)]);
        assert!(dissimilarity(&a, &c, false).is_none());
    }

    #[test]
    fn test_mean_removal_cancels_offset() {
        let a = fingerprint(&[("a", -50.0), ("b", -60.0), ("c", -70.0)]);
        let shifted = a.with_offset(-8.0);
        let (raw, _) = dissimilarity(&a, &shifted, false).unwrap();
        let (centered, _) = dissimilarity(&a, &shifted, true).unwrap();
        assert!((raw - 8.0 * 3.0_f64.sqrt()).abs() < 1e-9);
        assert!(centered.abs() < 1e-9);
    }

    #[test]
    fn test_rank_orders_and_excludes() {
        let map = vec![
            located(&[("a", -70.0), ("b", -70.0)], 0.0),
            located(&[("a", -51.0), ("b", -61.0)], 1.0),
            located(&[("z", -40.0)], 2.0),
            located(&[("a", -55.0), ("b", -60.0)], 3.0),
        ];
        let query = fingerprint(&[("a", -50.0), ("b", -60.0)]);
        let finder = NearestFingerprintFinder::new(&map, false);

        let ranked = finder.rank(&query).unwrap();
        assert_eq!(ranked.len(), 3);
        let xs: Vec<f64> = ranked.iter().map(|r| r.fingerprint.position().x).collect();
        assert_eq!(xs, vec![1.0, 3.0, 0.0]);

        let two = finder.find_k_nearest(&query, 2).unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(finder.find_nearest(&query).unwrap().fingerprint.position().x, 1.0);
        assert!(finder.find_k_nearest(&query, 0).is_err());
        assert_eq!(finder.find_k_nearest(&query, 10).unwrap().len(), 3);
    }

    #[test]
    fn test_mean_removed_mode_changes_ranking() {
        // Candidate 0 has the right shape but a constant offset; candidate 1 is closer in raw RSSI.
        let map = vec![
            located(&[("a", -40.0), ("b", -50.0), ("c", -60.0)], 0.0),
            located(&[("a", -52.0), ("b", -58.0), ("c", -64.0)], 1.0),
        ];
        let query = fingerprint(&[("a", -50.0), ("b", -60.0), ("c", -70.0)]);

        let raw = NearestFingerprintFinder::new(&map, false).find_nearest(&query).unwrap();
        assert_eq!(raw.fingerprint.position().x, 1.0);

        let centered = NearestFingerprintFinder::new(&map, true).find_nearest(&query).unwrap();
        assert_eq!(centered.fingerprint.position().x, 0.0);
        assert!(centered.distance.abs() < 1e-9);
    }

    #[test]
    fn test_no_resolvable_fingerprint() {
        let empty: Vec<LocatedFingerprint> = Vec::new();
        let query = fingerprint(&[("a", -50.0)]);
        assert_eq!(
            NearestFingerprintFinder::new(&empty, true).rank(&query).unwrap_err(),
            Error::NearestFingerprintNotFound
        );

        let map = vec![located(&[("b", -50.0)], 0.0)];
        assert_eq!(
            NearestFingerprintFinder::new(&map, false).find_nearest(&query).unwrap_err(),
            Error::NearestFingerprintNotFound
        );
    }
}
