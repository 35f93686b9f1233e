// Device position estimator over known emitters

use std::sync::Arc;

use crate::error::Result;
use crate::radio::{Fingerprint, LocatedFingerprint, LocatedRadioSource};

use super::model::ModelOptions;
use super::{run_estimation, EstimateListener, EstimationResult, EstimatorBase, FingerprintEstimator};

/// Estimates the device position from its nearest located fingerprints,
/// keeping every emitter at its known position.
pub struct PositionEstimator {
    base: EstimatorBase<PositionEstimator>,
}

impl Default for PositionEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl PositionEstimator {
    /// An estimator with no inputs yet; not ready.
    pub fn new() -> Self {
        Self {
            base: EstimatorBase::default(),
        }
    }

    /// An estimator ready to run.
    ///
    /// Fails with `InvalidArgument` when the radio map or the source list is empty.
    pub fn with_data(
        located_fingerprints: impl Into<Arc<Vec<LocatedFingerprint>>>,
        fingerprint: impl Into<Arc<Fingerprint>>,
        sources: impl Into<Arc<Vec<LocatedRadioSource>>>,
    ) -> Result<Self> {
        Ok(Self {
            base: EstimatorBase::with_data(located_fingerprints, fingerprint, sources)?,
        })
    }

    pub fn with_listener(mut self, listener: EstimateListener<Self>) -> Self {
        self.base.listener = Some(listener);
        self
    }
}

impl FingerprintEstimator for PositionEstimator {
    fn base(&self) -> &EstimatorBase<Self> {
        &self.base
    }

    fn base_mut(&mut self) -> &mut EstimatorBase<Self> {
        &mut self.base
    }

    fn estimate(&mut self) -> Result<EstimationResult> {
        run_estimation(self, ModelOptions::default())
    }
}
