pub mod constants;
pub mod error;
pub mod radio;
pub mod pathloss;
pub mod nearest;
pub mod solver;
pub mod uncertainty;
pub mod estimator;
pub mod simulation;
pub mod config;

pub use error::{Error, Result};
pub use estimator::{
    EstimateEvent, EstimateListener, EstimationResult, EstimatorBase, EstimatorState,
    FingerprintEstimator, PositionAndRadioSourceEstimator, PositionEstimator,
};
pub use radio::{Fingerprint, LocatedFingerprint, LocatedRadioSource, RadioSource, Reading};
pub use uncertainty::PropagationSettings;
