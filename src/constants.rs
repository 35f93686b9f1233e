// Shared constants for RSSI positioning (radio model and estimator defaults)

/// Speed of light in vacuum (m/s).
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Default path-loss exponent (free space).
pub const DEFAULT_PATH_LOSS_EXPONENT: f64 = 2.0;

/// Standard deviation used for readings that carry none (dB).
pub const FALLBACK_RSSI_STANDARD_DEVIATION: f64 = 1e-3;

/// Standard deviation of an emitter position prior when the emitter carries no covariance (m).
pub const FALLBACK_SOURCE_POSITION_STANDARD_DEVIATION: f64 = 1.0;

/// Standard deviation of an estimated path-loss exponent prior when none is known.
pub const FALLBACK_PATH_LOSS_EXPONENT_STANDARD_DEVIATION: f64 = 1.0;

/// Default minimum number of nearest fingerprints.
pub const DEFAULT_MIN_NEAREST_FINGERPRINTS: usize = 1;

/// Distances below this are clamped to keep log-distance terms finite (m).
pub const MIN_DISTANCE: f64 = 1e-6;

// --- Solver ---

/// Maximum Levenberg-Marquardt iterations.
pub const SOLVER_MAX_ITERATIONS: usize = 100;

/// Maximum damping retries within one iteration.
pub const SOLVER_MAX_DAMPING_STEPS: usize = 10;

/// Initial damping factor.
pub const SOLVER_INITIAL_DAMPING: f64 = 1e-3;

/// Relative parameter-change tolerance.
pub const SOLVER_PARAMETER_TOLERANCE: f64 = 1e-10;

/// Relative cost-change tolerance.
pub const SOLVER_COST_TOLERANCE: f64 = 1e-12;

/// Absolute cost below which the fit is exact.
pub const SOLVER_COST_EPSILON: f64 = 1e-24;
