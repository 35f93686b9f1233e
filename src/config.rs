use clap::Parser;

use crate::simulation::SceneConfig;

/// RSSI fingerprint positioning demo on a synthetic scene
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Width of the mapped area in meters.
    #[arg(long, default_value_t = 10.0)]
    pub width: f64,

    /// Height of the mapped area in meters.
    #[arg(long, default_value_t = 10.0)]
    pub height: f64,

    /// Spacing of the located fingerprints in meters.
    #[arg(long, default_value_t = 1.0)]
    pub grid_step: f64,

    /// Number of radio sources around the area.
    #[arg(long, default_value_t = 4)]
    pub sources: usize,

    /// Path-loss exponent used to generate the scene.
    #[arg(long, default_value_t = 2.0)]
    pub path_loss_exponent: f64,

    /// True device position, x coordinate.
    #[arg(long, default_value_t = 3.3)]
    pub x: f64,

    /// True device position, y coordinate.
    #[arg(long, default_value_t = 4.1)]
    pub y: f64,

    /// RSSI noise of the radio map and the query in dB (0 for exact readings).
    #[arg(long, default_value_t = 0.0)]
    pub noise: f64,

    /// Constant offset added to every query reading in dB.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub bias: f64,

    /// Compare raw RSSI values when ranking fingerprints instead of mean-removed ones.
    #[arg(long, default_value_t = false)]
    pub raw_finder: bool,

    /// Remove the per-fingerprint mean from readings in the fit.
    #[arg(long, default_value_t = false)]
    pub mean_removed_readings: bool,

    /// Minimum number of nearest fingerprints.
    #[arg(long, default_value_t = 1)]
    pub min_nearest: usize,

    /// Maximum number of nearest fingerprints (unbounded when omitted).
    #[arg(long)]
    pub max_nearest: Option<usize>,

    /// Refine the radio source positions together with the device position.
    #[arg(long, default_value_t = false)]
    pub joint: bool,

    /// Also estimate one path-loss exponent per source (with --joint).
    #[arg(long, default_value_t = false)]
    pub estimate_path_loss: bool,

    /// Seed of the noise generator.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Print the result as JSON on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Verbose logging (DEBUG level)
    #[arg(long, short, default_value_t = false)]
    pub verbose: bool,
}

impl Config {
    pub fn scene_config(&self) -> SceneConfig {
        SceneConfig {
            width: self.width,
            height: self.height,
            grid_step: self.grid_step,
            num_sources: self.sources,
            path_loss_exponent: self.path_loss_exponent,
            rssi_standard_deviation: self.noise,
            seed: self.seed,
            ..SceneConfig::default()
        }
    }
}
