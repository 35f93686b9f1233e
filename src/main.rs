// RSSI Positioning - Demo Entry Point
// Copyright (C) 2024 - RSSI fingerprint positioning
// Licensed under AGPL v3

use clap::Parser;
use nalgebra::Point2;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rssi_positioning::config::Config;
use rssi_positioning::simulation::SyntheticScene;
use rssi_positioning::{
    EstimationResult, FingerprintEstimator, PositionAndRadioSourceEstimator, PositionEstimator,
};
use tracing::{info, warn};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_logging(config.verbose);

    let scene = SyntheticScene::generate(&config.scene_config())?;
    info!(
        sources = scene.sources.len(),
        fingerprints = scene.radio_map.len(),
        "Synthetic scene ready"
    );

    let truth = Point2::new(config.x, config.y);
    // Query noise continues from a seed distinct from the radio map's
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(1));
    let query = scene.noisy_fingerprint_at(&truth, config.bias, &mut rng)?;

    let result = if config.joint {
        let mut estimator = PositionAndRadioSourceEstimator::with_data(
            scene.radio_map.clone(),
            query,
            scene.sources.clone(),
        )?;
        estimator.set_path_loss_estimation_enabled(config.estimate_path_loss)?;
        run(&mut estimator, &config)?
    } else {
        if config.estimate_path_loss {
            warn!("--estimate-path-loss has no effect without --joint");
        }
        let mut estimator =
            PositionEstimator::with_data(scene.radio_map.clone(), query, scene.sources.clone())?;
        run(&mut estimator, &config)?
    };

    let error = (result.position - truth).norm();
    info!(
        "Estimated ({:.3}, {:.3}) for true ({:.3}, {:.3}), error {:.4} m",
        result.position.x, result.position.y, truth.x, truth.y, error
    );
    info!(
        "Covariance [{:.3e} {:.3e}; {:.3e} {:.3e}], {} nearest fingerprints, {} iterations",
        result.covariance[(0, 0)],
        result.covariance[(0, 1)],
        result.covariance[(1, 0)],
        result.covariance[(1, 1)],
        result.nearest_fingerprints,
        result.iterations
    );
    if let Some(chi_square) = result.chi_square {
        info!("Chi-square {:.4}", chi_square);
    }
    if !result.converged {
        warn!("Solver stopped at its iteration cap");
    }

    if config.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

fn run<E: FingerprintEstimator>(
    estimator: &mut E,
    config: &Config,
) -> Result<EstimationResult, Box<dyn std::error::Error>> {
    estimator.set_use_no_mean_nearest_fingerprint_finder(!config.raw_finder)?;
    estimator.set_mean_effect_removed_from_readings(config.mean_removed_readings)?;
    estimator.set_min_max_nearest_fingerprints(config.min_nearest, config.max_nearest)?;
    Ok(estimator.estimate()?)
}

/// Initialize logging subsystem
fn init_logging(verbose: bool) {
    use tracing_subscriber::fmt::format::FmtSpan;

    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .with_span_events(if verbose {
            FmtSpan::ENTER | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        });

    if verbose {
        subscriber
            .with_max_level(tracing::Level::DEBUG)
            .init();
        info!("Verbose logging enabled (DEBUG level)");
    } else {
        subscriber
            .with_max_level(tracing::Level::INFO)
            .init();
    }
}
