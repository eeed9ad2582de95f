use std::time::{Duration, Instant};

use quake_core::config::{AnalysisConfig, LocatorBackend, LocatorConfig};
use quake_core::geo::{GeoPoint, centroid};
use quake_core::locator::{self, LocateOutcome, LocateRequest};
use quake_core::synthetic::{Scenario, ScenarioParams};
use quake_core::travel_time::TravelTimeModel;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

const CALIBRATION_STATIONS: usize = 60;
const CALIBRATION_SEED: u64 = 6543;
const CALIBRATION_MAX_SLOW_RUNS: u32 = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct TrainingReport {
	pub runs: u64,
	pub located: u64,
	pub mean_origin_error_ms: f64,
	pub mean_distance_km: f64,
	pub elapsed: Duration,
}

struct RunResult {
	origin_error_ms: i64,
	distance_km: f64,
}

/// One seeded earthquake somewhere in 0..10°N, 140..150°E, located with depth fixing disabled.
fn run_once(cfg: &LocatorConfig, model: &dyn TravelTimeModel, stations: usize, seed: u64) -> Option<RunResult> {
	let mut rng = StdRng::seed_from_u64(seed);
	let params = ScenarioParams {
		epicenter: GeoPoint::new(rng.gen_range(0.0..10.0), rng.gen_range(140.0..150.0)),
		stations,
		..ScenarioParams::default()
	};
	let scenario = Scenario::generate(&params, model, seed);

	let points: Vec<_> = scenario.picks.iter().map(|p| p.location()).collect();
	let request = LocateRequest { picks: scenario.picks.iter().collect(), root: centroid(&points)?, previous: None };
	let locator = locator::from_config(cfg);

	match locator.locate(&request, cfg, model) {
		LocateOutcome::Accepted(h) => Some(RunResult {
			origin_error_ms: (h.origin - params.origin).abs(),
			distance_km: h.epicenter().distance_km(&params.epicenter),
		}),
		other => {
			debug!(seed, outcome = ?other, "Synthetic earthquake not located");
			None
		},
	}
}

pub fn train(config: &AnalysisConfig, model: &dyn TravelTimeModel, runs: u64, seed: u64) -> TrainingReport {
	let cfg = LocatorConfig { depth_fix_allowed: false, ..config.locator.clone() };
	let started = Instant::now();
	let mut report = TrainingReport { runs, ..TrainingReport::default() };
	let (mut origin_sum, mut distance_sum) = (0.0, 0.0);

	for i in 0..runs {
		match run_once(&cfg, model, ScenarioParams::default().stations, seed + i) {
			Some(result) => {
				info!(run = i, origin_error_ms = result.origin_error_ms, distance_km = result.distance_km, "Located");
				origin_sum += result.origin_error_ms as f64;
				distance_sum += result.distance_km;
				report.located += 1;
			},
			None => warn!(run = i, "Failed to locate"),
		}
	}

	report.elapsed = started.elapsed();
	if report.located > 0 {
		report.mean_origin_error_ms = origin_sum / report.located as f64;
		report.mean_distance_km = distance_sum / report.located as f64;
	}

	info!(
		runs,
		located = report.located,
		failures = runs - report.located,
		mean_origin_error_ms = report.mean_origin_error_ms,
		mean_distance_km = report.mean_distance_km,
		elapsed_ms = report.elapsed.as_millis() as u64,
		"✅ Training finished"
	);
	report
}

/// Raises `locator.resolution` while a run stays within `budget`; stops after five slow runs in a row.
pub fn calibrate(config: &mut AnalysisConfig, model: &dyn TravelTimeModel, budget: Duration) {
	let (step, max) = match config.locator.backend {
		LocatorBackend::Cpu => (2.0, 160.0),
		LocatorBackend::Gpu => (5.0, 1000.0),
	};

	let mut cfg = LocatorConfig { depth_fix_allowed: false, resolution: 0.0, ..config.locator.clone() };
	let mut seed = CALIBRATION_SEED;
	let mut slow = 0;

	while slow < CALIBRATION_MAX_SLOW_RUNS && cfg.resolution <= max {
		let started = Instant::now();
		run_once(&cfg, model, CALIBRATION_STATIONS, seed);
		let took = started.elapsed();
		seed += 1;

		if took > budget {
			slow += 1;
		} else {
			slow = 0;
			cfg.resolution += step;
		}

		info!(
			resolution = cfg.resolution,
			took_ms = took.as_millis() as u64,
			budget_ms = budget.as_millis() as u64,
			"Calibrating"
		);
	}

	config.locator.resolution = cfg.resolution.min(max);
}
