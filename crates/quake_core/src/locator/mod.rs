pub mod batched;
pub mod confidence;
pub mod cpu;
pub mod search;

use std::sync::Arc;

use crate::config::{LocatorBackend, LocatorConfig};
use crate::geo::GeoPoint;
use crate::travel_time::TravelTimeModel;
use crate::types::{Hypocenter, PickedEvent};

pub use batched::{BatchedLocator, ComputeBackend, FallbackLocator, HostBackend};
pub use cpu::CpuLocator;

pub struct LocateRequest<'a> {
	pub picks: Vec<&'a PickedEvent>,
	/// Cluster root, the search centre when there is no previous hypocenter.
	pub root: GeoPoint,
	pub previous: Option<&'a Hypocenter>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocateOutcome {
	Accepted(Hypocenter),
	/// Best candidate failed the correctness threshold; callers keep their previous hypocenter.
	Rejected(Hypocenter),
	NoSolution,
	InsufficientStations { available: usize, required: usize },
}

pub trait Locator: Send + Sync {
	fn locate(&self, request: &LocateRequest<'_>, cfg: &LocatorConfig, model: &dyn TravelTimeModel) -> LocateOutcome;

	fn name(&self) -> &'static str;
}

#[must_use]
pub fn from_config(cfg: &LocatorConfig) -> Arc<dyn Locator> {
	match cfg.backend {
		LocatorBackend::Cpu => Arc::new(CpuLocator),
		LocatorBackend::Gpu => Arc::new(FallbackLocator::new(HostBackend)),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::BackendError;
	use crate::geo::centroid;
	use crate::locator::search::{Candidate, FINAL_SPACING_KM, Fit, GridPoint};
	use crate::synthetic::{Scenario, ScenarioParams};
	use crate::travel_time::SphericalModel;

	fn cfg() -> LocatorConfig {
		LocatorConfig { depth_fix_allowed: false, ..LocatorConfig::default() }
	}

	fn request(picks: &[PickedEvent]) -> LocateRequest<'_> {
		let points: Vec<GeoPoint> = picks.iter().map(PickedEvent::location).collect();
		LocateRequest { picks: picks.iter().collect(), root: centroid(&points).unwrap(), previous: None }
	}

	fn accepted(outcome: LocateOutcome) -> Hypocenter {
		match outcome {
			LocateOutcome::Accepted(h) => h,
			other => panic!("expected an accepted hypocenter, got {other:?}"),
		}
	}

	#[test]
	fn converges_on_synthetic_deep_event() {
		let model = SphericalModel::default();
		let params = ScenarioParams::default();
		let max_miss_km = 20.0 * FINAL_SPACING_KM;
		let max_origin_err = (1.5 * params.noise_ms) as i64;

		for seed in 1..=8 {
			let scenario = Scenario::generate(&params, &model, seed);
			let h = accepted(CpuLocator.locate(&request(&scenario.picks), &cfg(), &model));

			let miss_km = h.epicenter().distance_km(&params.epicenter);
			let origin_err = (h.origin - params.origin).abs();
			assert!(miss_km < max_miss_km, "seed {seed}: epicentre off by {miss_km} km");
			assert!(origin_err < max_origin_err, "seed {seed}: origin off by {origin_err} ms");
			assert!((h.depth_km - params.depth_km).abs() < max_miss_km, "seed {seed}: depth {}", h.depth_km);
			assert!(h.correctness * 100.0 >= cfg().correctness_threshold);
			assert_eq!(h.counts.used, 30);
			assert_eq!(h.confidence_polygon.len(), 36);
		}
	}

	#[test]
	fn noise_free_picks_land_on_the_final_grid() {
		let model = SphericalModel::default();
		let params = ScenarioParams { noise_ms: 0.0, ..ScenarioParams::default() };

		for seed in 1..=3 {
			let scenario = Scenario::generate(&params, &model, seed);
			let h = accepted(CpuLocator.locate(&request(&scenario.picks), &cfg(), &model));

			let miss_km = h.epicenter().distance_km(&params.epicenter);
			assert!(miss_km < 2.0 * FINAL_SPACING_KM, "seed {seed}: epicentre off by {miss_km} km");
			assert!((h.origin - params.origin).abs() < 250, "seed {seed}: origin {}", h.origin - params.origin);
		}
	}

	#[test]
	fn identical_inputs_give_identical_output() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams { depth_km: 10.0, ..ScenarioParams::default() }, &model, 5);

		let a = CpuLocator.locate(&request(&scenario.picks), &cfg(), &model);
		let b = CpuLocator.locate(&request(&scenario.picks), &cfg(), &model);
		let serial = CpuLocator.locate(&request(&scenario.picks), &LocatorConfig { parallel: false, ..cfg() }, &model);

		assert_eq!(a, b);
		assert_eq!(a, serial);
	}

	#[test]
	fn batched_matches_cpu_under_a_tight_ceiling() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams::default(), &model, 11);
		let tight = LocatorConfig { gpu_memory_ceiling_mb: 1, ..cfg() };

		let cpu = CpuLocator.locate(&request(&scenario.picks), &tight, &model);
		let batched = BatchedLocator::new(HostBackend).try_locate(&request(&scenario.picks), &tight, &model).unwrap();
		assert_eq!(cpu, batched);
	}

	#[test]
	fn zero_ceiling_is_a_backend_error() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams::default(), &model, 11);
		let cfg = LocatorConfig { gpu_memory_ceiling_mb: 0, ..cfg() };

		let err = BatchedLocator::new(HostBackend).try_locate(&request(&scenario.picks), &cfg, &model).unwrap_err();
		assert_eq!(err.class(), "memory_ceiling");
	}

	struct Unplugged;

	impl ComputeBackend for Unplugged {
		fn name(&self) -> &'static str {
			"unplugged"
		}

		fn evaluate_batch(&self, _: &Fit<'_>, _: &[GridPoint], _: &mut Vec<Option<Candidate>>) -> Result<(), BackendError> {
			Err(BackendError::Unavailable("no device".into()))
		}
	}

	#[test]
	fn fallback_uses_cpu_when_device_fails() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams::default(), &model, 4);
		let locator = FallbackLocator::new(Unplugged);

		let first = locator.locate(&request(&scenario.picks), &cfg(), &model);
		let second = locator.locate(&request(&scenario.picks), &cfg(), &model);

		assert_eq!(first, CpuLocator.locate(&request(&scenario.picks), &cfg(), &model));
		assert_eq!(first, second);
		assert_eq!(locator.fallbacks(), 2);
	}

	#[test]
	fn below_minimum_stations_never_locates() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams { stations: 4, ..ScenarioParams::default() }, &model, 2);

		let outcome = CpuLocator.locate(&request(&scenario.picks), &cfg(), &model);
		assert_eq!(outcome, LocateOutcome::InsufficientStations { available: 4, required: 5 });
	}

	#[test]
	fn station_cap_reduces_latest_picks() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams::default(), &model, 8);
		let capped = LocatorConfig { max_stations: 12, ..cfg() };

		let h = accepted(CpuLocator.locate(&request(&scenario.picks), &capped, &model));
		assert_eq!(h.counts.total, 30);
		assert_eq!(h.counts.used, 12);
		assert_eq!(h.counts.reduced, 18);
	}

	#[test]
	fn mostly_inconsistent_picks_are_rejected() {
		let model = SphericalModel::default();
		let params = ScenarioParams { gross_error_fraction: 0.8, ..ScenarioParams::default() };
		let scenario = Scenario::generate(&params, &model, 21);
		let strict = LocatorConfig { correctness_threshold: 60.0, ..cfg() };

		match CpuLocator.locate(&request(&scenario.picks), &strict, &model) {
			LocateOutcome::Rejected(h) => assert!(h.correctness < 0.6),
			other => panic!("expected rejection, got {other:?}"),
		}
	}

	#[test]
	fn shallow_event_with_unconstrained_depth_is_fixed() {
		let model = SphericalModel::default();
		let scenario = Scenario::generate(&ScenarioParams { depth_km: 10.0, ..ScenarioParams::default() }, &model, 3);
		let fixing = LocatorConfig { depth_fix_allowed: true, depth_fix_spread_km: -1.0, ..cfg() };

		let h = accepted(CpuLocator.locate(&request(&scenario.picks), &fixing, &model));
		assert!(h.depth_fixed);
		assert!((h.depth_km - 10.0).abs() < f64::EPSILON);
		assert!(h.depth_interval.is_none());
	}
}
