//! Coarse-to-fine grid search shared by every locator backend.

use std::cmp::Ordering;

use crate::config::LocatorConfig;
use crate::geo::{angular_distance, move_on_globe, GeoPoint};
use crate::locator::confidence;
use crate::locator::{LocateOutcome, LocateRequest};
use crate::quality::{Quality, QualityInputs};
use crate::travel_time::TravelTimeModel;
use crate::types::{DepthInterval, Hypocenter, Millis, StationCounts};

/// Horizontal spacing at which refinement stops.
pub(crate) const FINAL_SPACING_KM: f64 = 0.5;
const MAX_STAGES: usize = 12;
/// Converts grid spacing into extra arrival tolerance for coarse stages.
const STAGE_VELOCITY_KM_S: f64 = 8.0;

/// A pick reduced to what the fit needs. `secs` is relative to the earliest used pick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickObs {
	pub lat: f64,
	pub lon: f64,
	pub secs: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
	pub lat: f64,
	pub lon: f64,
	pub depth_km: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
	pub lat: f64,
	pub lon: f64,
	pub depth_km: f64,
	pub origin_secs: f64,
	pub error: f64,
	pub correct: usize,
}

impl Candidate {
	/// Total order used for every reduction: error, then depth, then origin, then position.
	#[must_use]
	pub fn rank(&self, other: &Self) -> Ordering {
		self.error
			.total_cmp(&other.error)
			.then(self.depth_km.total_cmp(&other.depth_km))
			.then(self.origin_secs.total_cmp(&other.origin_secs))
			.then(self.lat.total_cmp(&other.lat))
			.then(self.lon.total_cmp(&other.lon))
	}

	#[must_use]
	pub const fn point(&self) -> GridPoint {
		GridPoint { lat: self.lat, lon: self.lon, depth_km: self.depth_km }
	}
}

#[must_use]
pub fn better(a: Option<Candidate>, b: Option<Candidate>) -> Option<Candidate> {
	match (a, b) {
		(Some(a), Some(b)) => Some(if b.rank(&a).is_lt() { b } else { a }),
		(a, None) => a,
		(None, b) => b,
	}
}

/// Misfit of a set of picks against one hypothetical source.
pub struct Fit<'a> {
	picks: &'a [PickObs],
	model: &'a dyn TravelTimeModel,
	tolerance: f64,
	cap: f64,
	min_valid: usize,
}

impl<'a> Fit<'a> {
	#[must_use]
	pub fn new(picks: &'a [PickObs], model: &'a dyn TravelTimeModel, tolerance: f64, min_valid: usize) -> Self {
		Self { picks, model, tolerance, cap: tolerance * 3.0, min_valid }
	}

	#[must_use]
	pub const fn picks(&self) -> &[PickObs] {
		self.picks
	}

	#[must_use]
	pub const fn tolerance(&self) -> f64 {
		self.tolerance
	}

	/// `None` when too few picks have an arrival from this point.
	pub fn evaluate(&self, point: GridPoint, origins: &mut Vec<f64>) -> Option<Candidate> {
		origins.clear();
		let mut missing = 0usize;

		for pick in self.picks {
			let tt = self.model.p_wave(point.depth_km, angular_distance(point.lat, point.lon, pick.lat, pick.lon));
			if tt < 0.0 {
				missing += 1;
			} else {
				origins.push(pick.secs - tt);
			}
		}

		if origins.len() < self.min_valid {
			return None;
		}

		origins.sort_by(f64::total_cmp);
		let origin = windowed_median(origins, self.tolerance);

		let mut error = missing as f64 * self.cap;
		let mut correct = 0;
		for o in origins.iter() {
			let residual = (o - origin).abs();
			error += residual.min(self.cap);
			if residual <= self.tolerance {
				correct += 1;
			}
		}

		Some(Candidate { lat: point.lat, lon: point.lon, depth_km: point.depth_km, origin_secs: origin, error, correct })
	}

	/// Absolute residuals of the picks that have an arrival, for a solved origin.
	#[must_use]
	pub fn residuals(&self, candidate: &Candidate) -> Vec<f64> {
		self.picks
			.iter()
			.filter_map(|pick| {
				let tt = self.model.p_wave(
					candidate.depth_km,
					angular_distance(candidate.lat, candidate.lon, pick.lat, pick.lon),
				);
				(tt >= 0.0).then(|| (pick.secs - tt - candidate.origin_secs).abs())
			})
			.collect()
	}
}

/// Median of the densest window of width `2 * tolerance` over sorted origin estimates.
#[must_use]
pub fn windowed_median(sorted: &[f64], tolerance: f64) -> f64 {
	if sorted.is_empty() {
		return 0.0;
	}

	let (mut best_start, mut best_end) = (0, 0);
	let mut end = 0;

	for start in 0..sorted.len() {
		end = end.max(start);
		while end + 1 < sorted.len() && sorted[end + 1] - sorted[start] <= 2.0 * tolerance {
			end += 1;
		}
		if end - start > best_end - best_start {
			(best_start, best_end) = (start, end);
		}
	}

	let window = &sorted[best_start..=best_end];
	match window.len() {
		n if n % 2 == 1 => window[n / 2],
		n => (window[n / 2 - 1] + window[n / 2]) / 2.0,
	}
}

/// Evaluates a stage's grid and returns its best candidate. Implemented once per backend.
pub trait StageEvaluator {
	type Error;

	fn best(&self, fit: &Fit<'_>, points: &[GridPoint], cfg: &LocatorConfig) -> Result<Option<Candidate>, Self::Error>;
}

/// Grid half-width in cells for a resolution setting.
#[must_use]
pub fn grid_half(resolution: f64) -> usize {
	(6.0 * (1.0 + resolution.max(0.0) / 100.0)).round() as usize
}

fn stage_grid(center: GeoPoint, radius_km: f64, half: usize, depths: (f64, f64)) -> Vec<GridPoint> {
	let spacing = radius_km / half as f64;
	let steps = 2 * half + 1;
	let depth_count = if depths.1 > depths.0 { steps } else { 1 };
	let depth_step = if depth_count > 1 { (depths.1 - depths.0) / (depth_count - 1) as f64 } else { 0.0 };

	let mut points = Vec::with_capacity(steps * steps * depth_count);
	for i in 0..steps {
		let north = (i as f64 - half as f64) * spacing;
		for j in 0..steps {
			let east = (j as f64 - half as f64) * spacing;
			let at = move_on_globe(center.lat, center.lon, north.hypot(east), east.atan2(north).to_degrees());
			for d in 0..depth_count {
				points.push(GridPoint { lat: at.lat, lon: at.lon, depth_km: depths.0 + d as f64 * depth_step });
			}
		}
	}
	points
}

fn refine<E: StageEvaluator>(
	evaluator: &E,
	obs: &[PickObs],
	model: &dyn TravelTimeModel,
	cfg: &LocatorConfig,
	start: GeoPoint,
	depths: (f64, f64),
) -> Result<Option<Candidate>, E::Error> {
	let half = grid_half(cfg.resolution);
	let threshold = cfg.inaccuracy_threshold_ms / 1000.0;
	let max_depth = model.max_depth_km();

	let mut center = start;
	let mut radius = cfg.coarse_radius_km;
	let (mut lo, mut hi) = depths;
	let mut best = None;

	for _ in 0..MAX_STAGES {
		let spacing = radius / half as f64;
		let depth_step = if hi > lo { (hi - lo) / (2 * half) as f64 } else { 0.0 };
		let tolerance = threshold + (spacing + depth_step) / STAGE_VELOCITY_KM_S;

		let fit = Fit::new(obs, model, tolerance, cfg.min_stations);
		let points = stage_grid(center, radius, half, (lo, hi));
		let Some(stage_best) = evaluator.best(&fit, &points, cfg)? else {
			break;
		};

		center = GeoPoint::new(stage_best.lat, stage_best.lon);
		radius = spacing * 2.0;
		// depth trades off against origin time, so its window only halves per stage
		if hi > lo {
			let reach = ((hi - lo) / 4.0).max(2.0 * depth_step);
			lo = (stage_best.depth_km - reach).max(0.0);
			hi = (stage_best.depth_km + reach).min(max_depth);
		}
		best = Some(stage_best);

		if spacing < FINAL_SPACING_KM {
			break;
		}
	}

	Ok(best)
}

/// Runs the full location for one cluster: selection, search, depth fixing, confidence and acceptance.
pub fn run<E: StageEvaluator>(
	evaluator: &E,
	request: &LocateRequest<'_>,
	cfg: &LocatorConfig,
	model: &dyn TravelTimeModel,
) -> Result<LocateOutcome, E::Error> {
	let mut picks = request.picks.clone();
	picks.sort_by_key(|p| (p.time, p.id));

	let total = picks.len();
	picks.truncate(cfg.max_stations);
	let used = picks.len();

	if used < cfg.min_stations {
		return Ok(LocateOutcome::InsufficientStations { available: used, required: cfg.min_stations });
	}

	let reference: Millis = picks[0].time;
	let obs: Vec<PickObs> =
		picks.iter().map(|p| PickObs { lat: p.lat, lon: p.lon, secs: (p.time - reference) as f64 / 1000.0 }).collect();

	let start = request.previous.map_or(request.root, Hypocenter::epicenter);
	let threshold = cfg.inaccuracy_threshold_ms / 1000.0;
	let final_fit = Fit::new(&obs, model, threshold, cfg.min_stations);
	let mut scratch = Vec::with_capacity(obs.len());

	let Some(coarse) = refine(evaluator, &obs, model, cfg, start, (0.0, model.max_depth_km()))? else {
		return Ok(LocateOutcome::NoSolution);
	};
	let Some(mut best) = final_fit.evaluate(coarse.point(), &mut scratch) else {
		return Ok(LocateOutcome::NoSolution);
	};

	let mut depth_interval = Some(confidence::depth_interval(&final_fit, &best, model.max_depth_km()));
	let mut depth_fixed = false;

	if cfg.depth_fix_allowed
		&& depth_interval.is_some_and(|d: DepthInterval| d.max_km - d.min_km > cfg.depth_fix_spread_km)
	{
		let fixed = (cfg.fixed_depth_km, cfg.fixed_depth_km);
		if let Some(candidate) = refine(evaluator, &obs, model, cfg, start, fixed)?
			&& let Some(candidate) = final_fit.evaluate(candidate.point(), &mut scratch)
		{
			best = candidate;
			depth_fixed = true;
			depth_interval = None;
		}
	}

	let polygon = confidence::polygon(&final_fit, &best);
	let (ns_err_km, ew_err_km) = confidence::horizontal_errors(&best, &polygon);

	let residuals = final_fit.residuals(&best);
	let inliers: Vec<f64> = residuals.iter().copied().filter(|r| *r <= threshold).collect();
	let residual_secs = if inliers.is_empty() { 0.0 } else { inliers.iter().sum::<f64>() / inliers.len() as f64 };
	let origin_error_secs = inliers.iter().copied().fold(0.0, f64::max);

	let counts = StationCounts { total, used, reduced: total - used, wrong: used - best.correct };
	let correctness = best.correct as f64 / used as f64;

	let quality = Quality::assess(&QualityInputs {
		depth_err_km: depth_interval.map_or(f64::NAN, |d| (d.max_km - d.min_km) / 2.0),
		origin_err_secs: origin_error_secs,
		ns_err_km,
		ew_err_km,
		stations: used,
		match_pct: correctness * 100.0,
	});

	let hypocenter = Hypocenter {
		lat: best.lat,
		lon: best.lon,
		depth_km: best.depth_km,
		origin: reference + (best.origin_secs * 1000.0).round() as Millis,
		depth_fixed,
		depth_interval,
		confidence_polygon: polygon,
		counts,
		residual_secs,
		correctness,
		origin_error_secs,
		quality: Some(quality),
		obvious_arrivals: None,
	};

	if correctness * 100.0 >= cfg.correctness_threshold {
		Ok(LocateOutcome::Accepted(hypocenter))
	} else {
		Ok(LocateOutcome::Rejected(hypocenter))
	}
}
