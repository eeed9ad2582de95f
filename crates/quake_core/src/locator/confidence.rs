use crate::geo::{deg_to_km, move_on_globe, normalize_lon, GeoPoint};
use crate::locator::search::{Candidate, Fit, GridPoint};
use crate::types::DepthInterval;

const DEPTH_STEP_KM: f64 = 5.0;
const AZIMUTHS: usize = 36;
const MAX_REACH_KM: f64 = 2048.0;
const BISECTIONS: usize = 6;

/// A perturbed solution is still plausible when it keeps almost every consistent pick
/// and its misfit stays close to the optimum.
fn plausible(fit: &Fit<'_>, best: &Candidate, candidate: Option<Candidate>) -> bool {
	candidate.is_some_and(|c| c.correct * 10 >= best.correct * 9 && c.error <= best.error * 1.2 + fit.tolerance())
}

#[must_use]
pub fn depth_interval(fit: &Fit<'_>, best: &Candidate, max_depth_km: f64) -> DepthInterval {
	let mut scratch = Vec::with_capacity(fit.picks().len());
	let (mut min_km, mut max_km) = (best.depth_km, best.depth_km);

	let steps = (max_depth_km / DEPTH_STEP_KM) as usize;
	for i in 0..=steps {
		let depth_km = i as f64 * DEPTH_STEP_KM;
		let candidate = fit.evaluate(GridPoint { depth_km, ..best.point() }, &mut scratch);
		if plausible(fit, best, candidate) {
			min_km = min_km.min(depth_km);
			max_km = max_km.max(depth_km);
		}
	}

	DepthInterval { min_km, max_km }
}

/// Walks outward along each azimuth until the solution stops being plausible.
#[must_use]
pub fn polygon(fit: &Fit<'_>, best: &Candidate) -> Vec<GeoPoint> {
	let mut scratch = Vec::with_capacity(fit.picks().len());
	let plausible_at = |distance_km: f64, azimuth: f64, scratch: &mut Vec<f64>| {
		let at = move_on_globe(best.lat, best.lon, distance_km, azimuth);
		plausible(fit, best, fit.evaluate(GridPoint { lat: at.lat, lon: at.lon, depth_km: best.depth_km }, scratch))
	};

	(0..AZIMUTHS)
		.map(|i| {
			let azimuth = i as f64 * 360.0 / AZIMUTHS as f64;

			let (mut good, mut bad) = (0.0, 1.0);
			while bad <= MAX_REACH_KM && plausible_at(bad, azimuth, &mut scratch) {
				good = bad;
				bad *= 2.0;
			}
			for _ in 0..BISECTIONS {
				let mid = (good + bad) / 2.0;
				if plausible_at(mid, azimuth, &mut scratch) {
					good = mid;
				} else {
					bad = mid;
				}
			}

			move_on_globe(best.lat, best.lon, good, azimuth)
		})
		.collect()
}

/// Largest north-south and east-west extent of the polygon from the epicentre, km.
#[must_use]
pub fn horizontal_errors(best: &Candidate, polygon: &[GeoPoint]) -> (f64, f64) {
	let cos_lat = best.lat.to_radians().cos();
	polygon.iter().fold((0.0, 0.0), |(ns, ew), p| {
		let north = deg_to_km(p.lat - best.lat).abs();
		let east = (deg_to_km(normalize_lon(p.lon - best.lon)) * cos_lat).abs();
		(f64::max(ns, north), f64::max(ew, east))
	})
}
