use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{StationConfig, StationSource};
use crate::geo::{angular_distance, move_on_globe, GeoPoint};
use crate::tracker::magnitude;
use crate::travel_time::TravelTimeModel;
use crate::types::{Millis, PickId, PickedEvent, StationId};

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioParams {
	pub epicenter: GeoPoint,
	pub depth_km: f64,
	pub origin: Millis,
	pub stations: usize,
	pub max_distance_km: f64,
	/// Picks are displaced by a uniform error in `±noise_ms`.
	pub noise_ms: f64,
	/// Share of picks replaced by gross timing errors.
	pub gross_error_fraction: f64,
	pub magnitude: f64,
}

impl Default for ScenarioParams {
	fn default() -> Self {
		Self {
			epicenter: GeoPoint::new(5.0, 145.0),
			depth_km: 200.0,
			origin: 1_700_000_000_000,
			stations: 30,
			max_distance_km: 5000.0,
			noise_ms: 300.0,
			gross_error_fraction: 0.0,
			magnitude: 6.0,
		}
	}
}

#[derive(Debug, Clone)]
pub struct Scenario {
	pub params: ScenarioParams,
	pub stations: Vec<StationConfig>,
	pub picks: Vec<PickedEvent>,
}

impl Scenario {
	#[must_use]
	pub fn generate(params: &ScenarioParams, model: &dyn TravelTimeModel, seed: u64) -> Self {
		let mut rng = StdRng::seed_from_u64(seed);
		let mut stations = Vec::with_capacity(params.stations);
		let mut picks = Vec::with_capacity(params.stations);

		while stations.len() < params.stations {
			// uniform over area rather than over distance
			let distance = (params.max_distance_km * rng.r#gen::<f64>().sqrt()).max(10.0);
			let bearing = rng.gen_range(0.0..360.0);
			let at = move_on_globe(params.epicenter.lat, params.epicenter.lon, distance, bearing);

			let tt = model.p_wave(params.depth_km, angular_distance(params.epicenter.lat, params.epicenter.lon, at.lat, at.lon));
			if tt < 0.0 {
				continue;
			}

			let index = stations.len();
			let id = StationId::new("SY", &format!("S{index:03}"), "", "HHZ");

			let mut offset_ms = if params.noise_ms > 0.0 { rng.gen_range(-params.noise_ms..=params.noise_ms) } else { 0.0 };
			if rng.r#gen::<f64>() < params.gross_error_fraction {
				let sign = if rng.r#gen::<bool>() { 1.0 } else { -1.0 };
				offset_ms = sign * rng.gen_range(20_000.0..60_000.0);
			}

			let hypocentral_km = distance.hypot(params.depth_km);
			picks.push(PickedEvent {
				id: PickId { station: index, seq: 0 },
				station: id.clone(),
				lat: at.lat,
				lon: at.lon,
				time: params.origin + (tt * 1000.0 + offset_ms).round() as Millis,
				trigger_ratio: 50.0 + rng.gen_range(0.0..50.0),
				amplitude: magnitude::amplitude_for(params.magnitude, hypocentral_km),
			});
			stations.push(StationConfig { id, lat: at.lat, lon: at.lon, alt: 0.0, source: StationSource::Synthetic });
		}

		Self { params: params.clone(), stations, picks }
	}

	/// Picks sorted by arrival, the order a live feed would produce them in.
	#[must_use]
	pub fn picks_by_time(&self) -> Vec<PickedEvent> {
		let mut picks = self.picks.clone();
		picks.sort_by_key(|p| (p.time, p.id));
		picks
	}
}
