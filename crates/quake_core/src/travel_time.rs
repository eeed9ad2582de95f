use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::FatalError;
use crate::geo::EARTH_RADIUS_KM;

/// Returned when the phase is not observable at the requested depth and range.
pub const NO_ARRIVAL: f64 = -1.0;

pub const MAX_DEPTH_KM: f64 = 750.0;

pub trait TravelTimeModel: Send + Sync {
	/// Travel time in seconds, or a negative value when there is no arrival.
	fn p_wave(&self, depth_km: f64, angle_deg: f64) -> f64;

	fn max_depth_km(&self) -> f64 {
		MAX_DEPTH_KM
	}
}

/// Straight-ray model through a sphere whose effective P velocity grows with the
/// deepest point the ray reaches.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SphericalModel {
	pub surface_velocity_km_s: f64,
	pub velocity_gradient: f64,
	pub shadow_angle_deg: f64,
}

impl Default for SphericalModel {
	fn default() -> Self {
		Self { surface_velocity_km_s: 7.4, velocity_gradient: 0.0018, shadow_angle_deg: 98.0 }
	}
}

impl TravelTimeModel for SphericalModel {
	fn p_wave(&self, depth_km: f64, angle_deg: f64) -> f64 {
		if !(0.0..=MAX_DEPTH_KM).contains(&depth_km) || !(0.0..=self.shadow_angle_deg).contains(&angle_deg) {
			return NO_ARRIVAL;
		}

		let theta = angle_deg.to_radians();
		let source = (EARTH_RADIUS_KM - depth_km, 0.0);
		let station = (EARTH_RADIUS_KM * theta.cos(), EARTH_RADIUS_KM * theta.sin());
		let ray = (station.0 - source.0, station.1 - source.1);
		let length = ray.0.hypot(ray.1);

		if length < 1e-9 {
			return 0.0;
		}

		// closest approach of the chord to the earth's centre
		let t = (-(source.0 * ray.0 + source.1 * ray.1) / (length * length)).clamp(0.0, 1.0);
		let min_radius = (source.0 + t * ray.0).hypot(source.1 + t * ray.1);
		let velocity = self.surface_velocity_km_s + self.velocity_gradient * (EARTH_RADIUS_KM - min_radius);

		length / velocity
	}
}

/// Precomputed depth × angle grid with bilinear interpolation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TravelTimeTable {
	depth_step_km: f64,
	angle_step_deg: f64,
	depths: usize,
	angles: usize,
	values: Vec<f64>,
}

impl TravelTimeTable {
	pub fn build(model: &dyn TravelTimeModel, depth_step_km: f64, angle_step_deg: f64) -> Result<Self, FatalError> {
		let depths = (model.max_depth_km() / depth_step_km).ceil() as usize + 1;
		let angles = (180.0 / angle_step_deg).ceil() as usize + 1;

		let len = depths * angles;
		let mut values = Vec::new();
		values
			.try_reserve_exact(len)
			.map_err(|_| FatalError::Allocation { what: "travel-time table", bytes: len * size_of::<f64>() })?;

		for d in 0..depths {
			let depth = d as f64 * depth_step_km;
			for a in 0..angles {
				values.push(model.p_wave(depth, a as f64 * angle_step_deg));
			}
		}

		Ok(Self { depth_step_km, angle_step_deg, depths, angles, values })
	}

	/// Loads a table written by [`TravelTimeTable::save`]. Any failure is fatal.
	pub fn load(path: &Path) -> Result<Self, FatalError> {
		let fatal = |reason: String| FatalError::TravelTimeTable { path: path.to_path_buf(), reason };

		let content = fs::read_to_string(path).map_err(|e| fatal(e.to_string()))?;
		let table: Self = serde_json::from_str(&content).map_err(|e| fatal(e.to_string()))?;

		if table.depths < 2 || table.angles < 2 || table.values.len() != table.depths * table.angles {
			return Err(fatal(format!(
				"grid is {}x{} but holds {} values",
				table.depths,
				table.angles,
				table.values.len()
			)));
		}
		if table.depth_step_km <= 0.0 || table.angle_step_deg <= 0.0 {
			return Err(fatal("grid steps must be positive".to_string()));
		}

		info!(path = %path.display(), depths = table.depths, angles = table.angles, "Travel-time table loaded");
		Ok(table)
	}

	pub fn save(&self, path: &Path) -> anyhow::Result<()> {
		let content = serde_json::to_string(self)?;
		fs::write(path, content)?;
		Ok(())
	}

	fn at(&self, d: usize, a: usize) -> f64 {
		self.values[d * self.angles + a]
	}
}

impl TravelTimeModel for TravelTimeTable {
	fn p_wave(&self, depth_km: f64, angle_deg: f64) -> f64 {
		if depth_km < 0.0 || angle_deg < 0.0 {
			return NO_ARRIVAL;
		}

		let x = depth_km / self.depth_step_km;
		let y = angle_deg / self.angle_step_deg;
		let (d0, a0) = (x.floor() as usize, y.floor() as usize);
		if d0 + 1 >= self.depths || a0 + 1 >= self.angles {
			return NO_ARRIVAL;
		}

		let corners = [self.at(d0, a0), self.at(d0, a0 + 1), self.at(d0 + 1, a0), self.at(d0 + 1, a0 + 1)];
		if corners.iter().any(|v| *v < 0.0) {
			return NO_ARRIVAL;
		}

		let (fx, fy) = (x - d0 as f64, y - a0 as f64);
		let top = corners[0] + (corners[1] - corners[0]) * fy;
		let bottom = corners[2] + (corners[3] - corners[2]) * fy;
		top + (bottom - top) * fx
	}

	fn max_depth_km(&self) -> f64 {
		(self.depths - 1) as f64 * self.depth_step_km
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spherical_model_is_plausible() {
		let model = SphericalModel::default();
		let near = model.p_wave(10.0, 10.0);
		let far = model.p_wave(10.0, 60.0);

		assert!((130.0..170.0).contains(&near), "10 degrees took {near}s");
		assert!(far > near);
		assert!(model.p_wave(200.0, 10.0) < model.p_wave(0.0, 10.0) + 5.0);
	}

	#[test]
	fn shadow_zone_and_depth_limits_return_sentinel() {
		let model = SphericalModel::default();
		assert!(model.p_wave(10.0, 120.0) < 0.0);
		assert!(model.p_wave(900.0, 10.0) < 0.0);
		assert!(model.p_wave(-1.0, 10.0) < 0.0);
	}

	#[test]
	fn travel_time_grows_with_distance() {
		let model = SphericalModel::default();
		let mut last = 0.0;
		for step in 1..=95 {
			let t = model.p_wave(33.0, f64::from(step));
			assert!(t > last, "non-monotonic at {step} degrees");
			last = t;
		}
	}

	#[test]
	fn table_interpolates_close_to_model() {
		let model = SphericalModel::default();
		let table = TravelTimeTable::build(&model, 10.0, 0.5).unwrap();

		for (depth, angle) in [(15.0, 3.3), (200.0, 41.7), (555.0, 80.1)] {
			let exact = model.p_wave(depth, angle);
			let approx = table.p_wave(depth, angle);
			assert!((exact - approx).abs() < 0.5, "{depth} km / {angle} deg: {exact} vs {approx}");
		}

		assert!(table.p_wave(10.0, 150.0) < 0.0);
	}

	#[test]
	fn table_save_and_load() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("p.json");

		let table = TravelTimeTable::build(&SphericalModel::default(), 50.0, 5.0).unwrap();
		table.save(&path).unwrap();
		let loaded = TravelTimeTable::load(&path).unwrap();

		assert!((loaded.p_wave(100.0, 22.0) - table.p_wave(100.0, 22.0)).abs() < 1e-12);
	}

	#[test]
	fn missing_table_is_fatal() {
		let err = TravelTimeTable::load(Path::new("/nonexistent/p.json")).unwrap_err();
		assert!(matches!(err, FatalError::TravelTimeTable { .. }));
	}
}
