use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityTier {
	S,
	A,
	B,
	C,
	D,
}

impl fmt::Display for QualityTier {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::S => "S",
			Self::A => "A",
			Self::B => "B",
			Self::C => "C",
			Self::D => "D",
		};
		f.write_str(s)
	}
}

/// Tier boundaries for one axis, best first.
#[derive(Debug, Clone, Copy)]
struct Criterion {
	thresholds: [f64; 4],
	higher_is_better: bool,
}

impl Criterion {
	const fn lower(thresholds: [f64; 4]) -> Self {
		Self { thresholds, higher_is_better: false }
	}

	const fn higher(thresholds: [f64; 4]) -> Self {
		Self { thresholds, higher_is_better: true }
	}

	fn tier(&self, value: f64) -> QualityTier {
		const TIERS: [QualityTier; 4] = [QualityTier::S, QualityTier::A, QualityTier::B, QualityTier::C];

		if value.is_nan() {
			return QualityTier::D;
		}

		self
			.thresholds
			.iter()
			.zip(TIERS)
			.find(|(limit, _)| if self.higher_is_better { value >= **limit } else { value <= **limit })
			.map_or(QualityTier::D, |(_, tier)| tier)
	}
}

const DEPTH_KM: Criterion = Criterion::lower([5.0, 20.0, 50.0, 200.0]);
const ORIGIN_SECS: Criterion = Criterion::lower([1.0, 2.0, 5.0, 10.0]);
const HORIZONTAL_KM: Criterion = Criterion::lower([5.0, 15.0, 40.0, 100.0]);
const STATIONS: Criterion = Criterion::higher([40.0, 24.0, 12.0, 6.0]);
const MATCH_PCT: Criterion = Criterion::higher([90.0, 80.0, 65.0, 50.0]);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisQuality {
	pub value: f64,
	pub tier: QualityTier,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quality {
	pub depth: AxisQuality,
	pub origin: AxisQuality,
	pub north_south: AxisQuality,
	pub east_west: AxisQuality,
	pub stations: AxisQuality,
	pub match_pct: AxisQuality,
	pub summary: QualityTier,
}

/// Raw error metrics the tracker measures for a hypocenter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityInputs {
	pub depth_err_km: f64,
	pub origin_err_secs: f64,
	pub ns_err_km: f64,
	pub ew_err_km: f64,
	pub stations: usize,
	pub match_pct: f64,
}

impl Quality {
	#[must_use]
	pub fn assess(inputs: &QualityInputs) -> Self {
		let axis = |criterion: Criterion, value: f64| AxisQuality { value, tier: criterion.tier(value) };

		let depth = axis(DEPTH_KM, inputs.depth_err_km);
		let origin = axis(ORIGIN_SECS, inputs.origin_err_secs);
		let north_south = axis(HORIZONTAL_KM, inputs.ns_err_km);
		let east_west = axis(HORIZONTAL_KM, inputs.ew_err_km);
		let stations = axis(STATIONS, inputs.stations as f64);
		let match_pct = axis(MATCH_PCT, inputs.match_pct);

		let summary = [depth, origin, north_south, east_west, stations, match_pct]
			.iter()
			.map(|a| a.tier)
			.max()
			.unwrap_or(QualityTier::D);

		Self { depth, origin, north_south, east_west, stations, match_pct, summary }
	}
}
