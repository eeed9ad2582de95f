use serde::{Deserialize, Serialize};

use crate::types::StationId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MagnitudeReading {
	pub station: StationId,
	pub magnitude: f64,
	pub hypocentral_km: f64,
}

/// Richter-style ML with the Hutton & Boore distance correction.
#[must_use]
pub fn local_magnitude(amplitude: f64, hypocentral_km: f64) -> f64 {
	let r = hypocentral_km.max(1.0);
	amplitude.log10() + 1.11 * r.log10() + 0.00189 * r - 2.09
}

/// Amplitude a station at `hypocentral_km` records for `magnitude`.
#[must_use]
pub fn amplitude_for(magnitude: f64, hypocentral_km: f64) -> f64 {
	let r = hypocentral_km.max(1.0);
	10f64.powf(magnitude - 1.11 * r.log10() - 0.00189 * r + 2.09)
}

#[must_use]
pub fn bin(magnitude: f64, step: f64) -> f64 {
	if step <= 0.0 {
		return magnitude;
	}
	(magnitude / step).round() * step
}

/// Interquartile mean, or `None` below the minimum number of readings.
#[must_use]
pub fn aggregate(readings: &[f64], min_readings: usize) -> Option<f64> {
	if readings.is_empty() || readings.len() < min_readings {
		return None;
	}

	let mut sorted = readings.to_vec();
	sorted.sort_by(f64::total_cmp);
	let quarter = sorted.len() / 4;
	let middle = &sorted[quarter..sorted.len() - quarter];

	Some(middle.iter().sum::<f64>() / middle.len() as f64)
}
