use serde::{Deserialize, Serialize};

use crate::config::CityConfig;
use crate::geo::great_circle_distance;
use crate::types::Hypocenter;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityIntensity {
	pub name: String,
	pub distance_km: f64,
	pub pga_gal: f64,
	pub mmi: f64,
}

/// Peak ground acceleration in cm/s² with near-source saturation.
#[must_use]
pub fn pga_gal(magnitude: f64, hypocentral_km: f64) -> f64 {
	let saturation = 0.0055 * 10f64.powf(0.5 * magnitude);
	10f64.powf(0.5 * magnitude - (hypocentral_km + saturation).log10() - 0.003 * hypocentral_km + 1.0)
}

/// Modified Mercalli intensity from PGA (Wald et al. 1999).
#[must_use]
pub fn mmi_from_pga(pga_gal: f64) -> f64 {
	let log = pga_gal.max(1e-6).log10();
	let high = 3.66 * log - 1.66;
	let mmi = if high >= 5.0 { high } else { 2.20 * log + 1.0 };
	mmi.clamp(1.0, 12.0)
}

/// Cities ordered by strongest expected shaking.
#[must_use]
pub fn for_cities(cities: &[CityConfig], hypocenter: &Hypocenter, magnitude: f64) -> Vec<CityIntensity> {
	let mut out: Vec<CityIntensity> = cities
		.iter()
		.map(|city| {
			let distance_km = great_circle_distance(hypocenter.lat, hypocenter.lon, city.lat, city.lon);
			let pga = pga_gal(magnitude, distance_km.hypot(hypocenter.depth_km));
			CityIntensity { name: city.name.clone(), distance_km, pga_gal: pga, mmi: mmi_from_pga(pga) }
		})
		.collect();

	out.sort_by(|a, b| b.mmi.total_cmp(&a.mmi).then_with(|| a.name.cmp(&b.name)));
	out
}
