pub const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GeoPoint {
	pub lat: f64,
	pub lon: f64,
}

impl GeoPoint {
	#[must_use]
	pub const fn new(lat: f64, lon: f64) -> Self {
		Self { lat, lon }
	}

	#[must_use]
	pub fn distance_km(&self, other: &Self) -> f64 {
		great_circle_distance(self.lat, self.lon, other.lat, other.lon)
	}
}

/// Haversine distance in kilometres.
#[must_use]
pub fn great_circle_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
	let phi1 = lat1.to_radians();
	let phi2 = lat2.to_radians();
	let d_phi = (lat2 - lat1).to_radians();
	let d_lambda = (lon2 - lon1).to_radians();

	let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
	2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Angular distance in degrees, the unit travel-time tables are indexed by.
#[must_use]
pub fn angular_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
	km_to_deg(great_circle_distance(lat1, lon1, lat2, lon2))
}

#[must_use]
pub fn km_to_deg(km: f64) -> f64 {
	(km / EARTH_RADIUS_KM).to_degrees()
}

#[must_use]
pub fn deg_to_km(deg: f64) -> f64 {
	deg.to_radians() * EARTH_RADIUS_KM
}

/// Destination reached by travelling `distance_km` along `bearing_deg` from the start point.
#[must_use]
pub fn move_on_globe(lat: f64, lon: f64, distance_km: f64, bearing_deg: f64) -> GeoPoint {
	let delta = distance_km / EARTH_RADIUS_KM;
	let theta = bearing_deg.to_radians();
	let phi1 = lat.to_radians();
	let lambda1 = lon.to_radians();

	let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).clamp(-1.0, 1.0).asin();
	let lambda2 = lambda1 + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

	GeoPoint { lat: phi2.to_degrees(), lon: normalize_lon(lambda2.to_degrees()) }
}

/// Wraps a longitude into `[-180, 180)`.
#[must_use]
pub fn normalize_lon(lon: f64) -> f64 {
	(lon + 180.0).rem_euclid(360.0) - 180.0
}

/// Spherical centroid of a set of points; `None` for an empty set.
#[must_use]
pub fn centroid(points: &[GeoPoint]) -> Option<GeoPoint> {
	if points.is_empty() {
		return None;
	}

	let (mut x, mut y, mut z) = (0.0, 0.0, 0.0);
	for p in points {
		let (phi, lambda) = (p.lat.to_radians(), p.lon.to_radians());
		x += phi.cos() * lambda.cos();
		y += phi.cos() * lambda.sin();
		z += phi.sin();
	}

	let n = points.len() as f64;
	let (x, y, z) = (x / n, y / n, z / n);
	let hyp = x.hypot(y);
	Some(GeoPoint { lat: z.atan2(hyp).to_degrees(), lon: y.atan2(x).to_degrees() })
}
