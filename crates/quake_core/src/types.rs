use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;
use crate::quality::Quality;

/// Epoch milliseconds, the clock unit of the whole pipeline.
pub type Millis = i64;

pub type ClusterId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StationId {
	pub network: String,
	pub station: String,
	#[serde(default)]
	pub location: String,
	pub channel: String,
}

impl StationId {
	pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
		Self {
			network: network.to_string(),
			station: station.to_string(),
			location: location.to_string(),
			channel: channel.to_string(),
		}
	}
}

impl fmt::Display for StationId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}.{}.{}", self.network, self.station, self.location, self.channel)
	}
}

/// Identity of a pick: the registry index of its station and a per-station sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PickId {
	pub station: usize,
	pub seq: u64,
}

/// A single station's detected onset. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PickedEvent {
	pub id: PickId,
	pub station: StationId,
	pub lat: f64,
	pub lon: f64,
	pub time: Millis,
	pub trigger_ratio: f64,
	pub amplitude: f64,
}

impl PickedEvent {
	#[must_use]
	pub const fn location(&self) -> GeoPoint {
		GeoPoint::new(self.lat, self.lon)
	}
}

/// Messages a detector produces: a new pick, or growth of an existing pick's peak values.
#[derive(Debug, Clone, PartialEq)]
pub enum PickMessage {
	New(PickedEvent),
	Peak { id: PickId, ratio: f64, amplitude: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DepthInterval {
	pub min_km: f64,
	pub max_km: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationCounts {
	/// Picks assigned to the cluster.
	pub total: usize,
	/// Picks the search actually fitted.
	pub used: usize,
	/// Picks dropped by the station cap.
	pub reduced: usize,
	/// Fitted picks outside the arrival-inaccuracy threshold.
	pub wrong: usize,
}

impl StationCounts {
	#[must_use]
	pub const fn correct(&self) -> usize {
		self.used - self.wrong
	}
}

/// Stations that should certainly have seen the P wave by now, and how many did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObviousArrivals {
	pub expected: usize,
	pub picked: usize,
}

impl ObviousArrivals {
	#[must_use]
	pub fn ratio(&self) -> Option<f64> {
		(self.expected > 0).then(|| self.picked as f64 / self.expected as f64)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypocenter {
	pub lat: f64,
	pub lon: f64,
	pub depth_km: f64,
	pub origin: Millis,
	pub depth_fixed: bool,
	pub depth_interval: Option<DepthInterval>,
	pub confidence_polygon: Vec<GeoPoint>,
	pub counts: StationCounts,
	/// Mean absolute residual of the correct picks, seconds.
	pub residual_secs: f64,
	/// Consistent picks over fitted picks, 0..=1.
	pub correctness: f64,
	/// Half-width of the origin-time uncertainty, seconds.
	pub origin_error_secs: f64,
	pub quality: Option<Quality>,
	pub obvious_arrivals: Option<ObviousArrivals>,
}

impl Hypocenter {
	#[must_use]
	pub const fn epicenter(&self) -> GeoPoint {
		GeoPoint::new(self.lat, self.lon)
	}

	#[must_use]
	pub fn origin_time(&self) -> DateTime<Utc> {
		to_datetime(self.origin)
	}
}

impl fmt::Display for Hypocenter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"{:.3}, {:.3} at {:.1} km{} origin {} ({}/{} correct)",
			self.lat,
			self.lon,
			self.depth_km,
			if self.depth_fixed { " (fixed)" } else { "" },
			format_millis(self.origin),
			self.counts.correct(),
			self.counts.used
		)
	}
}

pub fn current_millis() -> Millis {
	Utc::now().timestamp_millis()
}

pub fn to_datetime(ms: Millis) -> DateTime<Utc> {
	DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

pub fn format_millis(ms: Millis) -> String {
	to_datetime(ms).format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn station_id_display() {
		let id = StationId::new("GE", "WLF", "", "BHZ");
		assert_eq!(id.to_string(), "GE.WLF..BHZ");
	}

	#[test]
	fn format_millis_is_utc() {
		assert_eq!(format_millis(1_704_558_271_250), "2024-01-06 16:24:31.250 UTC");
	}

	#[test]
	fn obvious_ratio_requires_expectations() {
		assert_eq!(ObviousArrivals::default().ratio(), None);
		assert_eq!(ObviousArrivals { expected: 4, picked: 3 }.ratio(), Some(0.75));
	}
}
