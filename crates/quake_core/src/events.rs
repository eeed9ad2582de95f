use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

use crate::archive::ArchivedQuake;
use crate::geo::GeoPoint;
use crate::tracker::Earthquake;
use crate::types::{ClusterId, Hypocenter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
	Correctness,
	ObviousArrivals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuakeEvent {
	ClusterCreated { cluster: ClusterId, stations: usize, root: GeoPoint },
	ClusterLevelChanged { cluster: ClusterId, level: u8 },
	ClusterMerged { survivor: ClusterId, absorbed: ClusterId },
	ClusterDissolved { cluster: ClusterId },
	HypocenterUpdated { cluster: ClusterId, hypocenter: Hypocenter },
	HypocenterRejected { cluster: ClusterId, reason: RejectReason, correctness: f64 },
	EarthquakeCreated { quake: Earthquake },
	EarthquakeRevised { quake: Earthquake },
	EarthquakeArchived { quake: ArchivedQuake },
}

impl QuakeEvent {
	#[must_use]
	pub const fn kind(&self) -> &'static str {
		match self {
			Self::ClusterCreated { .. } => "cluster_created",
			Self::ClusterLevelChanged { .. } => "cluster_level_changed",
			Self::ClusterMerged { .. } => "cluster_merged",
			Self::ClusterDissolved { .. } => "cluster_dissolved",
			Self::HypocenterUpdated { .. } => "hypocenter_updated",
			Self::HypocenterRejected { .. } => "hypocenter_rejected",
			Self::EarthquakeCreated { .. } => "earthquake_created",
			Self::EarthquakeRevised { .. } => "earthquake_revised",
			Self::EarthquakeArchived { .. } => "earthquake_archived",
		}
	}
}

type Listener = Box<dyn Fn(&QuakeEvent) + Send + Sync>;

/// Fan-out to synchronous listeners and to channel subscribers. Publishing never blocks on a reader.
#[derive(Default)]
pub struct EventBus {
	listeners: RwLock<Vec<Listener>>,
	channels: Mutex<Vec<mpsc::UnboundedSender<QuakeEvent>>>,
}

impl EventBus {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Listeners run on the location loop; keep them short.
	pub fn subscribe(&self, listener: impl Fn(&QuakeEvent) + Send + Sync + 'static) {
		self.listeners.write().push(Box::new(listener));
	}

	#[must_use]
	pub fn channel(&self) -> mpsc::UnboundedReceiver<QuakeEvent> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.channels.lock().push(tx);
		rx
	}

	pub fn publish(&self, event: &QuakeEvent) {
		trace!(kind = event.kind(), "Publishing event");

		for listener in self.listeners.read().iter() {
			listener(event);
		}

		// closed receivers are dropped here
		self.channels.lock().retain(|tx| tx.send(event.clone()).is_ok());
	}

	pub fn publish_all(&self, events: impl IntoIterator<Item = QuakeEvent>) {
		for event in events {
			self.publish(&event);
		}
	}
}
