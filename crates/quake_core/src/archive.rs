use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::ArchiveConfig;
use crate::tracker::Earthquake;
use crate::tracker::intensity::CityIntensity;
use crate::types::{Hypocenter, Millis, to_datetime};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedQuake {
	pub uuid: Uuid,
	pub revision: u32,
	pub hypocenter: Hypocenter,
	pub magnitude: Option<f64>,
	pub region: String,
	pub cities: Vec<CityIntensity>,
	pub archived_at: DateTime<Utc>,
}

impl ArchivedQuake {
	#[must_use]
	pub fn from_earthquake(quake: &Earthquake, now: Millis) -> Self {
		Self {
			uuid: quake.uuid,
			revision: quake.revision,
			hypocenter: quake.hypocenter.clone(),
			magnitude: quake.magnitude,
			region: quake.region.clone(),
			cities: quake.cities.clone(),
			archived_at: to_datetime(now),
		}
	}

	#[must_use]
	pub const fn origin(&self) -> Millis {
		self.hypocenter.origin
	}
}

/// Receives each earthquake exactly once when its tracking ends.
pub trait ArchiveTarget: Send + Sync {
	fn archive(&self, quake: ArchivedQuake);
}

/// Newest-first by origin time; the oldest origin is evicted at capacity.
#[derive(Debug, Clone, Default)]
pub struct EarthquakeArchive {
	capacity: usize,
	quakes: Vec<ArchivedQuake>,
}

impl EarthquakeArchive {
	#[must_use]
	pub const fn new(capacity: usize) -> Self {
		Self { capacity, quakes: Vec::new() }
	}

	/// Inserts or replaces by uuid. Returns the entry evicted to stay within capacity.
	pub fn insert(&mut self, quake: ArchivedQuake) -> Option<ArchivedQuake> {
		self.quakes.retain(|q| q.uuid != quake.uuid);

		let at = self.quakes.partition_point(|q| q.origin() >= quake.origin());
		self.quakes.insert(at, quake);

		(self.quakes.len() > self.capacity).then(|| self.quakes.pop()).flatten()
	}

	#[must_use]
	pub fn get(&self, uuid: Uuid) -> Option<&ArchivedQuake> {
		self.quakes.iter().find(|q| q.uuid == uuid)
	}

	pub fn iter(&self) -> impl Iterator<Item = &ArchivedQuake> {
		self.quakes.iter()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.quakes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.quakes.is_empty()
	}
}

impl ArchiveTarget for Mutex<EarthquakeArchive> {
	fn archive(&self, quake: ArchivedQuake) {
		self.lock().insert(quake);
	}
}

#[async_trait]
pub trait ArchiveSink: Send + Sync {
	async fn write(&self, quake: &ArchivedQuake) -> anyhow::Result<()>;
}

/// Appends one JSON document per line.
pub struct JsonLinesSink {
	path: PathBuf,
}

impl JsonLinesSink {
	#[must_use]
	pub const fn new(path: PathBuf) -> Self {
		Self { path }
	}
}

#[async_trait]
impl ArchiveSink for JsonLinesSink {
	async fn write(&self, quake: &ArchivedQuake) -> anyhow::Result<()> {
		let mut line = serde_json::to_vec(quake)?;
		line.push(b'\n');

		let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
		file.write_all(&line).await?;
		file.flush().await?;
		Ok(())
	}
}

/// Hands archived quakes to a background task so the location loop never waits on I/O.
#[derive(Clone)]
pub struct ArchiveHandle {
	tx: mpsc::UnboundedSender<ArchivedQuake>,
	archive: Arc<RwLock<EarthquakeArchive>>,
}

impl ArchiveHandle {
	#[must_use]
	pub fn spawn(cfg: &ArchiveConfig) -> (Self, JoinHandle<()>) {
		let sink = cfg.sink_path.clone().map(|path| Arc::new(JsonLinesSink::new(path)) as Arc<dyn ArchiveSink>);
		Self::with_sink(cfg.capacity, sink)
	}

	#[must_use]
	pub fn with_sink(capacity: usize, sink: Option<Arc<dyn ArchiveSink>>) -> (Self, JoinHandle<()>) {
		let (tx, mut rx) = mpsc::unbounded_channel::<ArchivedQuake>();
		let archive = Arc::new(RwLock::new(EarthquakeArchive::new(capacity)));
		let store = Arc::clone(&archive);

		let worker = tokio::spawn(async move {
			while let Some(quake) = rx.recv().await {
				info!(uuid = %quake.uuid, revision = quake.revision, magnitude = ?quake.magnitude, "Archiving earthquake");

				if let Some(evicted) = store.write().insert(quake.clone()) {
					info!(uuid = %evicted.uuid, "Evicted oldest archived earthquake");
				}

				if let Some(sink) = &sink
					&& let Err(e) = sink.write(&quake).await
				{
					error!(uuid = %quake.uuid, error = %e, "Failed to persist archived earthquake");
				}
			}
		});

		(Self { tx, archive }, worker)
	}

	#[must_use]
	pub fn snapshot(&self) -> Vec<ArchivedQuake> {
		self.archive.read().iter().cloned().collect()
	}
}

impl ArchiveTarget for ArchiveHandle {
	fn archive(&self, quake: ArchivedQuake) {
		if let Err(e) = self.tx.send(quake) {
			warn!(uuid = %e.0.uuid, "Archive worker stopped, dropping earthquake");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::StationCounts;

	fn quake(origin: Millis) -> ArchivedQuake {
		ArchivedQuake {
			uuid: Uuid::new_v4(),
			revision: 1,
			hypocenter: Hypocenter {
				lat: 0.0,
				lon: 0.0,
				depth_km: 10.0,
				origin,
				depth_fixed: false,
				depth_interval: None,
				confidence_polygon: Vec::new(),
				counts: StationCounts::default(),
				residual_secs: 0.0,
				correctness: 1.0,
				origin_error_secs: 0.0,
				quality: None,
				obvious_arrivals: None,
			},
			magnitude: Some(5.0),
			region: "test".into(),
			cities: Vec::new(),
			archived_at: to_datetime(origin),
		}
	}

	#[test]
	fn keeps_newest_origins_first_and_evicts_oldest() {
		let mut archive = EarthquakeArchive::new(2);
		assert!(archive.insert(quake(2_000)).is_none());
		assert!(archive.insert(quake(1_000)).is_none());

		let evicted = archive.insert(quake(3_000)).unwrap();
		assert_eq!(evicted.origin(), 1_000);

		let origins: Vec<Millis> = archive.iter().map(ArchivedQuake::origin).collect();
		assert_eq!(origins, vec![3_000, 2_000]);
	}

	#[test]
	fn late_old_quake_is_evicted_immediately() {
		let mut archive = EarthquakeArchive::new(1);
		archive.insert(quake(5_000));
		let late = quake(1_000);
		assert_eq!(archive.insert(late.clone()), Some(late));
		assert_eq!(archive.len(), 1);
	}

	#[test]
	fn same_uuid_replaces() {
		let mut archive = EarthquakeArchive::new(4);
		let mut q = quake(1_000);
		archive.insert(q.clone());
		q.revision = 3;
		archive.insert(q.clone());
		assert_eq!(archive.len(), 1);
		assert_eq!(archive.get(q.uuid).map(|q| q.revision), Some(3));
	}

	#[tokio::test]
	async fn worker_persists_json_lines() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("archive.jsonl");
		let (handle, worker) = ArchiveHandle::with_sink(10, Some(Arc::new(JsonLinesSink::new(path.clone()))));

		handle.archive(quake(1_000));
		handle.archive(quake(2_000));

		// the worker ends once every sender is gone
		let ArchiveHandle { tx, archive } = handle;
		drop(tx);
		worker.await.unwrap();

		assert_eq!(archive.read().len(), 2);
		let written = std::fs::read_to_string(&path).unwrap();
		let lines: Vec<ArchivedQuake> = written.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[0].origin(), 1_000);
	}
}
