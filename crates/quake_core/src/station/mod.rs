pub mod detector;
pub mod filter;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::config::{DetectorConfig, StationConfig, StationSource};
use crate::error::{FatalError, RecordError};
use crate::geo::GeoPoint;
use crate::station::detector::{OnsetPicker, Peaks, StaLtaPicker, Trigger};
use crate::types::{Millis, PickId, PickMessage, PickedEvent, StationId};

/// Raw payload an ingestion source hands over without decoding it first.
pub trait EncodedRecord: Send {
	fn decode(&self) -> anyhow::Result<Vec<i32>>;
}

pub enum RecordSamples {
	Decoded(Vec<i32>),
	Encoded(Box<dyn EncodedRecord>),
}

pub struct DataRecord {
	pub start_ms: Millis,
	pub sample_rate: f64,
	pub samples: RecordSamples,
}

impl DataRecord {
	#[must_use]
	pub const fn decoded(start_ms: Millis, sample_rate: f64, samples: Vec<i32>) -> Self {
		Self { start_ms, sample_rate, samples: RecordSamples::Decoded(samples) }
	}
}

struct StationState {
	picker: Box<dyn OnsetPicker>,
	sample_rate: Option<f64>,
	/// Timestamp the next sample is expected at.
	next_sample_ms: Option<Millis>,
	last_received_ms: Option<Millis>,
	buffer: VecDeque<(Millis, i32)>,
	next_seq: u64,
	open_pick: Option<PickId>,
	/// Messages produced by the current pass, flushed to the outbox when it ends.
	produced: Vec<PickMessage>,
	triggers: Vec<Trigger>,
}

/// Detector activity as of the last fast-loop pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StationActivity {
	pub peaks: Peaks,
	pub in_event: bool,
}

pub struct Station {
	pub index: usize,
	pub id: StationId,
	pub location: GeoPoint,
	pub source: StationSource,
	inbox: Mutex<Vec<DataRecord>>,
	outbox: Mutex<Vec<PickMessage>>,
	activity: Mutex<StationActivity>,
	stale: AtomicBool,
	state: Mutex<StationState>,
}

impl Station {
	#[must_use]
	pub fn new(index: usize, id: StationId, location: GeoPoint, source: StationSource) -> Self {
		let picker: Box<dyn OnsetPicker> = match source {
			StationSource::Seedlink { .. } => Box::new(StaLtaPicker::new()),
			StationSource::Synthetic => Box::new(StaLtaPicker::without_warmup()),
		};

		Self {
			index,
			id,
			location,
			source,
			inbox: Mutex::new(Vec::new()),
			outbox: Mutex::new(Vec::new()),
			activity: Mutex::new(StationActivity::default()),
			stale: AtomicBool::new(true),
			state: Mutex::new(StationState {
				picker,
				sample_rate: None,
				next_sample_ms: None,
				last_received_ms: None,
				buffer: VecDeque::new(),
				next_seq: 0,
				open_pick: None,
				produced: Vec::new(),
				triggers: Vec::new(),
			}),
		}
	}

	#[must_use]
	pub fn from_config(index: usize, cfg: &StationConfig) -> Self {
		Self::new(index, cfg.id.clone(), GeoPoint::new(cfg.lat, cfg.lon), cfg.source.clone())
	}

	/// Called by ingestion. Never blocks on analysis.
	pub fn deposit(&self, record: DataRecord) {
		self.inbox.lock().push(record);
	}

	/// Runs the detector over every deposited record. Returns how many records were analysed.
	pub fn analyse(&self, cfg: &DetectorConfig, now: Millis) -> Result<usize, FatalError> {
		let records = std::mem::take(&mut *self.inbox.lock());
		if records.is_empty() {
			return Ok(0);
		}

		let mut state = self.state.lock();
		let mut analysed = 0;

		for record in records {
			if record.start_ms > now + cfg.max_future_ms {
				debug!(station = %self.id, start = record.start_ms, "Dropping record from the future");
				continue;
			}

			if state.next_sample_ms.is_some_and(|next| record.start_ms < next - cfg.gap_threshold_ms) {
				debug!(station = %self.id, start = record.start_ms, "Dropping out-of-order record");
				continue;
			}

			let samples = match self.decode(record.samples, record.sample_rate) {
				Ok(samples) => samples,
				Err(e) => {
					warn!(station = %self.id, error = %e, "Skipping record");
					continue;
				},
			};

			self.check_continuity(&mut state, cfg, record.start_ms, record.sample_rate);
			self.run_picker(&mut state, cfg, record.start_ms, record.sample_rate, &samples)?;

			state.sample_rate = Some(record.sample_rate);
			state.next_sample_ms =
				Some(record.start_ms + (samples.len() as f64 * 1000.0 / record.sample_rate).round() as Millis);
			state.last_received_ms = Some(now);
			self.stale.store(false, Ordering::Release);
			analysed += 1;
		}

		if !state.produced.is_empty() {
			self.outbox.lock().append(&mut state.produced);
		}
		*self.activity.lock() = StationActivity { peaks: state.picker.peaks(), in_event: state.picker.in_event() };

		Ok(analysed)
	}

	fn decode(&self, samples: RecordSamples, sample_rate: f64) -> Result<Vec<i32>, RecordError> {
		if !(sample_rate.is_finite() && sample_rate > 0.0) {
			return Err(RecordError::SampleRate { station: self.id.to_string(), sample_rate });
		}

		match samples {
			RecordSamples::Decoded(samples) => Ok(samples),
			RecordSamples::Encoded(raw) => {
				raw.decode().map_err(|source| RecordError::Decode { station: self.id.to_string(), source })
			},
		}
	}

	fn check_continuity(&self, state: &mut StationState, cfg: &DetectorConfig, start_ms: Millis, sample_rate: f64) {
		let rate_changed =
			state.sample_rate.is_some_and(|previous| (previous - sample_rate).abs() > cfg.sample_rate_tolerance);
		let gap = state.next_sample_ms.map_or(0, |next| start_ms - next);

		if rate_changed || gap > cfg.gap_threshold_ms {
			debug!(station = %self.id, rate_changed, gap_ms = gap, "Resetting detector");
			state.picker.reset();
			state.buffer.clear();
			state.open_pick = None;
		}
	}

	fn run_picker(
		&self,
		state: &mut StationState,
		cfg: &DetectorConfig,
		start_ms: Millis,
		sample_rate: f64,
		samples: &[i32],
	) -> Result<(), FatalError> {
		state.buffer.try_reserve(samples.len()).map_err(|_| FatalError::Allocation {
			what: "station waveform buffer",
			bytes: samples.len() * size_of::<(Millis, i32)>(),
		})?;
		let step = 1000.0 / sample_rate;
		state.buffer.extend(samples.iter().enumerate().map(|(i, s)| (start_ms + (i as f64 * step) as Millis, *s)));

		let mut triggers = std::mem::take(&mut state.triggers);
		triggers.clear();
		state.picker.process(cfg, start_ms, sample_rate, samples, &mut triggers);

		for trigger in &triggers {
			match *trigger {
				Trigger::Onset { time, ratio, amplitude } => {
					let id = PickId { station: self.index, seq: state.next_seq };
					state.next_seq += 1;
					state.open_pick = Some(id);
					state.produced.push(PickMessage::New(PickedEvent {
						id,
						station: self.id.clone(),
						lat: self.location.lat,
						lon: self.location.lon,
						time,
						trigger_ratio: ratio,
						amplitude,
					}));
					debug!(station = %self.id, ratio, "Onset picked");
				},
				Trigger::Peak { ratio, amplitude } => {
					if let Some(id) = state.open_pick {
						state.produced.push(PickMessage::Peak { id, ratio, amplitude });
					}
				},
				Trigger::Release { .. } => state.open_pick = None,
			}
		}

		state.triggers = triggers;
		Ok(())
	}

	/// Per-second bookkeeping: trims the waveform buffer and tracks staleness.
	pub fn second(&self, cfg: &DetectorConfig, now: Millis, reset_peaks: bool) {
		let mut state = self.state.lock();

		let keep_from = now - (cfg.buffer_secs * 1000) as Millis;
		while state.buffer.front().is_some_and(|(t, _)| *t < keep_from) {
			state.buffer.pop_front();
		}

		let stale = state.last_received_ms.is_none_or(|t| now - t > (cfg.stale_after_secs * 1000) as Millis);
		let was_stale = self.stale.swap(stale, Ordering::AcqRel);
		if stale && !was_stale {
			warn!(station = %self.id, "Station stopped delivering data");
		}

		if reset_peaks {
			state.picker.reset_peaks();
			self.activity.lock().peaks = Peaks::default();
		}
	}

	/// Never waits on a running detector pass.
	#[must_use]
	pub fn drain_picks(&self) -> Vec<PickMessage> {
		std::mem::take(&mut *self.outbox.lock())
	}

	#[must_use]
	pub fn activity(&self) -> StationActivity {
		*self.activity.lock()
	}

	#[must_use]
	pub fn is_stale(&self) -> bool {
		self.stale.load(Ordering::Acquire)
	}

	#[must_use]
	pub fn buffered_samples(&self) -> usize {
		self.state.lock().buffer.len()
	}
}

/// Stations selected by the configuration, indexed by [`PickId::station`].
#[derive(Default)]
pub struct StationRegistry {
	stations: Vec<Arc<Station>>,
}

impl StationRegistry {
	#[must_use]
	pub fn from_config(stations: &[StationConfig]) -> Self {
		Self { stations: stations.iter().enumerate().map(|(i, cfg)| Arc::new(Station::from_config(i, cfg))).collect() }
	}

	pub fn push(&mut self, id: StationId, location: GeoPoint, source: StationSource) -> Arc<Station> {
		let station = Arc::new(Station::new(self.stations.len(), id, location, source));
		self.stations.push(Arc::clone(&station));
		station
	}

	#[must_use]
	pub fn get(&self, index: usize) -> Option<&Arc<Station>> {
		self.stations.get(index)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.stations.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.stations.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = &Arc<Station>> {
		self.stations.iter()
	}

	/// Fast-loop body: every station in parallel. Returns the number of records analysed.
	pub fn analyse_all(&self, cfg: &DetectorConfig, now: Millis) -> Result<usize, FatalError> {
		self.stations.par_iter().map(|s| s.analyse(cfg, now)).try_reduce(|| 0, |a, b| Ok(a + b))
	}

	pub fn second_all(&self, cfg: &DetectorConfig, now: Millis, reset_peaks: bool) {
		self.stations.par_iter().for_each(|s| s.second(cfg, now, reset_peaks));
	}

	#[must_use]
	pub fn drain_picks(&self) -> Vec<PickMessage> {
		self.stations.iter().flat_map(|s| s.drain_picks()).collect()
	}
}

#[cfg(test)]
mod tests {
	use std::f64::consts::PI;

	use super::*;

	const FS: f64 = 20.0;

	struct Corrupt;

	impl EncodedRecord for Corrupt {
		fn decode(&self) -> anyhow::Result<Vec<i32>> {
			anyhow::bail!("bad steim frame")
		}
	}

	fn station() -> Station {
		Station::new(0, StationId::new("XX", "T1", "", "HHZ"), GeoPoint::new(1.0, 2.0), StationSource::Synthetic)
	}

	fn quiet(n: usize) -> Vec<i32> {
		(0..n).map(|i| 500 + if i % 2 == 0 { 10 } else { -10 }).collect()
	}

	fn loud(n: usize) -> Vec<i32> {
		(0..n).map(|i| 500 + (8000.0 * (2.0 * PI * 3.0 * i as f64 / FS).sin()) as i32).collect()
	}

	fn deposit_seconds(station: &Station, from_sec: i64, seconds: i64, f: fn(usize) -> Vec<i32>) {
		for s in from_sec..from_sec + seconds {
			station.deposit(DataRecord::decoded(s * 1000, FS, f(FS as usize)));
		}
	}

	#[test]
	fn onset_becomes_pick_with_station_identity() {
		let cfg = DetectorConfig::default();
		let station = station();

		deposit_seconds(&station, 0, 30, quiet);
		deposit_seconds(&station, 30, 5, loud);
		assert_eq!(station.analyse(&cfg, 40_000).unwrap(), 35);

		let picks = station.drain_picks();
		let PickMessage::New(pick) = &picks[0] else { panic!("expected a new pick, got {picks:?}") };
		assert_eq!(pick.id, PickId { station: 0, seq: 0 });
		assert_eq!(pick.station.station, "T1");
		assert!((pick.lat - 1.0).abs() < f64::EPSILON);
		assert!(pick.time >= 30_000);
		assert!(picks[1..].iter().all(|m| matches!(m, PickMessage::Peak { id, .. } if id.seq == 0)));
		assert!(station.drain_picks().is_empty());
	}

	#[test]
	fn decode_failure_skips_only_that_record() {
		let cfg = DetectorConfig::default();
		let station = station();

		station.deposit(DataRecord::decoded(0, FS, quiet(20)));
		station.deposit(DataRecord { start_ms: 1000, sample_rate: FS, samples: RecordSamples::Encoded(Box::new(Corrupt)) });
		station.deposit(DataRecord::decoded(1000, FS, quiet(20)));

		assert_eq!(station.analyse(&cfg, 2000).unwrap(), 2);
		assert_eq!(station.buffered_samples(), 40);
	}

	#[test]
	fn future_and_out_of_order_records_are_dropped() {
		let cfg = DetectorConfig::default();
		let station = station();

		station.deposit(DataRecord::decoded(100_000, FS, quiet(20)));
		station.deposit(DataRecord::decoded(10_000, FS, quiet(20)));
		station.deposit(DataRecord::decoded(500_000, FS, quiet(20)));

		assert_eq!(station.analyse(&cfg, 100_000).unwrap(), 1);
	}

	#[test]
	fn gap_resets_detector_and_buffer() {
		let cfg = DetectorConfig::default();
		let station = station();

		deposit_seconds(&station, 0, 3, quiet);
		station.analyse(&cfg, 3000).unwrap();
		assert_eq!(station.buffered_samples(), 60);

		station.deposit(DataRecord::decoded(10_000, FS, quiet(20)));
		station.analyse(&cfg, 11_000).unwrap();
		assert_eq!(station.buffered_samples(), 20);
	}

	#[test]
	fn second_trims_buffer_and_flags_stale_station() {
		let cfg = DetectorConfig { buffer_secs: 2, stale_after_secs: 5, ..DetectorConfig::default() };
		let station = station();
		assert!(station.is_stale());

		deposit_seconds(&station, 0, 4, quiet);
		station.analyse(&cfg, 4000).unwrap();
		station.second(&cfg, 4000, false);
		assert!(!station.is_stale());
		assert_eq!(station.buffered_samples(), 40);

		station.second(&cfg, 10_000, false);
		assert!(station.is_stale());
	}

	#[test]
	fn activity_follows_the_detector() {
		let cfg = DetectorConfig::default();
		let station = station();
		assert_eq!(station.activity(), StationActivity::default());

		deposit_seconds(&station, 0, 30, quiet);
		deposit_seconds(&station, 30, 5, loud);
		station.analyse(&cfg, 40_000).unwrap();

		let activity = station.activity();
		assert!(activity.in_event);
		assert!(activity.peaks.ratio >= cfg.event_threshold);
		assert!(activity.peaks.velocity > 0.0);

		station.second(&cfg, 40_000, true);
		let activity = station.activity();
		assert_eq!(activity.peaks, Peaks::default());
		assert!(activity.in_event);
	}

	#[test]
	fn draining_picks_does_not_need_the_detector_state() {
		let cfg = DetectorConfig::default();
		let station = station();
		deposit_seconds(&station, 0, 30, quiet);
		deposit_seconds(&station, 30, 5, loud);
		station.analyse(&cfg, 40_000).unwrap();

		let _busy = station.state.lock();
		assert!(!station.drain_picks().is_empty());
		assert!(!station.is_stale());
	}

	#[test]
	fn registry_analyses_in_parallel() {
		let configs: Vec<StationConfig> = (0..8)
			.map(|i| StationConfig {
				id: StationId::new("XX", &format!("S{i}"), "", "HHZ"),
				lat: f64::from(i),
				lon: 0.0,
				alt: 0.0,
				source: StationSource::Synthetic,
			})
			.collect();
		let registry = StationRegistry::from_config(&configs);

		for station in registry.iter() {
			deposit_seconds(station, 0, 2, quiet);
		}

		assert_eq!(registry.analyse_all(&DetectorConfig::default(), 2000).unwrap(), 16);
		assert_eq!(registry.get(3).map(|s| s.index), Some(3));
	}
}
