use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, interval_at};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::archive::ArchiveTarget;
use crate::cluster::ClusterEngine;
use crate::config::{ConfigHandle, SchedulerConfig};
use crate::error::FatalError;
use crate::events::EventBus;
use crate::geo::GeoPoint;
use crate::locator::{self, Locator};
use crate::station::StationRegistry;
use crate::tracker::{Earthquake, EarthquakeTracker, TrackerContext};
use crate::travel_time::TravelTimeModel;
use crate::types::{ClusterId, Hypocenter, Millis, PickMessage, StationId, current_millis};

/// Detector activity of one station since the last peak reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationSummary {
	pub index: usize,
	pub id: StationId,
	pub peak_ratio: f64,
	pub peak_velocity: f64,
	pub in_event: bool,
	pub stale: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterSummary {
	pub id: ClusterId,
	pub stations: usize,
	pub level: u8,
	pub root: GeoPoint,
	pub hypocenter: Option<Hypocenter>,
	pub earthquake: Option<Uuid>,
}

/// Immutable view of the analysis state after a location tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisSnapshot {
	pub generation: u64,
	pub taken_at: Millis,
	pub pending_picks: usize,
	pub stations: Vec<StationSummary>,
	pub clusters: Vec<ClusterSummary>,
	pub earthquakes: Vec<Earthquake>,
}

struct AnalysisState {
	engine: ClusterEngine,
	tracker: EarthquakeTracker,
}

pub struct AnalysisContext {
	pub config: Arc<ConfigHandle>,
	pub stations: Arc<StationRegistry>,
	pub model: Arc<dyn TravelTimeModel>,
	pub locator: Arc<dyn Locator>,
	pub events: Arc<EventBus>,
	pub archive: Arc<dyn ArchiveTarget>,
	/// Picks submitted from outside the detectors, e.g. a replay.
	submitted: Mutex<Vec<PickMessage>>,
	state: Mutex<AnalysisState>,
	housekeeping_due: AtomicBool,
	last_config_poll: AtomicI64,
	generation: AtomicU64,
	snapshots: watch::Sender<Arc<AnalysisSnapshot>>,
}

impl AnalysisContext {
	#[must_use]
	pub fn new(
		config: Arc<ConfigHandle>,
		stations: Arc<StationRegistry>,
		model: Arc<dyn TravelTimeModel>,
		archive: Arc<dyn ArchiveTarget>,
	) -> Self {
		let locator = locator::from_config(&config.current().locator);
		info!(backend = locator.name(), stations = stations.len(), "Analysis context ready");

		Self {
			config,
			stations,
			model,
			locator,
			events: Arc::new(EventBus::new()),
			archive,
			submitted: Mutex::new(Vec::new()),
			state: Mutex::new(AnalysisState { engine: ClusterEngine::new(), tracker: EarthquakeTracker::default() }),
			housekeeping_due: AtomicBool::new(false),
			last_config_poll: AtomicI64::new(0),
			generation: AtomicU64::new(0),
			snapshots: watch::channel(Arc::new(AnalysisSnapshot::default())).0,
		}
	}

	#[must_use]
	pub fn subscribe(&self) -> watch::Receiver<Arc<AnalysisSnapshot>> {
		self.snapshots.subscribe()
	}

	#[must_use]
	pub fn snapshot(&self) -> Arc<AnalysisSnapshot> {
		Arc::clone(&self.snapshots.borrow())
	}

	pub fn submit_picks(&self, picks: impl IntoIterator<Item = PickMessage>) {
		self.submitted.lock().extend(picks);
	}

	/// Detector pass over every station.
	pub fn fast_tick(&self, now: Millis) -> Result<usize, FatalError> {
		let cfg = self.config.current();
		self.stations.analyse_all(&cfg.detector, now)
	}

	/// Station bookkeeping, configuration polling and a housekeeping request for the location loop.
	pub fn second_tick(&self, now: Millis) -> anyhow::Result<()> {
		let cfg = self.config.current();
		self.stations.second_all(&cfg.detector, now, true);
		self.housekeeping_due.store(true, Ordering::Release);

		let poll_ms = self.config.poll_period().as_millis() as Millis;
		if now - self.last_config_poll.load(Ordering::Acquire) >= poll_ms {
			self.last_config_poll.store(now, Ordering::Release);
			self.config.reload_if_changed().context("Configuration reload failed")?;
		}

		Ok(())
	}

	/// Clustering, location and tracking. Returns the number of events published.
	pub fn location_tick(&self, now: Millis) -> usize {
		let cfg = self.config.current();

		let mut picks = self.stations.drain_picks();
		picks.append(&mut self.submitted.lock());
		let stations = self.station_summaries();

		let mut state = self.state.lock();
		let AnalysisState { engine, tracker } = &mut *state;

		engine.ingest(picks);
		let mut events = engine.tick(&cfg.cluster, cfg.locator.inaccuracy_threshold_ms, self.model.as_ref(), now);

		let ctx = TrackerContext { locator: self.locator.as_ref(), model: self.model.as_ref(), stations: &self.stations };
		events.extend(tracker.tick(engine, &ctx, &cfg, now));

		if self.housekeeping_due.swap(false, Ordering::AcqRel) {
			events.extend(tracker.housekeeping(engine, self.archive.as_ref(), &cfg.tracker, now));
		}

		let snapshot = AnalysisSnapshot {
			generation: self.generation.fetch_add(1, Ordering::AcqRel) + 1,
			taken_at: now,
			pending_picks: engine.pending_len(),
			stations,
			clusters: engine
				.clusters()
				.map(|c| ClusterSummary {
					id: c.id,
					stations: c.len(),
					level: c.level(),
					root: c.root(),
					hypocenter: c.previous_hypocenter.clone(),
					earthquake: c.earthquake,
				})
				.collect(),
			earthquakes: tracker.quakes().cloned().collect(),
		};
		drop(state);

		let published = events.len();
		self.events.publish_all(events);
		self.snapshots.send_replace(Arc::new(snapshot));
		published
	}

	fn station_summaries(&self) -> Vec<StationSummary> {
		self.stations
			.iter()
			.map(|s| {
				let activity = s.activity();
				StationSummary {
					index: s.index,
					id: s.id.clone(),
					peak_ratio: activity.peaks.ratio,
					peak_velocity: activity.peaks.velocity,
					in_event: activity.in_event,
					stale: s.is_stale(),
				}
			})
			.collect()
	}

	/// Spawns the fast, second and location loops.
	#[must_use]
	pub fn start(self: &Arc<Self>) -> SchedulerHandle {
		let (shutdown, shutdown_rx) = watch::channel(false);
		let (fatal_tx, fatal) = mpsc::unbounded_channel();

		let loops: [(&'static str, PeriodFn, TickFn); 3] = [
			("fast", |s| Duration::from_millis(s.fast_loop_ms), |ctx, now| ctx.fast_tick(now).map(drop).map_err(Into::into)),
			("second", |s| Duration::from_millis(s.second_loop_ms), Self::second_tick),
			("location", |s| Duration::from_millis(s.location_loop_ms), |ctx, now| {
				ctx.location_tick(now);
				Ok(())
			}),
		];

		let tasks = loops
			.into_iter()
			.map(|(name, period, body)| {
				tokio::spawn(run_loop(name, Arc::clone(self), period, body, shutdown_rx.clone(), fatal_tx.clone()))
			})
			.collect();

		info!("Analysis loops started");
		SchedulerHandle { shutdown, tasks, fatal }
	}
}

type PeriodFn = fn(&SchedulerConfig) -> Duration;
type TickFn = fn(&AnalysisContext, Millis) -> anyhow::Result<()>;

pub struct SchedulerHandle {
	shutdown: watch::Sender<bool>,
	tasks: Vec<JoinHandle<()>>,
	fatal: mpsc::UnboundedReceiver<FatalError>,
}

impl SchedulerHandle {
	/// Resolves with the first fatal error, or `None` once every loop has stopped.
	pub async fn fatal(&mut self) -> Option<FatalError> {
		self.fatal.recv().await
	}

	/// Stops all loops and waits for in-flight ticks to finish.
	pub async fn shutdown(self) {
		let _ = self.shutdown.send(true);

		for result in join_all(self.tasks).await {
			if let Err(e) = result {
				warn!(error = %e, "Loop task ended abnormally");
			}
		}
		info!("Analysis loops stopped");
	}
}

async fn run_loop(
	name: &'static str,
	ctx: Arc<AnalysisContext>,
	period: PeriodFn,
	body: TickFn,
	mut shutdown: watch::Receiver<bool>,
	fatal: mpsc::UnboundedSender<FatalError>,
) {
	let mut current = period(&ctx.config.current().scheduler).max(Duration::from_millis(1));
	let mut ticker = interval(current);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut tick: u64 = 0;

	loop {
		let closed = tokio::select! {
			_ = ticker.tick() => false,
			changed = shutdown.changed() => changed.is_err(),
		};
		if closed || *shutdown.borrow() {
			break;
		}

		tick += 1;
		let worker = Arc::clone(&ctx);
		match tokio::task::spawn_blocking(move || body(&worker, current_millis())).await {
			Ok(Ok(())) => {},
			Ok(Err(e)) => match e.downcast::<FatalError>() {
				Ok(fatal_error) => {
					error!(task = name, tick, error = %fatal_error, "Fatal error, stopping loop");
					let _ = fatal.send(fatal_error);
					break;
				},
				Err(e) => error!(task = name, tick, error = %e, "Tick failed"),
			},
			Err(e) if e.is_panic() => error!(task = name, tick, "Tick panicked"),
			Err(e) => {
				warn!(task = name, tick, error = %e, "Tick cancelled");
				break;
			},
		}

		let next = period(&ctx.config.current().scheduler).max(Duration::from_millis(1));
		if next != current {
			info!(task = name, period_ms = next.as_millis() as u64, "Loop period changed");
			current = next;
			ticker = interval_at(Instant::now() + next, next);
			ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		}
	}

	debug!(task = name, ticks = tick, "Loop stopped");
}
