pub mod intensity;
pub mod magnitude;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveTarget, ArchivedQuake};
use crate::cluster::{Cluster, ClusterEngine};
use crate::config::{AnalysisConfig, TrackerConfig};
use crate::events::{QuakeEvent, RejectReason};
use crate::geo::angular_distance;
use crate::locator::{LocateOutcome, Locator};
use crate::station::StationRegistry;
use crate::travel_time::TravelTimeModel;
use crate::types::{ClusterId, Hypocenter, Millis, ObviousArrivals};

use intensity::CityIntensity;
use magnitude::MagnitudeReading;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Earthquake {
	pub uuid: Uuid,
	pub cluster: ClusterId,
	pub hypocenter: Hypocenter,
	/// Starts at 1 and grows by one per published revision.
	pub revision: u32,
	pub magnitude: Option<f64>,
	pub readings: Vec<MagnitudeReading>,
	pub region: String,
	pub cities: Vec<CityIntensity>,
	pub created_ms: Millis,
	pub updated_ms: Millis,
}

pub trait RegionResolver: Send + Sync {
	fn resolve(&self, lat: f64, lon: f64) -> String;
}

/// Fallback naming by coordinates.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinateRegion;

impl RegionResolver for CoordinateRegion {
	fn resolve(&self, lat: f64, lon: f64) -> String {
		let ns = if lat >= 0.0 { 'N' } else { 'S' };
		let ew = if lon >= 0.0 { 'E' } else { 'W' };
		format!("{:.3}°{ns} {:.3}°{ew}", lat.abs(), lon.abs())
	}
}

/// What the tracker needs from the rest of the pipeline for one pass.
pub struct TrackerContext<'a> {
	pub locator: &'a dyn Locator,
	pub model: &'a dyn TravelTimeModel,
	pub stations: &'a StationRegistry,
}

pub struct EarthquakeTracker {
	quakes: BTreeMap<ClusterId, Earthquake>,
	region: Box<dyn RegionResolver>,
}

impl Default for EarthquakeTracker {
	fn default() -> Self {
		Self::new(Box::new(CoordinateRegion))
	}
}

impl EarthquakeTracker {
	#[must_use]
	pub fn new(region: Box<dyn RegionResolver>) -> Self {
		Self { quakes: BTreeMap::new(), region }
	}

	pub fn quakes(&self) -> impl Iterator<Item = &Earthquake> {
		self.quakes.values()
	}

	#[must_use]
	pub fn get(&self, cluster: ClusterId) -> Option<&Earthquake> {
		self.quakes.get(&cluster)
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.quakes.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.quakes.is_empty()
	}

	/// Locates every cluster whose picks changed since its last location and publishes the results.
	/// Bound earthquakes whose stations reported larger peaks get their magnitude refreshed.
	pub fn tick(
		&mut self,
		engine: &mut ClusterEngine,
		ctx: &TrackerContext<'_>,
		cfg: &AnalysisConfig,
		now: Millis,
	) -> Vec<QuakeEvent> {
		let mut events = Vec::new();

		for id in engine.ids() {
			let Some(cluster) = engine.get_mut(id) else {
				continue;
			};

			let peaks_changed = cluster.take_peaks_changed();
			let published = cluster.needs_location() && self.relocate(cluster, ctx, cfg, now, &mut events);
			if peaks_changed && !published {
				self.refresh_magnitude(cluster, cfg, now, &mut events);
			}
		}

		events
	}

	/// Returns whether an earthquake was created or revised.
	fn relocate(
		&mut self,
		cluster: &mut Cluster,
		ctx: &TrackerContext<'_>,
		cfg: &AnalysisConfig,
		now: Millis,
		events: &mut Vec<QuakeEvent>,
	) -> bool {
		let id = cluster.id;
		let outcome = ctx.locator.locate(&cluster.locate_request(), &cfg.locator, ctx.model);
		cluster.mark_located();

		match outcome {
			LocateOutcome::Accepted(mut hypocenter) => {
				let obvious = obvious_arrivals(cluster, &hypocenter, ctx, &cfg.tracker, now);
				hypocenter.obvious_arrivals = Some(obvious);

				if fails_obvious_gate(&obvious, &cfg.tracker) {
					info!(
						cluster = id,
						expected = obvious.expected,
						picked = obvious.picked,
						"Hypocenter rejected, nearby stations saw nothing"
					);
					events.push(QuakeEvent::HypocenterRejected {
						cluster: id,
						reason: RejectReason::ObviousArrivals,
						correctness: hypocenter.correctness,
					});
					return false;
				}

				if cfg.tracker.reduce_revisions
					&& self.quakes.get(&id).is_some_and(|q| near_duplicate(&q.hypocenter, &hypocenter, &cfg.tracker))
				{
					debug!(cluster = id, "Revision suppressed as near duplicate");
					return false;
				}

				debug!(cluster = id, hypocenter = %hypocenter, "Hypocenter updated");
				cluster.previous_hypocenter = Some(hypocenter.clone());
				events.push(QuakeEvent::HypocenterUpdated { cluster: id, hypocenter: hypocenter.clone() });
				self.publish(cluster, hypocenter, cfg, now, events);
				true
			},
			LocateOutcome::Rejected(hypocenter) => {
				debug!(cluster = id, correctness = hypocenter.correctness, "Hypocenter below correctness threshold");
				events.push(QuakeEvent::HypocenterRejected {
					cluster: id,
					reason: RejectReason::Correctness,
					correctness: hypocenter.correctness,
				});
				false
			},
			LocateOutcome::NoSolution => {
				debug!(cluster = id, "No hypocenter solution");
				false
			},
			LocateOutcome::InsufficientStations { available, required } => {
				debug!(cluster = id, available, required, "Not enough stations to locate");
				false
			},
		}
	}

	/// Recomputes the magnitude of a bound earthquake from its picks' current peaks. A change
	/// of the binned magnitude is published as a revision.
	fn refresh_magnitude(&mut self, cluster: &Cluster, cfg: &AnalysisConfig, now: Millis, events: &mut Vec<QuakeEvent>) {
		let Some(quake) = self.quakes.get_mut(&cluster.id) else {
			return;
		};

		let readings = magnitude_readings(cluster, &quake.hypocenter, &cfg.tracker);
		let values: Vec<f64> = readings.iter().map(|r| r.magnitude).collect();
		let magnitude = magnitude::aggregate(&values, cfg.tracker.min_magnitude_readings);
		let binned = |m: Option<f64>| m.map(|m| magnitude::bin(m, cfg.tracker.magnitude_bin));
		let changed = binned(magnitude) != binned(quake.magnitude);

		quake.readings = readings;
		quake.magnitude = magnitude;
		if !changed {
			return;
		}

		quake.cities = magnitude.map(|m| intensity::for_cities(&cfg.cities, &quake.hypocenter, m)).unwrap_or_default();
		quake.revision += 1;
		quake.updated_ms = now;

		info!(uuid = %quake.uuid, revision = quake.revision, magnitude = ?quake.magnitude, "Earthquake magnitude revised");
		events.push(QuakeEvent::EarthquakeRevised { quake: quake.clone() });
	}

	fn publish(
		&mut self,
		cluster: &mut Cluster,
		hypocenter: Hypocenter,
		cfg: &AnalysisConfig,
		now: Millis,
		events: &mut Vec<QuakeEvent>,
	) {
		let readings = magnitude_readings(cluster, &hypocenter, &cfg.tracker);
		let values: Vec<f64> = readings.iter().map(|r| r.magnitude).collect();
		let magnitude = magnitude::aggregate(&values, cfg.tracker.min_magnitude_readings);
		let cities = magnitude.map(|m| intensity::for_cities(&cfg.cities, &hypocenter, m)).unwrap_or_default();
		let region = self.region.resolve(hypocenter.lat, hypocenter.lon);

		if let Some(quake) = self.quakes.get_mut(&cluster.id) {
			quake.hypocenter = hypocenter;
			quake.revision += 1;
			quake.magnitude = magnitude;
			quake.readings = readings;
			quake.region = region;
			quake.cities = cities;
			quake.updated_ms = now;

			info!(uuid = %quake.uuid, revision = quake.revision, magnitude = ?quake.magnitude, "Earthquake revised");
			events.push(QuakeEvent::EarthquakeRevised { quake: quake.clone() });
			return;
		}

		let quake = Earthquake {
			uuid: Uuid::new_v4(),
			cluster: cluster.id,
			hypocenter,
			revision: 1,
			magnitude,
			readings,
			region,
			cities,
			created_ms: now,
			updated_ms: now,
		};
		cluster.earthquake = Some(quake.uuid);

		info!(
			uuid = %quake.uuid,
			cluster = cluster.id,
			region = %quake.region,
			magnitude = ?quake.magnitude,
			hypocenter = %quake.hypocenter,
			"Earthquake created"
		);
		events.push(QuakeEvent::EarthquakeCreated { quake: quake.clone() });
		self.quakes.insert(cluster.id, quake);
	}

	/// Ends tracking of quakes past their retention and of quakes whose cluster disappeared.
	pub fn housekeeping(
		&mut self,
		engine: &mut ClusterEngine,
		archive: &dyn ArchiveTarget,
		cfg: &TrackerConfig,
		now: Millis,
	) -> Vec<QuakeEvent> {
		let mut events = Vec::new();

		let expired: Vec<ClusterId> = self
			.quakes
			.values()
			.filter(|q| engine.get(q.cluster).is_none() || now - q.updated_ms > retention_ms(q, cfg))
			.map(|q| q.cluster)
			.collect();

		for cluster in expired {
			self.dissolve(engine, cluster, archive, now, &mut events);
		}

		events
	}

	/// Removes the cluster and archives its earthquake. A quake is archived at most once.
	pub fn dissolve(
		&mut self,
		engine: &mut ClusterEngine,
		cluster: ClusterId,
		archive: &dyn ArchiveTarget,
		now: Millis,
		events: &mut Vec<QuakeEvent>,
	) {
		if engine.dissolve(cluster).is_some() {
			events.push(QuakeEvent::ClusterDissolved { cluster });
		}

		let Some(quake) = self.quakes.remove(&cluster) else {
			return;
		};

		let archived = ArchivedQuake::from_earthquake(&quake, now);
		if archived.magnitude.is_none() {
			warn!(uuid = %archived.uuid, "Archiving earthquake without a magnitude");
		}
		archive.archive(archived.clone());
		events.push(QuakeEvent::EarthquakeArchived { quake: archived });
	}
}

fn retention_ms(quake: &Earthquake, cfg: &TrackerConfig) -> Millis {
	let magnitude = quake.magnitude.unwrap_or(0.0).max(0.0);
	let secs = cfg.retention_base_secs as f64 + cfg.retention_per_magnitude_secs as f64 * magnitude;
	(secs * 1000.0) as Millis
}

fn near_duplicate(old: &Hypocenter, new: &Hypocenter, cfg: &TrackerConfig) -> bool {
	old.epicenter().distance_km(&new.epicenter()) <= cfg.duplicate_distance_km
		&& (old.origin - new.origin).abs() <= cfg.duplicate_origin_ms
		&& (old.depth_km - new.depth_km).abs() <= cfg.duplicate_depth_km
}

/// Stations close to the epicentre whose P arrival is well in the past, and how many of them picked.
fn obvious_arrivals(
	cluster: &Cluster,
	hypocenter: &Hypocenter,
	ctx: &TrackerContext<'_>,
	cfg: &TrackerConfig,
	now: Millis,
) -> ObviousArrivals {
	let mut obvious = ObviousArrivals::default();

	for station in ctx.stations.iter() {
		if station.is_stale() {
			continue;
		}
		let at = station.location;
		if hypocenter.epicenter().distance_km(&at) > cfg.obvious_radius_km {
			continue;
		}

		let tt = ctx.model.p_wave(hypocenter.depth_km, angular_distance(hypocenter.lat, hypocenter.lon, at.lat, at.lon));
		if tt < 0.0 {
			continue;
		}

		let arrival = hypocenter.origin + (tt * 1000.0) as Millis;
		if arrival + cfg.obvious_margin_ms < now {
			obvious.expected += 1;
			if cluster.contains_station(station.index) {
				obvious.picked += 1;
			}
		}
	}

	obvious
}

fn fails_obvious_gate(obvious: &ObviousArrivals, cfg: &TrackerConfig) -> bool {
	obvious.expected >= cfg.obvious_min_expected && obvious.ratio().is_some_and(|r| r < cfg.obvious_min_ratio)
}

fn magnitude_readings(cluster: &Cluster, hypocenter: &Hypocenter, cfg: &TrackerConfig) -> Vec<MagnitudeReading> {
	let window = (cfg.magnitude_window_secs * 1000) as Millis;

	cluster
		.picks()
		.filter(|p| p.peak_amplitude > 0.0)
		.filter(|p| (0..=window).contains(&(p.event.time - hypocenter.origin)))
		.map(|p| {
			let hypocentral_km = hypocenter.epicenter().distance_km(&p.event.location()).hypot(hypocenter.depth_km);
			MagnitudeReading {
				station: p.event.station.clone(),
				magnitude: magnitude::bin(magnitude::local_magnitude(p.peak_amplitude, hypocentral_km), cfg.magnitude_bin),
				hypocentral_km,
			}
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;

	use super::*;
	use crate::archive::EarthquakeArchive;
	use crate::cluster::AssignedPick;
	use crate::config::{CityConfig, LocatorConfig, StationSource};
	use crate::geo::move_on_globe;
	use crate::locator::{CpuLocator, LocateRequest};
	use crate::station::DataRecord;
	use crate::synthetic::{Scenario, ScenarioParams};
	use crate::travel_time::SphericalModel;
	use crate::types::{PickId, PickMessage, PickedEvent, StationId};

	fn config() -> AnalysisConfig {
		let mut cfg = AnalysisConfig::default();
		cfg.locator.depth_fix_allowed = false;
		cfg.cities = vec![CityConfig { name: "Near".into(), lat: 5.5, lon: 145.5 }];
		cfg
	}

	struct Pipeline {
		model: SphericalModel,
		stations: StationRegistry,
		archive: Mutex<EarthquakeArchive>,
	}

	impl Pipeline {
		fn new(scenario: &Scenario) -> Self {
			Self {
				model: SphericalModel::default(),
				stations: StationRegistry::from_config(&scenario.stations),
				archive: Mutex::new(EarthquakeArchive::new(10)),
			}
		}

		fn ctx(&self) -> TrackerContext<'_> {
			TrackerContext { locator: &CpuLocator, model: &self.model, stations: &self.stations }
		}
	}

	fn created(events: &[QuakeEvent]) -> Option<&Earthquake> {
		events.iter().find_map(|e| match e {
			QuakeEvent::EarthquakeCreated { quake } => Some(quake),
			_ => None,
		})
	}

	/// Picks whose times are far off any consistent origin, on fresh stations.
	fn bad_picks(scenario: &Scenario, count: usize) -> Vec<PickedEvent> {
		scenario
			.picks
			.iter()
			.cycle()
			.take(count)
			.enumerate()
			.map(|(i, p)| {
				let sign: Millis = if i % 2 == 0 { 1 } else { -1 };
				PickedEvent {
					id: PickId { station: 1000 + i, seq: 0 },
					time: p.time + sign * (40_000 + i as Millis * 2_500),
					..p.clone()
				}
			})
			.collect()
	}

	#[test]
	fn accepted_location_creates_an_earthquake() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		let id = engine.insert(scenario.picks.clone(), now);
		let events = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);

		let quake = created(&events).expect("earthquake created");
		assert_eq!(quake.revision, 1);
		assert_eq!(quake.cluster, id);
		assert!(quake.hypocenter.epicenter().distance_km(&scenario.params.epicenter) < 100.0);
		assert_eq!(engine.get(id).and_then(|c| c.earthquake), Some(quake.uuid));
		assert!(engine.get(id).is_some_and(|c| c.previous_hypocenter.is_some()));
	}

	#[test]
	fn magnitude_recovers_the_synthetic_value() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 12, ..ScenarioParams::default() }, &SphericalModel::default(), 7);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		engine.insert(scenario.picks.clone(), now);
		let events = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);
		let quake = created(&events).unwrap();

		let m = quake.magnitude.unwrap();
		assert!((m - scenario.params.magnitude).abs() < 0.5, "magnitude {m}");
		assert_eq!(quake.cities.len(), 1);
		assert!(quake.cities[0].mmi >= 1.0);
	}

	#[test]
	fn rejected_relocation_keeps_previous_hypocenter() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		let id = engine.insert(scenario.picks.clone(), now);
		let first = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);
		let quake = created(&first).unwrap().clone();

		let cluster = engine.get_mut(id).unwrap();
		for pick in bad_picks(&scenario, 20) {
			assert!(cluster.assign(AssignedPick::new(pick), now));
		}

		let second = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 1_000);

		assert!(second.iter().any(|e| matches!(
			e,
			QuakeEvent::HypocenterRejected { reason: RejectReason::Correctness, .. }
		)));
		assert!(!second.iter().any(|e| matches!(e, QuakeEvent::EarthquakeRevised { .. })));
		assert_eq!(tracker.get(id).map(|q| q.revision), Some(1));
		assert_eq!(engine.get(id).and_then(|c| c.previous_hypocenter.clone()), Some(quake.hypocenter.clone()));
	}

	fn revised(events: &[QuakeEvent]) -> Option<&Earthquake> {
		events.iter().find_map(|e| match e {
			QuakeEvent::EarthquakeRevised { quake } => Some(quake),
			_ => None,
		})
	}

	#[test]
	fn later_peak_amplitudes_revise_the_magnitude() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 12, ..ScenarioParams::default() }, &SphericalModel::default(), 7);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		// onsets carry a hundredth of the amplitude the stations reach later
		let onsets = scenario.picks.iter().map(|p| PickedEvent { amplitude: p.amplitude / 100.0, ..p.clone() }).collect();
		let id = engine.insert(onsets, now);
		let first = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);
		let onset_magnitude = created(&first).and_then(|q| q.magnitude).unwrap();
		assert!(onset_magnitude < scenario.params.magnitude - 1.5, "onset magnitude {onset_magnitude}");

		engine.ingest(scenario.picks.iter().map(|p| PickMessage::Peak { id: p.id, ratio: p.trigger_ratio, amplitude: p.amplitude }));
		let second = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 1_000);

		let quake = revised(&second).expect("magnitude revision");
		let peak_magnitude = quake.magnitude.unwrap();
		assert_eq!(quake.revision, 2);
		assert!((peak_magnitude - scenario.params.magnitude).abs() < 0.5, "peak magnitude {peak_magnitude}");
		assert_eq!(quake.updated_ms, now + 1_000);
		assert!(!second.iter().any(|e| matches!(e, QuakeEvent::HypocenterUpdated { .. })));
		assert_eq!(tracker.get(id).and_then(|q| q.magnitude), Some(peak_magnitude));

		// same peaks again: nothing new to report
		engine.ingest(scenario.picks.iter().map(|p| PickMessage::Peak { id: p.id, ratio: p.trigger_ratio, amplitude: p.amplitude }));
		assert!(tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 2_000).is_empty());
	}

	#[test]
	fn suppressed_revision_leaves_cluster_and_quake_in_agreement() {
		let mut cfg = config();
		cfg.tracker.reduce_revisions = true;
		cfg.tracker.duplicate_distance_km = 1000.0;
		cfg.tracker.duplicate_origin_ms = 60_000;
		cfg.tracker.duplicate_depth_km = 500.0;
		let scenario = Scenario::generate(&ScenarioParams { stations: 14, ..ScenarioParams::default() }, &SphericalModel::default(), 9);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		let id = engine.insert(scenario.picks[..10].to_vec(), now);
		let first = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);
		let quake = created(&first).unwrap().clone();

		let cluster = engine.get_mut(id).unwrap();
		for pick in &scenario.picks[10..] {
			cluster.assign(AssignedPick::new(pick.clone()), now);
		}
		let events = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 1_000);

		assert!(events.is_empty(), "{events:?}");
		assert_eq!(tracker.get(id).map(|q| q.revision), Some(1));
		assert_eq!(engine.get(id).and_then(|c| c.previous_hypocenter.clone()), Some(quake.hypocenter));
	}

	#[test]
	fn unchanged_cluster_is_not_relocated() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		engine.insert(scenario.picks.clone(), now);
		tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);

		assert!(tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 300).is_empty());
	}

	#[test]
	fn new_picks_publish_a_revision() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 14, ..ScenarioParams::default() }, &SphericalModel::default(), 9);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		let id = engine.insert(scenario.picks[..10].to_vec(), now);
		tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);

		let cluster = engine.get_mut(id).unwrap();
		for pick in &scenario.picks[10..] {
			cluster.assign(AssignedPick::new(pick.clone()), now);
		}
		let events = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now + 1_000);

		let quake = revised(&events);
		assert_eq!(quake.map(|q| q.revision), Some(2));
		assert_eq!(quake.map(|q| q.hypocenter.counts.total), Some(14));
	}

	#[test]
	fn silent_nearby_stations_reject_the_hypocenter() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let mut pipeline = Pipeline::new(&scenario);
		let now = scenario.params.origin + 600_000;

		// ten more live stations next to the epicentre that never picked anything
		for i in 0..10 {
			let station = pipeline.stations.push(
				StationId::new("XX", &format!("Q{i}"), "", "HHZ"),
				move_on_globe(5.0, 145.0, 50.0 + 10.0 * f64::from(i), 36.0 * f64::from(i)),
				StationSource::Synthetic,
			);
			station.deposit(DataRecord::decoded(now - 2_000, 20.0, vec![0; 40]));
			assert_eq!(station.analyse(&cfg.detector, now).unwrap(), 1);
			assert!(!station.is_stale());
		}

		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();

		let id = engine.insert(scenario.picks.clone(), now);
		let events = tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);

		assert!(events.iter().any(|e| matches!(
			e,
			QuakeEvent::HypocenterRejected { reason: RejectReason::ObviousArrivals, .. }
		)));
		assert!(tracker.get(id).is_none());
		assert!(engine.get(id).is_some_and(|c| c.previous_hypocenter.is_none()));
	}

	#[test]
	fn dissolving_archives_exactly_once() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		let id = engine.insert(scenario.picks.clone(), now);
		tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);

		let mut events = Vec::new();
		tracker.dissolve(&mut engine, id, &pipeline.archive, now, &mut events);
		tracker.dissolve(&mut engine, id, &pipeline.archive, now, &mut events);
		let later = tracker.housekeeping(&mut engine, &pipeline.archive, &cfg.tracker, now + 10_000_000);

		assert!(later.is_empty());
		assert_eq!(pipeline.archive.lock().len(), 1);
		assert_eq!(events.iter().filter(|e| matches!(e, QuakeEvent::EarthquakeArchived { .. })).count(), 1);
		assert_eq!(events.iter().filter(|e| matches!(e, QuakeEvent::ClusterDissolved { .. })).count(), 1);
		assert!(engine.get(id).is_none());
		assert!(tracker.is_empty());
	}

	#[test]
	fn housekeeping_waits_for_retention() {
		let cfg = config();
		let scenario = Scenario::generate(&ScenarioParams { stations: 10, ..ScenarioParams::default() }, &SphericalModel::default(), 3);
		let pipeline = Pipeline::new(&scenario);
		let mut engine = ClusterEngine::new();
		let mut tracker = EarthquakeTracker::default();
		let now = scenario.params.origin + 600_000;

		engine.insert(scenario.picks.clone(), now);
		tracker.tick(&mut engine, &pipeline.ctx(), &cfg, now);
		let retention = tracker.quakes().next().map(|q| retention_ms(q, &cfg.tracker)).unwrap();

		assert!(tracker.housekeeping(&mut engine, &pipeline.archive, &cfg.tracker, now + retention).is_empty());
		let events = tracker.housekeeping(&mut engine, &pipeline.archive, &cfg.tracker, now + retention + 1);
		assert!(events.iter().any(|e| matches!(e, QuakeEvent::EarthquakeArchived { .. })));
		assert_eq!(pipeline.archive.lock().len(), 1);
	}

	#[test]
	fn near_duplicate_revisions_can_be_suppressed() {
		let cfg = TrackerConfig::default();
		let scenario = Scenario::generate(&ScenarioParams::default(), &SphericalModel::default(), 1);
		let h = match CpuLocator.locate(
			&LocateRequest {
				picks: scenario.picks.iter().collect(),
				root: scenario.params.epicenter,
				previous: None,
			},
			&LocatorConfig::default(),
			&SphericalModel::default(),
		) {
			LocateOutcome::Accepted(h) => h,
			other => panic!("unexpected {other:?}"),
		};

		let mut moved = h.clone();
		moved.origin += 200;
		assert!(near_duplicate(&h, &moved, &cfg));
		moved.lat += 1.0;
		assert!(!near_duplicate(&h, &moved, &cfg));
	}

	#[test]
	fn coordinate_region_names() {
		assert_eq!(CoordinateRegion.resolve(-12.3456, 140.1), "12.346°S 140.100°E");
		assert_eq!(CoordinateRegion.resolve(0.0, -0.5), "0.000°N 0.500°W");
	}
}
