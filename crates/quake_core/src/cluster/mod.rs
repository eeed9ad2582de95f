use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{ClusterConfig, LevelBand};
use crate::events::QuakeEvent;
use crate::geo::{angular_distance, centroid, GeoPoint};
use crate::locator::LocateRequest;
use crate::travel_time::TravelTimeModel;
use crate::types::{ClusterId, Hypocenter, Millis, PickId, PickMessage, PickedEvent};

/// A pick together with the peak values its station reported after the onset.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignedPick {
	pub event: Arc<PickedEvent>,
	pub peak_ratio: f64,
	pub peak_amplitude: f64,
}

impl AssignedPick {
	#[must_use]
	pub fn new(event: PickedEvent) -> Self {
		Self { peak_ratio: event.trigger_ratio, peak_amplitude: event.amplitude, event: Arc::new(event) }
	}

	fn raise_peak(&mut self, ratio: f64, amplitude: f64) {
		self.peak_ratio = self.peak_ratio.max(ratio);
		self.peak_amplitude = self.peak_amplitude.max(amplitude);
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
	pub id: ClusterId,
	/// One pick per station, keyed by station index.
	picks: BTreeMap<usize, AssignedPick>,
	root: GeoPoint,
	updates: u64,
	level: u8,
	pub previous_hypocenter: Option<Hypocenter>,
	located_at: Option<u64>,
	last_assignment_ms: Millis,
	/// Set when a member pick's peak amplitude grew.
	peaks_changed: bool,
	pub earthquake: Option<Uuid>,
}

impl Cluster {
	#[must_use]
	pub fn new(id: ClusterId, picks: impl IntoIterator<Item = AssignedPick>, now: Millis) -> Self {
		let mut cluster = Self {
			id,
			picks: BTreeMap::new(),
			root: GeoPoint::new(0.0, 0.0),
			updates: 0,
			level: 0,
			previous_hypocenter: None,
			located_at: None,
			last_assignment_ms: now,
			peaks_changed: false,
			earthquake: None,
		};
		for pick in picks {
			cluster.assign(pick, now);
		}
		cluster.recompute_root();
		cluster
	}

	/// Adds a pick unless its station already contributes one. Returns whether it was taken.
	pub fn assign(&mut self, pick: AssignedPick, now: Millis) -> bool {
		let station = pick.event.id.station;
		if self.picks.contains_key(&station) {
			return false;
		}
		self.picks.insert(station, pick);
		self.updates += 1;
		self.last_assignment_ms = now;
		true
	}

	pub fn picks(&self) -> impl Iterator<Item = &AssignedPick> {
		self.picks.values()
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.picks.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.picks.is_empty()
	}

	#[must_use]
	pub fn contains_station(&self, station: usize) -> bool {
		self.picks.contains_key(&station)
	}

	#[must_use]
	pub const fn root(&self) -> GeoPoint {
		self.root
	}

	#[must_use]
	pub const fn level(&self) -> u8 {
		self.level
	}

	/// Monotonic counter of pick assignments.
	#[must_use]
	pub const fn updates(&self) -> u64 {
		self.updates
	}

	#[must_use]
	pub const fn last_assignment_ms(&self) -> Millis {
		self.last_assignment_ms
	}

	fn raise_peak(&mut self, station: usize, ratio: f64, amplitude: f64) {
		if let Some(pick) = self.picks.get_mut(&station) {
			self.peaks_changed |= amplitude > pick.peak_amplitude;
			pick.raise_peak(ratio, amplitude);
		}
	}

	/// Whether a peak amplitude grew since the last call.
	pub fn take_peaks_changed(&mut self) -> bool {
		std::mem::take(&mut self.peaks_changed)
	}

	#[must_use]
	pub fn needs_location(&self) -> bool {
		self.located_at != Some(self.updates)
	}

	pub const fn mark_located(&mut self) {
		self.located_at = Some(self.updates);
	}

	#[must_use]
	pub fn locate_request(&self) -> LocateRequest<'_> {
		LocateRequest {
			picks: self.picks.values().map(|p| p.event.as_ref()).collect(),
			root: self.root,
			previous: self.previous_hypocenter.as_ref(),
		}
	}

	#[must_use]
	pub fn earliest_pick_ms(&self) -> Option<Millis> {
		self.picks.values().map(|p| p.event.time).min()
	}

	fn recompute_root(&mut self) {
		let points: Vec<GeoPoint> = self.picks.values().map(|p| p.event.location()).collect();
		if let Some(root) = centroid(&points) {
			self.root = root;
		}
	}

	/// Raises the level to what the current peak ratios support. Never lowers it.
	fn update_level(&mut self, bands: &[LevelBand]) -> Option<u8> {
		let reached = bands
			.iter()
			.enumerate()
			.filter(|(_, band)| self.picks.values().filter(|p| p.peak_ratio >= band.min_ratio).count() >= band.min_stations)
			.map(|(i, _)| (i + 1) as u8)
			.max()
			.unwrap_or(0);

		(reached > self.level).then(|| {
			self.level = reached;
			reached
		})
	}
}

/// Whether two picks could come from the same source: close enough, and a time
/// difference a P wave could cover between them.
fn consistent(a: &PickedEvent, b: &PickedEvent, cfg: &ClusterConfig, inaccuracy_ms: f64) -> bool {
	let distance = a.location().distance_km(&b.location());
	if distance > cfg.radius_km {
		return false;
	}
	let max_dt = distance / cfg.min_apparent_velocity_km_s * 1000.0 + inaccuracy_ms;
	((a.time - b.time).abs() as f64) <= max_dt
}

/// Owns every cluster and every not-yet-clustered pick. Single writer: the location loop.
#[derive(Debug, Default)]
pub struct ClusterEngine {
	clusters: BTreeMap<ClusterId, Cluster>,
	pending: BTreeMap<PickId, AssignedPick>,
	owners: HashMap<PickId, ClusterId>,
	next_id: ClusterId,
}

impl ClusterEngine {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn ingest(&mut self, messages: impl IntoIterator<Item = PickMessage>) {
		for message in messages {
			match message {
				PickMessage::New(event) => {
					self.pending.insert(event.id, AssignedPick::new(event));
				},
				PickMessage::Peak { id, ratio, amplitude } => {
					if let Some(pick) = self.pending.get_mut(&id) {
						pick.raise_peak(ratio, amplitude);
					} else if let Some(cluster) = self.owners.get(&id).and_then(|c| self.clusters.get_mut(c)) {
						cluster.raise_peak(id.station, ratio, amplitude);
					}
				},
			}
		}
	}

	pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
		self.clusters.values()
	}

	#[must_use]
	pub fn get(&self, id: ClusterId) -> Option<&Cluster> {
		self.clusters.get(&id)
	}

	pub fn get_mut(&mut self, id: ClusterId) -> Option<&mut Cluster> {
		self.clusters.get_mut(&id)
	}

	#[must_use]
	pub fn ids(&self) -> Vec<ClusterId> {
		self.clusters.keys().copied().collect()
	}

	#[must_use]
	pub fn pending_len(&self) -> usize {
		self.pending.len()
	}

	#[must_use]
	pub fn owner_of(&self, pick: PickId) -> Option<ClusterId> {
		self.owners.get(&pick).copied()
	}

	/// Adds an externally formed cluster, e.g. from a replay. Returns its id.
	pub fn insert(&mut self, picks: Vec<PickedEvent>, now: Millis) -> ClusterId {
		let id = self.allocate_id();
		for pick in &picks {
			self.owners.insert(pick.id, id);
		}
		self.clusters.insert(id, Cluster::new(id, picks.into_iter().map(AssignedPick::new), now));
		id
	}

	/// Removes a cluster and forgets its picks.
	pub fn dissolve(&mut self, id: ClusterId) -> Option<Cluster> {
		let cluster = self.clusters.remove(&id)?;
		for pick in cluster.picks.values() {
			self.owners.remove(&pick.event.id);
		}
		info!(cluster = id, picks = cluster.len(), level = cluster.level, "Cluster dissolved");
		Some(cluster)
	}

	fn allocate_id(&mut self) -> ClusterId {
		self.next_id += 1;
		self.next_id
	}

	/// One location-loop pass. Returns the lifecycle events it produced.
	pub fn tick(
		&mut self,
		cfg: &ClusterConfig,
		inaccuracy_ms: f64,
		model: &dyn TravelTimeModel,
		now: Millis,
	) -> Vec<QuakeEvent> {
		let mut events = Vec::new();

		let max_age = (cfg.pick_max_age_secs * 1000) as Millis;
		self.pending.retain(|_, p| now - p.event.time <= max_age);

		self.assign_to_located(inaccuracy_ms, model, now);
		self.grow_neighbourhoods(cfg, inaccuracy_ms, now);
		self.seed(cfg, inaccuracy_ms, now, &mut events);

		for cluster in self.clusters.values_mut() {
			cluster.recompute_root();
			if let Some(level) = cluster.update_level(&cfg.level_bands) {
				info!(cluster = cluster.id, level, "Cluster level raised");
				events.push(QuakeEvent::ClusterLevelChanged { cluster: cluster.id, level });
			}
		}

		self.merge(cfg, inaccuracy_ms, now, &mut events);
		self.expire(cfg, now, &mut events);

		events
	}

	fn pending_by_time(&self) -> Vec<PickId> {
		let mut ids: Vec<(Millis, PickId)> = self.pending.values().map(|p| (p.event.time, p.event.id)).collect();
		ids.sort_unstable();
		ids.into_iter().map(|(_, id)| id).collect()
	}

	fn take_into(&mut self, pick_id: PickId, cluster_id: ClusterId, now: Millis) {
		let Some(pick) = self.pending.remove(&pick_id) else {
			return;
		};
		if let Some(cluster) = self.clusters.get_mut(&cluster_id)
			&& cluster.assign(pick, now)
		{
			self.owners.insert(pick_id, cluster_id);
		}
	}

	/// Clusters with a hypocenter take picks whose time matches the predicted P arrival.
	fn assign_to_located(&mut self, inaccuracy_ms: f64, model: &dyn TravelTimeModel, now: Millis) {
		for pick_id in self.pending_by_time() {
			let Some(pick) = self.pending.get(&pick_id) else {
				continue;
			};

			let best = self
				.clusters
				.values()
				.filter(|c| !c.contains_station(pick_id.station))
				.filter_map(|c| {
					let h = c.previous_hypocenter.as_ref()?;
					let tt = model.p_wave(h.depth_km, angular_distance(h.lat, h.lon, pick.event.lat, pick.event.lon));
					if tt < 0.0 {
						return None;
					}
					let predicted = h.origin as f64 + tt * 1000.0;
					let residual = (pick.event.time as f64 - predicted).abs();
					(residual <= inaccuracy_ms).then_some((residual, c.id))
				})
				.min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

			if let Some((residual, cluster_id)) = best {
				debug!(cluster = cluster_id, station = %pick.event.station, residual_ms = residual, "Pick matches hypocenter");
				self.take_into(pick_id, cluster_id, now);
			}
		}
	}

	/// Clusters still without a hypocenter grow by physically possible neighbours.
	fn grow_neighbourhoods(&mut self, cfg: &ClusterConfig, inaccuracy_ms: f64, now: Millis) {
		loop {
			let mut grew = false;

			for pick_id in self.pending_by_time() {
				let Some(pick) = self.pending.get(&pick_id) else {
					continue;
				};

				let best = self
					.clusters
					.values()
					.filter(|c| c.previous_hypocenter.is_none() && !c.contains_station(pick_id.station))
					.filter_map(|c| {
						c.picks()
							.filter(|q| consistent(&pick.event, &q.event, cfg, inaccuracy_ms))
							.map(|q| pick.event.location().distance_km(&q.event.location()))
							.min_by(f64::total_cmp)
							.map(|d| (d, c.id))
					})
					.min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

				if let Some((_, cluster_id)) = best {
					self.take_into(pick_id, cluster_id, now);
					grew = true;
				}
			}

			if !grew {
				break;
			}
		}
	}

	/// Forms a new cluster from enough mutually consistent unassigned picks.
	fn seed(&mut self, cfg: &ClusterConfig, inaccuracy_ms: f64, now: Millis, events: &mut Vec<QuakeEvent>) {
		let order = self.pending_by_time();
		let mut used: BTreeSet<PickId> = BTreeSet::new();

		for &seed_id in &order {
			if used.contains(&seed_id) {
				continue;
			}
			if !self.pending.contains_key(&seed_id) {
				continue;
			}

			let mut group = vec![seed_id];
			let mut stations = BTreeSet::from([seed_id.station]);
			for &other_id in &order {
				if used.contains(&other_id) || stations.contains(&other_id.station) {
					continue;
				}
				let Some(other) = self.pending.get(&other_id) else {
					continue;
				};
				let fits_all = group
					.iter()
					.filter_map(|g| self.pending.get(g))
					.all(|member| consistent(&member.event, &other.event, cfg, inaccuracy_ms));
				if fits_all {
					group.push(other_id);
					stations.insert(other_id.station);
				}
			}

			if group.len() < cfg.min_stations {
				continue;
			}

			let id = self.allocate_id();
			let picks: Vec<AssignedPick> = group.iter().filter_map(|g| self.pending.remove(g)).collect();
			for g in &group {
				used.insert(*g);
				self.owners.insert(*g, id);
			}
			let cluster = Cluster::new(id, picks, now);
			info!(cluster = id, stations = cluster.len(), lat = cluster.root.lat, lon = cluster.root.lon, "Cluster created");
			events.push(QuakeEvent::ClusterCreated { cluster: id, stations: cluster.len(), root: cluster.root });
			self.clusters.insert(id, cluster);
		}
	}

	/// Located pairs compare hypocenters; otherwise the roots must be close and
	/// at least one pick pair must be explainable by a single source.
	fn mergeable(a: &Cluster, b: &Cluster, cfg: &ClusterConfig, inaccuracy_ms: f64) -> bool {
		if a.earthquake.is_some() && b.earthquake.is_some() {
			return false;
		}

		if let (Some(ha), Some(hb)) = (&a.previous_hypocenter, &b.previous_hypocenter) {
			return ha.epicenter().distance_km(&hb.epicenter()) <= cfg.merge_distance_km
				&& (ha.origin - hb.origin).abs() <= cfg.merge_origin_ms;
		}

		a.root.distance_km(&b.root) <= cfg.merge_distance_km
			&& a.picks().any(|p| b.picks().any(|q| consistent(&p.event, &q.event, cfg, inaccuracy_ms)))
	}

	/// Survivor preference: bound earthquake, then hypocenter, then more picks, then lower id.
	fn survivor_of(a: &Cluster, b: &Cluster) -> (ClusterId, ClusterId) {
		let key = |c: &Cluster| (c.earthquake.is_some(), c.previous_hypocenter.is_some(), c.len());
		if key(b) > key(a) { (b.id, a.id) } else { (a.id, b.id) }
	}

	fn merge(&mut self, cfg: &ClusterConfig, inaccuracy_ms: f64, now: Millis, events: &mut Vec<QuakeEvent>) {
		loop {
			let ids = self.ids();
			let pair = ids.iter().enumerate().find_map(|(i, a)| {
				ids[i + 1..].iter().find_map(|b| {
					let (ca, cb) = (self.clusters.get(a)?, self.clusters.get(b)?);
					Self::mergeable(ca, cb, cfg, inaccuracy_ms).then(|| Self::survivor_of(ca, cb))
				})
			});

			let Some((survivor, absorbed)) = pair else {
				break;
			};
			let Some(gone) = self.clusters.remove(&absorbed) else {
				break;
			};

			if let Some(target) = self.clusters.get_mut(&survivor) {
				target.level = target.level.max(gone.level);
				for pick in gone.picks.into_values() {
					let pick_id = pick.event.id;
					if target.assign(pick, now) {
						self.owners.insert(pick_id, survivor);
					} else {
						self.owners.remove(&pick_id);
					}
				}
				target.recompute_root();
			}

			info!(survivor, absorbed, "Clusters merged");
			events.push(QuakeEvent::ClusterMerged { survivor, absorbed });
		}
	}

	fn expire(&mut self, cfg: &ClusterConfig, now: Millis, events: &mut Vec<QuakeEvent>) {
		let timeout = (cfg.timeout_secs * 1000) as Millis;
		let expired: Vec<ClusterId> = self
			.clusters
			.values()
			.filter(|c| c.earthquake.is_none() && now - c.last_assignment_ms > timeout)
			.map(|c| c.id)
			.collect();

		for id in expired {
			if self.dissolve(id).is_some() {
				events.push(QuakeEvent::ClusterDissolved { cluster: id });
			}
		}
	}
}
