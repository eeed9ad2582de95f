use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::StationId;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalysisConfig {
	pub scheduler: SchedulerConfig,
	pub detector: DetectorConfig,
	pub cluster: ClusterConfig,
	pub locator: LocatorConfig,
	pub tracker: TrackerConfig,
	pub archive: ArchiveConfig,
	pub travel_time: TravelTimeConfig,
	pub stations: Vec<StationConfig>,
	pub cities: Vec<CityConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
	pub fast_loop_ms: u64,
	pub second_loop_ms: u64,
	pub location_loop_ms: u64,
	pub config_poll_secs: u64,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self { fast_loop_ms: 100, second_loop_ms: 1000, location_loop_ms: 300, config_poll_secs: 5 }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DetectorConfig {
	/// STA/LTA ratio that opens an event.
	pub event_threshold: f64,
	/// Ratio below which an open event is released.
	pub release_threshold: f64,
	pub min_freq_hz: f64,
	pub max_freq_hz: f64,
	pub sta_secs: f64,
	pub mta_secs: f64,
	pub lta_secs: f64,
	/// Samples used to estimate the DC offset before filtering starts.
	pub offset_secs: f64,
	/// Time after a reset before the detector may trigger.
	pub warmup_secs: f64,
	pub gap_threshold_ms: i64,
	pub sample_rate_tolerance: f64,
	pub max_future_ms: i64,
	pub buffer_secs: u64,
	pub stale_after_secs: u64,
}

impl Default for DetectorConfig {
	fn default() -> Self {
		Self {
			event_threshold: 4.75,
			release_threshold: 1.5,
			min_freq_hz: 2.0,
			max_freq_hz: 5.0,
			sta_secs: 0.5,
			mta_secs: 6.0,
			lta_secs: 200.0,
			offset_secs: 4.0,
			warmup_secs: 10.0,
			gap_threshold_ms: 1000,
			sample_rate_tolerance: 0.2,
			max_future_ms: 60_000,
			buffer_secs: 300,
			stale_after_secs: 60,
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq)]
pub struct LevelBand {
	pub min_ratio: f64,
	pub min_stations: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
	pub min_stations: usize,
	pub radius_km: f64,
	/// Slowest apparent P velocity used to bound the time gap between neighbouring picks.
	pub min_apparent_velocity_km_s: f64,
	pub pick_max_age_secs: u64,
	pub timeout_secs: u64,
	pub merge_distance_km: f64,
	pub merge_origin_ms: i64,
	/// Level `n` is reached when `level_bands[n - 1]` is satisfied.
	pub level_bands: Vec<LevelBand>,
}

impl Default for ClusterConfig {
	fn default() -> Self {
		Self {
			min_stations: 4,
			radius_km: 800.0,
			min_apparent_velocity_km_s: 5.0,
			pick_max_age_secs: 120,
			timeout_secs: 120,
			merge_distance_km: 250.0,
			merge_origin_ms: 10_000,
			level_bands: vec![
				LevelBand { min_ratio: 64.0, min_stations: 8 },
				LevelBand { min_ratio: 1_000.0, min_stations: 7 },
				LevelBand { min_ratio: 10_000.0, min_stations: 6 },
				LevelBand { min_ratio: 50_000.0, min_stations: 4 },
			],
		}
	}
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LocatorBackend {
	Cpu,
	Gpu,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LocatorConfig {
	/// Cost/accuracy knob: 0 is the coarsest search, every 100 roughly halves the grid step.
	pub resolution: f64,
	pub min_stations: usize,
	pub max_stations: usize,
	/// Minimum share of fitted picks, in percent, that must be consistent.
	pub correctness_threshold: f64,
	pub inaccuracy_threshold_ms: f64,
	pub depth_fix_allowed: bool,
	pub fixed_depth_km: f64,
	/// Depth confidence spread above which depth is considered unconstrained.
	pub depth_fix_spread_km: f64,
	pub coarse_radius_km: f64,
	pub backend: LocatorBackend,
	pub parallel: bool,
	pub gpu_memory_ceiling_mb: usize,
}

impl Default for LocatorConfig {
	fn default() -> Self {
		Self {
			resolution: 40.0,
			min_stations: 5,
			max_stations: 40,
			correctness_threshold: 40.0,
			inaccuracy_threshold_ms: 1000.0,
			depth_fix_allowed: true,
			fixed_depth_km: 10.0,
			depth_fix_spread_km: 300.0,
			coarse_radius_km: 2500.0,
			backend: LocatorBackend::Cpu,
			parallel: true,
			gpu_memory_ceiling_mb: 256,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
	pub reduce_revisions: bool,
	pub duplicate_distance_km: f64,
	pub duplicate_origin_ms: i64,
	pub duplicate_depth_km: f64,
	pub min_magnitude_readings: usize,
	pub magnitude_bin: f64,
	/// Readings are only taken within this long after the origin estimate.
	pub magnitude_window_secs: u64,
	pub obvious_radius_km: f64,
	pub obvious_margin_ms: i64,
	pub obvious_min_expected: usize,
	pub obvious_min_ratio: f64,
	pub retention_base_secs: u64,
	pub retention_per_magnitude_secs: u64,
}

impl Default for TrackerConfig {
	fn default() -> Self {
		Self {
			reduce_revisions: false,
			duplicate_distance_km: 5.0,
			duplicate_origin_ms: 1000,
			duplicate_depth_km: 10.0,
			min_magnitude_readings: 3,
			magnitude_bin: 0.1,
			magnitude_window_secs: 600,
			obvious_radius_km: 300.0,
			obvious_margin_ms: 10_000,
			obvious_min_expected: 4,
			obvious_min_ratio: 0.5,
			retention_base_secs: 300,
			retention_per_magnitude_secs: 120,
		}
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ArchiveConfig {
	pub capacity: usize,
	pub sink_path: Option<PathBuf>,
}

impl Default for ArchiveConfig {
	fn default() -> Self {
		Self { capacity: 100, sink_path: None }
	}
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TravelTimeConfig {
	pub table_path: Option<PathBuf>,
	pub depth_step_km: f64,
	pub angle_step_deg: f64,
}

impl Default for TravelTimeConfig {
	fn default() -> Self {
		Self { table_path: None, depth_step_km: 5.0, angle_step_deg: 0.1 }
	}
}

/// Where a station's waveforms come from; selects its detector implementation.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StationSource {
	Seedlink { server: String },
	Synthetic,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StationConfig {
	#[serde(flatten)]
	pub id: StationId,
	pub lat: f64,
	pub lon: f64,
	#[serde(default)]
	pub alt: f64,
	pub source: StationSource,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CityConfig {
	pub name: String,
	pub lat: f64,
	pub lon: f64,
}

impl AnalysisConfig {
	pub fn load(path: &Path) -> Result<Self> {
		let content =
			fs::read_to_string(path).with_context(|| format!("Failed to read config file: {}", path.display()))?;

		let config: Self = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

		config.validate()?;

		Ok(config)
	}

	pub fn save(&self, path: &Path) -> Result<()> {
		let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
		fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;
		Ok(())
	}

	pub fn validate(&self) -> Result<()> {
		let s = &self.scheduler;
		if s.fast_loop_ms == 0 || s.second_loop_ms == 0 || s.location_loop_ms == 0 {
			anyhow::bail!("scheduler loop periods must be positive");
		}

		if self.detector.event_threshold <= self.detector.release_threshold {
			anyhow::bail!("detector.event_threshold must be greater than release_threshold");
		}

		if self.detector.min_freq_hz <= 0.0 || self.detector.min_freq_hz >= self.detector.max_freq_hz {
			anyhow::bail!("detector band must satisfy 0 < min_freq_hz < max_freq_hz");
		}

		if self.detector.sta_secs <= 0.0 || self.detector.sta_secs >= self.detector.lta_secs {
			anyhow::bail!("detector.sta_secs must be positive and shorter than lta_secs");
		}

		if self.cluster.min_stations < 2 {
			anyhow::bail!("cluster.min_stations must be at least 2");
		}

		if self.cluster.level_bands.len() > 4 {
			anyhow::bail!("cluster.level_bands can describe at most 4 levels");
		}

		let l = &self.locator;
		if l.min_stations < 3 {
			anyhow::bail!("locator.min_stations must be at least 3");
		}

		if l.max_stations < l.min_stations {
			anyhow::bail!("locator.max_stations must not be below min_stations");
		}

		if !(0.0..=100.0).contains(&l.correctness_threshold) {
			anyhow::bail!("locator.correctness_threshold must be a percentage");
		}

		if l.inaccuracy_threshold_ms <= 0.0 {
			anyhow::bail!("locator.inaccuracy_threshold_ms must be positive");
		}

		if l.resolution < 0.0 {
			anyhow::bail!("locator.resolution must be non-negative");
		}

		if self.archive.capacity == 0 {
			anyhow::bail!("archive.capacity must be greater than 0");
		}

		Ok(())
	}
}

/// Hot-reloadable configuration. Readers take a cheap `Arc` snapshot every tick.
pub struct ConfigHandle {
	current: RwLock<Arc<AnalysisConfig>>,
	path: Option<PathBuf>,
	modified: Mutex<Option<SystemTime>>,
}

impl ConfigHandle {
	#[must_use]
	pub fn new(config: AnalysisConfig) -> Self {
		Self { current: RwLock::new(Arc::new(config)), path: None, modified: Mutex::new(None) }
	}

	pub fn from_file(path: &Path) -> Result<Self> {
		let config = AnalysisConfig::load(path)?;
		let modified = fs::metadata(path).and_then(|m| m.modified()).ok();

		Ok(Self { current: RwLock::new(Arc::new(config)), path: Some(path.to_path_buf()), modified: Mutex::new(modified) })
	}

	#[must_use]
	pub fn current(&self) -> Arc<AnalysisConfig> {
		Arc::clone(&self.current.read())
	}

	pub fn replace(&self, config: AnalysisConfig) {
		*self.current.write() = Arc::new(config);
	}

	/// Applies `f` to a copy of the current configuration and publishes the result.
	pub fn update(&self, f: impl FnOnce(&mut AnalysisConfig)) {
		let mut next = (*self.current()).clone();
		f(&mut next);
		self.replace(next);
	}

	/// Re-reads the backing file when its modification time changed. A broken
	/// file keeps the previous configuration in place.
	pub fn reload_if_changed(&self) -> Result<bool> {
		let Some(path) = &self.path else {
			return Ok(false);
		};

		let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
		{
			let mut last = self.modified.lock();
			if modified.is_none() || *last == modified {
				return Ok(false);
			}
			*last = modified;
		}

		match AnalysisConfig::load(path) {
			Ok(config) => {
				self.replace(config);
				info!(path = %path.display(), "Configuration reloaded");
				Ok(true)
			},
			Err(e) => {
				warn!(path = %path.display(), error = %e, "Ignoring invalid configuration change");
				Err(e)
			},
		}
	}

	#[must_use]
	pub fn poll_period(&self) -> Duration {
		Duration::from_secs(self.current().scheduler.config_poll_secs.max(1))
	}
}
