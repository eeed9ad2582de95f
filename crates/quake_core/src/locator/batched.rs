//! Batched evaluation under a memory ceiling, the shape a device backend needs.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::LocatorConfig;
use crate::error::BackendError;
use crate::locator::cpu::CpuLocator;
use crate::locator::search::{self, Candidate, Fit, GridPoint, StageEvaluator};
use crate::locator::{LocateOutcome, LocateRequest, Locator};
use crate::travel_time::TravelTimeModel;

/// A device able to evaluate a batch of grid points in one submission.
pub trait ComputeBackend: Send + Sync {
	fn name(&self) -> &'static str;

	/// Writes one result per point of `batch` into `out`, in order.
	fn evaluate_batch(&self, fit: &Fit<'_>, batch: &[GridPoint], out: &mut Vec<Option<Candidate>>)
	-> Result<(), BackendError>;
}

/// In-process executor used when no device driver is linked.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostBackend;

impl ComputeBackend for HostBackend {
	fn name(&self) -> &'static str {
		"host"
	}

	fn evaluate_batch(
		&self,
		fit: &Fit<'_>,
		batch: &[GridPoint],
		out: &mut Vec<Option<Candidate>>,
	) -> Result<(), BackendError> {
		let mut scratch = Vec::with_capacity(fit.picks().len());
		out.extend(batch.iter().map(|p| fit.evaluate(*p, &mut scratch)));
		Ok(())
	}
}

pub struct BatchedLocator<B> {
	backend: B,
}

impl<B: ComputeBackend> BatchedLocator<B> {
	pub const fn new(backend: B) -> Self {
		Self { backend }
	}

	/// Device memory one grid point needs: its travel-time row plus the result slot.
	#[must_use]
	pub const fn bytes_per_point(picks: usize) -> usize {
		picks * size_of::<f64>() + size_of::<Candidate>()
	}

	pub fn try_locate(
		&self,
		request: &LocateRequest<'_>,
		cfg: &LocatorConfig,
		model: &dyn TravelTimeModel,
	) -> Result<LocateOutcome, BackendError> {
		search::run(self, request, cfg, model)
	}
}

impl<B: ComputeBackend> StageEvaluator for BatchedLocator<B> {
	type Error = BackendError;

	fn best(&self, fit: &Fit<'_>, points: &[GridPoint], cfg: &LocatorConfig) -> Result<Option<Candidate>, BackendError> {
		let ceiling = cfg.gpu_memory_ceiling_mb * 1024 * 1024;
		let per_point = Self::bytes_per_point(fit.picks().len());
		let batch_len = ceiling / per_point;
		if batch_len == 0 {
			return Err(BackendError::MemoryCeiling { required: per_point, ceiling });
		}

		let mut out = Vec::with_capacity(batch_len.min(points.len()));
		let mut best = None;
		for batch in points.chunks(batch_len) {
			out.clear();
			self.backend.evaluate_batch(fit, batch, &mut out)?;
			if out.len() != batch.len() {
				return Err(BackendError::Kernel(format!("{} returned {} of {} results", self.backend.name(), out.len(), batch.len())));
			}
			best = out.iter().copied().fold(best, search::better);
		}
		Ok(best)
	}
}

/// Tries the batched backend first and falls back to the CPU search on any backend error.
pub struct FallbackLocator<B> {
	device: BatchedLocator<B>,
	cpu: CpuLocator,
	reported: Mutex<HashSet<&'static str>>,
	fallbacks: AtomicU64,
}

impl<B: ComputeBackend> FallbackLocator<B> {
	pub fn new(backend: B) -> Self {
		Self { device: BatchedLocator::new(backend), cpu: CpuLocator, reported: Mutex::new(HashSet::new()), fallbacks: AtomicU64::new(0) }
	}

	#[must_use]
	pub fn fallbacks(&self) -> u64 {
		self.fallbacks.load(Ordering::Relaxed)
	}

	fn report(&self, error: &BackendError) {
		self.fallbacks.fetch_add(1, Ordering::Relaxed);
		if self.reported.lock().insert(error.class()) {
			warn!(backend = self.device.backend.name(), class = error.class(), error = %error, "Falling back to CPU location");
		} else {
			debug!(backend = self.device.backend.name(), class = error.class(), "Falling back to CPU location");
		}
	}
}

impl<B: ComputeBackend> Locator for FallbackLocator<B> {
	fn locate(&self, request: &LocateRequest<'_>, cfg: &LocatorConfig, model: &dyn TravelTimeModel) -> LocateOutcome {
		match self.device.try_locate(request, cfg, model) {
			Ok(outcome) => outcome,
			Err(e) => {
				self.report(&e);
				self.cpu.locate(request, cfg, model)
			},
		}
	}

	fn name(&self) -> &'static str {
		self.device.backend.name()
	}
}
