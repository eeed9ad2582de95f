use std::convert::Infallible;

use rayon::prelude::*;

use crate::config::LocatorConfig;
use crate::locator::search::{self, Candidate, Fit, GridPoint, StageEvaluator};
use crate::locator::{LocateOutcome, LocateRequest, Locator};
use crate::travel_time::TravelTimeModel;

/// Evaluates grid cells across the rayon pool and reduces them to the best candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuLocator;

impl StageEvaluator for CpuLocator {
	type Error = Infallible;

	fn best(&self, fit: &Fit<'_>, points: &[GridPoint], cfg: &LocatorConfig) -> Result<Option<Candidate>, Infallible> {
		let best = if cfg.parallel {
			points
				.par_iter()
				.map_init(|| Vec::with_capacity(fit.picks().len()), |scratch, p| fit.evaluate(*p, scratch))
				.reduce(|| None, search::better)
		} else {
			let mut scratch = Vec::with_capacity(fit.picks().len());
			points.iter().map(|p| fit.evaluate(*p, &mut scratch)).fold(None, search::better)
		};
		Ok(best)
	}
}

impl Locator for CpuLocator {
	fn locate(&self, request: &LocateRequest<'_>, cfg: &LocatorConfig, model: &dyn TravelTimeModel) -> LocateOutcome {
		let Ok(outcome) = search::run(self, request, cfg, model);
		outcome
	}

	fn name(&self) -> &'static str {
		"cpu"
	}
}
