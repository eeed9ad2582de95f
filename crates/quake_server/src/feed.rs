use std::sync::Arc;
use std::time::Duration;

use quake_core::config::StationSource;
use quake_core::station::{DataRecord, StationRegistry};
use quake_core::types::current_millis;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::debug;

const SAMPLE_RATE: f64 = 20.0;
const NOISE_COUNTS: i32 = 400;

pub fn spawn(stations: Arc<StationRegistry>) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut rng = StdRng::from_entropy();
		let mut ticker = interval(Duration::from_secs(1));
		let mut start = current_millis() - 1000;

		loop {
			ticker.tick().await;

			let mut fed = 0;
			for station in stations.iter().filter(|s| matches!(s.source, StationSource::Synthetic)) {
				let samples = (0..SAMPLE_RATE as usize).map(|_| rng.gen_range(-NOISE_COUNTS..=NOISE_COUNTS)).collect();
				station.deposit(DataRecord::decoded(start, SAMPLE_RATE, samples));
				fed += 1;
			}

			debug!(stations = fed, start, "Synthetic records deposited");
			start += 1000;
		}
	})
}
