use crate::config::DetectorConfig;
use crate::station::filter::BandPass;
use crate::types::Millis;

/// What a picker reports while it consumes a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Trigger {
	Onset { time: Millis, ratio: f64, amplitude: f64 },
	Peak { ratio: f64, amplitude: f64 },
	Release { time: Millis },
}

/// Largest ratio and filtered amplitude seen since the last peak reset.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Peaks {
	pub ratio: f64,
	pub velocity: f64,
}

pub trait OnsetPicker: Send {
	fn process(&mut self, cfg: &DetectorConfig, start_ms: Millis, sample_rate: f64, samples: &[i32], out: &mut Vec<Trigger>);

	/// Drops filter and average state, e.g. after a gap or a sample-rate change.
	fn reset(&mut self);

	fn reset_peaks(&mut self);

	fn peaks(&self) -> Peaks;

	fn in_event(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
	Idle,
	Event { ratio: f64, amplitude: f64 },
}

/// Classic STA/LTA picker with an intermediate-term average used for the peak ratio.
#[derive(Debug, Clone)]
pub struct StaLtaPicker {
	warmup: bool,
	filter: Option<(f64, BandPass)>,
	offset: Option<f64>,
	offset_sum: f64,
	offset_count: usize,
	sta: f64,
	mta: f64,
	lta: f64,
	filtered: u64,
	phase: Phase,
	peaks: Peaks,
}

impl StaLtaPicker {
	#[must_use]
	pub const fn new() -> Self {
		Self::build(true)
	}

	/// Picker that may trigger as soon as the offset is known. Used for synthetic feeds.
	#[must_use]
	pub const fn without_warmup() -> Self {
		Self::build(false)
	}

	const fn build(warmup: bool) -> Self {
		Self {
			warmup,
			filter: None,
			offset: None,
			offset_sum: 0.0,
			offset_count: 0,
			sta: 0.0,
			mta: 0.0,
			lta: 0.0,
			filtered: 0,
			phase: Phase::Idle,
			peaks: Peaks { ratio: 0.0, velocity: 0.0 },
		}
	}

	#[must_use]
	pub fn ratio(&self) -> f64 {
		if self.lta > 1e-9 { self.sta / self.lta } else { 0.0 }
	}
}

impl Default for StaLtaPicker {
	fn default() -> Self {
		Self::new()
	}
}

impl OnsetPicker for StaLtaPicker {
	fn process(&mut self, cfg: &DetectorConfig, start_ms: Millis, sample_rate: f64, samples: &[i32], out: &mut Vec<Trigger>) {
		let offset_window = ((cfg.offset_secs * sample_rate) as usize).max(1);
		let warmup_samples = if self.warmup { (cfg.warmup_secs * sample_rate) as u64 } else { 0 };
		let (n_sta, n_mta, n_lta) =
			((cfg.sta_secs * sample_rate).max(1.0), (cfg.mta_secs * sample_rate).max(1.0), (cfg.lta_secs * sample_rate).max(1.0));
		let peak_at_start = self.phase;

		let mut filter = match self.filter.take() {
			Some((rate, filter)) if (rate - sample_rate).abs() <= f64::EPSILON => filter,
			_ => BandPass::new(cfg.min_freq_hz, cfg.max_freq_hz, sample_rate),
		};

		for (i, &raw) in samples.iter().enumerate() {
			let value = f64::from(raw);
			let Some(offset) = self.offset else {
				self.offset_sum += value;
				self.offset_count += 1;
				if self.offset_count >= offset_window {
					self.offset = Some(self.offset_sum / self.offset_count as f64);
				}
				continue;
			};

			let amplitude = filter.process(value - offset).abs();
			if self.filtered == 0 {
				self.sta = amplitude;
				self.mta = amplitude;
				self.lta = amplitude;
			}
			self.filtered += 1;

			self.sta += (amplitude - self.sta) / n_sta;
			self.mta += (amplitude - self.mta) / n_mta;
			// the long average must not absorb the event it is measuring
			if self.phase == Phase::Idle {
				self.lta += (amplitude - self.lta) / n_lta;
			}

			let ratio = self.ratio();
			let medium_ratio = if self.lta > 1e-9 { self.mta / self.lta } else { 0.0 };
			self.peaks.ratio = self.peaks.ratio.max(ratio);
			self.peaks.velocity = self.peaks.velocity.max(amplitude);

			let time = start_ms + (i as f64 * 1000.0 / sample_rate).round() as Millis;
			match self.phase {
				Phase::Idle => {
					if self.filtered >= warmup_samples && ratio >= cfg.event_threshold {
						out.push(Trigger::Onset { time, ratio, amplitude });
						self.phase = Phase::Event { ratio, amplitude };
					}
				},
				Phase::Event { ratio: peak_ratio, amplitude: peak_amplitude } => {
					if ratio < cfg.release_threshold {
						out.push(Trigger::Release { time });
						self.phase = Phase::Idle;
					} else {
						self.phase =
							Phase::Event { ratio: peak_ratio.max(medium_ratio), amplitude: peak_amplitude.max(amplitude) };
					}
				},
			}
		}

		self.filter = Some((sample_rate, filter));

		if let Phase::Event { ratio, amplitude } = self.phase
			&& self.phase != peak_at_start
		{
			out.push(Trigger::Peak { ratio, amplitude });
		}
	}

	fn reset(&mut self) {
		*self = Self::build(self.warmup);
	}

	fn reset_peaks(&mut self) {
		self.peaks = Peaks::default();
	}

	fn peaks(&self) -> Peaks {
		self.peaks
	}

	fn in_event(&self) -> bool {
		matches!(self.phase, Phase::Event { .. })
	}
}
