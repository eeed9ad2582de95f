use std::f64::consts::{FRAC_1_SQRT_2, PI};

/// Second-order section, Direct Form II Transposed.
#[derive(Debug, Clone)]
pub struct Biquad {
	b: [f64; 3],
	a: [f64; 2],
	state: [f64; 2],
}

impl Biquad {
	#[must_use]
	pub const fn new(b: [f64; 3], a: [f64; 2]) -> Self {
		Self { b, a, state: [0.0; 2] }
	}

	/// Butterworth low-pass section (Q = 1/sqrt(2)).
	#[must_use]
	pub fn lowpass(cutoff_hz: f64, sample_rate: f64) -> Self {
		let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate);
		let a0 = 1.0 + alpha;
		let k = (1.0 - cos) / 2.0;
		Self::new([k / a0, (1.0 - cos) / a0, k / a0], [-2.0 * cos / a0, (1.0 - alpha) / a0])
	}

	/// Butterworth high-pass section (Q = 1/sqrt(2)).
	#[must_use]
	pub fn highpass(cutoff_hz: f64, sample_rate: f64) -> Self {
		let (cos, alpha) = Self::prewarp(cutoff_hz, sample_rate);
		let a0 = 1.0 + alpha;
		let k = (1.0 + cos) / 2.0;
		Self::new([k / a0, -(1.0 + cos) / a0, k / a0], [-2.0 * cos / a0, (1.0 - alpha) / a0])
	}

	fn prewarp(cutoff_hz: f64, sample_rate: f64) -> (f64, f64) {
		let w0 = 2.0 * PI * cutoff_hz / sample_rate;
		(w0.cos(), w0.sin() / (2.0 * FRAC_1_SQRT_2))
	}

	pub fn process_real(&mut self, input: f64) -> f64 {
		let output = self.b[0] * input + self.state[0];
		self.state[0] = self.b[1] * input - self.a[0] * output + self.state[1];
		self.state[1] = self.b[2] * input - self.a[1] * output;
		output
	}

	pub fn reset(&mut self) {
		self.state = [0.0; 2];
	}
}

/// High-pass followed by low-pass, giving a 2-pole band-pass.
#[derive(Debug, Clone)]
pub struct BandPass {
	sections: [Biquad; 2],
}

impl BandPass {
	#[must_use]
	pub fn new(min_freq_hz: f64, max_freq_hz: f64, sample_rate: f64) -> Self {
		// keep the upper corner below nyquist for low-rate channels
		let upper = max_freq_hz.min(sample_rate * 0.45);
		let lower = min_freq_hz.min(upper * 0.5);
		Self { sections: [Biquad::highpass(lower, sample_rate), Biquad::lowpass(upper, sample_rate)] }
	}

	pub fn process(&mut self, input: f64) -> f64 {
		self.sections.iter_mut().fold(input, |x, s| s.process_real(x))
	}

	pub fn reset(&mut self) {
		self.sections.iter_mut().for_each(Biquad::reset);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn steady_state_gain(freq: f64) -> f64 {
		let fs = 100.0;
		let mut filter = BandPass::new(2.0, 5.0, fs);
		let mut peak: f64 = 0.0;
		for i in 0..4000 {
			let y = filter.process((2.0 * PI * freq * f64::from(i) / fs).sin());
			if i > 3000 {
				peak = peak.max(y.abs());
			}
		}
		peak
	}

	#[test]
	fn passes_the_band_and_rejects_the_rest() {
		let pass = steady_state_gain(3.2);
		assert!(pass > 0.6, "passband gain {pass}");
		assert!(steady_state_gain(0.1) < 0.05);
		assert!(steady_state_gain(30.0) < 0.1);
	}

	#[test]
	fn removes_dc_offset() {
		let mut filter = BandPass::new(2.0, 5.0, 50.0);
		let mut last = 0.0;
		for _ in 0..2000 {
			last = filter.process(1000.0);
		}
		assert!(last.abs() < 1e-3);
	}
}
