use std::path::PathBuf;

use thiserror::Error;

/// Conditions that must stop the process. Everything else is logged and
/// retried on the next tick.
#[derive(Error, Debug)]
pub enum FatalError {
	#[error("failed to load travel-time table {path}: {reason}")]
	TravelTimeTable { path: PathBuf, reason: String },

	#[error("failed to allocate {what} ({bytes} bytes)")]
	Allocation { what: &'static str, bytes: usize },
}

/// Failures reported by a location compute backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
	#[error("compute device unavailable: {0}")]
	Unavailable(String),

	#[error("batch needs {required} bytes but the memory ceiling is {ceiling} bytes")]
	MemoryCeiling { required: usize, ceiling: usize },

	#[error("kernel failure: {0}")]
	Kernel(String),
}

impl BackendError {
	/// Coarse class used to rate-limit fallback logging.
	#[must_use]
	pub const fn class(&self) -> &'static str {
		match self {
			Self::Unavailable(_) => "unavailable",
			Self::MemoryCeiling { .. } => "memory_ceiling",
			Self::Kernel(_) => "kernel",
		}
	}
}

/// Errors raised while feeding waveform records into a station.
#[derive(Error, Debug)]
pub enum RecordError {
	#[error("record for {station} could not be decoded: {source}")]
	Decode {
		station: String,
		#[source]
		source: anyhow::Error,
	},

	#[error("record for {station} has invalid sample rate {sample_rate}")]
	SampleRate { station: String, sample_rate: f64 },
}
