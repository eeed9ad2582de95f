use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quake_core::archive::ArchiveHandle;
use quake_core::config::{AnalysisConfig, ConfigHandle, StationSource};
use quake_core::error::FatalError;
use quake_core::events::QuakeEvent;
use quake_core::scheduler::AnalysisContext;
use quake_core::station::StationRegistry;
use quake_core::travel_time::{SphericalModel, TravelTimeModel, TravelTimeTable};
use tracing::{error, info, warn};

mod feed;
mod training;

#[derive(Parser)]
#[command(name = "quake", about = "Real-time earthquake detection and location")]
struct Cli {
	#[arg(short, long, env = "QUAKE_CONFIG", default_value = "config.toml")]
	config: PathBuf,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Run the analysis pipeline (default)
	Run,
	/// Locate seeded synthetic earthquakes and report the accuracy
	Train {
		#[arg(long, default_value_t = 100)]
		runs: u64,
		#[arg(long, default_value_t = 888)]
		seed: u64,
	},
	/// Raise the search resolution until locating takes longer than the budget, then save it
	Calibrate {
		#[arg(long, default_value_t = 400)]
		budget_ms: u64,
	},
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	match cli.command.unwrap_or(Command::Run) {
		Command::Run => run(&cli.config).await,
		Command::Train { runs, seed } => {
			let config = AnalysisConfig::load(&cli.config).context("Failed to load configuration")?;
			let model = load_model(&config)?;
			let report = training::train(&config, model.as_ref(), runs, seed);
			if report.located == 0 {
				anyhow::bail!("no synthetic earthquake was located");
			}
			Ok(())
		},
		Command::Calibrate { budget_ms } => {
			let mut config = AnalysisConfig::load(&cli.config).context("Failed to load configuration")?;
			let model = load_model(&config)?;
			training::calibrate(&mut config, model.as_ref(), Duration::from_millis(budget_ms));
			config.save(&cli.config).context("Failed to save calibrated configuration")?;
			info!(resolution = config.locator.resolution, "✅ Calibrated resolution saved");
			Ok(())
		},
	}
}

fn load_model(config: &AnalysisConfig) -> Result<Arc<dyn TravelTimeModel>, FatalError> {
	let tt = &config.travel_time;
	match &tt.table_path {
		Some(path) => Ok(Arc::new(TravelTimeTable::load(path)?)),
		None => {
			let table = TravelTimeTable::build(&SphericalModel::default(), tt.depth_step_km, tt.angle_step_deg)?;
			info!(depth_step_km = tt.depth_step_km, angle_step_deg = tt.angle_step_deg, "Travel-time table built");
			Ok(Arc::new(table))
		},
	}
}

async fn run(path: &Path) -> anyhow::Result<()> {
	info!("🚀 Starting quake");

	let config = Arc::new(ConfigHandle::from_file(path).context("Failed to load configuration")?);
	let current = config.current();
	info!("✅ Configuration loaded");

	let model = load_model(&current)?;
	info!("✅ Travel-time model ready");

	let stations = Arc::new(StationRegistry::from_config(&current.stations));
	let synthetic = stations.iter().filter(|s| matches!(s.source, StationSource::Synthetic)).count();
	if stations.is_empty() {
		warn!("No stations configured, nothing will be detected");
	}
	info!(stations = stations.len(), synthetic, "✅ Stations registered");

	let (archive, archive_worker) = ArchiveHandle::spawn(&current.archive);
	let ctx = Arc::new(AnalysisContext::new(Arc::clone(&config), Arc::clone(&stations), model, Arc::new(archive)));

	ctx.events.subscribe(|event| {
		if let QuakeEvent::EarthquakeCreated { quake } | QuakeEvent::EarthquakeRevised { quake } = event {
			info!(
				uuid = %quake.uuid,
				revision = quake.revision,
				region = %quake.region,
				magnitude = ?quake.magnitude,
				"🌍 {}",
				quake.hypocenter
			);
		}
	});

	let feed = feed::spawn(Arc::clone(&stations));
	let mut scheduler = ctx.start();
	info!("✅ All loops started");

	let outcome = tokio::select! {
		_ = tokio::signal::ctrl_c() => {
			info!("Shutdown requested");
			Ok(())
		},
		fatal = scheduler.fatal() => match fatal {
			Some(e) => {
				error!(error = %e, "Fatal error, shutting down");
				Err(e.into())
			},
			None => Ok(()),
		},
	};

	feed.abort();
	scheduler.shutdown().await;

	// the archive worker drains once the last handle is gone
	drop(ctx);
	if tokio::time::timeout(Duration::from_secs(5), archive_worker).await.is_err() {
		warn!("Archive worker did not finish in time");
	}

	outcome
}
