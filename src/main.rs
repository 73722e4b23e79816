//! multicam-record - run a multi-camera recording from a JSON configuration

use anyhow::{bail, Context, Result};
use clap::Parser;
use multicam_recorder::source::SimulatedSource;
use multicam_recorder::storage::FrameSink;
use multicam_recorder::{init_tracing, PipelineContext, RecordingCoordinator, RunConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the run configuration (JSON).
    #[arg(long, short)]
    config: PathBuf,
    /// Drive simulated cameras instead of hardware.
    #[arg(long)]
    simulate: bool,
    /// Also write the run summary to this file.
    #[arg(long, value_name = "PATH")]
    summary: Option<PathBuf>,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing();
    tracing::info!("Starting multicam-record v{}", env!("CARGO_PKG_VERSION"));

    if !args.simulate {
        bail!("no camera bindings are linked into this build; rerun with --simulate");
    }

    let config = RunConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let (pipeline, destinations) = config.pipeline_config()?;
    let concurrent_saves = config.concurrent_saves()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(concurrent_saves)
        .build()
        .context("failed to build runtime")?;

    let summary = runtime.block_on(async {
        let context = PipelineContext::current(concurrent_saves);
        let sink: Arc<dyn FrameSink> = Arc::from(config.sink.build());
        let mut coordinator = RecordingCoordinator::new(context, pipeline, destinations, sink);

        // Simulated cameras pace themselves at the configured rate
        let interval = config
            .fps
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .map(|fps| Duration::from_secs_f64(1.0 / fps));
        for channel in &config.channels {
            let mut source = SimulatedSource::new(channel.id.clone()).with_role(channel.role);
            if let Some(first) = config.first_sequence_id {
                source = source.with_sequence(vec![first]);
            }
            if let Some(interval) = interval {
                source = source.with_frame_interval(interval);
            }
            coordinator.add_source(Box::new(source));
        }

        let stop = coordinator.stop_handle();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, finishing frames already acquired");
                stop.request_stop();
            }
        });

        coordinator.run().await
    })?;

    let json = serde_json::to_string_pretty(&summary)?;
    println!("{json}");
    if let Some(path) = &args.summary {
        std::fs::write(path, &json)
            .with_context(|| format!("failed to write summary to {}", path.display()))?;
    }

    if summary.is_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        tracing::warn!(
            "Run finished with {} failed channels and {} save failures",
            summary.failed_channels().len(),
            summary.total_save_failures()
        );
        Ok(ExitCode::FAILURE)
    }
}
