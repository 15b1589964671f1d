//! camera_pipeline - run the analytics pipeline on one camera
//!
//! Captures H.264 from the given source, runs detection, tracking and secondary
//! classification, draws the results and publishes the stream. Exits 0 when the
//! source ends, 1 on a fatal fault and 130 when interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use camera_analytics::config::SourceSettings;
use camera_analytics::pipeline::OVERLAY_STAGE;
use camera_analytics::{ControlLoop, ObjectCounter, PipelineConfig, PipelineGraph};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Camera source, e.g. /dev/video0 or stub://front.
    source: String,
    /// Publish location (rtmp://host/app/stream or stub://name).
    #[arg(long)]
    location: Option<String>,
    /// Frames per batch.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Emit a partial batch after this many milliseconds.
    #[arg(long)]
    batch_timeout_ms: Option<u64>,
    /// Output width of the muxer.
    #[arg(long)]
    width: Option<u32>,
    /// Output height of the muxer.
    #[arg(long)]
    height: Option<u32>,
    /// Fail the run after this many seconds (0 disables).
    #[arg(long)]
    run_timeout_secs: Option<u64>,
    /// Config file (TOML or JSON); defaults to $PIPELINE_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args) {
        Ok(code) => process::exit(code),
        Err(err) => {
            log::error!("{:#}", err);
            eprintln!("error: {:#}", err);
            process::exit(1);
        }
    }
}

fn run(args: Args) -> Result<i32> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::load_from(Some(path))?,
        None => PipelineConfig::load()?,
    };
    apply_args(&mut config, &args);
    config.validate()?;

    let mut graph = PipelineGraph::build(&config).context("build pipeline")?;
    graph.link_all().context("link pipeline")?;
    let counter = ObjectCounter::default();
    let totals = counter.handle();
    graph
        .attach_probe(OVERLAY_STAGE, counter)
        .context("attach object counter")?;

    let control = ControlLoop::new().with_run_timeout(config.run_timeout);
    let stop = control.stop_handle();
    ctrlc::set_handler(move || stop.stop()).context("install Ctrl-C handler")?;

    log::info!(
        "camera_pipeline: {} -> {}",
        args.source,
        config.publish.location
    );
    let report = control.run(&mut graph)?;
    let totals = totals.totals();
    log::info!(
        "processed {} frame(s): {} ({} warning(s))",
        totals.frames,
        totals.objects,
        report.warnings
    );
    Ok(report.status.exit_code())
}

fn apply_args(config: &mut PipelineConfig, args: &Args) {
    let mut source = SourceSettings::new(args.source.clone());
    if let Some(existing) = config.sources.first() {
        source.fps = existing.fps;
        source.frame_limit = existing.frame_limit;
    }
    config.sources = vec![source];
    if let Some(location) = &args.location {
        config.publish.location = location.clone();
    }
    if let Some(batch_size) = args.batch_size {
        config.muxer.batch_size = batch_size;
    }
    if let Some(ms) = args.batch_timeout_ms {
        config.muxer.batch_timeout = Duration::from_millis(ms);
    }
    if let Some(width) = args.width {
        config.muxer.width = width;
    }
    if let Some(height) = args.height {
        config.muxer.height = height;
    }
    if let Some(secs) = args.run_timeout_secs {
        config.run_timeout = (secs > 0).then(|| Duration::from_secs(secs));
    }
}
