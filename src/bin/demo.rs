//! demo - end-to-end synthetic run of the camera analytics pipeline
//!
//! Drives the full graph from a finite `stub://` camera into an in-memory sink and
//! prints what the object counter saw.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::time::Duration;

use camera_analytics::config::SourceSettings;
use camera_analytics::pipeline::OVERLAY_STAGE;
use camera_analytics::stage::stub_sink;
use camera_analytics::{
    ControlLoop, ObjectClass, ObjectCounter, PipelineConfig, PipelineEvent, PipelineGraph,
    RunStatus,
};

const DEMO_SINK: &str = "demo";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Frames to capture before the camera reports end of stream.
    #[arg(long, default_value_t = 300)]
    frames: u64,
    /// Capture rate; 0 runs as fast as the pipeline allows.
    #[arg(long, default_value_t = 0)]
    fps: u32,
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
    #[arg(long, default_value_t = 320)]
    width: u32,
    #[arg(long, default_value_t = 180)]
    height: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.frames == 0 {
        return Err(anyhow!("frames must be >= 1"));
    }

    let mut config = PipelineConfig::default();
    let mut source = SourceSettings::new("stub://demo-camera");
    source.fps = args.fps;
    source.frame_limit = Some(args.frames);
    config.sources = vec![source];
    config.muxer.batch_size = args.batch_size;
    config.muxer.width = args.width;
    config.muxer.height = args.height;
    config.publish.location = format!("stub://{}", DEMO_SINK);
    config.run_timeout = Some(Duration::from_secs(60));
    config.validate()?;

    let mut graph = PipelineGraph::build(&config).context("build demo pipeline")?;
    graph.link_all()?;
    let counter = ObjectCounter::default();
    let totals = counter.handle();
    graph.attach_probe(OVERLAY_STAGE, counter)?;
    println!("stages: {}", graph.stage_names().join(" -> "));

    let report = ControlLoop::new()
        .with_run_timeout(config.run_timeout)
        .run_with(&mut graph, |event| {
            if let PipelineEvent::Warning { .. } | PipelineEvent::Error { .. } = event {
                println!("event: {}", event);
            }
        })?;

    let totals = totals.totals();
    let published = stub_sink(DEMO_SINK).frames();
    let labelled = published
        .iter()
        .map(|frame| frame.metadata.classifications().len())
        .sum::<usize>();
    println!("status: {:?} in {:?}", report.status, report.elapsed);
    println!("frames counted: {}, published: {}", totals.frames, published.len());
    for class in ObjectClass::ALL {
        println!("  {:<9} {}", class.label(), totals.objects.get(class));
    }
    println!("secondary labels: {}", labelled);
    if let Some(last) = published.last() {
        for annotation in last.metadata.annotations() {
            println!("last overlay: {}", annotation.value);
        }
    }

    match report.status {
        RunStatus::Success => Ok(()),
        RunStatus::Failed { stage, cause } => Err(anyhow!("demo failed in {}: {}", stage, cause)),
        RunStatus::Interrupted => Err(anyhow!("demo interrupted")),
    }
}
