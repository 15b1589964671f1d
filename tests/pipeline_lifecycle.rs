use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use camera_analytics::config::SourceSettings;
use camera_analytics::frame::{Frame, Payload, PortKind};
use camera_analytics::pipeline::{OVERLAY_STAGE, PUBLISH_STAGE};
use camera_analytics::probe::{probe_fn, OVERLAY_TEXT_KEY};
use camera_analytics::stage::{stub_sink, Outbox, Stage};
use camera_analytics::{
    ControlLoop, ObjectCounter, PipelineConfig, PipelineError, PipelineEvent, PipelineGraph,
    PipelineState, RunStatus, Severity, StageState,
};

/// Port-only stage for link checks; never started.
struct Port {
    name: &'static str,
    input: Option<PortKind>,
    output: Option<PortKind>,
}

impl Stage for Port {
    fn name(&self) -> &str {
        self.name
    }

    fn input(&self) -> Option<PortKind> {
        self.input
    }

    fn output(&self) -> Option<PortKind> {
        self.output
    }

    fn produce(&mut self) -> Result<Option<Payload>> {
        Ok(None)
    }

    fn process(&mut self, _input: Payload, _out: &mut Outbox) -> Result<()> {
        Ok(())
    }
}

fn port(name: &'static str, input: Option<PortKind>, output: Option<PortKind>) -> Box<dyn Stage> {
    Box::new(Port {
        name,
        input,
        output,
    })
}

fn stub_config(sink: &str, frame_limit: Option<u64>) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    let mut source = SourceSettings::new("stub://lifecycle-camera");
    source.fps = 0;
    source.frame_limit = frame_limit;
    config.sources = vec![source];
    config.muxer.batch_size = 4;
    config.muxer.width = 64;
    config.muxer.height = 32;
    config.publish.location = format!("stub://{}", sink);
    config.validate().expect("valid config");
    config
}

fn built(config: &PipelineConfig) -> PipelineGraph {
    let mut graph = PipelineGraph::build(config).expect("build");
    graph.link_all().expect("link");
    graph
}

fn control() -> ControlLoop {
    ControlLoop::new().with_run_timeout(Some(Duration::from_secs(20)))
}

#[test]
fn link_rejects_mismatched_and_unknown_ports() {
    let mut graph = PipelineGraph::new();
    graph
        .add_stage(port("packets", None, Some(PortKind::Packets)))
        .unwrap();
    graph
        .add_stage(port("frames-in", Some(PortKind::Frames), Some(PortKind::Frames)))
        .unwrap();
    graph
        .add_stage(port("frames-sink", Some(PortKind::Frames), None))
        .unwrap();

    let mismatch = graph.link("packets", "frames-in");
    assert!(matches!(mismatch, Err(PipelineError::Link { .. })));
    assert!(graph.link("frames-in", "frames-in").is_err());
    assert!(graph.link("frames-in", "nowhere").is_err());
    assert!(graph.link("frames-sink", "frames-in").is_err());
    assert!(graph.add_stage(port("packets", None, None)).is_err());

    graph.link("frames-in", "frames-sink").expect("compatible link");
    // The output port is taken now.
    assert!(graph.link("frames-in", "frames-sink").is_err());
}

#[test]
fn link_rejects_cycles() {
    let mut graph = PipelineGraph::new();
    for name in ["a", "b"] {
        graph
            .add_stage(port(name, Some(PortKind::Frames), Some(PortKind::Frames)))
            .unwrap();
    }
    graph.link("a", "b").expect("a -> b");
    let cycle = graph.link("b", "a");
    match cycle {
        Err(PipelineError::Link { reason, .. }) => assert!(reason.contains("cycle"), "{}", reason),
        other => panic!("expected a link error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn unlinked_graph_refuses_to_start() {
    let mut graph = PipelineGraph::build(&stub_config("lifecycle-unlinked", Some(1))).unwrap();
    assert!(matches!(
        graph.start(),
        Err(PipelineError::Configuration { .. })
    ));
    assert_eq!(graph.state(), PipelineState::Idle);
}

#[test]
fn build_names_every_stage_in_order() {
    let graph = PipelineGraph::build(&stub_config("lifecycle-names", Some(1))).unwrap();
    assert_eq!(
        graph.stage_names(),
        vec![
            "capture",
            "parse",
            "decode",
            "batch-mux",
            "primary-infer",
            "tracker",
            "secondary-infer-1",
            "secondary-infer-2",
            "convert",
            "overlay",
            "publish",
        ]
    );
}

#[test]
fn build_rejects_unknown_stage_options() {
    let mut config = stub_config("lifecycle-options", Some(1));
    config.stage_options.insert(
        "overlay".to_string(),
        camera_analytics::StageOptions::new().with("colour", "red"),
    );
    assert!(matches!(
        PipelineGraph::build(&config),
        Err(PipelineError::Configuration { .. })
    ));
}

#[test]
fn finite_source_runs_to_success() {
    let sink = "lifecycle-success";
    stub_sink(sink).clear();
    let mut graph = built(&stub_config(sink, Some(20)));
    let counter = ObjectCounter::default();
    let totals = counter.handle();
    graph.attach_probe(OVERLAY_STAGE, counter).unwrap();

    let report = control().run(&mut graph).expect("run");
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(report.fatal_events, 0);
    assert_eq!(graph.state(), PipelineState::Idle);

    let published = stub_sink(sink).frames();
    assert_eq!(published.len(), 20);
    assert_eq!(totals.totals().frames, 20);
    let sequences: Vec<u64> = published.iter().map(|f| f.sequence).collect();
    assert_eq!(sequences, (0..20).collect::<Vec<u64>>());
    assert!(published.iter().any(|f| !f.metadata.detections().is_empty()));
    for frame in &published {
        assert!(frame
            .metadata
            .detections()
            .iter()
            .all(|record| record.tracking_id().is_some()));
        let overlay: Vec<_> = frame
            .metadata
            .annotations()
            .iter()
            .filter(|a| a.key == OVERLAY_TEXT_KEY)
            .collect();
        assert_eq!(overlay.len(), 1);
        assert!(overlay[0]
            .value
            .starts_with(&format!("Frame={} ", frame.sequence)));
    }
}

#[test]
fn graph_restarts_after_a_clean_stop() {
    let sink = "lifecycle-restart";
    stub_sink(sink).clear();
    let mut graph = built(&stub_config(sink, Some(6)));

    let first = control().run(&mut graph).expect("first run");
    assert_eq!(first.status, RunStatus::Success);
    let second = control().run(&mut graph).expect("second run");
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(stub_sink(sink).len(), 12);
}

#[test]
fn start_is_idempotent_and_stop_twice_is_a_no_op() {
    let sink = "lifecycle-idempotent";
    let mut graph = built(&stub_config(sink, None));
    graph.start().expect("start");
    assert_eq!(graph.state(), PipelineState::Running);
    graph.start().expect("second start");
    assert_eq!(graph.state(), PipelineState::Running);
    assert!(graph.link("capture", "parse").is_err());

    graph.stop();
    assert_eq!(graph.state(), PipelineState::Idle);
    graph.stop();
    assert_eq!(graph.state(), PipelineState::Idle);
}

#[test]
fn lost_publish_connection_fails_the_run() {
    let sink = "lifecycle-lost";
    stub_sink(sink).clear();
    let location = format!("{}?fail_after=3", sink);
    let mut graph = built(&stub_config(&location, None));

    let report = control().run(&mut graph).expect("run");
    match &report.status {
        RunStatus::Failed { stage, cause } => {
            assert_eq!(stage, PUBLISH_STAGE);
            assert!(cause.contains("lost"), "{}", cause);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(report.status.exit_code(), 1);
    assert!(report.fatal_events >= 1);
    assert_eq!(graph.state(), PipelineState::Errored);
    assert_eq!(stub_sink(sink).len(), 3);
    assert!(matches!(
        graph.start(),
        Err(PipelineError::InvalidState { .. })
    ));
}

#[test]
fn refused_publish_connection_fails_start() {
    let mut graph = built(&stub_config("lifecycle-refused?refuse=1", Some(5)));
    let err = control().run(&mut graph).expect_err("start must fail");
    assert!(matches!(err, PipelineError::StageFault { ref stage, .. } if stage == PUBLISH_STAGE));
    assert_eq!(graph.state(), PipelineState::Idle);

    let faults: Vec<PipelineEvent> = graph
        .events()
        .try_iter()
        .filter(|event| matches!(event, PipelineEvent::Error { .. }))
        .collect();
    assert_eq!(faults.len(), 1, "{:?}", faults);
    match &faults[0] {
        PipelineEvent::Error {
            stage,
            cause,
            severity,
        } => {
            assert_eq!(stage, PUBLISH_STAGE);
            assert_eq!(*severity, Severity::Fatal);
            assert!(cause.contains("refused"), "{}", cause);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// Source whose first `produce` call fails.
struct BrokenSource;

impl Stage for BrokenSource {
    fn name(&self) -> &str {
        "broken"
    }

    fn input(&self) -> Option<PortKind> {
        None
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Frames)
    }

    fn produce(&mut self) -> Result<Option<Payload>> {
        anyhow::bail!("device vanished")
    }
}

#[test]
fn running_state_precedes_a_stage_fault() {
    for _ in 0..20 {
        let mut graph = PipelineGraph::new();
        graph.add_stage(Box::new(BrokenSource)).unwrap();
        graph
            .add_stage(port("frames-sink", Some(PortKind::Frames), None))
            .unwrap();
        graph.link("broken", "frames-sink").unwrap();

        let mut seen = Vec::new();
        let report = control()
            .run_with(&mut graph, |event| seen.push(event.clone()))
            .expect("run");
        assert!(matches!(report.status, RunStatus::Failed { ref stage, .. } if stage == "broken"));

        let running = seen.iter().position(|event| {
            matches!(
                event,
                PipelineEvent::StateChanged { stage, to: StageState::Running, .. } if stage == "broken"
            )
        });
        let fault = seen
            .iter()
            .position(|event| event.is_fatal() && event.stage() == "broken");
        match (running, fault) {
            (Some(running), Some(fault)) => assert!(running < fault, "{:?}", seen),
            _ => panic!("missing events: {:?}", seen),
        }
    }
}

#[test]
fn metadata_only_grows_between_overlay_and_publish() {
    let sink = "lifecycle-records";
    stub_sink(sink).clear();
    let mut graph = built(&stub_config(sink, Some(12)));
    let at_overlay = Arc::new(Mutex::new(BTreeMap::new()));
    let recorded = Arc::clone(&at_overlay);
    let counter = probe_fn("record-count", move |frame: &Frame, annotator| {
        recorded
            .lock()
            .unwrap()
            .insert(frame.sequence(), frame.metadata().record_count());
        annotator.annotate("records", frame.metadata().record_count().to_string());
        Ok(())
    });
    graph.attach_probe(OVERLAY_STAGE, counter).unwrap();

    let report = control().run(&mut graph).expect("run");
    assert_eq!(report.status, RunStatus::Success);

    let at_overlay = at_overlay.lock().unwrap();
    let published = stub_sink(sink).frames();
    assert_eq!(published.len(), 12);
    assert_eq!(at_overlay.len(), 12);
    for frame in &published {
        let before = at_overlay[&frame.sequence];
        // Detections and tracker ids are already attached upstream of overlay.
        assert!(before >= frame.metadata.detections().len());
        assert!(
            frame.metadata.record_count() > before,
            "frame {}: {} records at overlay, {} published",
            frame.sequence,
            before,
            frame.metadata.record_count()
        );
    }
}

#[test]
fn run_timeout_fails_an_endless_source() {
    let mut graph = built(&stub_config("lifecycle-timeout", None));
    let report = ControlLoop::new()
        .with_run_timeout(Some(Duration::from_millis(300)))
        .run(&mut graph)
        .expect("run");
    match &report.status {
        RunStatus::Failed { stage, cause } => {
            assert_eq!(stage, "pipeline");
            assert!(cause.contains("timeout"), "{}", cause);
        }
        other => panic!("expected timeout failure, got {:?}", other),
    }
    assert!(report.elapsed >= Duration::from_millis(300));
}

#[test]
fn stop_handle_interrupts_the_run() {
    let mut graph = built(&stub_config("lifecycle-interrupt", None));
    let control = control();
    let stop = control.stop_handle();
    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        stop.stop();
    });

    let report = control.run(&mut graph).expect("run");
    stopper.join().unwrap();
    assert_eq!(report.status, RunStatus::Interrupted);
    assert_eq!(report.status.exit_code(), 130);
    assert_eq!(graph.state(), PipelineState::Idle);
}
