use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camera_analytics::frame::{Frame, Payload, PixelFormat, PortKind, SourceId};
use camera_analytics::probe::{probe_fn, ObjectCounter, OVERLAY_TEXT_KEY};
use camera_analytics::stage::{Outbox, Stage};
use camera_analytics::{ControlLoop, PipelineError, PipelineEvent, PipelineGraph, RunStatus};

struct CountingSource {
    source: SourceId,
    total: u64,
    next: u64,
    ended: bool,
}

impl Stage for CountingSource {
    fn name(&self) -> &str {
        "camera"
    }

    fn input(&self) -> Option<PortKind> {
        None
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Frames)
    }

    fn produce(&mut self) -> Result<Option<Payload>> {
        if self.ended {
            return Ok(None);
        }
        if self.next == self.total {
            self.ended = true;
            return Ok(Some(Payload::EndOfStream {
                source: self.source,
            }));
        }
        let frame = Frame::new(
            self.source,
            self.next,
            Duration::ZERO,
            2,
            2,
            PixelFormat::Rgba,
            vec![0u8; PixelFormat::Rgba.buffer_len(2, 2)],
        );
        self.next += 1;
        Ok(Some(Payload::Frame(frame)))
    }
}

/// Sink recording (sequence, annotation keys) of every frame it receives.
struct AnnotationRecorder {
    seen: Arc<Mutex<Vec<(u64, Vec<String>)>>>,
}

impl Stage for AnnotationRecorder {
    fn name(&self) -> &str {
        "sink"
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Frames)
    }

    fn output(&self) -> Option<PortKind> {
        None
    }

    fn process(&mut self, input: Payload, _out: &mut Outbox) -> Result<()> {
        if let Payload::Frame(frame) = input {
            let keys = frame
                .metadata()
                .annotations()
                .iter()
                .map(|a| a.key.clone())
                .collect();
            self.seen.lock().unwrap().push((frame.sequence(), keys));
        }
        Ok(())
    }
}

fn graph(total: u64) -> (PipelineGraph, Arc<Mutex<Vec<(u64, Vec<String>)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut graph = PipelineGraph::new();
    graph
        .add_stage(Box::new(CountingSource {
            source: 0,
            total,
            next: 0,
            ended: false,
        }))
        .expect("add source");
    graph
        .add_stage(Box::new(AnnotationRecorder {
            seen: Arc::clone(&seen),
        }))
        .expect("add sink");
    graph.link("camera", "sink").expect("link");
    (graph, seen)
}

fn run(graph: &mut PipelineGraph) -> (RunStatus, Vec<PipelineEvent>) {
    let mut events = Vec::new();
    let report = ControlLoop::new()
        .with_run_timeout(Some(Duration::from_secs(10)))
        .run_with(graph, |event| events.push(event.clone()))
        .expect("run");
    (report.status, events)
}

fn warnings(events: &[PipelineEvent]) -> Vec<(String, String, Option<u64>)> {
    events
        .iter()
        .filter_map(|event| match event {
            PipelineEvent::Warning {
                stage,
                message,
                frame,
            } => Some((stage.clone(), message.clone(), *frame)),
            _ => None,
        })
        .collect()
}

#[test]
fn failing_probe_reports_once_and_the_stream_continues() {
    let (mut graph, seen) = graph(5);
    let probe = probe_fn("label-check", |frame: &Frame, annotator| {
        annotator.annotate("checked", "yes");
        if frame.sequence() == 2 {
            bail!("label table missing");
        }
        Ok(())
    });
    graph.attach_probe("sink", probe).expect("attach");

    let (status, events) = run(&mut graph);
    assert_eq!(status, RunStatus::Success);

    let warnings = warnings(&events);
    assert_eq!(warnings.len(), 1, "{:?}", warnings);
    let (stage, message, frame) = &warnings[0];
    assert_eq!(stage, "sink");
    assert_eq!(*frame, Some(2));
    assert!(message.contains("label-check"), "{}", message);
    assert!(message.contains("label table missing"), "{}", message);
    assert!(!events.iter().any(PipelineEvent::is_fatal));

    let seen = seen.lock().unwrap();
    let sequences: Vec<u64> = seen.iter().map(|(seq, _)| *seq).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    for (seq, keys) in seen.iter() {
        if *seq == 2 {
            assert!(keys.is_empty(), "partial annotations leaked onto frame 2");
        } else {
            assert_eq!(keys, &vec!["checked".to_string()]);
        }
    }
}

#[test]
fn panicking_probe_is_contained() {
    let (mut graph, seen) = graph(4);
    let probe = probe_fn("fragile", |frame: &Frame, _annotator| {
        if frame.sequence() == 1 {
            panic!("lookup out of range");
        }
        Ok(())
    });
    graph.attach_probe("sink", probe).expect("attach");

    let (status, events) = run(&mut graph);
    assert_eq!(status, RunStatus::Success);
    let warnings = warnings(&events);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].2, Some(1));
    assert!(warnings[0].1.contains("lookup out of range"));
    assert_eq!(seen.lock().unwrap().len(), 4);
}

#[test]
fn counter_annotates_every_frame() {
    let (mut graph, seen) = graph(6);
    let counter = ObjectCounter::default();
    let totals = counter.handle();
    graph.attach_probe("sink", counter).expect("attach");

    let (status, events) = run(&mut graph);
    assert_eq!(status, RunStatus::Success);
    assert!(warnings(&events).is_empty());
    assert_eq!(totals.totals().frames, 6);
    assert_eq!(totals.totals().objects.total(), 0);
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|(_, keys)| keys == &vec![OVERLAY_TEXT_KEY.to_string()]));
}

#[test]
fn only_one_probe_per_graph() {
    let (mut graph, _seen) = graph(1);
    graph
        .attach_probe("sink", ObjectCounter::default())
        .expect("first attach");
    let second = graph.attach_probe("sink", ObjectCounter::new("again"));
    assert!(matches!(second, Err(PipelineError::Configuration { .. })));
}

#[test]
fn probe_needs_an_input_port() {
    let (mut graph, _seen) = graph(1);
    assert!(graph.attach_probe("camera", ObjectCounter::default()).is_err());
    assert!(graph.attach_probe("missing", ObjectCounter::default()).is_err());
}
