//! Batch muxer behaviour inside a running graph: frame conservation, size-first
//! emission and the batch timeout.

use anyhow::Result;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camera_analytics::frame::{Frame, Payload, PixelFormat, PortKind, SourceId};
use camera_analytics::mux::{BatchMuxer, MuxConfig};
use camera_analytics::stage::{Outbox, Stage};
use camera_analytics::{ControlLoop, PipelineGraph, RunStatus};

/// Emits `total` frames back to back, then waits `hold` before end of stream.
struct FrameSource {
    name: String,
    source: SourceId,
    total: u64,
    next: u64,
    hold: Duration,
    last_sent: Option<Instant>,
    sent_at: Arc<Mutex<Vec<Instant>>>,
    ended: bool,
}

impl FrameSource {
    fn new(name: &str, source: SourceId, total: u64, hold: Duration) -> Self {
        Self {
            name: name.to_string(),
            source,
            total,
            next: 0,
            hold,
            last_sent: None,
            sent_at: Arc::new(Mutex::new(Vec::new())),
            ended: false,
        }
    }
}

impl Stage for FrameSource {
    fn name(&self) -> &str {
        &self.name
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
        if self.next < self.total {
            let frame = Frame::new(
                self.source,
                self.next,
                Duration::ZERO,
                4,
                2,
                PixelFormat::Nv12,
                vec![0u8; PixelFormat::Nv12.buffer_len(4, 2)],
            );
            self.next += 1;
            let now = Instant::now();
            self.last_sent = Some(now);
            self.sent_at.lock().unwrap().push(now);
            return Ok(Some(Payload::Frame(frame)));
        }
        if self.last_sent.map_or(true, |t| t.elapsed() >= self.hold) {
            self.ended = true;
            return Ok(Some(Payload::EndOfStream {
                source: self.source,
            }));
        }
        thread::sleep(Duration::from_millis(1));
        Ok(None)
    }
}

#[derive(Clone, Debug)]
struct Received {
    at: Instant,
    source: SourceId,
    sequences: Vec<u64>,
}

struct BatchRecorder {
    log: Arc<Mutex<Vec<Received>>>,
}

impl Stage for BatchRecorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn output(&self) -> Option<PortKind> {
        None
    }

    fn process(&mut self, input: Payload, _out: &mut Outbox) -> Result<()> {
        if let Payload::Batch(batch) = input {
            self.log.lock().unwrap().push(Received {
                at: Instant::now(),
                source: batch.source,
                sequences: batch.frames().iter().map(Frame::sequence).collect(),
            });
        }
        Ok(())
    }
}

fn run_graph(
    sources: Vec<FrameSource>,
    batch_size: usize,
    batch_timeout: Duration,
) -> (RunStatus, Vec<Received>) {
    let mut graph = PipelineGraph::new();
    let names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();
    let muxer = BatchMuxer::new(
        "batch-mux",
        MuxConfig {
            sources: sources.len(),
            batch_size,
            batch_timeout,
            ..MuxConfig::default()
        },
    )
    .expect("muxer");
    for source in sources {
        graph.add_stage(Box::new(source)).expect("add source");
    }
    graph.add_stage(Box::new(muxer)).expect("add muxer");
    let log = Arc::new(Mutex::new(Vec::new()));
    graph
        .add_stage(Box::new(BatchRecorder {
            log: Arc::clone(&log),
        }))
        .expect("add recorder");
    for name in &names {
        graph.link(name, "batch-mux").expect("link source");
    }
    graph.link("batch-mux", "recorder").expect("link recorder");

    let report = ControlLoop::new()
        .with_run_timeout(Some(Duration::from_secs(10)))
        .run(&mut graph)
        .expect("run");
    let received = log.lock().unwrap().clone();
    (report.status, received)
}

#[test]
fn every_frame_lands_in_exactly_one_batch() {
    let sources = vec![
        FrameSource::new("src-0", 0, 9, Duration::ZERO),
        FrameSource::new("src-1", 1, 6, Duration::ZERO),
    ];
    let (status, received) = run_graph(sources, 4, Duration::from_millis(33));
    assert_eq!(status, RunStatus::Success);

    for source in [0u32, 1] {
        let mut seen: Vec<u64> = received
            .iter()
            .filter(|r| r.source == source)
            .flat_map(|r| r.sequences.clone())
            .collect();
        let expected = if source == 0 { 9 } else { 6 };
        // Arrival order within a source is preserved.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        seen.dedup();
        assert_eq!(seen, (0..expected).collect::<Vec<u64>>());
    }
    assert!(received.iter().all(|r| !r.sequences.is_empty() && r.sequences.len() <= 4));
}

#[test]
fn batch_size_one_emits_single_frames() {
    let sources = vec![FrameSource::new("src", 0, 12, Duration::ZERO)];
    let (status, received) = run_graph(sources, 1, Duration::from_millis(33));
    assert_eq!(status, RunStatus::Success);
    assert_eq!(received.len(), 12);
    assert!(received.iter().all(|r| r.sequences.len() == 1));
}

#[test]
fn burst_fills_one_batch_without_waiting() {
    let source = FrameSource::new("src", 0, 4, Duration::from_millis(300));
    let sent_at = Arc::clone(&source.sent_at);
    let (status, received) = run_graph(vec![source], 4, Duration::from_millis(33));
    assert_eq!(status, RunStatus::Success);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sequences, vec![0, 1, 2, 3]);
    // Emitted on size, well before the end-of-stream flush.
    let last_sent = *sent_at.lock().unwrap().last().unwrap();
    assert!(received[0].at.duration_since(last_sent) < Duration::from_millis(250));
}

#[test]
fn lone_frame_waits_for_the_timeout() {
    let timeout = Duration::from_millis(33);
    let source = FrameSource::new("src", 0, 1, Duration::from_millis(400));
    let sent_at = Arc::clone(&source.sent_at);
    let (status, received) = run_graph(vec![source], 4, timeout);
    assert_eq!(status, RunStatus::Success);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].sequences, vec![0]);

    let waited = received[0].at.duration_since(sent_at.lock().unwrap()[0]);
    assert!(waited >= timeout, "emitted after {:?}", waited);
    assert!(waited < Duration::from_millis(350), "emitted after {:?}", waited);
}
