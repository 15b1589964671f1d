//! Pipeline graph.
//!
//! The graph owns every stage, the links between their ports, and the collective
//! lifecycle: build, link, start, stop. While running, each stage lives on its own
//! thread and hands payloads to its downstream neighbour over a bounded channel; the
//! graph keeps only the control senders and join handles. `stop()` drops those
//! senders in reverse topological order and takes the stages back, so a stopped
//! graph can be started again.

use crossbeam_channel::{Receiver, Sender};
use std::fmt;
use std::thread::{self, JoinHandle};

use crate::config::PipelineConfig;
use crate::detect::{BackendRegistry, DetectorParams};
use crate::error::{PipelineError, Result};
use crate::event::{event_channel, EventSender, PipelineEvent, Severity, StageState};
use crate::frame::{Payload, PortKind, SourceId};
use crate::mux::{BatchMuxer, MuxConfig};
use crate::probe::MetadataProbe;
use crate::stage::{
    CaptureConfig, CaptureStage, ConvertStage, DecodeConfig, DecodeStage, OverlayStage,
    ParseStage, PrimaryInferStage, PublishStage, SecondaryInferStage, Stage, StageOptions,
    TrackerStage,
};

mod control;
mod runner;

pub use control::{ControlLoop, RunReport, RunStatus, StopHandle};

use runner::{RunnerExit, StageRunner};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 4;

pub const MUX_STAGE: &str = "batch-mux";
pub const PRIMARY_STAGE: &str = "primary-infer";
pub const TRACKER_STAGE: &str = "tracker";
pub const CONVERT_STAGE: &str = "convert";
pub const OVERLAY_STAGE: &str = "overlay";
pub const PUBLISH_STAGE: &str = "publish";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running,
    Stopping,
    /// A fatal fault was observed. Absorbing: the graph can be stopped but not restarted.
    Errored,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Errored => "errored",
        };
        f.write_str(name)
    }
}

struct Worker {
    /// Never sent on; dropping it tells the runner to exit.
    control: Sender<()>,
    handle: JoinHandle<RunnerExit>,
}

struct Slot {
    name: String,
    stage: Option<Box<dyn Stage>>,
    input: Option<PortKind>,
    output: Option<PortKind>,
    max_inputs: usize,
    upstream: Vec<usize>,
    downstream: Option<usize>,
    probe: Option<Box<dyn MetadataProbe>>,
    worker: Option<Worker>,
}

pub struct PipelineGraph {
    slots: Vec<Slot>,
    /// Links declared by `build`, applied by `link_all`.
    planned: Vec<(usize, usize)>,
    /// Start order of the currently running workers.
    running: Vec<usize>,
    state: PipelineState,
    channel_capacity: usize,
    events_tx: EventSender,
    events_rx: Receiver<PipelineEvent>,
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(channel_capacity: usize) -> Self {
        let (events_tx, events_rx) = event_channel();
        Self {
            slots: Vec::new(),
            planned: Vec::new(),
            running: Vec::new(),
            state: PipelineState::Idle,
            channel_capacity: channel_capacity.max(1),
            events_tx,
            events_rx,
        }
    }

    /// Instantiate every stage named by `config`, in topological order. Links are
    /// planned but not made; call [`link_all`](Self::link_all) next.
    pub fn build(config: &PipelineConfig) -> Result<Self> {
        if config.sources.is_empty() {
            return Err(PipelineError::configuration(
                "capture",
                "no capture source configured",
            ));
        }
        let mut graph = Self::with_capacity(config.channel_capacity);
        let registry = BackendRegistry::with_defaults();
        let muxer = &config.muxer;
        let multi = config.sources.len() > 1;

        let mut decoders = Vec::with_capacity(config.sources.len());
        for (i, source) in config.sources.iter().enumerate() {
            let suffix = if multi { format!("-{}", i) } else { String::new() };
            let capture_name = format!("capture{}", suffix);
            let parse_name = format!("parse{}", suffix);
            let decode_name = format!("decode{}", suffix);
            let hardware = !source.device.starts_with("stub://");

            let capture = instantiate(
                &capture_name,
                CaptureStage::new(
                    &capture_name,
                    i as SourceId,
                    CaptureConfig {
                        device: source.device.clone(),
                        fps: source.fps,
                        width: muxer.width,
                        height: muxer.height,
                        frame_limit: source.frame_limit,
                    },
                ),
            )?;
            let capture = graph.insert(capture)?;
            let parse = graph.insert(Box::new(ParseStage::new(&parse_name)))?;
            let decode = instantiate(
                &decode_name,
                DecodeStage::new(
                    &decode_name,
                    DecodeConfig {
                        width: muxer.width,
                        height: muxer.height,
                        hardware,
                    },
                ),
            )?;
            let decode = graph.insert(decode)?;
            graph.planned.push((capture, parse));
            graph.planned.push((parse, decode));
            decoders.push(decode);
        }

        let mux = instantiate(
            MUX_STAGE,
            BatchMuxer::new(
                MUX_STAGE,
                MuxConfig {
                    sources: config.sources.len(),
                    batch_size: muxer.batch_size,
                    batch_timeout: muxer.batch_timeout,
                    width: muxer.width,
                    height: muxer.height,
                },
            ),
        )?;
        let mux = graph.insert(mux)?;
        for decode in decoders {
            graph.planned.push((decode, mux));
        }

        let mut chain = vec![mux];
        let params = DetectorParams {
            model_path: config.inference.model_path.clone(),
            width: muxer.width,
            height: muxer.height,
        };
        let primary = instantiate(
            PRIMARY_STAGE,
            registry
                .create_detector(&config.inference.backend, &params)
                .map(|backend| {
                    PrimaryInferStage::new(PRIMARY_STAGE, backend, config.inference.threshold)
                }),
        )?;
        chain.push(graph.insert(primary)?);
        chain.push(graph.insert(Box::new(TrackerStage::new(
            TRACKER_STAGE,
            config.tracker.iou_threshold,
            config.tracker.max_age,
        )))?);
        for (k, secondary) in config.inference.secondary.iter().enumerate() {
            let name = format!("secondary-infer-{}", k + 1);
            let stage = instantiate(
                &name,
                registry
                    .create_classifier(&secondary.classifier)
                    .map(|backend| {
                        SecondaryInferStage::new(&name, backend, secondary.targets.clone())
                    }),
            )?;
            chain.push(graph.insert(stage)?);
        }
        chain.push(graph.insert(Box::new(ConvertStage::new(CONVERT_STAGE)))?);
        chain.push(graph.insert(Box::new(OverlayStage::new(OVERLAY_STAGE)))?);
        let publish = instantiate(
            PUBLISH_STAGE,
            PublishStage::new(PUBLISH_STAGE, &config.publish.location),
        )?;
        chain.push(graph.insert(publish)?);
        for pair in chain.windows(2) {
            graph.planned.push((pair[0], pair[1]));
        }

        for (name, options) in &config.stage_options {
            graph.configure_stage(name, options)?;
        }
        log::info!("pipeline built: {} stages", graph.slots.len());
        Ok(graph)
    }

    /// Add a stage for a hand-assembled graph.
    pub fn add_stage(&mut self, stage: Box<dyn Stage>) -> Result<()> {
        self.insert(stage).map(|_| ())
    }

    fn insert(&mut self, stage: Box<dyn Stage>) -> Result<usize> {
        self.require_idle("add a stage")?;
        let name = stage.name().to_string();
        if self.index_of(&name).is_some() {
            return Err(PipelineError::configuration(name, "duplicate stage name"));
        }
        self.slots.push(Slot {
            input: stage.input(),
            output: stage.output(),
            max_inputs: stage.max_inputs(),
            name,
            stage: Some(stage),
            upstream: Vec::new(),
            downstream: None,
            probe: None,
            worker: None,
        });
        Ok(self.slots.len() - 1)
    }

    pub fn configure_stage(&mut self, name: &str, options: &StageOptions) -> Result<()> {
        self.require_idle("configure a stage")?;
        let index = self
            .index_of(name)
            .ok_or_else(|| PipelineError::configuration(name, "unknown stage"))?;
        let slot = &mut self.slots[index];
        let stage = slot
            .stage
            .as_mut()
            .ok_or_else(|| PipelineError::configuration(name, "stage is unavailable"))?;
        stage
            .configure(options)
            .map_err(|err| PipelineError::configuration(name, format!("{:#}", err)))?;
        slot.input = stage.input();
        slot.output = stage.output();
        slot.max_inputs = stage.max_inputs();
        Ok(())
    }

    /// Make every link planned by [`build`](Self::build).
    pub fn link_all(&mut self) -> Result<()> {
        self.require_idle("link")?;
        for (up, down) in self.planned.clone() {
            if self.slots[up].downstream == Some(down) {
                continue;
            }
            self.link_indices(up, down)?;
        }
        Ok(())
    }

    /// Connect the output of `upstream` to a free input of `downstream`.
    pub fn link(&mut self, upstream: &str, downstream: &str) -> Result<()> {
        self.require_idle("link")?;
        let up = self.index_of(upstream).ok_or_else(|| {
            PipelineError::link(upstream, downstream, format!("unknown stage '{}'", upstream))
        })?;
        let down = self.index_of(downstream).ok_or_else(|| {
            PipelineError::link(upstream, downstream, format!("unknown stage '{}'", downstream))
        })?;
        self.link_indices(up, down)
    }

    fn link_indices(&mut self, u: usize, d: usize) -> Result<()> {
        let (up, down) = (&self.slots[u], &self.slots[d]);
        let fail = |reason: String| PipelineError::link(&up.name, &down.name, reason);
        if u == d {
            return Err(fail("a stage cannot feed itself".to_string()));
        }
        let Some(out_kind) = up.output else {
            return Err(fail(format!("'{}' has no output port", up.name)));
        };
        let Some(in_kind) = down.input else {
            return Err(fail(format!("'{}' has no input port", down.name)));
        };
        if out_kind != in_kind {
            return Err(fail(format!(
                "port kinds differ: {} -> {}",
                out_kind, in_kind
            )));
        }
        if let Some(existing) = up.downstream {
            return Err(fail(format!(
                "output already linked to '{}'",
                self.slots[existing].name
            )));
        }
        if down.upstream.len() >= down.max_inputs {
            return Err(fail(format!(
                "no free input port ({} of {} in use)",
                down.upstream.len(),
                down.max_inputs
            )));
        }
        if self.reaches(d, u) {
            return Err(fail("link would create a cycle".to_string()));
        }
        log::debug!("linked {} -> {}", up.name, down.name);
        self.slots[u].downstream = Some(d);
        self.slots[d].upstream.push(u);
        Ok(())
    }

    /// Whether following outputs from `from` arrives at `to`.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut cursor = Some(from);
        while let Some(i) = cursor {
            if i == to {
                return true;
            }
            cursor = self.slots[i].downstream;
        }
        false
    }

    /// Attach the metadata probe at the input of `stage`. Only one probe may be
    /// attached per graph.
    pub fn attach_probe<P: MetadataProbe + 'static>(&mut self, stage: &str, probe: P) -> Result<()> {
        self.require_idle("attach a probe")?;
        if let Some(existing) = self.slots.iter().find(|slot| slot.probe.is_some()) {
            return Err(PipelineError::configuration(
                stage,
                format!("a probe is already attached at '{}'", existing.name),
            ));
        }
        let index = self
            .index_of(stage)
            .ok_or_else(|| PipelineError::configuration(stage, "unknown stage"))?;
        let slot = &mut self.slots[index];
        if slot.input.is_none() {
            return Err(PipelineError::configuration(stage, "stage has no input port"));
        }
        log::info!("probe '{}' attached at {}", probe.name(), slot.name);
        slot.probe = Some(Box::new(probe));
        Ok(())
    }

    /// Move every stage to Running, producers first. Idempotent while running.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Running => return Ok(()),
            PipelineState::Idle => {}
            state => {
                return Err(PipelineError::InvalidState {
                    state,
                    operation: "start",
                })
            }
        }
        if self.slots.is_empty() {
            return Err(PipelineError::configuration("pipeline", "graph has no stages"));
        }
        for slot in &self.slots {
            if slot.output.is_some() && slot.downstream.is_none() {
                return Err(PipelineError::configuration(
                    &slot.name,
                    "output port is not linked",
                ));
            }
            if slot.input.is_some() && slot.upstream.is_empty() {
                return Err(PipelineError::configuration(
                    &slot.name,
                    "input port is not linked",
                ));
            }
            if slot.stage.is_none() {
                return Err(PipelineError::configuration(
                    &slot.name,
                    "stage was lost by an earlier run",
                ));
            }
        }

        let order = self.topological_order();
        let mut outputs: Vec<Option<Sender<Payload>>> = vec![None; self.slots.len()];
        let mut inputs: Vec<Vec<Receiver<Payload>>> =
            self.slots.iter().map(|_| Vec::new()).collect();
        for (d, slot) in self.slots.iter().enumerate() {
            for &u in &slot.upstream {
                let (tx, rx) = crossbeam_channel::bounded(self.channel_capacity);
                outputs[u] = Some(tx);
                inputs[d].push(rx);
            }
        }

        if let Err(err) = self.spawn_all(&order, outputs, inputs) {
            self.halt_workers();
            return Err(err);
        }
        self.state = PipelineState::Running;
        log::info!("pipeline running ({} stages)", self.running.len());
        Ok(())
    }

    fn spawn_all(
        &mut self,
        order: &[usize],
        mut outputs: Vec<Option<Sender<Payload>>>,
        mut inputs: Vec<Vec<Receiver<Payload>>>,
    ) -> Result<()> {
        let expected: Vec<usize> = (0..self.slots.len())
            .map(|i| self.source_ancestors(i))
            .collect();
        for &i in order {
            let events = self.events_tx.clone();
            let slot = &mut self.slots[i];
            let Some(mut stage) = slot.stage.take() else {
                continue;
            };
            if let Err(err) = stage.start() {
                slot.stage = Some(stage);
                let cause = format!("{:#}", err);
                log::error!("stage {} failed to start: {}", slot.name, cause);
                events.error(&slot.name, cause.clone(), Severity::Fatal);
                return Err(PipelineError::StageFault {
                    stage: slot.name.clone(),
                    severity: Severity::Fatal,
                    cause,
                });
            }
            let (control, control_rx) = crossbeam_channel::bounded::<()>(0);
            let runner = StageRunner {
                name: slot.name.clone(),
                stage,
                probe: slot.probe.take(),
                control: control_rx,
                inputs: std::mem::take(&mut inputs[i]),
                output: outputs[i].take(),
                events: events.clone(),
                expected_eos: expected[i],
            };
            // Running goes out before the thread can publish anything of its own.
            events.state_changed(&slot.name, StageState::Idle, StageState::Running);
            let handle = match thread::Builder::new()
                .name(format!("stage-{}", slot.name))
                .spawn(move || runner.run())
            {
                Ok(handle) => handle,
                Err(err) => {
                    let cause = format!("failed to spawn stage thread: {}", err);
                    events.state_changed(&slot.name, StageState::Running, StageState::Idle);
                    events.error(&slot.name, cause.clone(), Severity::Fatal);
                    return Err(PipelineError::StageFault {
                        stage: slot.name.clone(),
                        severity: Severity::Fatal,
                        cause,
                    });
                }
            };
            slot.worker = Some(Worker { control, handle });
            self.running.push(i);
        }
        Ok(())
    }

    /// Move every stage back to Idle, consumers first. A no-op when nothing runs.
    pub fn stop(&mut self) {
        match self.state {
            PipelineState::Idle | PipelineState::Stopping => return,
            PipelineState::Errored if self.running.is_empty() => return,
            _ => {}
        }
        let errored = self.state == PipelineState::Errored;
        if !errored {
            self.state = PipelineState::Stopping;
        }
        log::info!("stopping pipeline");
        self.halt_workers();
        if !errored {
            self.state = PipelineState::Idle;
        }
        log::info!("pipeline stopped ({})", self.state);
    }

    fn halt_workers(&mut self) {
        let running = std::mem::take(&mut self.running);
        for &i in running.iter().rev() {
            let slot = &mut self.slots[i];
            let Some(worker) = slot.worker.take() else {
                continue;
            };
            drop(worker.control);
            match worker.handle.join() {
                Ok(exit) => {
                    slot.stage = Some(exit.stage);
                    slot.probe = exit.probe;
                }
                Err(_) => {
                    log::error!("stage {} thread did not exit cleanly; stage discarded", slot.name);
                    continue;
                }
            }
            if let Some(stage) = slot.stage.as_mut() {
                if let Err(err) = stage.stop() {
                    log::warn!("stage {} failed to stop cleanly: {:#}", slot.name, err);
                }
            }
            self.events_tx
                .state_changed(&slot.name, StageState::Running, StageState::Idle);
        }
    }

    /// Record a fatal fault. The graph keeps running until `stop()`.
    pub fn mark_errored(&mut self) {
        if self.state != PipelineState::Errored {
            log::error!("pipeline marked errored (was {})", self.state);
            self.state = PipelineState::Errored;
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.slots.iter().map(|slot| slot.name.as_str()).collect()
    }

    /// Receiving half of the event channel. All clones share one queue.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.events_rx.clone()
    }

    pub fn event_sender(&self) -> EventSender {
        self.events_tx.clone()
    }

    fn require_idle(&self, operation: &'static str) -> Result<()> {
        if self.state == PipelineState::Idle {
            Ok(())
        } else {
            Err(PipelineError::InvalidState {
                state: self.state,
                operation,
            })
        }
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| slot.name == name)
    }

    /// Kahn's algorithm; ties resolved by insertion order.
    fn topological_order(&self) -> Vec<usize> {
        let mut indegree: Vec<usize> = self.slots.iter().map(|s| s.upstream.len()).collect();
        let mut ready: std::collections::VecDeque<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.slots.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            if let Some(d) = self.slots[i].downstream {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        order
    }

    /// Number of source stages feeding `index`, directly or transitively.
    fn source_ancestors(&self, index: usize) -> usize {
        let mut seen = vec![false; self.slots.len()];
        let mut stack = vec![index];
        let mut sources = 0;
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            let slot = &self.slots[i];
            if slot.input.is_none() {
                sources += 1;
            }
            stack.extend(slot.upstream.iter().copied());
        }
        sources
    }
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PipelineGraph {
    fn drop(&mut self) {
        self.stop();
    }
}

fn instantiate<S: Stage + 'static>(name: &str, stage: anyhow::Result<S>) -> Result<Box<dyn Stage>> {
    stage
        .map(|stage| Box::new(stage) as Box<dyn Stage>)
        .map_err(|err| PipelineError::configuration(name, format!("{:#}", err)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display_is_lowercase() {
        assert_eq!(PipelineState::Errored.to_string(), "errored");
        assert_eq!(PipelineState::Idle.to_string(), "idle");
    }

    #[test]
    fn empty_graph_refuses_to_start() {
        let mut graph = PipelineGraph::new();
        assert!(matches!(
            graph.start(),
            Err(PipelineError::Configuration { .. })
        ));
        graph.stop();
        assert_eq!(graph.state(), PipelineState::Idle);
    }
}
