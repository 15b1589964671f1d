//! Per-stage worker loop.
//!
//! Each running stage owns one thread executing a `StageRunner`. Sources poll
//! `produce`; every other stage selects over its control channel and its open inputs,
//! waking early when the stage has a pending deadline. Dropping the control sender
//! ends the loop; the runner then hands the stage back to the graph.

use crossbeam_channel::{Receiver, Select, Sender, TryRecvError};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::event::{EventSender, Severity};
use crate::frame::Payload;
use crate::probe::{panic_message, run_probe, MetadataProbe};
use crate::stage::{fault_severity, Outbox, Stage};

/// Back-off when a source has nothing ready.
const IDLE_POLL: Duration = Duration::from_millis(1);

pub(crate) struct RunnerExit {
    pub stage: Box<dyn Stage>,
    pub probe: Option<Box<dyn MetadataProbe>>,
}

pub(crate) struct StageRunner {
    pub name: String,
    pub stage: Box<dyn Stage>,
    pub probe: Option<Box<dyn MetadataProbe>>,
    pub control: Receiver<()>,
    pub inputs: Vec<Receiver<Payload>>,
    pub output: Option<Sender<Payload>>,
    pub events: EventSender,
    /// End-of-stream markers a sink waits for before reporting end of stream.
    pub expected_eos: usize,
}

enum Selected {
    Stop,
    Deadline,
    Input(usize, Option<Payload>),
}

impl StageRunner {
    pub fn run(mut self) -> RunnerExit {
        log::debug!("stage {} running", self.name);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if self.inputs.is_empty() {
                self.run_source();
            } else {
                self.run_consumer();
            }
        }));
        if let Err(payload) = outcome {
            let cause = format!("stage panicked: {}", panic_message(payload.as_ref()));
            log::error!("{}: {}", self.name, cause);
            self.events.error(&self.name, cause, Severity::Fatal);
        }
        log::debug!("stage {} exiting", self.name);
        RunnerExit {
            stage: self.stage,
            probe: self.probe,
        }
    }

    fn run_source(&mut self) {
        loop {
            match self.control.try_recv() {
                Err(TryRecvError::Empty) => {}
                _ => return,
            }
            let payload = match self.stage.produce() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    thread::sleep(IDLE_POLL);
                    continue;
                }
                Err(err) => {
                    if self.report(err) == Severity::Fatal {
                        return;
                    }
                    continue;
                }
            };
            let eos = matches!(payload, Payload::EndOfStream { .. });
            if !self.send(payload) {
                return;
            }
            if eos {
                log::info!("{}: end of stream", self.name);
                return;
            }
        }
    }

    fn run_consumer(&mut self) {
        let mut open = vec![true; self.inputs.len()];
        let mut eos_seen = 0usize;
        loop {
            let deadline = self.stage.deadline();
            let selected = {
                let mut sel = Select::new();
                let control = sel.recv(&self.control);
                let mut slots = Vec::with_capacity(self.inputs.len());
                for (i, rx) in self.inputs.iter().enumerate() {
                    if open[i] {
                        slots.push((sel.recv(rx), i));
                    }
                }
                if slots.is_empty() {
                    log::debug!("{}: all inputs closed", self.name);
                    return;
                }
                let oper = match deadline {
                    Some(at) => sel.select_deadline(at).ok(),
                    None => Some(sel.select()),
                };
                match oper {
                    None => Selected::Deadline,
                    Some(oper) if oper.index() == control => {
                        let _ = oper.recv(&self.control);
                        Selected::Stop
                    }
                    Some(oper) => {
                        let index = oper.index();
                        let input = slots
                            .iter()
                            .find(|(op, _)| *op == index)
                            .map(|(_, i)| *i)
                            .unwrap_or_default();
                        Selected::Input(input, oper.recv(&self.inputs[input]).ok())
                    }
                }
            };

            match selected {
                Selected::Stop => return,
                Selected::Deadline => {}
                Selected::Input(input, None) => open[input] = false,
                Selected::Input(_, Some(payload)) => {
                    if !self.handle(payload, &mut eos_seen) {
                        return;
                    }
                }
            }

            if self.stage.deadline().is_some_and(|at| at <= Instant::now())
                && !self.fire_deadline()
            {
                return;
            }
        }
    }

    /// Returns false when the loop must end.
    fn handle(&mut self, mut payload: Payload, eos_seen: &mut usize) -> bool {
        if let Payload::EndOfStream { source } = payload {
            let mut out = Outbox::new();
            let result = self.stage.end_of_stream(source, &mut out);
            if !self.flush(&mut out) {
                return false;
            }
            if let Err(err) = result {
                if self.report(err) == Severity::Fatal {
                    return false;
                }
            }
            if self.output.is_some() {
                return self.send(payload);
            }
            *eos_seen += 1;
            if *eos_seen == self.expected_eos.max(1) {
                log::info!("{}: all sources ended", self.name);
                self.events.end_of_stream(&self.name);
            }
            return true;
        }

        if let Some(probe) = self.probe.as_mut() {
            match &mut payload {
                Payload::Frame(frame) => {
                    run_probe(&mut **probe, frame, &self.name, &self.events);
                }
                Payload::Batch(batch) => {
                    for frame in batch.frames_mut() {
                        run_probe(&mut **probe, frame, &self.name, &self.events);
                    }
                }
                _ => {}
            }
        }

        let mut out = Outbox::new();
        let result = self.stage.process(payload, &mut out);
        let delivered = self.flush(&mut out);
        if let Err(err) = result {
            if self.report(err) == Severity::Fatal {
                return false;
            }
        }
        delivered
    }

    fn fire_deadline(&mut self) -> bool {
        let mut out = Outbox::new();
        let result = self.stage.on_deadline(Instant::now(), &mut out);
        let delivered = self.flush(&mut out);
        if let Err(err) = result {
            if self.report(err) == Severity::Fatal {
                return false;
            }
        }
        delivered
    }

    fn flush(&self, out: &mut Outbox) -> bool {
        for payload in out.drain() {
            if !self.send(payload) {
                return false;
            }
        }
        true
    }

    fn send(&self, payload: Payload) -> bool {
        match &self.output {
            Some(tx) => match tx.send(payload) {
                Ok(()) => true,
                Err(_) => {
                    log::debug!("{}: downstream closed", self.name);
                    false
                }
            },
            None => true,
        }
    }

    fn report(&self, err: anyhow::Error) -> Severity {
        let severity = fault_severity(&err);
        let cause = format!("{:#}", err);
        let fault = PipelineError::StageFault {
            stage: self.name.clone(),
            severity,
            cause: cause.clone(),
        };
        match severity {
            Severity::Warning => log::warn!("{}", fault),
            Severity::Fatal => log::error!("{}", fault),
        }
        self.events.error(&self.name, cause, severity);
        severity
    }
}
