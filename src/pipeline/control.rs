//! Control loop: consumes the event channel and owns start/stop.

use crossbeam_channel::{after, never, select, Receiver, Sender};
use std::time::{Duration, Instant};

use super::PipelineGraph;
use crate::error::Result;
use crate::event::{PipelineEvent, Severity};

/// Stage name used for faults raised by the control loop itself.
pub const PIPELINE_STAGE: &str = "pipeline";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Every source reached end of stream.
    Success,
    Failed { stage: String, cause: String },
    /// Stopped through a `StopHandle`.
    Interrupted,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed { .. } => 1,
            RunStatus::Interrupted => 130,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunReport {
    pub status: RunStatus,
    /// Warnings and non-fatal errors observed.
    pub warnings: usize,
    pub fatal_events: usize,
    pub events: usize,
    pub elapsed: Duration,
}

/// Requests an external stop. Cloneable and safe to call from a signal handler thread.
#[derive(Clone, Debug)]
pub struct StopHandle {
    tx: Sender<()>,
}

impl StopHandle {
    pub fn stop(&self) {
        // A pending request is enough; repeated requests are dropped.
        let _ = self.tx.try_send(());
    }
}

pub struct ControlLoop {
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    run_timeout: Option<Duration>,
}

#[derive(Default)]
struct Tally {
    warnings: usize,
    fatal: usize,
    events: usize,
}

impl ControlLoop {
    pub fn new() -> Self {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        Self {
            stop_tx,
            stop_rx,
            run_timeout: None,
        }
    }

    /// Fail the run once `timeout` has elapsed without a terminal event.
    pub fn with_run_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.run_timeout = timeout;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    pub fn run(&self, graph: &mut PipelineGraph) -> Result<RunReport> {
        self.run_with(graph, |_| {})
    }

    /// Start `graph` and drive it until end of stream, a fatal fault or an external
    /// stop. Every consumed event is passed to `observer`.
    pub fn run_with<F>(&self, graph: &mut PipelineGraph, mut observer: F) -> Result<RunReport>
    where
        F: FnMut(&PipelineEvent),
    {
        let started = Instant::now();
        let events = graph.events();
        let faults = graph.event_sender();
        graph.start()?;

        let timer = self.run_timeout.map(after).unwrap_or_else(never);
        let mut tally = Tally::default();
        let status = loop {
            // External stop takes priority over anything already queued.
            if self.stop_rx.try_recv().is_ok() {
                break RunStatus::Interrupted;
            }
            select! {
                recv(self.stop_rx) -> _ => break RunStatus::Interrupted,
                recv(events) -> msg => {
                    let Ok(event) = msg else {
                        break RunStatus::Failed {
                            stage: PIPELINE_STAGE.to_string(),
                            cause: "event channel closed".to_string(),
                        };
                    };
                    tally.events += 1;
                    observer(&event);
                    if let Some(status) = self.handle(graph, &event, &mut tally) {
                        break status;
                    }
                },
                recv(timer) -> _ => {
                    let limit = self.run_timeout.unwrap_or_default();
                    faults.error(
                        PIPELINE_STAGE,
                        format!("run timeout of {:?} elapsed", limit),
                        Severity::Fatal,
                    );
                },
            }
        };

        if status == RunStatus::Interrupted {
            log::info!("stop requested");
        }
        graph.stop();

        for event in events.try_iter() {
            tally.events += 1;
            match &event {
                PipelineEvent::Warning { .. } => tally.warnings += 1,
                PipelineEvent::Error { severity, .. } => match severity {
                    Severity::Warning => tally.warnings += 1,
                    Severity::Fatal => tally.fatal += 1,
                },
                _ => {}
            }
            observer(&event);
        }

        let report = RunReport {
            status,
            warnings: tally.warnings,
            fatal_events: tally.fatal,
            events: tally.events,
            elapsed: started.elapsed(),
        };
        match &report.status {
            RunStatus::Success => log::info!(
                "pipeline finished after {:?} ({} warning(s))",
                report.elapsed,
                report.warnings
            ),
            RunStatus::Failed { stage, cause } => {
                log::error!("pipeline failed in {}: {}", stage, cause)
            }
            RunStatus::Interrupted => log::info!("pipeline interrupted after {:?}", report.elapsed),
        }
        Ok(report)
    }

    fn handle(
        &self,
        graph: &mut PipelineGraph,
        event: &PipelineEvent,
        tally: &mut Tally,
    ) -> Option<RunStatus> {
        match event {
            PipelineEvent::Error {
                stage,
                cause,
                severity: Severity::Fatal,
            } => {
                tally.fatal += 1;
                log::error!("{}", event);
                graph.mark_errored();
                Some(RunStatus::Failed {
                    stage: stage.clone(),
                    cause: cause.clone(),
                })
            }
            PipelineEvent::EndOfStream { stage } => {
                log::info!("end of stream reached at {}", stage);
                Some(RunStatus::Success)
            }
            PipelineEvent::Warning { .. } | PipelineEvent::Error { .. } => {
                tally.warnings += 1;
                log::warn!("{}", event);
                None
            }
            PipelineEvent::StateChanged { .. } => {
                log::debug!("{}", event);
                None
            }
        }
    }
}

impl Default for ControlLoop {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_status() {
        assert_eq!(RunStatus::Success.exit_code(), 0);
        let failed = RunStatus::Failed {
            stage: "publish".to_string(),
            cause: "connection refused".to_string(),
        };
        assert_eq!(failed.exit_code(), 1);
        assert_eq!(RunStatus::Interrupted.exit_code(), 130);
    }

    #[test]
    fn stop_handle_never_blocks() {
        let control = ControlLoop::new();
        let handle = control.stop_handle();
        handle.stop();
        handle.stop();
        assert!(control.stop_rx.try_recv().is_ok());
        assert!(control.stop_rx.try_recv().is_err());
    }
}
