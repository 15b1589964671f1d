//! Pipeline event channel.
//!
//! Every stage publishes into one multi-producer channel; the control loop is the
//! only consumer. A single publisher's events arrive in emission order.

use crossbeam_channel::{Receiver, Sender};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    Idle,
    Running,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Idle => f.write_str("idle"),
            StageState::Running => f.write_str("running"),
        }
    }
}

/// Whether a fault requires the whole graph to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warning => f.write_str("warning"),
            Severity::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        stage: String,
        from: StageState,
        to: StageState,
    },
    Warning {
        stage: String,
        message: String,
        /// Sequence number of the frame involved, when there is one.
        frame: Option<u64>,
    },
    Error {
        stage: String,
        cause: String,
        severity: Severity,
    },
    EndOfStream {
        stage: String,
    },
}

impl PipelineEvent {
    pub fn stage(&self) -> &str {
        match self {
            PipelineEvent::StateChanged { stage, .. }
            | PipelineEvent::Warning { stage, .. }
            | PipelineEvent::Error { stage, .. }
            | PipelineEvent::EndOfStream { stage } => stage,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineEvent::Error {
                severity: Severity::Fatal,
                ..
            }
        )
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::StateChanged { stage, from, to } => {
                write!(f, "{}: {} -> {}", stage, from, to)
            }
            PipelineEvent::Warning {
                stage,
                message,
                frame: Some(seq),
            } => write!(f, "{}: warning on frame {}: {}", stage, seq, message),
            PipelineEvent::Warning { stage, message, .. } => {
                write!(f, "{}: warning: {}", stage, message)
            }
            PipelineEvent::Error {
                stage,
                cause,
                severity,
            } => write!(f, "{}: {} error: {}", stage, severity, cause),
            PipelineEvent::EndOfStream { stage } => write!(f, "{}: end of stream", stage),
        }
    }
}

/// Create the pipeline-wide event channel.
pub fn event_channel() -> (EventSender, Receiver<PipelineEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSender { tx }, rx)
}

/// Cloneable publishing half of the event channel.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: Sender<PipelineEvent>,
}

impl EventSender {
    pub fn publish(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("event channel closed; event dropped");
        }
    }

    pub fn state_changed(&self, stage: &str, from: StageState, to: StageState) {
        self.publish(PipelineEvent::StateChanged {
            stage: stage.to_string(),
            from,
            to,
        });
    }

    pub fn warning(&self, stage: &str, message: impl Into<String>, frame: Option<u64>) {
        self.publish(PipelineEvent::Warning {
            stage: stage.to_string(),
            message: message.into(),
            frame,
        });
    }

    pub fn error(&self, stage: &str, cause: impl Into<String>, severity: Severity) {
        self.publish(PipelineEvent::Error {
            stage: stage.to_string(),
            cause: cause.into(),
            severity,
        });
    }

    pub fn end_of_stream(&self, stage: &str) {
        self.publish(PipelineEvent::EndOfStream {
            stage: stage.to_string(),
        });
    }
}
