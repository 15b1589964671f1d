//! Error taxonomy of the pipeline graph API.
//!
//! Startup problems (`Configuration`, `Link`) abort before `start()`. Runtime faults
//! travel through the event channel; the `StageFault` and `ProbeFault` variants are
//! the formatted form the runner logs before publishing them.

use thiserror::Error;

use crate::event::Severity;
use crate::pipeline::PipelineState;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error in stage '{stage}': {reason}")]
    Configuration { stage: String, reason: String },

    #[error("cannot link '{upstream}' -> '{downstream}': {reason}")]
    Link {
        upstream: String,
        downstream: String,
        reason: String,
    },

    #[error("stage '{stage}' {severity} fault: {cause}")]
    StageFault {
        stage: String,
        severity: Severity,
        cause: String,
    },

    #[error("probe '{probe}' failed on frame {frame}: {cause}")]
    ProbeFault {
        probe: String,
        frame: u64,
        cause: String,
    },

    #[error("cannot {operation} while pipeline is {state}")]
    InvalidState {
        state: PipelineState,
        operation: &'static str,
    },
}

impl PipelineError {
    pub fn configuration(stage: impl Into<String>, reason: impl ToString) -> Self {
        PipelineError::Configuration {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }

    pub fn link(
        upstream: impl Into<String>,
        downstream: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        PipelineError::Link {
            upstream: upstream.into(),
            downstream: downstream.into(),
            reason: reason.to_string(),
        }
    }
}
