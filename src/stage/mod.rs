//! Stage abstraction and the concrete collaborators of the camera pipeline.
//!
//! A stage is an opaque unit of work with typed ports. The graph drives every stage
//! through the same capability set: `configure`, `start`, `stop`, and either
//! `produce` (sources) or `process` (everything downstream). Concrete variants are
//! chosen from configuration by `PipelineGraph::build`.

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Instant;

use crate::event::Severity;
use crate::frame::{Payload, PortKind, SourceId};

pub mod capture;
pub mod convert;
pub mod decode;
pub mod infer;
pub mod overlay;
pub mod parse;
pub mod publish;
pub mod track;

pub use capture::{CaptureConfig, CaptureStage};
pub use convert::ConvertStage;
pub use decode::{DecodeConfig, DecodeStage};
pub use infer::{PrimaryInferStage, SecondaryInferStage};
pub use overlay::OverlayStage;
pub use parse::ParseStage;
pub use publish::{stub_sink, PublishStage, PublishedFrame, PublishedLog};
pub use track::TrackerStage;

/// A processing unit in the pipeline graph.
///
/// Runtime failures are returned as `anyhow` errors. Returning a [`Fault`] picks the
/// severity; any other error is treated as fatal.
pub trait Stage: Send {
    fn name(&self) -> &str;

    /// Kind accepted on the input port(s); `None` for sources.
    fn input(&self) -> Option<PortKind>;

    /// Kind emitted on the output port; `None` for sinks.
    fn output(&self) -> Option<PortKind>;

    /// Number of upstream links the stage accepts.
    fn max_inputs(&self) -> usize {
        usize::from(self.input().is_some())
    }

    /// Apply static options. Stages reject options they do not know.
    fn configure(&mut self, options: &StageOptions) -> Result<()> {
        options.reject_unknown(self.name(), &[])
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Produce the next unit (sources only). `Ok(None)` means nothing is ready yet;
    /// emitting `Payload::EndOfStream` ends the source.
    fn produce(&mut self) -> Result<Option<Payload>> {
        bail!("stage {} has no source port", self.name())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let _ = (input, out);
        bail!("stage {} has no input port", self.name())
    }

    /// Called before end-of-stream for `source` is forwarded downstream.
    fn end_of_stream(&mut self, source: SourceId, out: &mut Outbox) -> Result<()> {
        let _ = (source, out);
        Ok(())
    }

    /// Earliest instant at which `on_deadline` must run, if any.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn on_deadline(&mut self, now: Instant, out: &mut Outbox) -> Result<()> {
        let _ = (now, out);
        Ok(())
    }
}

/// Runtime fault with an explicit severity.
#[derive(Debug, thiserror::Error)]
#[error("{cause}")]
pub struct Fault {
    pub severity: Severity,
    pub cause: String,
}

impl Fault {
    pub fn warning(cause: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            cause: cause.into(),
        }
    }

    pub fn fatal(cause: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            cause: cause.into(),
        }
    }
}

/// Severity of an error returned by a stage.
pub fn fault_severity(err: &anyhow::Error) -> Severity {
    err.downcast_ref::<Fault>()
        .map(|fault| fault.severity)
        .unwrap_or(Severity::Fatal)
}

/// Units emitted by one `process` call, forwarded in push order.
#[derive(Debug, Default)]
pub struct Outbox {
    items: Vec<Payload>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: Payload) {
        self.items.push(payload);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, Payload> {
        self.items.drain(..)
    }
}

/// Property bag applied through `Stage::configure`.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(transparent)]
pub struct StageOptions(BTreeMap<String, serde_json::Value>);

impl StageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Parse option `key`, accepting both strings and bare JSON/TOML scalars.
    pub fn get<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(value) = self.0.get(key) else {
            return Ok(None);
        };
        let raw = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        raw.parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("option {}={}: {}", key, raw, e))
    }

    pub fn reject_unknown(&self, stage: &str, known: &[&str]) -> Result<()> {
        if let Some(key) = self.keys().find(|key| !known.contains(key)) {
            bail!("stage {} does not support option '{}'", stage, key);
        }
        Ok(())
    }
}
