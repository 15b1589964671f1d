//! Camera analytics pipeline.
//!
//! A live camera feed is captured, parsed, decoded, batched, run through object
//! detection, tracking and secondary classification, annotated, drawn and published
//! as a stream.
//!
//! # Architecture
//!
//! ```text
//! capture -> parse -> decode -> batch-mux -> primary-infer -> tracker
//!     -> secondary-infer-1..n -> convert -> overlay -> publish
//! ```
//!
//! - `pipeline`: the stage graph (build, link, start, stop) and the control loop
//!   that consumes the event channel until end of stream, a fatal error or an
//!   interrupt.
//! - `stage`: the `Stage` trait and the concrete stages.
//! - `mux`: the batch muxer, which groups frames of one source by size or timeout.
//! - `probe`: per-frame metadata observers attached at a stage input.
//! - `detect`: detector and classifier backends behind a registry.
//! - `frame` / `metadata`: units moving across links and their append-only
//!   analytics record.
//! - `event`: the multi-producer event channel.
//! - `config`: file and environment configuration.

pub mod config;
pub mod detect;
pub mod error;
pub mod event;
pub mod frame;
pub mod metadata;
pub mod mux;
pub mod pipeline;
pub mod probe;
pub mod stage;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use event::{EventSender, PipelineEvent, Severity, StageState};
pub use frame::{Batch, Frame, Packet, Payload, PixelFormat, PortKind, SourceId};
pub use metadata::{BoundingBox, ClassCounts, DetectionRecord, Metadata, ObjectClass};
pub use mux::{BatchMuxer, MuxConfig, MuxWindow};
pub use pipeline::{ControlLoop, PipelineGraph, PipelineState, RunReport, RunStatus, StopHandle};
pub use probe::{MetadataProbe, ObjectCounter, ProbeAnnotator};
pub use stage::{Stage, StageOptions};
