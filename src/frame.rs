//! Media units carried on pipeline links.
//!
//! - `Packet`: one encoded access unit (capture, parse).
//! - `Frame`: decoded pixels plus the append-only `Metadata` record.
//! - `Batch`: frames of one source grouped by the batch muxer.
//!
//! None of these implement `Clone`. A unit is held by exactly one stage at a time and
//! ownership moves across links; pixel bytes stay private to the frame.
//!
//! ```compile_fail
//! use camera_analytics::frame::Frame;
//! fn duplicate(frame: &Frame) -> Frame {
//!     frame.clone()
//! }
//! ```
//!
//! ```compile_fail
//! use camera_analytics::frame::Frame;
//! fn peek(frame: &Frame) -> usize {
//!     frame.pixels.len()
//! }
//! ```

use std::fmt;
use std::time::{Duration, Instant};

use crate::metadata::Metadata;

/// Index of the capture source a unit originated from.
pub type SourceId = u32;

/// Kind of unit a stage port accepts or emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    Packets,
    Frames,
    Batches,
}

impl fmt::Display for PortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortKind::Packets => "packets",
            PortKind::Frames => "frames",
            PortKind::Batches => "batches",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// Packet
// ----------------------------------------------------------------------------

/// Encoded access unit.
pub struct Packet {
    data: Vec<u8>,
    pub source: SourceId,
    pub sequence: u64,
    pub pts: Duration,
    /// Set by the parser when the unit carries an IDR slice.
    pub keyframe: bool,
}

impl Packet {
    pub fn new(source: SourceId, sequence: u64, pts: Duration, data: Vec<u8>) -> Self {
        Self {
            data,
            source,
            sequence,
            pts,
            keyframe: false,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Frame
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4:2:0 luma plane followed by interleaved chroma.
    Nv12,
    Rgba,
}

impl PixelFormat {
    pub fn buffer_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv12 => pixels + pixels / 2,
            PixelFormat::Rgba => pixels * 4,
        }
    }
}

/// Decoded image plus its metadata.
pub struct Frame {
    /// Private pixel data; stages read through `pixels()` / `view()`.
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
    source: SourceId,
    sequence: u64,
    pts: Duration,
    decoded_at: Instant,
    metadata: Metadata,
}

impl Frame {
    pub fn new(
        source: SourceId,
        sequence: u64,
        pts: Duration,
        width: u32,
        height: u32,
        format: PixelFormat,
        pixels: Vec<u8>,
    ) -> Self {
        Self {
            pixels,
            width,
            height,
            format,
            source,
            sequence,
            pts,
            decoded_at: Instant::now(),
            metadata: Metadata::new(),
        }
    }

    pub fn source(&self) -> SourceId {
        self.source
    }

    /// Per-source sequence number assigned at decode.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn pts(&self) -> Duration {
        self.pts
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    /// Swap in a converted buffer. Metadata is untouched.
    pub fn replace_pixels(&mut self, format: PixelFormat, pixels: Vec<u8>) {
        self.format = format;
        self.pixels = pixels;
    }

    /// Time since the frame left the decoder.
    pub fn age(&self) -> Duration {
        self.decoded_at.elapsed()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    /// Read-only view handed to inference backends.
    pub fn view(&self) -> FrameView<'_> {
        FrameView { frame: self }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("source", &self.source)
            .field("sequence", &self.sequence)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.pixels.len())
            .field("records", &self.metadata.record_count())
            .finish()
    }
}

/// Borrowed, read-only access to a frame's pixels and geometry.
#[derive(Clone, Copy)]
pub struct FrameView<'a> {
    frame: &'a Frame,
}

impl<'a> FrameView<'a> {
    pub fn width(&self) -> u32 {
        self.frame.width
    }

    pub fn height(&self) -> u32 {
        self.frame.height
    }

    pub fn format(&self) -> PixelFormat {
        self.frame.format
    }

    pub fn pixels(&self) -> &'a [u8] {
        &self.frame.pixels
    }

    pub fn source(&self) -> SourceId {
        self.frame.source
    }

    pub fn sequence(&self) -> u64 {
        self.frame.sequence
    }

    pub fn metadata(&self) -> &'a Metadata {
        &self.frame.metadata
    }
}

// ----------------------------------------------------------------------------
// Batch
// ----------------------------------------------------------------------------

/// Frames of one source emitted together by the muxer, in arrival order.
#[derive(Debug)]
pub struct Batch {
    frames: Vec<Frame>,
    pub id: u64,
    pub source: SourceId,
    /// Output resolution configured on the muxer.
    pub width: u32,
    pub height: u32,
}

impl Batch {
    pub fn new(id: u64, source: SourceId, width: u32, height: u32, frames: Vec<Frame>) -> Self {
        Self {
            frames,
            id,
            source,
            width,
            height,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut [Frame] {
        &mut self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }
}

// ----------------------------------------------------------------------------
// Payload
// ----------------------------------------------------------------------------

/// Unit moving across a link.
#[derive(Debug)]
pub enum Payload {
    Packet(Packet),
    Frame(Frame),
    Batch(Batch),
    /// The named source will send nothing more.
    EndOfStream { source: SourceId },
}

impl Payload {
    /// Port kind this payload travels on; `None` for end-of-stream, which may
    /// travel on any port.
    pub fn kind(&self) -> Option<PortKind> {
        match self {
            Payload::Packet(_) => Some(PortKind::Packets),
            Payload::Frame(_) => Some(PortKind::Frames),
            Payload::Batch(_) => Some(PortKind::Batches),
            Payload::EndOfStream { .. } => None,
        }
    }

    pub fn frame_count(&self) -> usize {
        match self {
            Payload::Frame(_) => 1,
            Payload::Batch(batch) => batch.len(),
            _ => 0,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("source", &self.source)
            .field("sequence", &self.sequence)
            .field("keyframe", &self.keyframe)
            .field("bytes", &self.data.len())
            .finish()
    }
}
