//! Batch muxer.
//!
//! Frames arrive from one or more decode stages and are grouped per source into
//! batches of at most `batch_size`. A batch is emitted as soon as it is full, or once
//! `batch_timeout` has passed since its oldest pending frame arrived. Size wins ties.
//! End-of-stream for a source flushes whatever that source still has pending.
//!
//! The timing core, [`MuxWindow`], takes explicit `Instant`s so its behaviour can be
//! checked without sleeping; [`BatchMuxer`] wraps it as a pipeline stage.

use anyhow::{anyhow, bail, Result};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::frame::{Batch, Frame, Payload, PortKind, SourceId};
use crate::stage::{Outbox, Stage, StageOptions};

pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(33);

// ----------------------------------------------------------------------------
// Timing core
// ----------------------------------------------------------------------------

struct Pending {
    frames: Vec<Frame>,
    oldest: Instant,
}

/// Why a window was emitted from `MuxWindow::push`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Trigger {
    Size,
    /// The oldest frame had already waited `timeout` when the next one arrived.
    Timeout,
}

/// Per-source pending windows.
pub struct MuxWindow {
    batch_size: usize,
    timeout: Duration,
    pending: BTreeMap<SourceId, Pending>,
}

impl MuxWindow {
    pub fn new(batch_size: usize, timeout: Duration) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be at least 1");
        }
        Ok(Self {
            batch_size,
            timeout,
            pending: BTreeMap::new(),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Add a frame that arrived at `now`. Returns the source's batch when the
    /// window is full or its oldest frame has waited `timeout`; size wins ties.
    pub fn push(&mut self, frame: Frame, now: Instant) -> Option<(Trigger, Vec<Frame>)> {
        let source = frame.source();
        let window = self.pending.entry(source).or_insert_with(|| Pending {
            frames: Vec::with_capacity(self.batch_size),
            oldest: now,
        });
        window.frames.push(frame);
        let full = window.frames.len() >= self.batch_size;
        let expired = now.saturating_duration_since(window.oldest) >= self.timeout;
        let trigger = if full {
            Trigger::Size
        } else if expired {
            Trigger::Timeout
        } else {
            return None;
        };
        self.pending.remove(&source).map(|p| (trigger, p.frames))
    }

    /// Remove and return every window whose oldest frame is at least `timeout` old.
    pub fn expire(&mut self, now: Instant) -> Vec<(SourceId, Vec<Frame>)> {
        let due: Vec<SourceId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.oldest) >= self.timeout)
            .map(|(source, _)| *source)
            .collect();
        due.into_iter()
            .filter_map(|source| self.pending.remove(&source).map(|p| (source, p.frames)))
            .collect()
    }

    /// Remove the pending window of `source`, if any.
    pub fn flush(&mut self, source: SourceId) -> Option<Vec<Frame>> {
        self.pending.remove(&source).map(|p| p.frames)
    }

    /// Drop every pending frame, returning how many were released.
    pub fn release(&mut self) -> usize {
        let released = self.pending_total();
        self.pending.clear();
        released
    }

    /// Instant at which the earliest pending window times out.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .map(|p| p.oldest + self.timeout)
            .min()
    }

    pub fn pending(&self, source: SourceId) -> usize {
        self.pending.get(&source).map_or(0, |p| p.frames.len())
    }

    pub fn pending_total(&self) -> usize {
        self.pending.values().map(|p| p.frames.len()).sum()
    }
}

// ----------------------------------------------------------------------------
// Stage
// ----------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct MuxConfig {
    pub sources: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    /// Output resolution stamped on every batch.
    pub width: u32,
    pub height: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            sources: 1,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub batches: u64,
    /// Batches emitted because their window timed out before filling up.
    pub timeouts: u64,
    /// Frames still pending when the muxer was stopped without end-of-stream.
    pub dropped_on_stop: u64,
}

pub struct BatchMuxer {
    name: String,
    config: MuxConfig,
    window: MuxWindow,
    next_batch_id: u64,
    stats: Arc<Mutex<MuxStats>>,
}

impl BatchMuxer {
    pub fn new(name: impl Into<String>, config: MuxConfig) -> Result<Self> {
        let name = name.into();
        if config.sources == 0 {
            bail!("{} needs at least one source", name);
        }
        if config.width == 0 || config.height == 0 {
            bail!("output resolution must be non-zero");
        }
        let window = MuxWindow::new(config.batch_size, config.batch_timeout)?;
        Ok(Self {
            name,
            config,
            window,
            next_batch_id: 0,
            stats: Arc::new(Mutex::new(MuxStats::default())),
        })
    }

    /// Shared view of the muxer counters; stays valid after the muxer moves into the graph.
    pub fn stats_handle(&self) -> Arc<Mutex<MuxStats>> {
        Arc::clone(&self.stats)
    }

    fn update(&self, f: impl FnOnce(&mut MuxStats)) -> Result<()> {
        let mut stats = self
            .stats
            .lock()
            .map_err(|_| anyhow!("muxer stats lock poisoned"))?;
        f(&mut stats);
        Ok(())
    }

    fn emit(&mut self, source: SourceId, frames: Vec<Frame>, out: &mut Outbox) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        let count = frames.len() as u64;
        let batch = Batch::new(
            self.next_batch_id,
            source,
            self.config.width,
            self.config.height,
            frames,
        );
        self.next_batch_id += 1;
        out.push(Payload::Batch(batch));
        self.update(|s| {
            s.frames_out += count;
            s.batches += 1;
        })
    }
}

impl Stage for BatchMuxer {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Frames)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn max_inputs(&self) -> usize {
        self.config.sources
    }

    fn configure(&mut self, options: &StageOptions) -> Result<()> {
        options.reject_unknown(
            &self.name,
            &["batch_size", "batch_timeout_ms", "width", "height"],
        )?;
        if let Some(size) = options.get::<usize>("batch_size")? {
            self.config.batch_size = size;
        }
        if let Some(ms) = options.get::<u64>("batch_timeout_ms")? {
            self.config.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(width) = options.get::<u32>("width")? {
            self.config.width = width;
        }
        if let Some(height) = options.get::<u32>("height")? {
            self.config.height = height;
        }
        if self.config.width == 0 || self.config.height == 0 {
            bail!("output resolution must be non-zero");
        }
        self.window = MuxWindow::new(self.config.batch_size, self.config.batch_timeout)?;
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        log::info!(
            "{}: batch-size={} timeout={:?} output={}x{} sources={}",
            self.name,
            self.config.batch_size,
            self.config.batch_timeout,
            self.config.width,
            self.config.height,
            self.config.sources
        );
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let released = self.window.release() as u64;
        self.update(|s| s.dropped_on_stop += released)?;
        let stats = *self
            .stats
            .lock()
            .map_err(|_| anyhow!("muxer stats lock poisoned"))?;
        log::info!(
            "{}: frames_in={} frames_out={} batches={} timeouts={} dropped_on_stop={}",
            self.name,
            stats.frames_in,
            stats.frames_out,
            stats.batches,
            stats.timeouts,
            stats.dropped_on_stop
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Frame(frame) = input else {
            bail!("{} accepts frames only", self.name);
        };
        self.update(|s| s.frames_in += 1)?;
        let source = frame.source();
        if let Some((trigger, frames)) = self.window.push(frame, Instant::now()) {
            if trigger == Trigger::Timeout {
                self.update(|s| s.timeouts += 1)?;
            }
            self.emit(source, frames, out)?;
        }
        Ok(())
    }

    fn end_of_stream(&mut self, source: SourceId, out: &mut Outbox) -> Result<()> {
        if let Some(frames) = self.window.flush(source) {
            log::debug!("{}: flushing {} frame(s) of source {}", self.name, frames.len(), source);
            self.emit(source, frames, out)?;
        }
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.window.next_deadline()
    }

    fn on_deadline(&mut self, now: Instant, out: &mut Outbox) -> Result<()> {
        for (source, frames) in self.window.expire(now) {
            self.update(|s| s.timeouts += 1)?;
            self.emit(source, frames, out)?;
        }
        Ok(())
    }
}
