//! Capture stage.
//!
//! Reads encoded H.264 access units from a camera. `stub://` devices produce a
//! synthetic Annex-B stream (one access unit per frame, an IDR with parameter sets
//! every `GOP_LENGTH` frames); `/dev/videoN` devices are read through V4L2 when the
//! `capture-v4l2` feature is enabled.

use anyhow::{bail, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::{Duration, Instant};

use crate::frame::{Packet, Payload, PortKind, SourceId};
use crate::stage::{Stage, StageOptions};

pub const GOP_LENGTH: u64 = 30;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_SPS: u8 = 0x67;
const NAL_PPS: u8 = 0x68;
const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;

/// Configuration for a capture stage.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    /// Device path (e.g. "/dev/video0") or `stub://name`.
    pub device: String,
    /// Frames per second; 0 disables pacing for synthetic devices.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Send end-of-stream after this many frames.
    pub frame_limit: Option<u64>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            fps: 30,
            width: 1920,
            height: 1080,
            frame_limit: None,
        }
    }
}

pub struct CaptureStage {
    name: String,
    source: SourceId,
    config: CaptureConfig,
    backend: CaptureBackend,
    sequence: u64,
    next_due: Option<Instant>,
    ended: bool,
}

enum CaptureBackend {
    Synthetic(SyntheticCapture),
    #[cfg(feature = "capture-v4l2")]
    Device(DeviceCapture),
}

impl CaptureStage {
    pub fn new(name: &str, source: SourceId, config: CaptureConfig) -> Result<Self> {
        if config.device.trim().is_empty() {
            bail!("no capture device configured");
        }
        let backend = if config.device.starts_with("stub://") {
            CaptureBackend::Synthetic(SyntheticCapture::new(source))
        } else {
            #[cfg(feature = "capture-v4l2")]
            {
                CaptureBackend::Device(DeviceCapture::new(&config)?)
            }
            #[cfg(not(feature = "capture-v4l2"))]
            {
                bail!(
                    "capture device {} requires the capture-v4l2 feature",
                    config.device
                )
            }
        };
        Ok(Self {
            name: name.to_string(),
            source,
            config,
            backend,
            sequence: 0,
            next_due: None,
            ended: false,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.sequence
    }

    fn frame_interval(&self) -> Option<Duration> {
        (self.config.fps > 0).then(|| Duration::from_secs(1) / self.config.fps)
    }

    /// Presentation timestamp of frame `sequence`.
    fn pts(&self) -> Duration {
        let fps = if self.config.fps == 0 { 30 } else { self.config.fps };
        Duration::from_secs(self.sequence) / fps
    }
}

impl Stage for CaptureStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        None
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Packets)
    }

    fn configure(&mut self, options: &StageOptions) -> Result<()> {
        options.reject_unknown(&self.name, &["fps", "frame_limit"])?;
        if let Some(fps) = options.get::<u32>("fps")? {
            self.config.fps = fps;
        }
        if let Some(limit) = options.get::<u64>("frame_limit")? {
            self.config.frame_limit = Some(limit);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.sequence = 0;
        self.next_due = None;
        self.ended = false;
        match &mut self.backend {
            CaptureBackend::Synthetic(_) => {
                log::info!(
                    "{}: connected to {} (synthetic, {} fps)",
                    self.name,
                    self.config.device,
                    self.config.fps
                );
                Ok(())
            }
            #[cfg(feature = "capture-v4l2")]
            CaptureBackend::Device(device) => device.connect(&self.name),
        }
    }

    fn stop(&mut self) -> Result<()> {
        #[cfg(feature = "capture-v4l2")]
        if let CaptureBackend::Device(device) = &mut self.backend {
            device.disconnect();
        }
        log::info!("{}: captured {} frame(s)", self.name, self.sequence);
        Ok(())
    }

    fn produce(&mut self) -> Result<Option<Payload>> {
        if self.ended {
            return Ok(None);
        }
        if self
            .config
            .frame_limit
            .is_some_and(|limit| self.sequence >= limit)
        {
            self.ended = true;
            return Ok(Some(Payload::EndOfStream {
                source: self.source,
            }));
        }
        let interval = self.frame_interval();
        let data = match &mut self.backend {
            CaptureBackend::Synthetic(synthetic) => {
                pace(interval, &mut self.next_due);
                synthetic.next_unit(self.sequence)
            }
            #[cfg(feature = "capture-v4l2")]
            CaptureBackend::Device(device) => device.next_unit()?,
        };
        let packet = Packet::new(self.source, self.sequence, self.pts(), data);
        self.sequence += 1;
        Ok(Some(Payload::Packet(packet)))
    }
}

/// Sleep until the next frame is due. A stalled consumer does not cause a burst
/// of catch-up frames.
fn pace(interval: Option<Duration>, next_due: &mut Option<Instant>) {
    let Some(interval) = interval else {
        return;
    };
    let now = Instant::now();
    let due = next_due.unwrap_or(now);
    if due > now {
        thread::sleep(due - now);
    }
    *next_due = Some(due.max(now) + interval);
}

// ----------------------------------------------------------------------------
// Synthetic capture (stub://)
// ----------------------------------------------------------------------------

struct SyntheticCapture {
    rng: StdRng,
}

impl SyntheticCapture {
    fn new(source: SourceId) -> Self {
        Self {
            rng: StdRng::seed_from_u64(0x5eed_0000 + source as u64),
        }
    }

    /// One Annex-B access unit. Payload bytes are never zero so no start code can
    /// appear inside a NAL unit.
    fn next_unit(&mut self, sequence: u64) -> Vec<u8> {
        let mut unit = Vec::with_capacity(256);
        if sequence % GOP_LENGTH == 0 {
            self.push_nal(&mut unit, NAL_SPS, 12);
            self.push_nal(&mut unit, NAL_PPS, 4);
            self.push_nal(&mut unit, NAL_IDR, 192);
        } else {
            self.push_nal(&mut unit, NAL_SLICE, 48);
        }
        unit
    }

    fn push_nal(&mut self, unit: &mut Vec<u8>, header: u8, payload: usize) {
        unit.extend_from_slice(&START_CODE);
        unit.push(header);
        unit.extend((0..payload).map(|_| self.rng.gen_range(1..=255u8)));
    }
}

// ----------------------------------------------------------------------------
// V4L2 device capture
// ----------------------------------------------------------------------------

#[cfg(feature = "capture-v4l2")]
struct DeviceCapture {
    config: CaptureConfig,
    state: Option<DeviceState>,
}

#[cfg(feature = "capture-v4l2")]
#[ouroboros::self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

#[cfg(feature = "capture-v4l2")]
impl DeviceCapture {
    fn new(config: &CaptureConfig) -> Result<Self> {
        if !std::path::Path::new(&config.device).exists() {
            bail!("capture device {} not found", config.device);
        }
        Ok(Self {
            config: config.clone(),
            state: None,
        })
    }

    fn connect(&mut self, stage: &str) -> Result<()> {
        use anyhow::Context;
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"H264");
        let format = device
            .set_format(&format)
            .context("set H.264 capture format")?;
        if format.fourcc != v4l::FourCC::new(b"H264") {
            bail!(
                "{} does not deliver H.264 (got {})",
                self.config.device,
                format.fourcc
            );
        }
        if self.config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("{}: failed to set fps on {}: {}", stage, self.config.device, err);
            }
        }

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;
        self.state = Some(state);
        log::info!(
            "{}: connected to {} ({}x{} H.264)",
            stage,
            self.config.device,
            format.width,
            format.height
        );
        Ok(())
    }

    fn disconnect(&mut self) {
        self.state = None;
    }

    fn next_unit(&mut self) -> Result<Vec<u8>> {
        use anyhow::Context;
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let (buf, meta) = state
            .with_mut(|fields| fields.stream.next())
            .context("capture v4l2 buffer")?;
        let used = (meta.bytesused as usize).min(buf.len());
        Ok(buf[..used].to_vec())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(limit: Option<u64>) -> CaptureConfig {
        CaptureConfig {
            device: "stub://test".to_string(),
            fps: 0,
            width: 64,
            height: 32,
            frame_limit: limit,
        }
    }

    fn packet(payload: Option<Payload>) -> Packet {
        match payload {
            Some(Payload::Packet(packet)) => packet,
            other => panic!("expected packet, got {:?}", other),
        }
    }

    #[test]
    fn synthetic_stream_starts_with_parameter_sets() -> Result<()> {
        let mut stage = CaptureStage::new("capture", 0, stub_config(None))?;
        stage.start()?;
        let first = packet(stage.produce()?);
        assert_eq!(&first.data()[..5], &[0, 0, 0, 1, NAL_SPS]);
        assert_eq!(first.sequence, 0);
        let second = packet(stage.produce()?);
        assert_eq!(&second.data()[..5], &[0, 0, 0, 1, NAL_SLICE]);
        assert_eq!(second.sequence, 1);
        Ok(())
    }

    #[test]
    fn frame_limit_ends_the_stream() -> Result<()> {
        let mut stage = CaptureStage::new("capture", 3, stub_config(Some(2)))?;
        stage.start()?;
        packet(stage.produce()?);
        packet(stage.produce()?);
        assert!(matches!(
            stage.produce()?,
            Some(Payload::EndOfStream { source: 3 })
        ));
        assert!(stage.produce()?.is_none());
        assert_eq!(stage.frames_captured(), 2);
        Ok(())
    }

    #[test]
    fn configure_overrides_limit_and_rejects_unknown() -> Result<()> {
        let mut stage = CaptureStage::new("capture", 0, stub_config(None))?;
        stage.configure(&StageOptions::new().with("frame_limit", 1))?;
        stage.start()?;
        packet(stage.produce()?);
        assert!(matches!(stage.produce()?, Some(Payload::EndOfStream { .. })));
        assert!(stage
            .configure(&StageOptions::new().with("exposure", 3))
            .is_err());
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn device_capture_needs_feature() {
        let config = CaptureConfig {
            device: "/dev/video0".to_string(),
            ..CaptureConfig::default()
        };
        assert!(CaptureStage::new("capture", 0, config).is_err());
    }
}
