//! H.264 decoder stage.
//!
//! Synthetic streams (devices under `stub://`) decode into a deterministic NV12
//! test pattern at the configured resolution. Real streams go through a GStreamer
//! `avdec_h264` pipeline when built with `hw-gstreamer`.

use anyhow::{anyhow, Result};

use crate::frame::{Frame, Packet, Payload, PixelFormat, PortKind, SourceId};
use crate::stage::{Fault, Outbox, Stage};

#[derive(Clone, Debug)]
pub struct DecodeConfig {
    pub width: u32,
    pub height: u32,
    /// Decode real H.264 rather than the synthetic capture bitstream.
    pub hardware: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            hardware: false,
        }
    }
}

enum DecoderBackend {
    Synthetic,
    #[cfg(feature = "hw-gstreamer")]
    Gstreamer(gst_decoder::GstDecoder),
}

pub struct DecodeStage {
    name: String,
    config: DecodeConfig,
    backend: DecoderBackend,
    synced: bool,
    decoded: u64,
    skipped: u64,
}

impl DecodeStage {
    pub fn new(name: &str, config: DecodeConfig) -> Result<Self> {
        if config.width == 0 || config.height == 0 {
            return Err(anyhow!(
                "invalid output size {}x{}",
                config.width,
                config.height
            ));
        }
        let backend = if config.hardware {
            hardware_backend(name, &config)?
        } else {
            DecoderBackend::Synthetic
        };
        Ok(Self {
            name: name.to_string(),
            config,
            backend,
            synced: false,
            decoded: 0,
            skipped: 0,
        })
    }

    pub fn frames_decoded(&self) -> u64 {
        self.decoded
    }

    fn decode_synthetic(&mut self, packet: Packet, out: &mut Outbox) -> Result<()> {
        if !self.synced {
            if !packet.keyframe {
                self.skipped += 1;
                return Err(Fault::warning(format!(
                    "waiting for keyframe; packet {} skipped",
                    packet.sequence
                ))
                .into());
            }
            self.synced = true;
        }
        let pixels = test_pattern(self.config.width, self.config.height, packet.sequence);
        self.decoded += 1;
        out.push(Payload::Frame(Frame::new(
            packet.source,
            packet.sequence,
            packet.pts,
            self.config.width,
            self.config.height,
            PixelFormat::Nv12,
            pixels,
        )));
        Ok(())
    }
}

#[cfg(feature = "hw-gstreamer")]
fn hardware_backend(name: &str, config: &DecodeConfig) -> Result<DecoderBackend> {
    Ok(DecoderBackend::Gstreamer(gst_decoder::GstDecoder::new(
        name,
        config.width,
        config.height,
    )?))
}

#[cfg(not(feature = "hw-gstreamer"))]
fn hardware_backend(_name: &str, _config: &DecodeConfig) -> Result<DecoderBackend> {
    Err(anyhow!("H.264 decoding of device streams requires the hw-gstreamer feature"))
}

/// Diagonal luma gradient that scrolls one pixel per frame, neutral chroma.
pub fn test_pattern(width: u32, height: u32, sequence: u64) -> Vec<u8> {
    let (w, h) = (width as usize, height as usize);
    let mut pixels = Vec::with_capacity(PixelFormat::Nv12.buffer_len(width, height));
    for y in 0..h {
        for x in 0..w {
            pixels.push(((x + y) as u64 + sequence) as u8);
        }
    }
    pixels.resize(PixelFormat::Nv12.buffer_len(width, height), 128);
    pixels
}

impl Stage for DecodeStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Packets)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Frames)
    }

    fn start(&mut self) -> Result<()> {
        self.synced = false;
        match &mut self.backend {
            DecoderBackend::Synthetic => Ok(()),
            #[cfg(feature = "hw-gstreamer")]
            DecoderBackend::Gstreamer(decoder) => decoder.start(),
        }
    }

    fn stop(&mut self) -> Result<()> {
        log::info!(
            "{}: decoded {} frame(s), skipped {} packet(s) before sync",
            self.name,
            self.decoded,
            self.skipped
        );
        match &mut self.backend {
            DecoderBackend::Synthetic => Ok(()),
            #[cfg(feature = "hw-gstreamer")]
            DecoderBackend::Gstreamer(decoder) => decoder.stop(),
        }
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Packet(packet) = input else {
            anyhow::bail!("{} accepts packets only", self.name);
        };
        match &mut self.backend {
            DecoderBackend::Synthetic => {}
            #[cfg(feature = "hw-gstreamer")]
            DecoderBackend::Gstreamer(decoder) => {
                let decoded = decoder.push(&packet)?;
                self.decoded += decoded.len() as u64;
                for frame in decoded {
                    out.push(Payload::Frame(frame));
                }
                return Ok(());
            }
        }
        self.decode_synthetic(packet, out)
    }

    fn end_of_stream(&mut self, _source: SourceId, _out: &mut Outbox) -> Result<()> {
        self.synced = false;
        match &mut self.backend {
            DecoderBackend::Synthetic => Ok(()),
            #[cfg(feature = "hw-gstreamer")]
            DecoderBackend::Gstreamer(decoder) => {
                let drained = decoder.drain()?;
                self.decoded += drained.len() as u64;
                for frame in drained {
                    _out.push(Payload::Frame(frame));
                }
                Ok(())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// GStreamer decoder
// ----------------------------------------------------------------------------

#[cfg(feature = "hw-gstreamer")]
mod gst_decoder {
    use std::collections::VecDeque;
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;

    use crate::frame::{Frame, Packet, PixelFormat, SourceId};

    const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

    pub(super) struct GstDecoder {
        name: String,
        width: u32,
        height: u32,
        pipeline: gstreamer::Pipeline,
        appsrc: gstreamer_app::AppSrc,
        appsink: gstreamer_app::AppSink,
        /// Identity of packets pushed but not yet decoded, in decode order.
        in_flight: VecDeque<(SourceId, u64, Duration)>,
    }

    impl GstDecoder {
        pub(super) fn new(name: &str, width: u32, height: u32) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;
            let description = format!(
                "appsrc name=src is-live=true format=time \
                 caps=video/x-h264,stream-format=byte-stream,alignment=au ! \
                 h264parse ! avdec_h264 ! videoconvert ! videoscale ! \
                 video/x-raw,format=NV12,width={width},height={height} ! \
                 appsink name=sink sync=false"
            );
            let pipeline = gstreamer::parse::launch(&description)
                .context("build decoder pipeline")?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("decoder pipeline is not a Pipeline"))?;
            let appsrc = pipeline
                .by_name("src")
                .context("appsrc element missing from pipeline")?
                .downcast::<gstreamer_app::AppSrc>()
                .map_err(|_| anyhow!("appsrc element has unexpected type"))?;
            let appsink = pipeline
                .by_name("sink")
                .context("appsink element missing from pipeline")?
                .downcast::<gstreamer_app::AppSink>()
                .map_err(|_| anyhow!("appsink element has unexpected type"))?;
            Ok(Self {
                name: name.to_string(),
                width,
                height,
                pipeline,
                appsrc,
                appsink,
                in_flight: VecDeque::new(),
            })
        }

        pub(super) fn start(&mut self) -> Result<()> {
            self.in_flight.clear();
            self.pipeline
                .set_state(gstreamer::State::Playing)
                .context("set decoder pipeline to Playing")?;
            log::info!("{}: gstreamer decoder playing", self.name);
            Ok(())
        }

        pub(super) fn stop(&mut self) -> Result<()> {
            self.pipeline
                .set_state(gstreamer::State::Null)
                .context("set decoder pipeline to Null")?;
            Ok(())
        }

        pub(super) fn push(&mut self, packet: &Packet) -> Result<Vec<Frame>> {
            self.poll_bus()?;
            let mut buffer = gstreamer::Buffer::from_slice(packet.data().to_vec());
            if let Some(buffer) = buffer.get_mut() {
                buffer.set_pts(gstreamer::ClockTime::from_nseconds(
                    packet.pts.as_nanos() as u64
                ));
            }
            self.appsrc
                .push_buffer(buffer)
                .map_err(|err| anyhow!("decoder rejected packet {}: {:?}", packet.sequence, err))?;
            self.in_flight
                .push_back((packet.source, packet.sequence, packet.pts));
            self.pull(gstreamer::ClockTime::ZERO)
        }

        pub(super) fn drain(&mut self) -> Result<Vec<Frame>> {
            self.appsrc
                .end_of_stream()
                .map_err(|err| anyhow!("decoder refused end-of-stream: {:?}", err))?;
            let timeout = gstreamer::ClockTime::from_mseconds(DRAIN_TIMEOUT.as_millis() as u64);
            let frames = self.pull(timeout)?;
            if !self.in_flight.is_empty() {
                log::warn!(
                    "{}: {} packet(s) never produced a frame",
                    self.name,
                    self.in_flight.len()
                );
                self.in_flight.clear();
            }
            Ok(frames)
        }

        fn pull(&mut self, timeout: gstreamer::ClockTime) -> Result<Vec<Frame>> {
            let mut frames = Vec::new();
            while let Some(sample) = self.appsink.try_pull_sample(timeout) {
                let pixels = sample_to_nv12(&sample, self.width, self.height)?;
                let Some((source, sequence, pts)) = self.in_flight.pop_front() else {
                    log::warn!("{}: decoder emitted an unmatched frame", self.name);
                    continue;
                };
                frames.push(Frame::new(
                    source,
                    sequence,
                    pts,
                    self.width,
                    self.height,
                    PixelFormat::Nv12,
                    pixels,
                ));
            }
            Ok(frames)
        }

        fn poll_bus(&mut self) -> Result<()> {
            let Some(bus) = self.pipeline.bus() else {
                return Ok(());
            };
            while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
                if let gstreamer::MessageView::Error(err) = message.view() {
                    return Err(anyhow!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
            }
            Ok(())
        }
    }

    impl Drop for GstDecoder {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }

    fn sample_to_nv12(sample: &gstreamer::Sample, width: u32, height: u32) -> Result<Vec<u8>> {
        let buffer = sample.buffer().context("decoded sample missing buffer")?;
        let caps = sample.caps().context("decoded sample missing caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .context("parse decoded caps as video info")?;
        if info.width() != width || info.height() != height {
            return Err(anyhow!(
                "decoder produced {}x{}, expected {}x{}",
                info.width(),
                info.height(),
                width,
                height
            ));
        }

        let map = buffer.map_readable().context("map decoded buffer")?;
        let data = map.as_slice();
        let row = width as usize;
        let mut pixels = Vec::with_capacity(PixelFormat::Nv12.buffer_len(width, height));
        // Plane 0 is luma, plane 1 interleaved chroma at half height.
        for (plane, rows) in [(0usize, height as usize), (1, height as usize / 2)] {
            let stride = info.stride()[plane] as usize;
            let offset = info.offset()[plane];
            for r in 0..rows {
                let start = offset + r * stride;
                pixels.extend_from_slice(
                    data.get(start..start + row)
                        .context("decoded buffer row is out of bounds")?,
                );
            }
        }
        Ok(pixels)
    }
}
