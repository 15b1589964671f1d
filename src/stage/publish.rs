//! Publishing sink.
//!
//! - `rtmp://` / `rtmps://`: encode RGBA frames with x264 and push FLV to the
//!   server (requires `hw-gstreamer`).
//! - `stub://<name>[?fail_after=N][&refuse=1]`: record published frames in memory,
//!   readable through [`stub_sink`]. `fail_after` loses the connection after N
//!   frames, `refuse` fails at start.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use url::Url;

use crate::frame::{Frame, Payload, PixelFormat, PortKind, SourceId};
use crate::metadata::Metadata;
use crate::stage::{Fault, Outbox, Stage};

/// What a stub sink saw for one frame.
#[derive(Clone, Debug)]
pub struct PublishedFrame {
    pub source: SourceId,
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub metadata: Metadata,
}

/// In-memory record of a `stub://` sink, shared with whoever looks it up by name.
#[derive(Clone, Debug, Default)]
pub struct PublishedLog(Arc<Mutex<Vec<PublishedFrame>>>);

impl PublishedLog {
    pub fn frames(&self) -> Vec<PublishedFrame> {
        match self.0.lock() {
            Ok(frames) => frames.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.0.lock() {
            Ok(frames) => frames.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        match self.0.lock() {
            Ok(mut frames) => frames.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn record(&self, frame: PublishedFrame) -> Result<()> {
        self.0
            .lock()
            .map_err(|_| anyhow!("published log lock poisoned"))?
            .push(frame);
        Ok(())
    }
}

fn stub_sinks() -> &'static Mutex<HashMap<String, PublishedLog>> {
    static SINKS: OnceLock<Mutex<HashMap<String, PublishedLog>>> = OnceLock::new();
    SINKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Log of the `stub://<name>` sink, created on first use.
pub fn stub_sink(name: &str) -> PublishedLog {
    let mut sinks = match stub_sinks().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    sinks.entry(name.to_string()).or_default().clone()
}

enum Target {
    Stub {
        sink: String,
        fail_after: Option<u64>,
        refuse: bool,
        log: Option<PublishedLog>,
    },
    #[cfg(feature = "hw-gstreamer")]
    Rtmp {
        location: String,
        encoder: Option<rtmp::RtmpEncoder>,
    },
}

pub struct PublishStage {
    name: String,
    location: String,
    target: Target,
    published: u64,
}

impl PublishStage {
    pub fn new(name: &str, location: &str) -> Result<Self> {
        let url = Url::parse(location)
            .with_context(|| format!("{}: invalid location {}", name, location))?;
        let target = match url.scheme() {
            "stub" => stub_target(&url)?,
            "rtmp" | "rtmps" => rtmp_target(location)?,
            other => bail!("unsupported publish scheme '{}'", other),
        };
        Ok(Self {
            name: name.to_string(),
            location: location.to_string(),
            target,
            published: 0,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn frames_published(&self) -> u64 {
        self.published
    }

    fn publish(&mut self, frame: &Frame) -> Result<()> {
        match &mut self.target {
            Target::Stub {
                sink,
                fail_after,
                log,
                ..
            } => {
                if fail_after.is_some_and(|limit| self.published >= limit) {
                    return Err(Fault::fatal(format!("connection to stub://{} lost", sink)).into());
                }
                let log = log
                    .as_ref()
                    .ok_or_else(|| anyhow!("sink stub://{} is not connected", sink))?;
                log.record(PublishedFrame {
                    source: frame.source(),
                    sequence: frame.sequence(),
                    width: frame.width(),
                    height: frame.height(),
                    format: frame.format(),
                    metadata: frame.metadata().clone(),
                })?;
            }
            #[cfg(feature = "hw-gstreamer")]
            Target::Rtmp { location, encoder } => {
                if encoder.is_none() {
                    *encoder = Some(rtmp::RtmpEncoder::new(
                        location,
                        frame.width(),
                        frame.height(),
                    )?);
                }
                if let Some(encoder) = encoder.as_mut() {
                    encoder.push(frame)?;
                }
            }
        }
        self.published += 1;
        Ok(())
    }
}

fn stub_target(url: &Url) -> Result<Target> {
    let sink = format!(
        "{}{}",
        url.host_str().unwrap_or_default(),
        url.path().trim_end_matches('/')
    );
    if sink.is_empty() {
        bail!("stub sink needs a name");
    }
    let mut fail_after = None;
    let mut refuse = false;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "fail_after" => {
                fail_after = Some(
                    value
                        .parse::<u64>()
                        .with_context(|| format!("fail_after={}", value))?,
                )
            }
            "refuse" => refuse = value != "0",
            other => bail!("unknown stub sink parameter '{}'", other),
        }
    }
    Ok(Target::Stub {
        sink,
        fail_after,
        refuse,
        log: None,
    })
}

#[cfg(feature = "hw-gstreamer")]
fn rtmp_target(location: &str) -> Result<Target> {
    Ok(Target::Rtmp {
        location: location.to_string(),
        encoder: None,
    })
}

#[cfg(not(feature = "hw-gstreamer"))]
fn rtmp_target(_location: &str) -> Result<Target> {
    bail!("RTMP publishing requires the hw-gstreamer feature")
}

impl Stage for PublishStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn output(&self) -> Option<PortKind> {
        None
    }

    fn start(&mut self) -> Result<()> {
        self.published = 0;
        match &mut self.target {
            Target::Stub {
                sink, refuse, log, ..
            } => {
                if *refuse {
                    bail!("stub://{} refused the connection", sink);
                }
                *log = Some(stub_sink(sink));
            }
            #[cfg(feature = "hw-gstreamer")]
            Target::Rtmp { .. } => {}
        }
        log::info!("{}: publishing to {}", self.name, self.location);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        match &mut self.target {
            Target::Stub { log, .. } => *log = None,
            #[cfg(feature = "hw-gstreamer")]
            Target::Rtmp { encoder, .. } => {
                if let Some(mut encoder) = encoder.take() {
                    encoder.finish()?;
                }
            }
        }
        log::info!(
            "{}: published {} frame(s) to {}",
            self.name,
            self.published,
            self.location
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, _out: &mut Outbox) -> Result<()> {
        let Payload::Batch(batch) = input else {
            bail!("{} accepts batches only", self.name);
        };
        for frame in batch.frames() {
            self.publish(frame)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// RTMP via GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "hw-gstreamer")]
mod rtmp {
    use anyhow::{anyhow, Context, Result};
    use gstreamer::prelude::*;

    use crate::frame::{Frame, PixelFormat};

    pub(super) struct RtmpEncoder {
        pipeline: gstreamer::Pipeline,
        appsrc: gstreamer_app::AppSrc,
        width: u32,
        height: u32,
    }

    impl RtmpEncoder {
        pub(super) fn new(location: &str, width: u32, height: u32) -> Result<Self> {
            gstreamer::init().context("initialize gstreamer")?;
            let description = format!(
                "appsrc name=src is-live=true format=time \
                 caps=video/x-raw,format=RGBA,width={width},height={height},framerate=0/1 ! \
                 videoconvert ! x264enc tune=zerolatency speed-preset=ultrafast ! \
                 h264parse ! flvmux streamable=true ! rtmpsink location=\"{location}\""
            );
            let pipeline = gstreamer::parse::launch(&description)
                .context("build RTMP pipeline")?
                .downcast::<gstreamer::Pipeline>()
                .map_err(|_| anyhow!("RTMP pipeline is not a Pipeline"))?;
            let appsrc = pipeline
                .by_name("src")
                .context("appsrc element missing from pipeline")?
                .downcast::<gstreamer_app::AppSrc>()
                .map_err(|_| anyhow!("appsrc element has unexpected type"))?;
            pipeline
                .set_state(gstreamer::State::Playing)
                .context("set RTMP pipeline to Playing")?;
            log::info!("rtmp: streaming {}x{} to {}", width, height, location);
            Ok(Self {
                pipeline,
                appsrc,
                width,
                height,
            })
        }

        pub(super) fn push(&mut self, frame: &Frame) -> Result<()> {
            if frame.format() != PixelFormat::Rgba {
                return Err(anyhow!("RTMP encoder expects RGBA, got {:?}", frame.format()));
            }
            if frame.width() != self.width || frame.height() != self.height {
                return Err(anyhow!(
                    "frame size {}x{} changed from {}x{}",
                    frame.width(),
                    frame.height(),
                    self.width,
                    self.height
                ));
            }
            let mut buffer = gstreamer::Buffer::from_slice(frame.pixels().to_vec());
            if let Some(buffer) = buffer.get_mut() {
                buffer.set_pts(gstreamer::ClockTime::from_nseconds(
                    frame.pts().as_nanos() as u64
                ));
            }
            self.appsrc
                .push_buffer(buffer)
                .map_err(|err| anyhow!("RTMP connection lost: {:?}", err))?;
            self.check_bus()
        }

        pub(super) fn finish(&mut self) -> Result<()> {
            let _ = self.appsrc.end_of_stream();
            self.pipeline
                .set_state(gstreamer::State::Null)
                .context("set RTMP pipeline to Null")?;
            Ok(())
        }

        fn check_bus(&self) -> Result<()> {
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

    impl Drop for RtmpEncoder {
        fn drop(&mut self) {
            let _ = self.pipeline.set_state(gstreamer::State::Null);
        }
    }
}
