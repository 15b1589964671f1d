//! Metadata probes.
//!
//! A probe is attached at the input of one stage and sees every frame reaching that
//! point, once, in arrival order. It gets read-only access to the frame and may only
//! append annotations through a [`ProbeAnnotator`]. Annotations are staged and land
//! on the frame only when the call succeeds; an error or panic discards them and is
//! reported as a single warning.

use anyhow::{anyhow, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::PipelineError;
use crate::event::EventSender;
use crate::frame::Frame;
use crate::metadata::{Annotation, ClassCounts};

/// Annotation key written by [`ObjectCounter`].
pub const OVERLAY_TEXT_KEY: &str = "overlay-text";

pub trait MetadataProbe: Send {
    fn name(&self) -> &str;

    fn on_frame(&mut self, frame: &Frame, annotator: &mut ProbeAnnotator) -> Result<()>;
}

/// Append-only handle a probe uses to attach derived values.
#[derive(Debug)]
pub struct ProbeAnnotator {
    author: String,
    staged: Vec<Annotation>,
}

impl ProbeAnnotator {
    fn new(author: &str) -> Self {
        Self {
            author: author.to_string(),
            staged: Vec::new(),
        }
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.staged
            .push(Annotation::new(self.author.clone(), key, value));
    }

    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

/// Run `probe` on `frame`, committing its annotations on success.
///
/// Failures never propagate: they are logged and published as a warning from
/// `stage`. Returns whether the probe succeeded.
pub fn run_probe(
    probe: &mut dyn MetadataProbe,
    frame: &mut Frame,
    stage: &str,
    events: &EventSender,
) -> bool {
    let mut annotator = ProbeAnnotator::new(probe.name());
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        probe.on_frame(frame, &mut annotator)
    }));
    let cause = match outcome {
        Ok(Ok(())) => {
            let metadata = frame.metadata_mut();
            for annotation in annotator.staged {
                metadata.push_annotation(annotation);
            }
            return true;
        }
        Ok(Err(err)) => format!("{:#}", err),
        Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
    };
    let fault = PipelineError::ProbeFault {
        probe: probe.name().to_string(),
        frame: frame.sequence(),
        cause,
    };
    log::warn!("{}: {}", stage, fault);
    events.warning(stage, fault.to_string(), Some(frame.sequence()));
    false
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ----------------------------------------------------------------------------
// Built-in probes
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CounterTotals {
    pub frames: u64,
    pub objects: ClassCounts,
}

/// Shared read access to an [`ObjectCounter`]'s running totals.
#[derive(Clone, Debug)]
pub struct CounterHandle(Arc<Mutex<CounterTotals>>);

impl CounterHandle {
    pub fn totals(&self) -> CounterTotals {
        match self.0.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Counts objects per class and writes an overlay text line per frame, e.g.
/// `Frame=12 Vehicle=2 Bicycle=0 Person=1 Roadsign=0`.
pub struct ObjectCounter {
    name: String,
    totals: Arc<Mutex<CounterTotals>>,
}

impl ObjectCounter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            totals: Arc::new(Mutex::new(CounterTotals::default())),
        }
    }

    pub fn handle(&self) -> CounterHandle {
        CounterHandle(Arc::clone(&self.totals))
    }
}

impl Default for ObjectCounter {
    fn default() -> Self {
        Self::new("object-counter")
    }
}

impl MetadataProbe for ObjectCounter {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_frame(&mut self, frame: &Frame, annotator: &mut ProbeAnnotator) -> Result<()> {
        let counts = frame.metadata().class_counts();
        let text = format!("Frame={} {}", frame.sequence(), counts);
        log::debug!("{}: source {} {}", self.name, frame.source(), text);
        annotator.annotate(OVERLAY_TEXT_KEY, text);

        let mut totals = self
            .totals
            .lock()
            .map_err(|_| anyhow!("counter totals lock poisoned"))?;
        totals.frames += 1;
        totals.objects.merge(&counts);
        Ok(())
    }
}

/// Probe backed by a closure.
pub struct FnProbe<F> {
    name: String,
    f: F,
}

pub fn probe_fn<F>(name: impl Into<String>, f: F) -> FnProbe<F>
where
    F: FnMut(&Frame, &mut ProbeAnnotator) -> Result<()> + Send,
{
    FnProbe {
        name: name.into(),
        f,
    }
}

impl<F> MetadataProbe for FnProbe<F>
where
    F: FnMut(&Frame, &mut ProbeAnnotator) -> Result<()> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn on_frame(&mut self, frame: &Frame, annotator: &mut ProbeAnnotator) -> Result<()> {
        (self.f)(frame, annotator)
    }
}
