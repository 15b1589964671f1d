//! Multi-object tracker stage.
//!
//! Greedy IoU association between the live tracks of a source and the detections of
//! each new frame. Tracks only match detections of their own class and are retired
//! after `max_age` consecutive frames without a match. Tracking ids are unique
//! across all sources for the life of the stage and start at 1.

use anyhow::Result;
use std::collections::HashMap;

use crate::frame::{Frame, Payload, PortKind, SourceId};
use crate::metadata::{BoundingBox, DetectionRecord, ObjectClass};
use crate::stage::{Outbox, Stage, StageOptions};

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    class: ObjectClass,
    bbox: BoundingBox,
    frames_lost: u32,
}

pub struct TrackerStage {
    name: String,
    iou_threshold: f32,
    max_age: u32,
    tracks: HashMap<SourceId, Vec<Track>>,
    next_id: u64,
}

impl TrackerStage {
    pub fn new(name: &str, iou_threshold: f32, max_age: u32) -> Self {
        Self {
            name: name.to_string(),
            iou_threshold,
            max_age,
            tracks: HashMap::new(),
            next_id: 1,
        }
    }

    /// Live tracks for `source`.
    pub fn active_tracks(&self, source: SourceId) -> usize {
        self.tracks.get(&source).map_or(0, Vec::len)
    }

    fn update(&mut self, frame: &mut Frame) -> Result<()> {
        let tracks = self.tracks.entry(frame.source()).or_default();
        let records = frame.metadata().detections();
        // Records tracked upstream keep their id and take no part in association.
        let pending: Vec<usize> = (0..records.len())
            .filter(|&i| records[i].tracking_id().is_none())
            .collect();
        let matches = associate(tracks, records, &pending, self.iou_threshold);

        let mut matched_tracks = vec![false; tracks.len()];
        let mut assignments = Vec::with_capacity(pending.len());
        for &det in &pending {
            let record = &records[det];
            let id = match matches.get(&det) {
                Some(&t) => {
                    let track = &mut tracks[t];
                    track.bbox = record.bbox;
                    track.frames_lost = 0;
                    matched_tracks[t] = true;
                    track.id
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    tracks.push(Track {
                        id,
                        class: record.class,
                        bbox: record.bbox,
                        frames_lost: 0,
                    });
                    matched_tracks.push(true);
                    id
                }
            };
            assignments.push((det, id));
        }

        let max_age = self.max_age;
        let mut index = 0;
        tracks.retain_mut(|track| {
            let seen = matched_tracks[index];
            index += 1;
            if !seen {
                track.frames_lost += 1;
            }
            track.frames_lost <= max_age
        });

        let metadata = frame.metadata_mut();
        for (det, id) in assignments {
            metadata.assign_tracking_id(det, id)?;
        }
        Ok(())
    }
}

/// Greedy highest-IoU-first matching of `pending` detections to tracks of the same
/// class. Returns detection index -> track index.
fn associate(
    tracks: &[Track],
    records: &[DetectionRecord],
    pending: &[usize],
    iou_threshold: f32,
) -> HashMap<usize, usize> {
    let mut candidates = Vec::new();
    for (t, track) in tracks.iter().enumerate() {
        for &det in pending {
            let record = &records[det];
            if record.class != track.class {
                continue;
            }
            let iou = track.bbox.iou(&record.bbox);
            if iou >= iou_threshold && iou > 0.0 {
                candidates.push((iou, t, det));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut used_tracks = vec![false; tracks.len()];
    let mut matches = HashMap::new();
    for (_, t, det) in candidates {
        if used_tracks[t] || matches.contains_key(&det) {
            continue;
        }
        used_tracks[t] = true;
        matches.insert(det, t);
    }
    matches
}

impl Stage for TrackerStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Batches)
    }

    fn configure(&mut self, options: &StageOptions) -> Result<()> {
        options.reject_unknown(&self.name, &["iou_threshold", "max_age"])?;
        if let Some(iou) = options.get::<f32>("iou_threshold")? {
            if !(0.0..=1.0).contains(&iou) {
                anyhow::bail!("iou_threshold {} is outside 0..=1", iou);
            }
            self.iou_threshold = iou;
        }
        if let Some(max_age) = options.get::<u32>("max_age")? {
            self.max_age = max_age;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.tracks.clear();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        log::info!("{}: issued {} tracking id(s)", self.name, self.next_id - 1);
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Batch(mut batch) = input else {
            anyhow::bail!("{} accepts batches only", self.name);
        };
        for frame in batch.frames_mut() {
            self.update(frame)?;
        }
        out.push(Payload::Batch(batch));
        Ok(())
    }

    fn end_of_stream(&mut self, source: SourceId, _out: &mut Outbox) -> Result<()> {
        self.tracks.remove(&source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Batch, PixelFormat};
    use std::time::Duration;

    fn frame(source: SourceId, seq: u64, boxes: &[(ObjectClass, f32)]) -> Payload {
        let mut frame = Frame::new(
            source,
            seq,
            Duration::ZERO,
            64,
            32,
            PixelFormat::Nv12,
            vec![0u8; PixelFormat::Nv12.buffer_len(64, 32)],
        );
        for &(class, left) in boxes {
            frame.metadata_mut().push_detection(DetectionRecord::new(
                class,
                BoundingBox::new(left, 4.0, 10.0, 10.0),
                0.9,
                "pgie",
            ));
        }
        Payload::Batch(Batch::new(seq, source, 64, 32, vec![frame]))
    }

    fn ids(stage: &mut TrackerStage, payload: Payload) -> Vec<Option<u64>> {
        let mut out = Outbox::new();
        stage.process(payload, &mut out).unwrap();
        let ids = match out.drain().next() {
            Some(Payload::Batch(batch)) => batch.frames()[0]
                .metadata()
                .detections()
                .iter()
                .map(|r| r.tracking_id())
                .collect(),
            other => panic!("unexpected {:?}", other),
        };
        ids
    }

    #[test]
    fn moving_object_keeps_its_id() {
        let mut tracker = TrackerStage::new("tracker", 0.3, 5);
        let first = ids(&mut tracker, frame(0, 0, &[(ObjectClass::Vehicle, 2.0)]));
        let second = ids(&mut tracker, frame(0, 1, &[(ObjectClass::Vehicle, 4.0)]));
        assert_eq!(first, vec![Some(1)]);
        assert_eq!(second, vec![Some(1)]);
    }

    #[test]
    fn class_change_starts_a_new_track() {
        let mut tracker = TrackerStage::new("tracker", 0.3, 5);
        ids(&mut tracker, frame(0, 0, &[(ObjectClass::Vehicle, 2.0)]));
        let next = ids(&mut tracker, frame(0, 1, &[(ObjectClass::Person, 2.0)]));
        assert_eq!(next, vec![Some(2)]);
    }

    #[test]
    fn ids_are_unique_across_sources() {
        let mut tracker = TrackerStage::new("tracker", 0.3, 5);
        let a = ids(&mut tracker, frame(0, 0, &[(ObjectClass::Vehicle, 2.0)]));
        let b = ids(&mut tracker, frame(1, 0, &[(ObjectClass::Vehicle, 2.0)]));
        assert_ne!(a, b);
        assert_eq!(tracker.active_tracks(0), 1);
        assert_eq!(tracker.active_tracks(1), 1);
    }

    #[test]
    fn stale_tracks_are_retired() {
        let mut tracker = TrackerStage::new("tracker", 0.3, 1);
        ids(&mut tracker, frame(0, 0, &[(ObjectClass::Vehicle, 2.0)]));
        ids(&mut tracker, frame(0, 1, &[]));
        assert_eq!(tracker.active_tracks(0), 1);
        ids(&mut tracker, frame(0, 2, &[]));
        assert_eq!(tracker.active_tracks(0), 0);
        let back = ids(&mut tracker, frame(0, 3, &[(ObjectClass::Vehicle, 2.0)]));
        assert_eq!(back, vec![Some(2)]);
    }

    #[test]
    fn end_of_stream_forgets_source() {
        let mut tracker = TrackerStage::new("tracker", 0.3, 5);
        ids(&mut tracker, frame(0, 0, &[(ObjectClass::Bicycle, 2.0)]));
        tracker.end_of_stream(0, &mut Outbox::new()).unwrap();
        assert_eq!(tracker.active_tracks(0), 0);
    }
}
