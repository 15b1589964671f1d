//! H.264 Annex-B parser stage.
//!
//! Splits each access unit into NAL units, marks IDR units as keyframes and drops
//! units that cannot be decoded: packets without a start code, and slices that
//! arrive before the stream's SPS and PPS.

use anyhow::Result;
use std::collections::HashMap;

use crate::frame::{Payload, PortKind, SourceId};
use crate::stage::{Fault, Outbox, Stage};

pub const NAL_TYPE_SLICE: u8 = 1;
pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// Split an Annex-B byte stream into NAL unit payloads (start codes stripped).
pub fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            // A four-byte start code owns the leading zero.
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            starts.push((code_start, i + 3));
            i += 3;
        } else {
            i += 1;
        }
    }
    starts
        .iter()
        .enumerate()
        .filter_map(|(k, &(_, begin))| {
            let end = starts.get(k + 1).map_or(data.len(), |&(next, _)| next);
            (end > begin).then(|| &data[begin..end])
        })
        .collect()
}

pub fn nal_type(unit: &[u8]) -> Option<u8> {
    unit.first().map(|header| header & 0x1f)
}

#[derive(Default)]
struct StreamState {
    have_sps: bool,
    have_pps: bool,
}

pub struct ParseStage {
    name: String,
    streams: HashMap<SourceId, StreamState>,
    units: u64,
    dropped: u64,
}

impl ParseStage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            streams: HashMap::new(),
            units: 0,
            dropped: 0,
        }
    }
}

impl Stage for ParseStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn input(&self) -> Option<PortKind> {
        Some(PortKind::Packets)
    }

    fn output(&self) -> Option<PortKind> {
        Some(PortKind::Packets)
    }

    fn start(&mut self) -> Result<()> {
        self.streams.clear();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        log::info!(
            "{}: parsed {} NAL unit(s), dropped {} packet(s)",
            self.name,
            self.units,
            self.dropped
        );
        Ok(())
    }

    fn process(&mut self, input: Payload, out: &mut Outbox) -> Result<()> {
        let Payload::Packet(mut packet) = input else {
            anyhow::bail!("{} accepts packets only", self.name);
        };
        let units = split_nal_units(packet.data());
        if units.is_empty() {
            self.dropped += 1;
            return Err(Fault::warning(format!(
                "packet {} has no Annex-B start code; dropped",
                packet.sequence
            ))
            .into());
        }

        let stream = self.streams.entry(packet.source).or_default();
        let mut has_slice = false;
        let mut keyframe = false;
        for unit in &units {
            match nal_type(unit) {
                Some(NAL_TYPE_SPS) => stream.have_sps = true,
                Some(NAL_TYPE_PPS) => stream.have_pps = true,
                Some(NAL_TYPE_IDR) => {
                    has_slice = true;
                    keyframe = true;
                }
                Some(NAL_TYPE_SLICE) => has_slice = true,
                _ => {}
            }
        }
        self.units += units.len() as u64;

        if has_slice && !(stream.have_sps && stream.have_pps) {
            self.dropped += 1;
            return Err(Fault::warning(format!(
                "packet {} carries a slice before SPS/PPS; dropped",
                packet.sequence
            ))
            .into());
        }
        packet.keyframe = keyframe;
        out.push(Payload::Packet(packet));
        Ok(())
    }

    fn end_of_stream(&mut self, source: SourceId, _out: &mut Outbox) -> Result<()> {
        self.streams.remove(&source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;
    use crate::frame::Packet;
    use crate::stage::fault_severity;
    use std::time::Duration;

    fn packet(seq: u64, data: Vec<u8>) -> Payload {
        Payload::Packet(Packet::new(0, seq, Duration::ZERO, data))
    }

    #[test]
    fn splits_three_and_four_byte_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 9, 9, 0, 0, 1, 0x68, 7, 0, 0, 0, 1, 0x65, 1];
        let units = split_nal_units(&data);
        assert_eq!(units, vec![&[0x67, 9, 9][..], &[0x68, 7][..], &[0x65, 1][..]]);
        assert_eq!(nal_type(units[2]), Some(NAL_TYPE_IDR));
        assert!(split_nal_units(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn idr_access_unit_is_marked_keyframe() {
        let mut stage = ParseStage::new("parse");
        let mut out = Outbox::new();
        let au = vec![0, 0, 0, 1, 0x67, 1, 0, 0, 0, 1, 0x68, 2, 0, 0, 0, 1, 0x65, 3];
        stage.process(packet(0, au), &mut out).unwrap();
        match out.drain().next() {
            Some(Payload::Packet(p)) => assert!(p.keyframe),
            other => panic!("unexpected {:?}", other),
        }
        stage
            .process(packet(1, vec![0, 0, 0, 1, 0x41, 5]), &mut out)
            .unwrap();
        match out.drain().next() {
            Some(Payload::Packet(p)) => assert!(!p.keyframe),
            other => panic!("unexpected {:?}", other),
        };
    }

    #[test]
    fn slice_before_parameter_sets_is_a_warning() {
        let mut stage = ParseStage::new("parse");
        let mut out = Outbox::new();
        let err = stage
            .process(packet(0, vec![0, 0, 0, 1, 0x41, 5]), &mut out)
            .unwrap_err();
        assert_eq!(fault_severity(&err), Severity::Warning);
        assert!(out.is_empty());
        let err = stage.process(packet(1, vec![7, 7, 7]), &mut out).unwrap_err();
        assert!(err.to_string().contains("no Annex-B start code"));
    }
}
