//! packet.rs
//! Binary scan layout derived from live device metadata, and the decoded samples.
//!
//! The device packs active channels in ascending scan-index order as big-endian
//! signed 16-bit words. The layout is rebuilt on every reconfiguration.

use serde::{Serialize, Serializer, ser::SerializeMap};

use crate::sensor::channel::ChannelMask;

/// Bytes per channel word.
pub const WORD_SIZE: usize = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMeta {
    pub channel: ChannelMask,
    pub name: &'static str,
    pub index: u32,
    pub scale: f64,
    pub offset: f64,
}

impl ChannelMeta {
    #[inline]
    pub fn to_physical(&self, raw: i16) -> f64 {
        (f64::from(raw) + self.offset) * self.scale
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketLayout {
    metas: Vec<ChannelMeta>,
}

impl PacketLayout {
    /// Sorts by scan index; the order on the wire is imposed by the device.
    pub fn new(mut metas: Vec<ChannelMeta>) -> Self {
        metas.sort_by_key(|m| m.index);
        Self { metas }
    }

    pub fn metas(&self) -> &[ChannelMeta] {
        &self.metas
    }

    pub fn len(&self) -> usize {
        self.metas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Packet size in bytes.
    pub fn size(&self) -> usize {
        self.metas.len() * WORD_SIZE
    }

    /// Channels actually present in the layout.
    pub fn mask(&self) -> ChannelMask {
        self.metas
            .iter()
            .fold(ChannelMask::NONE, |acc, m| acc | m.channel)
    }

    /// Decodes one packet. `None` unless `bytes` is exactly one packet long.
    pub fn decode(&self, bytes: &[u8]) -> Option<Sample> {
        if self.metas.is_empty() || bytes.len() != self.size() {
            return None;
        }
        let readings = bytes
            .chunks_exact(WORD_SIZE)
            .zip(&self.metas)
            .map(|(word, meta)| Reading {
                channel: meta.channel,
                name: meta.name,
                value: meta.to_physical(i16::from_be_bytes([word[0], word[1]])),
            })
            .collect();
        Some(Sample { readings })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub channel: ChannelMask,
    pub name: &'static str,
    pub value: f64,
}

/// One decoded packet in physical units. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    readings: Vec<Reading>,
}

impl Sample {
    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    /// Value for a channel by its wire name.
    pub fn get(&self, name: &str) -> Option<f64> {
        self.readings.iter().find(|r| r.name == name).map(|r| r.value)
    }

    /// View restricted to the channels in `mask`.
    pub fn select(&self, mask: ChannelMask) -> SampleView<'_> {
        SampleView { sample: self, mask }
    }
}

/// Borrowed, filtered view of a sample; serializes as `{"accel_x": 0.1, ...}`.
#[derive(Debug, Clone, Copy)]
pub struct SampleView<'a> {
    sample: &'a Sample,
    mask: ChannelMask,
}

impl SampleView<'_> {
    pub fn iter(&self) -> impl Iterator<Item = &Reading> {
        let mask = self.mask;
        self.sample
            .readings
            .iter()
            .filter(move |r| mask.contains(r.channel))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Newline-terminated JSON line; `None` when nothing in the mask is present.
    pub fn to_json_line(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }
        let mut line = serde_json::to_vec(self).ok()?;
        line.push(b'\n');
        Some(line)
    }
}

impl Serialize for SampleView<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for reading in self.iter() {
            map.serialize_entry(reading.name, &reading.value)?;
        }
        map.end()
    }
}
