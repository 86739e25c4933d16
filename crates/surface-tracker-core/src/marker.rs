use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// A square fiducial detected in one frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub id: u32,
    /// Corner positions in raw (distorted) image pixels, in detector order.
    pub verts_px: [Point2<f32>; 4],
}

impl Marker {
    pub fn new(id: u32, verts_px: [Point2<f32>; 4]) -> Self {
        Self { id, verts_px }
    }

    /// Perimeter of the vertex polygon in pixels.
    pub fn perimeter(&self) -> f32 {
        (0..4)
            .map(|k| nalgebra::distance(&self.verts_px[k], &self.verts_px[(k + 1) % 4]))
            .sum()
    }
}

/// Marker detection state of a single frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum MarkerEntry {
    /// Upstream detection has not reached this frame yet.
    #[default]
    Unknown,
    /// Detection ran; the list may be empty.
    Known(Vec<Marker>),
}

impl MarkerEntry {
    pub fn is_known(&self) -> bool {
        matches!(self, MarkerEntry::Known(_))
    }
}

/// Per-frame marker source of a recording, one entry per frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MarkerCache {
    entries: Vec<MarkerEntry>,
}

impl MarkerCache {
    pub fn new(entries: Vec<MarkerEntry>) -> Self {
        Self { entries }
    }

    /// A recording of `len` frames with no marker data yet.
    pub fn unknown(len: usize) -> Self {
        Self::new(vec![MarkerEntry::Unknown; len])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&MarkerEntry> {
        self.entries.get(idx)
    }

    /// True when the frame exists and its markers were computed.
    pub fn is_known(&self, idx: usize) -> bool {
        self.get(idx).is_some_and(MarkerEntry::is_known)
    }

    /// Store an upstream detection result. Out of range indices are ignored.
    pub fn set(&mut self, idx: usize, entry: MarkerEntry) {
        if let Some(slot) = self.entries.get_mut(idx) {
            *slot = entry;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkerEntry> {
        self.entries.iter()
    }
}

impl FromIterator<MarkerEntry> for MarkerCache {
    fn from_iter<T: IntoIterator<Item = MarkerEntry>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}
