use std::ops::Range;

use surface_tracker_core::LocationState;

/// Per-frame surface locations of a recording, one entry per frame.
#[derive(Clone, Debug, PartialEq)]
pub struct LocationCache {
    entries: Vec<LocationState>,
}

impl LocationCache {
    /// A cache of `len` frames, none computed yet.
    pub fn unknown(len: usize) -> Self {
        Self {
            entries: vec![LocationState::Unknown; len],
        }
    }

    pub fn from_states(entries: Vec<LocationState>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&LocationState> {
        self.entries.get(idx)
    }

    /// Overwrite one entry. Returns false when `idx` is out of range.
    pub fn update(&mut self, idx: usize, state: LocationState) -> bool {
        match self.entries.get_mut(idx) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => false,
        }
    }

    /// Entries in `range`, clamped to the cache bounds.
    pub fn section(&self, range: Range<usize>) -> &[LocationState] {
        let end = range.end.min(self.entries.len());
        let start = range.start.min(end);
        &self.entries[start..end]
    }

    pub fn detected_count(&self, range: Range<usize>) -> usize {
        let section = self.section(range);
        section.iter().filter(|s| s.is_detected()).count()
    }

    /// True once no entry is `Unknown`.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(LocationState::is_resolved)
    }

    /// One flag per frame, set where the entry is already resolved.
    pub fn resolved_flags(&self) -> Vec<bool> {
        self.entries.iter().map(LocationState::is_resolved).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocationState> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use surface_tracker_core::{Homography, SurfaceTransforms};

    fn detected() -> LocationState {
        let h = Homography::identity();
        LocationState::Detected {
            transforms: SurfaceTransforms {
                img_to_surf: h,
                surf_to_img: h,
                dist_img_to_surf: h,
                surf_to_dist_img: h,
            },
            marker_count: 2,
        }
    }

    #[test]
    fn update_overwrites_and_rejects_out_of_range() {
        let mut cache = LocationCache::unknown(3);
        assert!(cache.update(1, LocationState::NotDetected));
        assert!(cache.update(1, detected()));
        assert!(!cache.update(3, detected()));
        assert_eq!(cache.get(1), Some(&detected()));
        assert_eq!(cache.len(), 3);
        assert!(!cache.is_complete());
    }

    #[test]
    fn section_is_clamped() {
        let mut cache = LocationCache::unknown(5);
        cache.update(3, detected());
        cache.update(4, detected());
        assert_eq!(cache.section(2..10).len(), 3);
        assert!(cache.section(7..9).is_empty());
        assert_eq!(cache.detected_count(0..4), 1);
        assert_eq!(cache.detected_count(0..100), 2);
    }

    #[test]
    fn resolved_flags_track_known_entries() {
        let mut cache = LocationCache::unknown(3);
        cache.update(0, LocationState::NotDetected);
        cache.update(2, detected());
        assert_eq!(cache.resolved_flags(), vec![true, false, true]);
        cache.update(1, LocationState::NotDetected);
        assert!(cache.is_complete());
    }
}
