//! Mapping time-stamped image points onto the surface, frame by frame.

use std::ops::Range;

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use surface_tracker_core::{CameraModel, LocationState};

use crate::LocationCache;

/// Half-open time interval `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub end: f64,
}

/// Time interval attributed to frame `idx`.
///
/// Bounds sit halfway between neighbouring frame timestamps; the first and
/// last frames extend to infinity.
pub fn enclosing_window(timestamps: &[f64], idx: usize) -> Option<TimeWindow> {
    let t = *timestamps.get(idx)?;
    let start = match idx.checked_sub(1).and_then(|i| timestamps.get(i)) {
        Some(prev) => (prev + t) / 2.0,
        None => f64::NEG_INFINITY,
    };
    let end = match timestamps.get(idx + 1) {
        Some(next) => (t + next) / 2.0,
        None => f64::INFINITY,
    };
    Some(TimeWindow { start, end })
}

/// A time-stamped point in raw image pixels, e.g. a gaze sample.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PointEvent {
    pub timestamp: f64,
    pub position: Point2<f32>,
    pub confidence: f32,
}

/// Source of point events queryable by time.
pub trait EventStore {
    /// Events with timestamps inside `window`, in timestamp order.
    fn query_window(&self, window: TimeWindow) -> Vec<PointEvent>;
}

/// In-memory event store kept sorted by timestamp.
#[derive(Clone, Debug, Default)]
pub struct SortedEvents {
    events: Vec<PointEvent>,
}

impl SortedEvents {
    pub fn new(mut events: Vec<PointEvent>) -> Self {
        events.sort_by(|a, b| a.timestamp.total_cmp(&b.timestamp));
        Self { events }
    }
}

impl EventStore for SortedEvents {
    fn query_window(&self, window: TimeWindow) -> Vec<PointEvent> {
        let lo = self.events.partition_point(|e| e.timestamp < window.start);
        let hi = self.events.partition_point(|e| e.timestamp < window.end);
        self.events[lo..hi.max(lo)].to_vec()
    }
}

/// A point event expressed in normalized surface coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MappedPoint {
    pub timestamp: f64,
    pub surface_position: Point2<f32>,
    pub confidence: f32,
    /// Whether the point falls inside the unit square.
    pub on_surface: bool,
}

impl MappedPoint {
    fn from_event(event: &PointEvent, surface_position: Point2<f32>) -> Self {
        let inside = |v: f32| (0.0..=1.0).contains(&v);
        Self {
            timestamp: event.timestamp,
            surface_position,
            confidence: event.confidence,
            on_surface: inside(surface_position.x) && inside(surface_position.y),
        }
    }
}

/// Read-only view of a location cache for section queries.
#[derive(Clone, Copy, Debug)]
pub struct SectionReader<'a> {
    cache: Option<&'a LocationCache>,
}

impl<'a> SectionReader<'a> {
    pub fn new(cache: Option<&'a LocationCache>) -> Self {
        Self { cache }
    }

    /// Events of every frame in `range`, mapped onto the surface.
    ///
    /// The result holds one list per frame of the range (clamped to the
    /// cache), empty where the surface was not detected. Without a cache the
    /// result is empty.
    pub fn map_section(
        &self,
        range: Range<usize>,
        timestamps: &[f64],
        events: &dyn EventStore,
        camera: &CameraModel,
    ) -> Vec<Vec<MappedPoint>> {
        let Some(cache) = self.cache else {
            return Vec::new();
        };
        let start = range.start.min(range.end).min(cache.len());
        cache
            .section(range)
            .iter()
            .enumerate()
            .map(|(offset, state)| {
                map_frame(start + offset, state, timestamps, events, camera)
            })
            .collect()
    }

    /// Number of frames in `range` where the surface was detected.
    pub fn visible_count(&self, range: Range<usize>) -> usize {
        self.cache.map_or(0, |cache| cache.detected_count(range))
    }
}

fn map_frame(
    idx: usize,
    state: &LocationState,
    timestamps: &[f64],
    events: &dyn EventStore,
    camera: &CameraModel,
) -> Vec<MappedPoint> {
    let (Some(transforms), Some(window)) = (state.transforms(), enclosing_window(timestamps, idx))
    else {
        return Vec::new();
    };
    events
        .query_window(window)
        .iter()
        .filter_map(|event| {
            let undist = camera.undistort(event.position)?;
            Some(MappedPoint::from_event(
                event,
                transforms.img_to_surf.apply(undist),
            ))
        })
        .collect()
}
