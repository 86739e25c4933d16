//! Marker-defined planar surfaces.
//!
//! A surface is described by the positions of its markers' vertices in
//! normalized surface coordinates (the unit square). Two registrations are
//! kept: one built from undistorted vertices and one from raw vertices, so a
//! located surface carries transforms for both pixel spaces.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

use crate::{
    estimate_homography, homography_from_4pt, CameraModel, Homography, LocationState, Marker,
    MarkerEntry, SurfaceTransforms,
};

/// Corners of the normalized surface, counter-clockwise from the origin.
pub const UNIT_SQUARE: [Point2<f32>; 4] = [
    Point2::new(0.0, 0.0),
    Point2::new(1.0, 0.0),
    Point2::new(1.0, 1.0),
    Point2::new(0.0, 1.0),
];

/// Errors from editing a surface definition.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("surface is not located in the current frame")]
    SurfaceNotLocated,
    #[error("corner index {index} out of range (expected 0..4)")]
    InvalidCorner { index: usize },
    #[error("point could not be undistorted")]
    Undistortion,
    #[error("degenerate perspective transform")]
    DegenerateTransform,
}

/// Tuning for surface definition and location.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceParams {
    /// Markers with a smaller pixel perimeter are ignored.
    pub min_marker_perimeter: f32,
    /// Minimal number of registered markers needed to report a detection.
    pub min_markers_for_detection: usize,
    /// Registrations seen in fewer than `ratio * max_support` frames are pruned.
    pub prune_support_ratio: f32,
}

impl Default for SurfaceParams {
    fn default() -> Self {
        Self {
            min_marker_perimeter: 20.0,
            min_markers_for_detection: 1,
            prune_support_ratio: 0.2,
        }
    }
}

/// One marker's vertices in surface coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegisteredMarker {
    pub id: u32,
    pub verts_uv: [Point2<f32>; 4],
    /// Number of observations folded into `verts_uv`.
    pub support: usize,
}

impl RegisteredMarker {
    fn new(id: u32, verts_uv: [Point2<f32>; 4]) -> Self {
        Self {
            id,
            verts_uv,
            support: 1,
        }
    }

    /// Fold another observation into the running mean.
    fn observe(&mut self, verts_uv: &[Point2<f32>; 4]) {
        let n = self.support as f32;
        for (acc, v) in self.verts_uv.iter_mut().zip(verts_uv) {
            acc.x = (acc.x * n + v.x) / (n + 1.0);
            acc.y = (acc.y * n + v.y) / (n + 1.0);
        }
        self.support += 1;
    }
}

pub type MarkerRegistry = BTreeMap<u32, RegisteredMarker>;

fn to_quad(pts: Vec<Point2<f32>>) -> Option<[Point2<f32>; 4]> {
    pts.try_into().ok()
}

/// Locate a surface from the markers visible in one frame.
///
/// Only markers present in both registrations contribute. Any degenerate
/// estimate yields `NotDetected`.
pub fn locate(
    markers: &[Marker],
    camera: &CameraModel,
    registered_undist: &MarkerRegistry,
    registered_dist: &MarkerRegistry,
    params: &SurfaceParams,
) -> LocationState {
    let mut raw = Vec::new();
    let mut uv_undist = Vec::new();
    let mut uv_dist = Vec::new();
    let mut marker_count = 0;

    for m in markers {
        if m.perimeter() < params.min_marker_perimeter {
            continue;
        }
        let (Some(ru), Some(rd)) = (registered_undist.get(&m.id), registered_dist.get(&m.id))
        else {
            continue;
        };
        raw.extend_from_slice(&m.verts_px);
        uv_undist.extend_from_slice(&ru.verts_uv);
        uv_dist.extend_from_slice(&rd.verts_uv);
        marker_count += 1;
    }

    if marker_count == 0 || marker_count < params.min_markers_for_detection {
        return LocationState::NotDetected;
    }

    let transforms = camera.undistort_all(&raw).and_then(|undist| {
        let img_to_surf = estimate_homography(&undist, &uv_undist)?;
        let dist_img_to_surf = estimate_homography(&raw, &uv_dist)?;
        Some(SurfaceTransforms {
            img_to_surf,
            surf_to_img: img_to_surf.inverse()?,
            dist_img_to_surf,
            surf_to_dist_img: dist_img_to_surf.inverse()?,
        })
    });

    match transforms {
        Some(transforms) => LocationState::Detected {
            transforms,
            marker_count,
        },
        None => LocationState::NotDetected,
    }
}

/// Immutable snapshot of everything `locate` needs.
///
/// Cheap to clone and safe to move onto a worker thread.
#[derive(Clone, Debug)]
pub struct SurfaceLocator {
    camera: CameraModel,
    registered_undist: Arc<MarkerRegistry>,
    registered_dist: Arc<MarkerRegistry>,
    params: SurfaceParams,
}

impl SurfaceLocator {
    /// Location for one marker entry; unknown markers stay `Unknown`.
    pub fn locate(&self, entry: &MarkerEntry) -> LocationState {
        match entry {
            MarkerEntry::Unknown => LocationState::Unknown,
            MarkerEntry::Known(markers) => locate(
                markers,
                &self.camera,
                &self.registered_undist,
                &self.registered_dist,
                &self.params,
            ),
        }
    }
}

/// A surface defined by a set of registered markers.
#[derive(Clone, Debug)]
pub struct MarkerSurface {
    name: String,
    registered_undist: MarkerRegistry,
    registered_dist: MarkerRegistry,
    params: SurfaceParams,
}

impl MarkerSurface {
    pub fn new(name: impl Into<String>, params: SurfaceParams) -> Self {
        Self::from_registrations(name, params, MarkerRegistry::new(), MarkerRegistry::new())
    }

    pub fn from_registrations(
        name: impl Into<String>,
        params: SurfaceParams,
        registered_undist: MarkerRegistry,
        registered_dist: MarkerRegistry,
    ) -> Self {
        Self {
            name: name.into(),
            registered_undist,
            registered_dist,
            params,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &SurfaceParams {
        &self.params
    }

    pub fn registered_markers_undist(&self) -> &MarkerRegistry {
        &self.registered_undist
    }

    pub fn registered_markers_dist(&self) -> &MarkerRegistry {
        &self.registered_dist
    }

    pub fn has_registrations(&self) -> bool {
        !self.registered_undist.is_empty()
    }

    pub fn locate(&self, markers: &[Marker], camera: &CameraModel) -> LocationState {
        locate(
            markers,
            camera,
            &self.registered_undist,
            &self.registered_dist,
            &self.params,
        )
    }

    pub fn locator(&self, camera: &CameraModel) -> SurfaceLocator {
        SurfaceLocator {
            camera: *camera,
            registered_undist: Arc::new(self.registered_undist.clone()),
            registered_dist: Arc::new(self.registered_dist.clone()),
            params: self.params.clone(),
        }
    }

    /// Accumulate one frame of marker observations into the definition.
    ///
    /// The first frame with usable markers fixes the coordinate system to
    /// their bounding box. Later frames refine existing registrations and
    /// register new markers, provided the surface can be located.
    pub fn update_definition(&mut self, markers: &[Marker], camera: &CameraModel) {
        let usable: Vec<&Marker> = markers
            .iter()
            .filter(|m| m.perimeter() >= self.params.min_marker_perimeter)
            .collect();
        if usable.is_empty() {
            return;
        }

        if !self.has_registrations() {
            self.define_coordinate_system(&usable, camera);
            return;
        }

        let location = self.locate(markers, camera);
        let Some(t) = location.transforms() else {
            return;
        };

        for m in usable {
            let Some(undist) = camera.undistort_all(&m.verts_px) else {
                continue;
            };
            let (Some(uv_undist), Some(uv_dist)) = (
                to_quad(t.img_to_surf.apply_all(&undist)),
                to_quad(t.dist_img_to_surf.apply_all(&m.verts_px)),
            ) else {
                continue;
            };
            self.registered_undist
                .entry(m.id)
                .and_modify(|r| r.observe(&uv_undist))
                .or_insert_with(|| RegisteredMarker::new(m.id, uv_undist));
            self.registered_dist
                .entry(m.id)
                .and_modify(|r| r.observe(&uv_dist))
                .or_insert_with(|| RegisteredMarker::new(m.id, uv_dist));
        }
    }

    fn define_coordinate_system(&mut self, markers: &[&Marker], camera: &CameraModel) {
        let raw: Vec<Point2<f32>> = markers.iter().flat_map(|m| m.verts_px).collect();
        let Some(undist) = camera.undistort_all(&raw) else {
            return;
        };

        let (mut min, mut max) = (undist[0], undist[0]);
        for p in &undist {
            min = Point2::new(min.x.min(p.x), min.y.min(p.y));
            max = Point2::new(max.x.max(p.x), max.y.max(p.y));
        }
        if max.x - min.x < 1e-3 || max.y - min.y < 1e-3 {
            return;
        }

        let corners_undist = [
            Point2::new(min.x, min.y),
            Point2::new(max.x, min.y),
            Point2::new(max.x, max.y),
            Point2::new(min.x, max.y),
        ];
        let Some(corners_dist) = camera.distort_all(&corners_undist).and_then(to_quad) else {
            return;
        };
        let (Some(h_undist), Some(h_dist)) = (
            homography_from_4pt(&corners_undist, &UNIT_SQUARE),
            homography_from_4pt(&corners_dist, &UNIT_SQUARE),
        ) else {
            return;
        };

        for (m, verts) in markers.iter().zip(undist.chunks_exact(4)) {
            let (Some(uv_undist), Some(uv_dist)) = (
                to_quad(h_undist.apply_all(verts)),
                to_quad(h_dist.apply_all(&m.verts_px)),
            ) else {
                continue;
            };
            self.registered_undist
                .insert(m.id, RegisteredMarker::new(m.id, uv_undist));
            self.registered_dist
                .insert(m.id, RegisteredMarker::new(m.id, uv_dist));
        }
        debug!(
            "surface '{}' defined from {} markers",
            self.name,
            self.registered_undist.len()
        );
    }

    /// Drop registrations with little support relative to the best-supported marker.
    pub fn prune_markers(&mut self) {
        let max_support = self
            .registered_undist
            .values()
            .map(|r| r.support)
            .max()
            .unwrap_or(0);
        let min_support = self.params.prune_support_ratio * max_support as f32;

        let before = self.registered_undist.len();
        self.registered_undist
            .retain(|_, r| r.support as f32 >= min_support);
        let kept = &self.registered_undist;
        self.registered_dist.retain(|id, _| kept.contains_key(id));
        debug!(
            "pruned {} of {} markers from surface '{}'",
            before - self.registered_undist.len(),
            before,
            self.name
        );
    }

    /// Register a marker from its image vertices in a frame where the surface is located.
    pub fn add_marker(
        &mut self,
        id: u32,
        verts_px: [Point2<f32>; 4],
        camera: &CameraModel,
        location: &LocationState,
    ) -> Result<(), GeometryError> {
        let Some(t) = location.transforms() else {
            return Err(GeometryError::SurfaceNotLocated);
        };
        let Some(undist) = camera.undistort_all(&verts_px) else {
            return Err(GeometryError::Undistortion);
        };
        let uv_undist = to_quad(t.img_to_surf.apply_all(&undist));
        let uv_dist = to_quad(t.dist_img_to_surf.apply_all(&verts_px));
        let (Some(uv_undist), Some(uv_dist)) = (uv_undist, uv_dist) else {
            return Err(GeometryError::DegenerateTransform);
        };

        let undist_marker = RegisteredMarker::new(id, uv_undist);
        let dist_marker = RegisteredMarker::new(id, uv_dist);
        self.registered_undist.insert(id, undist_marker);
        self.registered_dist.insert(id, dist_marker);
        Ok(())
    }

    /// Remove a registration. Returns whether the marker was registered.
    pub fn pop_marker(&mut self, id: u32) -> bool {
        let removed = self.registered_undist.remove(&id).is_some();
        self.registered_dist.remove(&id).is_some() || removed
    }

    /// Move one surface corner to `new_pos` (raw image pixels).
    ///
    /// All registrations are re-expressed so that the edited corner becomes
    /// the corresponding unit-square corner.
    pub fn move_corner(
        &mut self,
        corner_idx: usize,
        new_pos: Point2<f32>,
        camera: &CameraModel,
        location: &LocationState,
    ) -> Result<(), GeometryError> {
        if corner_idx >= UNIT_SQUARE.len() {
            return Err(GeometryError::InvalidCorner { index: corner_idx });
        }
        let Some(t) = location.transforms() else {
            return Err(GeometryError::SurfaceNotLocated);
        };
        let Some(undist) = camera.undistort(new_pos) else {
            return Err(GeometryError::Undistortion);
        };

        let remap_undist = corner_remap(corner_idx, t.img_to_surf.apply(undist))?;
        let remap_dist = corner_remap(corner_idx, t.dist_img_to_surf.apply(new_pos))?;

        remap_registry(&mut self.registered_undist, &remap_undist);
        remap_registry(&mut self.registered_dist, &remap_dist);
        Ok(())
    }
}

/// Transform taking the edited square back onto the canonical one.
fn corner_remap(corner_idx: usize, new_uv: Point2<f32>) -> Result<Homography, GeometryError> {
    let mut edited = UNIT_SQUARE;
    edited[corner_idx] = new_uv;
    homography_from_4pt(&edited, &UNIT_SQUARE).ok_or(GeometryError::DegenerateTransform)
}

fn remap_registry(registry: &mut MarkerRegistry, h: &Homography) {
    for r in registry.values_mut() {
        r.verts_uv = r.verts_uv.map(|p| h.apply(p));
    }
}
