use crate::Homography;

/// The four transforms between image space and normalized surface space.
///
/// `img_*` operate on undistorted pixels, `dist_img_*` on raw pixels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceTransforms {
    pub img_to_surf: Homography,
    pub surf_to_img: Homography,
    pub dist_img_to_surf: Homography,
    pub surf_to_dist_img: Homography,
}

/// Location of a surface in one frame.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum LocationState {
    /// Not computed yet.
    #[default]
    Unknown,
    /// Computed, surface absent.
    NotDetected,
    /// Computed, surface present.
    Detected {
        transforms: SurfaceTransforms,
        marker_count: usize,
    },
}

impl LocationState {
    pub fn is_detected(&self) -> bool {
        matches!(self, LocationState::Detected { .. })
    }

    /// True for `Detected` and `NotDetected`.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, LocationState::Unknown)
    }

    pub fn transforms(&self) -> Option<&SurfaceTransforms> {
        match self {
            LocationState::Detected { transforms, .. } => Some(transforms),
            _ => None,
        }
    }

    pub fn marker_count(&self) -> usize {
        match self {
            LocationState::Detected { marker_count, .. } => *marker_count,
            _ => 0,
        }
    }
}
