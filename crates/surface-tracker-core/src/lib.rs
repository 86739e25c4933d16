//! Geometry and data types for marker-defined planar surfaces.
//!
//! This crate knows nothing about caching or playback. It provides:
//! - homography estimation between image and surface coordinates,
//! - a distortion-aware camera model,
//! - per-frame marker sources,
//! - `MarkerSurface`, which builds a surface definition from marker
//!   observations and locates the surface in a frame.

mod camera;
mod homography;
mod location;
mod logger;
mod marker;
mod surface;

pub use camera::{CameraIntrinsics, CameraModel, Distortion};
pub use homography::{estimate_homography, homography_from_4pt, Homography};
pub use location::{LocationState, SurfaceTransforms};
pub use marker::{Marker, MarkerCache, MarkerEntry};
pub use surface::{
    locate, GeometryError, MarkerRegistry, MarkerSurface, RegisteredMarker, SurfaceLocator,
    SurfaceParams, UNIT_SQUARE,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
