//! Offline surface tracking over recorded marker sequences.
//!
//! A [`SurfaceLocationController`] answers "where is the surface in frame
//! `i`?" for a recording whose marker detections may still be in progress.
//! Answers come from a per-frame [`LocationCache`] that is filled in the
//! background and on demand, so no call ever waits for computation.
//!
//! Before any location exists, a [`DefinitionBootstrapper`] builds the
//! surface definition by scanning the recording once, wrapping around from
//! the first visited frame. Until that scan closes, results are provisional
//! and never cached.
//!
//! ```no_run
//! use surface_tracker_core::{CameraIntrinsics, CameraModel, MarkerCache};
//! use surface_tracker_offline::{OfflineParams, SurfaceLocationController};
//!
//! let camera = CameraModel::pinhole(CameraIntrinsics {
//!     fx: 800.0,
//!     fy: 800.0,
//!     cx: 640.0,
//!     cy: 360.0,
//! });
//! let markers = MarkerCache::unknown(300);
//! let mut surface = SurfaceLocationController::new("monitor", OfflineParams::default());
//! let location = surface.update_location(0, &markers, &camera);
//! assert!(!location.is_detected());
//! ```

mod bootstrap;
mod cache;
mod controller;
mod filler;
mod observer;
mod params;
mod record;
mod section;

pub use bootstrap::{BootstrapPhase, DefinitionBootstrapper, ScanOutcome};
pub use cache::LocationCache;
pub use controller::SurfaceLocationController;
pub use filler::{
    BackgroundFiller, BackgroundJob, Drained, JobFactory, JobRequest, SeekCursor,
    ThreadedJobFactory,
};
pub use observer::{SurfaceChange, SurfaceObserver};
pub use params::OfflineParams;
pub use record::{AddedInPlayer, RecordError, SerializedLocation, SurfaceRecord};
pub use section::{
    enclosing_window, EventStore, MappedPoint, PointEvent, SectionReader, SortedEvents,
    TimeWindow,
};
