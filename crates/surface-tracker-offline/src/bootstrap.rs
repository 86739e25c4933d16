//! Lazy discovery of a surface definition from an incomplete marker source.
//!
//! The scan starts at `start_idx` and walks forward with wrap-around, feeding
//! every known frame into the surface definition exactly once. A frame whose
//! markers are still unknown interrupts the scan; the next call resumes. The
//! definition becomes final only when the walk reaches the frame just before
//! `start_idx` without interruption.

use std::collections::BTreeSet;

use log::{debug, info};
use surface_tracker_core::{CameraModel, MarkerCache, MarkerEntry, MarkerSurface};

/// Largest build-up status reported before the scan loop closes.
const MAX_OPEN_STATUS: f32 = 1.0 - f32::EPSILON;

/// Where the bootstrap currently stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapPhase {
    /// No frame has been scanned yet.
    Undefined,
    /// Scanning started but the loop has not closed.
    Scanning,
    /// The loop closed; terminal.
    Defined,
}

/// Result of one [`DefinitionBootstrapper::scan`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanOutcome {
    /// The loop closed during this call.
    Closed,
    /// Marker data for frame `at` is not available yet.
    Interrupted { at: usize },
    /// The definition was already final.
    AlreadyDefined,
}

/// Bootstrap progress of one surface.
#[derive(Clone, Debug, PartialEq)]
pub struct DefinitionBootstrapper {
    start_idx: Option<usize>,
    observations_frame_idxs: BTreeSet<usize>,
    build_up_status: f32,
}

impl Default for DefinitionBootstrapper {
    fn default() -> Self {
        Self::new()
    }
}

impl DefinitionBootstrapper {
    pub fn new() -> Self {
        Self {
            start_idx: None,
            observations_frame_idxs: BTreeSet::new(),
            build_up_status: 0.0,
        }
    }

    /// A surface that was fully defined before it was tracked offline.
    pub fn already_defined() -> Self {
        Self {
            start_idx: Some(0),
            observations_frame_idxs: BTreeSet::new(),
            build_up_status: 1.0,
        }
    }

    /// Resume from persisted progress.
    pub fn restore(
        start_idx: Option<usize>,
        observations_frame_idxs: impl IntoIterator<Item = usize>,
        build_up_status: f32,
    ) -> Self {
        Self {
            start_idx,
            observations_frame_idxs: observations_frame_idxs.into_iter().collect(),
            build_up_status: build_up_status.clamp(0.0, 1.0),
        }
    }

    pub fn phase(&self) -> BootstrapPhase {
        if self.is_defined() {
            BootstrapPhase::Defined
        } else if self.start_idx.is_none() {
            BootstrapPhase::Undefined
        } else {
            BootstrapPhase::Scanning
        }
    }

    pub fn is_defined(&self) -> bool {
        self.build_up_status >= 1.0
    }

    pub fn start_idx(&self) -> Option<usize> {
        self.start_idx
    }

    pub fn observations_frame_idxs(&self) -> &BTreeSet<usize> {
        &self.observations_frame_idxs
    }

    pub fn build_up_status(&self) -> f32 {
        self.build_up_status
    }

    /// Advance the scan as far as the marker source allows.
    ///
    /// `frame_idx` becomes the start of the scan on the first call.
    pub fn scan(
        &mut self,
        frame_idx: usize,
        markers: &MarkerCache,
        surface: &mut MarkerSurface,
        camera: &CameraModel,
    ) -> ScanOutcome {
        if self.is_defined() {
            return ScanOutcome::AlreadyDefined;
        }
        let n = markers.len();
        if n == 0 {
            return ScanOutcome::Interrupted { at: frame_idx };
        }

        let start = match self.start_idx {
            Some(start) if start < n => start,
            _ => {
                let start = frame_idx.min(n - 1);
                debug!("surface '{}' scan starts at frame {start}", surface.name());
                self.start_idx = Some(start);
                start
            }
        };
        let last = (start + n - 1) % n;

        let mut idx = start;
        loop {
            let Some(MarkerEntry::Known(visible)) = markers.get(idx) else {
                self.build_up_status =
                    (self.observations_frame_idxs.len() as f32 / n as f32).min(MAX_OPEN_STATUS);
                return ScanOutcome::Interrupted { at: idx };
            };

            if self.observations_frame_idxs.insert(idx) {
                surface.update_definition(visible, camera);
            }

            if idx == last {
                self.build_up_status = 1.0;
                surface.prune_markers();
                info!(
                    "surface '{}' defined from {} frames with {} markers",
                    surface.name(),
                    self.observations_frame_idxs.len(),
                    surface.registered_markers_undist().len()
                );
                return ScanOutcome::Closed;
            }
            idx = (idx + 1) % n;
        }
    }
}
