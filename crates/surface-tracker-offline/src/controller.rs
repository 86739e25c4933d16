//! Per-frame and per-section access to the locations of one surface.

use std::ops::Range;

use log::{debug, info, warn};
use nalgebra::Point2;
use serde_json::Value;
use surface_tracker_core::{
    CameraModel, LocationState, MarkerCache, MarkerEntry, MarkerSurface, SurfaceParams,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    AddedInPlayer, BackgroundFiller, DefinitionBootstrapper, EventStore, JobFactory,
    LocationCache, MappedPoint, OfflineParams, ScanOutcome, SectionReader, SurfaceChange,
    SurfaceObserver, SurfaceRecord, ThreadedJobFactory,
};

/// Drives the location cache of one surface over a recording.
///
/// Every operation returns immediately: locations that are not available yet
/// are reported as `NotDetected` and resolved on a later visit, either by the
/// background job or on demand once the frame's markers are known. Failures
/// are logged and never reach the caller.
pub struct SurfaceLocationController {
    surface: MarkerSurface,
    bootstrap: DefinitionBootstrapper,
    cache: Option<LocationCache>,
    filler: BackgroundFiller,
    current: LocationState,
    /// Set after a corner edit; the next visit fills the remaining frames.
    refill_pending: bool,
    /// Frame the bootstrap scan last stopped at, already reported.
    stalled_at: Option<usize>,
    observer: Option<Box<dyn SurfaceObserver>>,
}

impl SurfaceLocationController {
    /// A new, undefined surface filled by background threads.
    pub fn new(name: impl Into<String>, params: OfflineParams) -> Self {
        let factory = ThreadedJobFactory::new(params.worker_thread_name);
        Self::with_job_factory(name, params.surface, Box::new(factory))
    }

    /// A new, undefined surface whose fill jobs come from `factory`.
    pub fn with_job_factory(
        name: impl Into<String>,
        params: SurfaceParams,
        factory: Box<dyn JobFactory>,
    ) -> Self {
        Self::from_parts(
            MarkerSurface::new(name, params),
            DefinitionBootstrapper::new(),
            factory,
        )
    }

    /// Track a surface that was fully defined elsewhere.
    pub fn for_defined_surface(surface: MarkerSurface, factory: Box<dyn JobFactory>) -> Self {
        Self::from_parts(surface, DefinitionBootstrapper::already_defined(), factory)
    }

    fn from_parts(
        surface: MarkerSurface,
        bootstrap: DefinitionBootstrapper,
        factory: Box<dyn JobFactory>,
    ) -> Self {
        Self {
            surface,
            bootstrap,
            cache: None,
            filler: BackgroundFiller::new(factory),
            current: LocationState::Unknown,
            refill_pending: false,
            stalled_at: None,
            observer: None,
        }
    }

    pub fn name(&self) -> &str {
        self.surface.name()
    }

    pub fn surface(&self) -> &MarkerSurface {
        &self.surface
    }

    /// Location adopted by the last `update_location` call.
    pub fn current_location(&self) -> &LocationState {
        &self.current
    }

    pub fn build_up_status(&self) -> f32 {
        self.bootstrap.build_up_status()
    }

    pub fn is_defined(&self) -> bool {
        self.bootstrap.is_defined()
    }

    pub fn bootstrapper(&self) -> &DefinitionBootstrapper {
        &self.bootstrap
    }

    pub fn has_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn cache(&self) -> Option<&LocationCache> {
        self.cache.as_ref()
    }

    pub fn has_live_job(&self) -> bool {
        self.filler.is_running()
    }

    pub fn subscribe(&mut self, observer: impl SurfaceObserver + 'static) {
        self.observer = Some(Box::new(observer));
    }

    fn notify(&mut self, change: SurfaceChange) {
        if let Some(observer) = self.observer.as_mut() {
            observer.on_surface_change(self.surface.name(), change);
        }
    }

    fn adopt(&mut self, state: LocationState) -> LocationState {
        self.current = state;
        state
    }

    /// Location of the surface in `frame_idx`.
    ///
    /// Runs the bootstrap scan while the surface is undefined, applies
    /// finished background results, then reads the cache. A missing cache is
    /// rebuilt in the background, starting at `frame_idx`.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, markers, camera), fields(surface = %self.surface.name()))
    )]
    pub fn update_location(
        &mut self,
        frame_idx: usize,
        markers: &MarkerCache,
        camera: &CameraModel,
    ) -> LocationState {
        let n = markers.len();
        if frame_idx >= n {
            debug!("frame {frame_idx} outside recording of {n} frames");
            return self.adopt(LocationState::NotDetected);
        }

        if !self.bootstrap.is_defined() {
            match self
                .bootstrap
                .scan(frame_idx, markers, &mut self.surface, camera)
            {
                ScanOutcome::Closed => {
                    self.stalled_at = None;
                    self.drop_cache();
                    self.notify(SurfaceChange::Defined);
                }
                ScanOutcome::Interrupted { at } => {
                    debug!(
                        "surface '{}' definition pending, markers of frame {at} unknown",
                        self.surface.name()
                    );
                    let dropped = self.drop_cache();
                    if dropped || self.stalled_at != Some(at) {
                        self.stalled_at = Some(at);
                        self.notify(SurfaceChange::ProvisionalDiscarded);
                    }
                    let provisional = self.provisional_location(frame_idx, markers, camera);
                    return self.adopt(provisional);
                }
                ScanOutcome::AlreadyDefined => {}
            }
        }

        if self.cache.as_ref().is_some_and(|c| c.len() != n) {
            warn!(
                "location cache of surface '{}' does not match {n} frames, discarding",
                self.surface.name()
            );
            self.drop_cache();
        }

        self.drain();

        if self.cache.is_none() {
            self.recalculate(frame_idx, markers, camera);
            return self.adopt(LocationState::NotDetected);
        }
        if self.refill_pending && !self.filler.is_running() {
            self.refill(frame_idx, markers, camera);
        }

        let state = self.lookup_or_compute(frame_idx, markers, camera);
        self.adopt(state)
    }

    /// Apply background results gathered so far.
    fn drain(&mut self) {
        let drained = self.filler.drain(self.cache.as_mut());
        if drained.applied > 0 {
            debug!("applied {} background locations", drained.applied);
        }
        if drained.completed {
            info!("fill job of surface '{}' finished", self.surface.name());
            self.notify(SurfaceChange::FillJobFinished);
        }
    }

    fn lookup_or_compute(
        &mut self,
        frame_idx: usize,
        markers: &MarkerCache,
        camera: &CameraModel,
    ) -> LocationState {
        let Some(cache) = self.cache.as_mut() else {
            return LocationState::NotDetected;
        };
        if let Some(state) = cache.get(frame_idx).copied().filter(LocationState::is_resolved) {
            return state;
        }
        match markers.get(frame_idx) {
            Some(MarkerEntry::Known(visible)) => {
                debug!("computing frame {frame_idx} on demand");
                let state = self.surface.locate(visible, camera);
                cache.update(frame_idx, state);
                state
            }
            _ => {
                debug!("markers of frame {frame_idx} pending");
                LocationState::NotDetected
            }
        }
    }

    /// Location for `frame_idx` without touching the cache.
    fn provisional_location(
        &self,
        frame_idx: usize,
        markers: &MarkerCache,
        camera: &CameraModel,
    ) -> LocationState {
        match markers.get(frame_idx) {
            Some(MarkerEntry::Known(visible)) if self.surface.has_registrations() => {
                self.surface.locate(visible, camera)
            }
            _ => LocationState::NotDetected,
        }
    }

    /// Location for an edit at `frame_idx`.
    fn location_at(
        &self,
        frame_idx: usize,
        markers: &MarkerCache,
        camera: &CameraModel,
    ) -> LocationState {
        match self.cache.as_ref().and_then(|c| c.get(frame_idx)) {
            Some(state) if state.is_resolved() => *state,
            _ => match markers.get(frame_idx) {
                Some(MarkerEntry::Known(visible)) => self.surface.locate(visible, camera),
                _ => LocationState::NotDetected,
            },
        }
    }

    /// Cancel the live job and drop the cache. Returns whether either existed.
    fn drop_cache(&mut self) -> bool {
        let cancelled = self.filler.cancel();
        if cancelled {
            debug!(
                "cancelled stale fill job of surface '{}'",
                self.surface.name()
            );
        }
        self.refill_pending = false;
        self.cache.take().is_some() || cancelled
    }

    fn recalculate(&mut self, frame_idx: usize, markers: &MarkerCache, camera: &CameraModel) {
        info!(
            "recalculating location cache of surface '{}' from frame {frame_idx}",
            self.surface.name()
        );
        self.cache = Some(LocationCache::unknown(markers.len()));
        self.refill(frame_idx, markers, camera);
    }

    /// Start a job for every frame with known markers that is not resolved yet.
    fn refill(&mut self, frame_idx: usize, markers: &MarkerCache, camera: &CameraModel) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let visited: Vec<bool> = cache
            .resolved_flags()
            .into_iter()
            .enumerate()
            .map(|(idx, resolved)| resolved || !markers.is_known(idx))
            .collect();
        self.filler
            .start(markers, self.surface.locator(camera), visited, frame_idx);
        self.refill_pending = false;
    }

    /// Point the live fill job at a new playback position.
    pub fn seek(&self, frame_idx: usize) {
        self.filler.seek(frame_idx);
    }

    /// Events of every frame in `range`, mapped onto the surface.
    ///
    /// One list per frame, empty where the surface was not detected; an empty
    /// result without a cache.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, timestamps, events, camera), fields(surface = %self.surface.name()))
    )]
    pub fn map_section(
        &self,
        range: Range<usize>,
        timestamps: &[f64],
        events: &dyn EventStore,
        camera: &CameraModel,
    ) -> Vec<Vec<MappedPoint>> {
        SectionReader::new(self.cache.as_ref()).map_section(range, timestamps, events, camera)
    }

    pub fn visible_count_in_section(&self, range: Range<usize>) -> usize {
        SectionReader::new(self.cache.as_ref()).visible_count(range)
    }

    /// Move one surface corner to `new_pos` (raw pixels of `frame_idx`).
    ///
    /// Stops background filling and resets the cache, resolving only
    /// `frame_idx`. The remaining frames are filled after the next
    /// `update_location`. A failed edit leaves everything unchanged.
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "debug", skip(self, markers, camera), fields(surface = %self.surface.name()))
    )]
    pub fn move_corner(
        &mut self,
        frame_idx: usize,
        corner_idx: usize,
        new_pos: Point2<f32>,
        markers: &MarkerCache,
        camera: &CameraModel,
    ) {
        let location = self.location_at(frame_idx, markers, camera);
        if let Err(err) = self
            .surface
            .move_corner(corner_idx, new_pos, camera, &location)
        {
            warn!(
                "cannot move corner {corner_idx} of surface '{}' in frame {frame_idx}: {err}",
                self.surface.name()
            );
            return;
        }

        self.drop_cache();
        if !self.bootstrap.is_defined() {
            let provisional = self.provisional_location(frame_idx, markers, camera);
            self.adopt(provisional);
            return;
        }

        let mut cache = LocationCache::unknown(markers.len());
        let state = match markers.get(frame_idx) {
            Some(MarkerEntry::Known(visible)) => {
                let state = self.surface.locate(visible, camera);
                cache.update(frame_idx, state);
                state
            }
            _ => LocationState::NotDetected,
        };
        self.cache = Some(cache);
        self.refill_pending = true;
        self.adopt(state);
    }

    /// Register marker `id` from its raw pixel vertices in `frame_idx`.
    ///
    /// The cache is dropped even when the marker cannot be registered.
    pub fn add_marker(
        &mut self,
        frame_idx: usize,
        id: u32,
        verts_px: [Point2<f32>; 4],
        markers: &MarkerCache,
        camera: &CameraModel,
    ) {
        let location = self.location_at(frame_idx, markers, camera);
        if let Err(err) = self.surface.add_marker(id, verts_px, camera, &location) {
            warn!(
                "cannot add marker {id} to surface '{}': {err}",
                self.surface.name()
            );
        }
        self.invalidate();
    }

    /// Remove marker `id` from the definition and drop the cache.
    pub fn pop_marker(&mut self, id: u32) {
        if !self.surface.pop_marker(id) {
            debug!("marker {id} not registered on '{}'", self.surface.name());
        }
        self.invalidate();
    }

    fn invalidate(&mut self) {
        self.drop_cache();
        self.notify(SurfaceChange::Invalidated);
    }

    pub fn save(&self) -> SurfaceRecord {
        SurfaceRecord {
            name: self.surface.name().to_owned(),
            registered_markers_undist: self
                .surface
                .registered_markers_undist()
                .values()
                .cloned()
                .collect(),
            registered_markers_dist: self
                .surface
                .registered_markers_dist()
                .values()
                .cloned()
                .collect(),
            build_up_status: self.bootstrap.build_up_status(),
            cache: SurfaceRecord::encode_cache(self.cache.as_ref()),
            added_in_player: Some(AddedInPlayer {
                start_idx: self.bootstrap.start_idx(),
                observations_frame_idxs: self
                    .bootstrap
                    .observations_frame_idxs()
                    .iter()
                    .copied()
                    .collect(),
            }),
        }
    }

    /// Restore a surface saved with [`save`](Self::save).
    ///
    /// Malformed cache data leaves the cache absent; it is rebuilt lazily.
    pub fn load(&mut self, record: &Value) {
        self.drop_cache();
        let record = match SurfaceRecord::from_json(record) {
            Ok(record) => record,
            Err(err) => {
                warn!(
                    "ignoring persisted state of surface '{}': {err}",
                    self.surface.name()
                );
                return;
            }
        };

        self.surface = MarkerSurface::from_registrations(
            record.name.clone(),
            self.surface.params().clone(),
            record.registry_undist(),
            record.registry_dist(),
        );
        self.bootstrap = record.bootstrapper();
        self.stalled_at = None;
        self.current = LocationState::Unknown;

        if !self.bootstrap.is_defined() {
            return;
        }
        self.cache = match record.location_cache() {
            Ok(cache) => cache,
            Err(err) => {
                warn!(
                    "discarding persisted location cache of '{}': {err}",
                    record.name
                );
                None
            }
        };
    }
}
