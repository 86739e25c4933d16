#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use nalgebra::Point2;
use parking_lot::Mutex;
use surface_tracker_core::{
    init_with_level, CameraIntrinsics, CameraModel, Distortion, LocationState, Marker,
    MarkerCache, MarkerEntry, SurfaceParams,
};
use surface_tracker_offline::{
    BackgroundJob, JobFactory, JobRequest, SurfaceChange, SurfaceLocationController,
};

pub fn init_logging() {
    let _ = init_with_level(log::LevelFilter::Debug);
}

pub fn camera() -> CameraModel {
    CameraModel {
        intrinsics: CameraIntrinsics {
            fx: 800.0,
            fy: 800.0,
            cx: 640.0,
            cy: 360.0,
        },
        distortion: Distortion {
            k1: -0.04,
            k2: 0.01,
            ..Distortion::default()
        },
    }
}

/// Marker origins on a 200x150 board, 30 units per marker side.
const MARKER_ORIGINS: [(u32, f32, f32); 4] = [
    (11, 0.0, 0.0),
    (12, 170.0, 0.0),
    (13, 170.0, 120.0),
    (14, 0.0, 120.0),
];

/// Board point seen in undistorted pixels at 1.5 px/unit, offset by `shift`.
pub fn board_to_undist(x: f32, y: f32, shift: f32) -> Point2<f32> {
    Point2::new(400.0 + shift + 1.5 * x, 200.0 + 1.5 * y)
}

/// All four board markers, in raw pixels.
pub fn board_frame(shift: f32) -> MarkerEntry {
    let cam = camera();
    let markers = MARKER_ORIGINS
        .iter()
        .map(|&(id, ox, oy)| {
            let corner = |x: f32, y: f32| {
                cam.distort(board_to_undist(x, y, shift))
                    .expect("distort")
            };
            Marker::new(
                id,
                [
                    corner(ox, oy),
                    corner(ox + 30.0, oy),
                    corner(ox + 30.0, oy + 30.0),
                    corner(ox, oy + 30.0),
                ],
            )
        })
        .collect();
    MarkerEntry::Known(markers)
}

/// A recording of `len` frames where the board drifts slowly to the right.
pub fn recording(len: usize) -> MarkerCache {
    (0..len).map(|i| board_frame(i as f32 * 2.0)).collect()
}

/// Raw pixel vertices of a square at board position `(x, y)`.
pub fn board_square_px(x: f32, y: f32, size: f32, shift: f32) -> [Point2<f32>; 4] {
    let cam = camera();
    [(x, y), (x + size, y), (x + size, y + size), (x, y + size)].map(|(bx, by)| {
        cam.distort(board_to_undist(bx, by, shift))
            .expect("distort")
    })
}

/// State of one job handed out by [`ScriptedFactory`].
#[derive(Debug)]
pub struct JobScript {
    pub request: JobRequest,
    pub queue: Vec<(usize, LocationState)>,
    pub finished: bool,
    pub cancelled: bool,
    pub released: bool,
}

/// Deterministic job factory; tests decide what each job produces.
///
/// An eager factory computes every unvisited frame at spawn time and marks
/// the job finished.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    eager: bool,
    jobs: Arc<Mutex<Vec<JobScript>>>,
}

impl ScriptedFactory {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn eager() -> Self {
        Self {
            eager: true,
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Jobs neither cancelled nor released by their owner.
    pub fn live(&self) -> usize {
        self.jobs
            .lock()
            .iter()
            .filter(|j| !j.cancelled && !j.released)
            .count()
    }

    pub fn cancelled(&self) -> usize {
        self.jobs.lock().iter().filter(|j| j.cancelled).count()
    }

    pub fn last_request(&self) -> Option<JobRequest> {
        self.jobs.lock().last().map(|j| j.request.clone())
    }

    /// Queue a result on the newest job.
    pub fn push(&self, idx: usize, state: LocationState) {
        if let Some(job) = self.jobs.lock().last_mut() {
            job.queue.push((idx, state));
        }
    }

    /// Let the newest job compute all its frames and finish.
    pub fn run_to_end(&self) {
        if let Some(job) = self.jobs.lock().last_mut() {
            let results = compute_all(&job.request);
            job.queue.extend(results);
            job.finished = true;
        }
    }
}

fn compute_all(request: &JobRequest) -> Vec<(usize, LocationState)> {
    let n = request.markers.len();
    if n == 0 {
        return Vec::new();
    }
    let start = request.seek.get() % n;
    (0..n)
        .map(|k| (start + k) % n)
        .filter(|&idx| !request.visited[idx])
        .filter_map(|idx| {
            let entry = request.markers.get(idx)?;
            Some((idx, request.locator.locate(entry)))
        })
        .collect()
}

impl JobFactory for ScriptedFactory {
    fn spawn(&self, request: JobRequest) -> Box<dyn BackgroundJob> {
        let mut script = JobScript {
            request,
            queue: Vec::new(),
            finished: false,
            cancelled: false,
            released: false,
        };
        if self.eager {
            script.queue = compute_all(&script.request);
            script.finished = true;
        }
        let mut jobs = self.jobs.lock();
        jobs.push(script);
        Box::new(ScriptedJob {
            jobs: Arc::clone(&self.jobs),
            id: jobs.len() - 1,
        })
    }
}

struct ScriptedJob {
    jobs: Arc<Mutex<Vec<JobScript>>>,
    id: usize,
}

impl BackgroundJob for ScriptedJob {
    fn fetch(&mut self) -> Box<dyn Iterator<Item = (usize, LocationState)> + '_> {
        let mut jobs = self.jobs.lock();
        let script = &mut jobs[self.id];
        let results = if script.cancelled {
            Vec::new()
        } else {
            std::mem::take(&mut script.queue)
        };
        Box::new(results.into_iter())
    }

    fn completed(&self) -> bool {
        let jobs = self.jobs.lock();
        let script = &jobs[self.id];
        script.finished && script.queue.is_empty() && !script.cancelled
    }

    fn cancel(&mut self) {
        self.jobs.lock()[self.id].cancelled = true;
    }
}

impl Drop for ScriptedJob {
    fn drop(&mut self) {
        self.jobs.lock()[self.id].released = true;
    }
}

/// Controller backed by `factory`, recording every change notification.
pub fn scripted_controller(
    factory: &ScriptedFactory,
) -> (SurfaceLocationController, Arc<Mutex<Vec<SurfaceChange>>>) {
    init_logging();
    let mut ctl = SurfaceLocationController::with_job_factory(
        "board",
        SurfaceParams::default(),
        Box::new(factory.clone()),
    );
    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    ctl.subscribe(move |_: &str, change: SurfaceChange| sink.lock().push(change));
    (ctl, changes)
}

/// Keep visiting `frame_idx` until the live fill job is gone.
pub fn settle(
    ctl: &mut SurfaceLocationController,
    frame_idx: usize,
    markers: &MarkerCache,
    camera: &CameraModel,
) {
    let deadline = Instant::now() + Duration::from_secs(20);
    ctl.update_location(frame_idx, markers, camera);
    while ctl.has_live_job() {
        assert!(Instant::now() < deadline, "fill job did not finish");
        std::thread::sleep(Duration::from_millis(2));
        ctl.update_location(frame_idx, markers, camera);
    }
}
