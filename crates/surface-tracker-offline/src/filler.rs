//! Background filling of the location cache.
//!
//! At most one job is live per filler. Workers never touch the cache: they
//! publish `(frame, location)` pairs which the owner pulls with
//! [`BackgroundFiller::drain`] and writes on its own thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;

use log::{debug, warn};
use surface_tracker_core::{LocationState, MarkerCache, SurfaceLocator};

use crate::LocationCache;

/// Frame index a running job should continue from.
///
/// Shared between the owner (writer) and the worker (reader).
#[derive(Clone, Debug, Default)]
pub struct SeekCursor(Arc<AtomicUsize>);

impl SeekCursor {
    pub fn new(idx: usize) -> Self {
        Self(Arc::new(AtomicUsize::new(idx)))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, idx: usize) {
        self.0.store(idx, Ordering::Release);
    }
}

/// Everything a worker receives when a job starts.
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// Snapshot of the marker source at job creation.
    pub markers: MarkerCache,
    pub locator: SurfaceLocator,
    /// Frames the worker must skip, one flag per frame.
    pub visited: Vec<bool>,
    pub seek: SeekCursor,
}

/// Handle to one outstanding background computation.
pub trait BackgroundJob: Send {
    /// Results produced since the last call. Never blocks.
    fn fetch(&mut self) -> Box<dyn Iterator<Item = (usize, LocationState)> + '_>;

    /// True once the worker finished and every result was fetched.
    fn completed(&self) -> bool;

    /// Stop the worker. Safe to call repeatedly.
    fn cancel(&mut self);
}

/// Creates background jobs.
pub trait JobFactory: Send {
    fn spawn(&self, request: JobRequest) -> Box<dyn BackgroundJob>;
}

/// Runs every job on its own OS thread.
#[derive(Clone, Debug)]
pub struct ThreadedJobFactory {
    thread_name: String,
}

impl ThreadedJobFactory {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            thread_name: thread_name.into(),
        }
    }
}

impl JobFactory for ThreadedJobFactory {
    fn spawn(&self, request: JobRequest) -> Box<dyn BackgroundJob> {
        Box::new(spawn_worker(&self.thread_name, request))
    }
}

fn spawn_worker(thread_name: &str, request: JobRequest) -> ThreadedJob {
    let (tx, rx) = mpsc::channel();
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancelled);

    let spawned = thread::Builder::new()
        .name(thread_name.to_owned())
        .spawn(move || fill_locations(request, &tx, &flag));
    if let Err(err) = spawned {
        // the sender was dropped with the closure, so the job reads as finished
        warn!("failed to spawn cache filler thread: {err}");
    }

    ThreadedJob {
        results: rx,
        cancelled,
        exhausted: false,
    }
}

/// Worker loop: visit every unvisited frame once, starting at the seek
/// cursor and wrapping around. A moved cursor makes the walk jump there.
fn fill_locations(
    request: JobRequest,
    tx: &Sender<(usize, LocationState)>,
    cancelled: &AtomicBool,
) {
    let JobRequest {
        markers,
        locator,
        mut visited,
        seek,
    } = request;

    let n = markers.len().min(visited.len());
    if n == 0 {
        return;
    }
    let mut remaining = visited[..n].iter().filter(|v| !**v).count();
    let mut last_seek = seek.get();
    let mut idx = last_seek % n;

    while remaining > 0 {
        if cancelled.load(Ordering::Acquire) {
            debug!("cache filler cancelled with {remaining} frames left");
            return;
        }

        let requested = seek.get();
        if requested != last_seek {
            last_seek = requested;
            idx = requested % n;
        }

        if !visited[idx] {
            visited[idx] = true;
            remaining -= 1;
            let state = markers
                .get(idx)
                .map(|entry| locator.locate(entry))
                .unwrap_or_default();
            if tx.send((idx, state)).is_err() {
                return;
            }
        }
        idx = (idx + 1) % n;
    }
}

struct ThreadedJob {
    results: Receiver<(usize, LocationState)>,
    cancelled: Arc<AtomicBool>,
    exhausted: bool,
}

struct Fetch<'a> {
    results: &'a Receiver<(usize, LocationState)>,
    exhausted: &'a mut bool,
}

impl Iterator for Fetch<'_> {
    type Item = (usize, LocationState);

    fn next(&mut self) -> Option<Self::Item> {
        match self.results.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                *self.exhausted = true;
                None
            }
        }
    }
}

impl BackgroundJob for ThreadedJob {
    fn fetch(&mut self) -> Box<dyn Iterator<Item = (usize, LocationState)> + '_> {
        Box::new(Fetch {
            results: &self.results,
            exhausted: &mut self.exhausted,
        })
    }

    fn completed(&self) -> bool {
        self.exhausted && !self.cancelled.load(Ordering::Acquire)
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl Drop for ThreadedJob {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Outcome of one [`BackgroundFiller::drain`] call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Drained {
    /// Results written into the cache.
    pub applied: usize,
    /// The job finished and its handle was released.
    pub completed: bool,
}

/// Owns the single live background job.
pub struct BackgroundFiller {
    factory: Box<dyn JobFactory>,
    job: Option<Box<dyn BackgroundJob>>,
    seek: SeekCursor,
}

impl BackgroundFiller {
    pub fn new(factory: Box<dyn JobFactory>) -> Self {
        Self {
            factory,
            job: None,
            seek: SeekCursor::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    /// Start a job, cancelling any live one first.
    pub fn start(
        &mut self,
        markers: &MarkerCache,
        locator: SurfaceLocator,
        visited: Vec<bool>,
        seek_idx: usize,
    ) {
        self.cancel();
        self.seek.set(seek_idx);
        self.job = Some(self.factory.spawn(JobRequest {
            markers: markers.clone(),
            locator,
            visited,
            seek: self.seek.clone(),
        }));
    }

    /// Ask the live job to continue from `idx`.
    pub fn seek(&self, idx: usize) {
        self.seek.set(idx);
    }

    /// Cancel and release the live job. Returns whether one was live.
    pub fn cancel(&mut self) -> bool {
        match self.job.take() {
            Some(mut job) => {
                job.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply every available result to `cache`.
    ///
    /// Writes are forced overwrites, so results may arrive in any order and
    /// may duplicate on-demand computations. A job without a cache to fill is
    /// stale and gets cancelled.
    pub fn drain(&mut self, cache: Option<&mut LocationCache>) -> Drained {
        if self.job.is_none() {
            return Drained::default();
        }
        let Some(cache) = cache else {
            debug!("cancelling cache filler without a cache");
            self.cancel();
            return Drained::default();
        };
        let Some(job) = self.job.as_mut() else {
            return Drained::default();
        };

        let mut applied = 0;
        for (idx, state) in job.fetch() {
            if state.is_resolved() && cache.update(idx, state) {
                applied += 1;
            }
        }

        let completed = job.completed();
        if completed {
            debug!("cache filler completed");
            self.job = None;
        }
        Drained { applied, completed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use surface_tracker_core::{
        CameraIntrinsics, CameraModel, MarkerEntry, MarkerSurface, SurfaceParams,
    };

    fn locator() -> SurfaceLocator {
        let camera = CameraModel::pinhole(CameraIntrinsics {
            fx: 500.0,
            fy: 500.0,
            cx: 320.0,
            cy: 240.0,
        });
        MarkerSurface::new("empty", SurfaceParams::default()).locator(&camera)
    }

    fn drain_until_complete(filler: &mut BackgroundFiller, cache: &mut LocationCache) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while filler.is_running() {
            filler.drain(Some(&mut *cache));
            assert!(Instant::now() < deadline, "filler did not complete");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn threaded_job_fills_unvisited_frames() {
        let markers: MarkerCache = (0..12)
            .map(|i| {
                if i % 4 == 3 {
                    MarkerEntry::Unknown
                } else {
                    MarkerEntry::Known(Vec::new())
                }
            })
            .collect();
        let visited: Vec<bool> = markers.iter().map(|e| !e.is_known()).collect();

        let mut filler = BackgroundFiller::new(Box::new(ThreadedJobFactory::new("test-filler")));
        let mut cache = LocationCache::unknown(markers.len());
        filler.start(&markers, locator(), visited, 5);
        drain_until_complete(&mut filler, &mut cache);

        for (idx, state) in cache.iter().enumerate() {
            if idx % 4 == 3 {
                assert_eq!(*state, LocationState::Unknown);
            } else {
                assert_eq!(*state, LocationState::NotDetected);
            }
        }
    }

    #[test]
    fn drain_without_cache_cancels_job() {
        let markers = MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); 4]);
        let mut filler = BackgroundFiller::new(Box::new(ThreadedJobFactory::new("test-filler")));
        filler.start(&markers, locator(), vec![false; 4], 0);
        assert!(filler.is_running());
        assert_eq!(filler.drain(None), Drained::default());
        assert!(!filler.is_running());
        assert!(!filler.cancel());
    }

    #[test]
    fn worker_follows_seek_cursor() {
        let markers = MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); 6]);
        let (tx, rx) = mpsc::channel();
        let seek = SeekCursor::new(4);
        fill_locations(
            JobRequest {
                markers,
                locator: locator(),
                visited: vec![false, false, true, false, false, false],
                seek,
            },
            &tx,
            &AtomicBool::new(false),
        );
        drop(tx);
        let order: Vec<usize> = rx.iter().map(|(idx, _)| idx).collect();
        assert_eq!(order, vec![4, 5, 0, 1, 3]);
    }

    #[test]
    fn cancelled_worker_stops_immediately() {
        let markers = MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); 6]);
        let (tx, rx) = mpsc::channel();
        fill_locations(
            JobRequest {
                markers,
                locator: locator(),
                visited: vec![false; 6],
                seek: SeekCursor::default(),
            },
            &tx,
            &AtomicBool::new(true),
        );
        drop(tx);
        assert_eq!(rx.iter().count(), 0);
    }

    #[test]
    fn repeated_cancel_stops_a_running_worker() {
        const FRAMES: usize = 1_000_000;
        let mut job = spawn_worker(
            "test-filler",
            JobRequest {
                markers: MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); FRAMES]),
                locator: locator(),
                visited: vec![false; FRAMES],
                seek: SeekCursor::default(),
            },
        );
        job.cancel();
        job.cancel();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut received = 0;
        while !job.exhausted {
            received += job.fetch().count();
            assert!(Instant::now() < deadline, "worker kept running");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(received < FRAMES);
        assert!(!job.completed());

        job.cancel();
        assert!(!job.completed());
    }

    #[test]
    fn dropping_a_job_cancels_it() {
        let job = spawn_worker(
            "test-filler",
            JobRequest {
                markers: MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); 8]),
                locator: locator(),
                visited: vec![false; 8],
                seek: SeekCursor::default(),
            },
        );
        let flag = Arc::clone(&job.cancelled);
        drop(job);
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn filler_cancel_releases_the_job_once() {
        let markers = MarkerCache::new(vec![MarkerEntry::Known(Vec::new()); 4]);
        let mut filler = BackgroundFiller::new(Box::new(ThreadedJobFactory::new("test-filler")));
        filler.start(&markers, locator(), vec![false; 4], 0);
        assert!(filler.cancel());
        assert!(!filler.cancel());
        assert!(!filler.is_running());
    }
}
