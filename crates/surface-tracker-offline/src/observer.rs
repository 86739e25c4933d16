/// Transition of a surface's cache validity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SurfaceChange {
    /// The bootstrap scan closed its loop; the definition is final.
    Defined,
    /// The bootstrap scan hit a frame without marker data; provisional
    /// results were dropped.
    ProvisionalDiscarded,
    /// The registered marker set changed; the cache was dropped.
    Invalidated,
    /// A background fill job finished. Frames whose markers were still
    /// pending when it started may remain unresolved.
    FillJobFinished,
}

/// Receives cache validity changes, on the thread driving the controller.
pub trait SurfaceObserver: Send {
    fn on_surface_change(&mut self, surface: &str, change: SurfaceChange);
}

impl<F> SurfaceObserver for F
where
    F: FnMut(&str, SurfaceChange) + Send,
{
    fn on_surface_change(&mut self, surface: &str, change: SurfaceChange) {
        self(surface, change)
    }
}
