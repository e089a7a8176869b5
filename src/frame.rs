use crate::render::RenderSurface;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};
use url::Url;

/// How the first [`FrameController::ensure_loaded`] call finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Signalled,
    TimedOut,
    AlreadyLoaded,
}

#[derive(Debug, Default)]
struct FrameState {
    /// One-way; set when the source is assigned.
    loaded: bool,
    open: bool,
    /// Bumped on every open/close so stale transitions do nothing.
    generation: u64,
}

/// Owns the embedded sub-application frame: deferred load and open/close
/// transitions. `open` flips synchronously; animation only follows it.
pub struct FrameController {
    surface: Arc<dyn RenderSurface>,
    source: Url,
    load_timeout: Duration,
    close_fallback: Duration,
    state: Mutex<FrameState>,
    load_signal: watch::Sender<bool>,
    transition_end: Notify,
}

impl FrameController {
    pub fn new(
        surface: Arc<dyn RenderSurface>,
        source: Url,
        load_timeout: Duration,
        close_fallback: Duration,
    ) -> Self {
        Self {
            surface,
            source,
            load_timeout,
            close_fallback,
            state: Mutex::new(FrameState::default()),
            load_signal: watch::Sender::new(false),
            transition_end: Notify::new(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|s| s.open).unwrap_or(false)
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().map(|s| s.loaded).unwrap_or(false)
    }

    /// Assigns the source on first call and waits for the load signal or the
    /// fallback timeout. Later calls return immediately.
    pub async fn ensure_loaded(&self) -> LoadOutcome {
        let first = match self.state.lock() {
            Ok(mut state) if !state.loaded => {
                state.loaded = true;
                true
            }
            _ => false,
        };
        if !first {
            return LoadOutcome::AlreadyLoaded;
        }

        let mut rx = self.load_signal.subscribe();
        debug!(src = %self.source, "loading sub-application");
        self.surface.set_frame_source(&self.source);
        let signalled = async { rx.wait_for(|loaded| *loaded).await.map(|_| ()) };
        match tokio::time::timeout(self.load_timeout, signalled).await {
            Ok(Ok(())) => LoadOutcome::Signalled,
            _ => {
                warn!(
                    timeout_ms = self.load_timeout.as_millis() as u64,
                    "sub-application load signal missing; continuing"
                );
                LoadOutcome::TimedOut
            }
        }
    }

    /// The frame document fired its load event.
    pub fn notify_loaded(&self) {
        self.load_signal.send_replace(true);
    }

    /// The frame's open/close transition finished.
    pub fn notify_transition_end(&self) {
        self.transition_end.notify_waiters();
    }

    /// Synchronous half of opening: mark open and put the frame in layout.
    pub fn begin_open(&self) -> u64 {
        let generation = match self.state.lock() {
            Ok(mut state) => {
                state.open = true;
                state.generation += 1;
                state.generation
            }
            Err(_) => 0,
        };
        self.surface.set_frame_displayed(true);
        generation
    }

    /// Loads if needed, then reveals unless closed in the meantime.
    pub async fn finish_open(&self, generation: u64) {
        self.ensure_loaded().await;
        if self.is_current(generation, true) {
            self.surface.set_frame_revealed(true);
        }
    }

    pub async fn open(&self) {
        let generation = self.begin_open();
        self.finish_open(generation).await;
    }

    /// Synchronous half of closing: mark closed and start the transition out.
    pub fn begin_close(&self) -> u64 {
        let generation = match self.state.lock() {
            Ok(mut state) => {
                state.open = false;
                state.generation += 1;
                state.generation
            }
            Err(_) => 0,
        };
        self.surface.set_frame_revealed(false);
        generation
    }

    /// Removes the frame from layout after the transition ends, or after the
    /// fallback delay if no end signal arrives.
    pub async fn finish_close(&self, generation: u64) {
        let ended = self.transition_end.notified();
        tokio::select! {
            _ = ended => {}
            _ = tokio::time::sleep(self.close_fallback) => {
                debug!("close transition end not observed; using fallback");
            }
        }
        if self.is_current(generation, false) {
            self.surface.set_frame_displayed(false);
        }
    }

    pub async fn close(&self) {
        let generation = self.begin_close();
        self.finish_close(generation).await;
    }

    /// Hides the frame outright, e.g. when the launcher is suppressed.
    pub fn suppress(&self) {
        self.surface.set_frame_displayed(false);
    }

    fn is_current(&self, generation: u64, open: bool) -> bool {
        self.state
            .lock()
            .map(|s| s.generation == generation && s.open == open)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::HeadlessSurface;

    fn controller() -> (Arc<FrameController>, Arc<HeadlessSurface>) {
        let surface = Arc::new(HeadlessSurface::new());
        let frame = Arc::new(FrameController::new(
            surface.clone(),
            Url::parse("https://widgets.example/chat.html?empresa=acme&hideLocation=1").unwrap(),
            Duration::from_secs(5),
            Duration::from_millis(300),
        ));
        (frame, surface)
    }

    #[tokio::test(start_paused = true)]
    async fn load_times_out_after_five_seconds() {
        let (frame, surface) = controller();
        let started = tokio::time::Instant::now();
        assert_eq!(frame.ensure_loaded().await, LoadOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(frame.ensure_loaded().await, LoadOutcome::AlreadyLoaded);
        assert_eq!(surface.snapshot().frame_source_sets, 1);
        assert!(frame.is_loaded());
    }

    #[tokio::test(start_paused = true)]
    async fn load_signal_resolves_early() {
        let (frame, _) = controller();
        let waiter = {
            let frame = frame.clone();
            tokio::spawn(async move { frame.ensure_loaded().await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        frame.notify_loaded();
        assert_eq!(waiter.await.unwrap(), LoadOutcome::Signalled);
    }

    #[tokio::test(start_paused = true)]
    async fn open_reveals_and_close_removes_after_fallback() {
        let (frame, surface) = controller();
        frame.notify_loaded();
        frame.open().await;
        let snap = surface.snapshot();
        assert!(frame.is_open());
        assert!(snap.frame_displayed && snap.frame_revealed);

        let generation = frame.begin_close();
        assert!(!frame.is_open());
        let snap = surface.snapshot();
        assert!(snap.frame_displayed && !snap.frame_revealed);

        frame.finish_close(generation).await;
        assert!(!surface.snapshot().frame_displayed);
    }

    #[tokio::test(start_paused = true)]
    async fn transition_end_short_circuits_fallback() {
        let (frame, surface) = controller();
        frame.notify_loaded();
        frame.open().await;
        let generation = frame.begin_close();
        let closing = {
            let frame = frame.clone();
            tokio::spawn(async move { frame.finish_close(generation).await })
        };
        tokio::task::yield_now().await;
        let started = tokio::time::Instant::now();
        frame.notify_transition_end();
        closing.await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!surface.snapshot().frame_displayed);
    }

    #[tokio::test(start_paused = true)]
    async fn reopen_during_close_keeps_frame_in_layout() {
        let (frame, surface) = controller();
        frame.notify_loaded();
        frame.open().await;
        let generation = frame.begin_close();
        frame.open().await;
        frame.finish_close(generation).await;
        let snap = surface.snapshot();
        assert!(snap.frame_displayed && snap.frame_revealed);
        assert!(frame.is_open());
    }
}
