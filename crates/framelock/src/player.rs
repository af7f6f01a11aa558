//! Top-level playback handle.
//!
//! A [`Player`] owns one decode thread at a time and the flags it runs
//! under. Restart never resumes an old thread: a finished thread is
//! joined and discarded, and a fresh session is spawned against the same
//! present slot, so the presenter keeps its reader across source changes.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver};
use tracing::{debug, warn};

use framelock_core::gate::FrameGate;
use framelock_core::present_slot::{present_slot, PresentReader, PresentWriter};
use framelock_core::video::{PipelineError, PlaybackState, VideoFrame};

#[cfg(feature = "ffmpeg")]
use crate::media::{FfmpegSource, HwAccel};
use crate::media::{
    run_session, MediaSource, RenderRequest, SessionConfig, SessionFlags, SessionOutcome,
};

/// Builds a fresh source for each session. Called on the decode thread;
/// every `play` after a stop opens anew rather than resuming.
pub type SourceFactory =
    Arc<dyn Fn() -> Result<Box<dyn MediaSource>, PipelineError> + Send + Sync>;

/// Playback state machine over one decode session at a time.
pub struct Player {
    /// Opens the current source; replaced by `set_source`.
    factory: SourceFactory,
    /// Flags shared with the live decode thread, if any.
    flags: Arc<SessionFlags>,
    /// Pacing gate every session of this player waits on.
    gate: Arc<FrameGate>,
    /// Producer side of the present slot; each session gets a clone.
    sink: PresentWriter<VideoFrame>,
    /// Consumer side, handed to the presenter once.
    frames: Option<PresentReader<VideoFrame>>,
    /// Redraw callback forwarded into each session.
    render_request: Option<RenderRequest>,
    /// The decode thread of the current or most recent session.
    worker: Option<JoinHandle<()>>,
    /// Ending report of the current or most recent session.
    outcome: Option<Receiver<SessionOutcome>>,
}

impl Player {
    /// Creates an idle player paced by the process-wide gate.
    pub fn new(factory: SourceFactory) -> Self {
        Self::with_gate(factory, FrameGate::global())
    }

    /// Creates an idle player paced by a caller-owned gate.
    pub fn with_gate(factory: SourceFactory, gate: Arc<FrameGate>) -> Self {
        let (sink, frames) = present_slot();
        Self {
            factory,
            flags: Arc::new(SessionFlags::new()),
            gate,
            sink,
            frames: Some(frames),
            render_request: None,
            worker: None,
            outcome: None,
        }
    }

    /// Creates a player that opens `uri` with the given decode strategy.
    #[cfg(feature = "ffmpeg")]
    pub fn from_uri(uri: impl Into<String>, strategy: HwAccel) -> Self {
        let uri = uri.into();
        Self::new(Arc::new(move || {
            FfmpegSource::open(&uri, strategy)
                .map(|source| Box::new(source) as Box<dyn MediaSource>)
        }))
    }

    /// Sets the callback the decode thread uses to request redraws. Takes
    /// effect from the next `play`.
    pub fn set_render_request(&mut self, request: RenderRequest) {
        self.render_request = Some(request);
    }

    /// The frame reader for the presenter. Yields once; the reader stays
    /// valid across every session this player runs.
    pub fn take_frames(&mut self) -> Option<PresentReader<VideoFrame>> {
        self.frames.take()
    }

    /// The gate pacing this player's sessions.
    pub fn gate(&self) -> &Arc<FrameGate> {
        &self.gate
    }

    /// Starts playback. With a live decode thread this only resets the
    /// flags, which also cancels a stop that has not won yet; otherwise
    /// any finished thread is discarded and a new session is spawned.
    pub fn play(&mut self) {
        if let Some(worker) = &self.worker {
            if !worker.is_finished() {
                self.flags.reset_for_play();
                debug!("play on a live session");
                return;
            }
        }
        if let Some(finished) = self.worker.take() {
            let _ = finished.join();
        }

        self.flags.reset_for_play();
        let (tx, rx) = bounded(1);
        self.outcome = Some(rx);
        let cfg = SessionConfig {
            gate: Arc::clone(&self.gate),
            flags: Arc::clone(&self.flags),
            sink: self.sink.clone(),
            outcome: tx,
            render_request: self.render_request.clone(),
        };
        let factory = Arc::clone(&self.factory);
        match thread::Builder::new()
            .name("video-decode".into())
            .spawn(move || run_session(move || factory(), cfg))
        {
            Ok(handle) => self.worker = Some(handle),
            Err(err) => {
                warn!(%err, "failed to spawn decode thread");
                self.flags.mark_terminal();
            }
        }
    }

    /// Toggles the pause flag. The decode thread stays alive and observes
    /// the flag once per iteration.
    pub fn pause(&self) {
        self.flags.set_pausing(!self.flags.is_pausing());
    }

    /// Requests a stop and returns without waiting for the decode thread
    /// to exit. No-op unless a session is live.
    pub fn stop(&self) {
        if self.flags.is_playing() {
            self.flags.request_stop();
        }
    }

    /// Replaces the source. A live session is stopped and joined first;
    /// playback then starts on the new source.
    pub fn set_source(&mut self, factory: SourceFactory) {
        self.factory = factory;
        self.stop_and_join();
        self.play();
    }

    /// Current state, derived from the session flags.
    pub fn state(&self) -> PlaybackState {
        self.flags.state()
    }

    pub fn is_playing(&self) -> bool {
        self.state() == PlaybackState::Playing
    }

    /// How the most recent session ended, if it has reported yet. Each
    /// ending is delivered once.
    pub fn take_outcome(&mut self) -> Option<SessionOutcome> {
        self.outcome.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    fn stop_and_join(&mut self) {
        self.flags.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
