//! The per-session decode loop.
//!
//! One session is one playback attempt: a source is opened, frames are
//! polled one at a time, each produced frame waits on the pacing gate and
//! is then published to the presenter's slot. End of stream rewinds and
//! keeps going; only a stop request or a fatal error ends the loop, and
//! both run the same teardown before the session flags flip terminal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Sender;
use framelock_core::gate::{FrameGate, GateWait};
use framelock_core::present_slot::PresentWriter;
use framelock_core::video::{PipelineError, PlaybackState, VideoFrame};
use tracing::{debug, error, info, trace};

use crate::media::source::{FramePoll, MediaSource};

/// Cooperative playback flags shared between the player, the decode
/// thread, and the gate wait. The flags are the primary termination
/// signal; the outcome channel supplements them with the reason.
#[derive(Debug, Default)]
pub struct SessionFlags {
    playing: AtomicBool,
    pausing: AtomicBool,
    stopping: AtomicBool,
    stopped: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    pub fn set_pausing(&self, pausing: bool) {
        self.pausing.store(pausing, Ordering::Release);
    }

    pub fn is_pausing(&self) -> bool {
        self.pausing.load(Ordering::Acquire)
    }

    /// Asks the decode loop to exit at its next checkpoint.
    pub fn request_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Clears the terminal flags and marks the session live. Pause state
    /// deliberately survives a restart.
    pub fn reset_for_play(&self) {
        self.stopped.store(false, Ordering::Release);
        self.stopping.store(false, Ordering::Release);
        self.playing.store(true, Ordering::Release);
    }

    /// Both terminal flags flip together once teardown has completed.
    pub(crate) fn mark_terminal(&self) {
        self.stopped.store(true, Ordering::Release);
        self.stopping.store(true, Ordering::Release);
        self.playing.store(false, Ordering::Release);
    }

    pub(crate) fn stopping_ref(&self) -> &AtomicBool {
        &self.stopping
    }

    pub fn state(&self) -> PlaybackState {
        if self.is_stopped() {
            PlaybackState::Stopped
        } else if self.is_stopping() {
            PlaybackState::Stopping
        } else if !self.is_playing() {
            PlaybackState::Idle
        } else if self.is_pausing() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }
}

/// Why the session ended. End of stream is not an ending; the loop rewinds
/// and continues until stopped.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Stop was requested and teardown completed.
    Stopped { frames_presented: u64 },
    /// A fatal open/decode error ended the session after teardown.
    Failed(PipelineError),
}

/// Callback that asks the host to schedule a redraw; invoked from the
/// decode thread after each publish. Failures to marshal are the host's to
/// swallow.
pub type RenderRequest = Arc<dyn Fn() + Send + Sync>;

/// Everything a decode thread needs besides the source itself.
pub struct SessionConfig {
    pub gate: Arc<FrameGate>,
    pub flags: Arc<SessionFlags>,
    pub sink: PresentWriter<VideoFrame>,
    pub outcome: Sender<SessionOutcome>,
    pub render_request: Option<RenderRequest>,
}

/// Opens the source and runs the decode loop to completion. This is the
/// whole decode-thread body: teardown and terminal flagging happen here on
/// every exit path, including open failure.
pub fn run_session<F, S>(open: F, cfg: SessionConfig)
where
    F: FnOnce() -> Result<S, PipelineError>,
    S: MediaSource,
{
    let mut source = match open() {
        Ok(source) => source,
        Err(err) => {
            error!(%err, "session failed to open");
            finish_session(&cfg, SessionOutcome::Failed(err));
            return;
        }
    };

    let outcome = decode_loop(&mut source, &cfg);
    source.finish();
    finish_session(&cfg, outcome);
}

fn finish_session(cfg: &SessionConfig, outcome: SessionOutcome) {
    cfg.flags.mark_terminal();
    let _ = cfg.outcome.try_send(outcome);
    info!("session closed");
}

fn decode_loop<S: MediaSource>(source: &mut S, cfg: &SessionConfig) -> SessionOutcome {
    let info = source.info();
    info!(
        width = info.width,
        height = info.height,
        rate = info.frame_rate,
        strategy = %info.strategy,
        "session decoding"
    );

    let mut frame_number: u64 = 0;
    let mut presented: u64 = 0;

    loop {
        if cfg.flags.is_stopping() {
            debug!(presented, "stop requested");
            return SessionOutcome::Stopped {
                frames_presented: presented,
            };
        }
        if cfg.flags.is_pausing() {
            // Decoder state is kept warm; only the cadence pauses.
            thread::sleep(info.frame_interval());
            continue;
        }

        match source.poll_frame() {
            Ok(FramePoll::Frame(frame)) => {
                frame_number += 1;
                // The gate is the sole decode/render cadence sync point,
                // taken immediately before hand-off.
                match cfg.gate.wait_released(cfg.flags.stopping_ref()) {
                    GateWait::Released => {
                        cfg.sink.publish(frame);
                        presented += 1;
                        trace!(frame = frame_number, "frame published");
                        if let Some(request) = &cfg.render_request {
                            request();
                        }
                    }
                    GateWait::Interrupted => {
                        return SessionOutcome::Stopped {
                            frames_presented: presented,
                        };
                    }
                }
            }
            // No frame this iteration: neither the gate nor the hand-off
            // runs.
            Ok(FramePoll::NotReady) => continue,
            Ok(FramePoll::EndOfStream) => {
                frame_number = 0;
                match source.rewind() {
                    Ok(()) => {
                        debug!("end of stream, rewinding");
                        continue;
                    }
                    Err(err) => {
                        error!(%err, "rewind failed");
                        return SessionOutcome::Failed(err);
                    }
                }
            }
            Err(err) => {
                error!(%err, "decode failed");
                return SessionOutcome::Failed(err);
            }
        }
    }
}
