//! The decode-side seam between the session loop and whatever produces
//! frames.
//!
//! The session never talks to FFmpeg directly; it drives a [`MediaSource`],
//! which hides stream opening, packet pumping, and surface negotiation
//! behind a poll-shaped contract. [`SyntheticSource`] implements the same
//! contract from generated frames so every session behavior is exercisable
//! without codecs or devices.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framelock_core::video::{CpuFrame, PipelineError, VideoFrame};
use tracing::debug;

use crate::media::hwaccel::HwAccel;

/// Stream facts fixed at open time.
#[derive(Debug, Clone, Copy)]
pub struct SourceInfo {
    pub width: u32,
    pub height: u32,
    /// Frames per second as reported by the container.
    pub frame_rate: f64,
    /// The strategy actually in effect after any degradation.
    pub strategy: HwAccel,
}

impl SourceInfo {
    /// Wall-clock duration of one frame; used for the pause sleep.
    pub fn frame_interval(&self) -> Duration {
        let rate = if self.frame_rate.is_finite() && self.frame_rate > 0.0 {
            self.frame_rate
        } else {
            25.0
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

/// One poll of the decoder.
#[derive(Debug)]
pub enum FramePoll {
    /// A decoded frame ready for pacing and hand-off.
    Frame(VideoFrame),
    /// The decoder needs more input before it can produce output.
    NotReady,
    /// The stream ran out. The session decides whether to rewind.
    EndOfStream,
}

/// A stream of decoded frames driven from the session thread.
///
/// Implementations own their decoder state exclusively; every method runs
/// on the decode thread. `finish` must be safe to call after any error and
/// must release everything the source acquired.
pub trait MediaSource: Send {
    fn info(&self) -> SourceInfo;

    /// Advances decoding by at most one frame.
    fn poll_frame(&mut self) -> Result<FramePoll, PipelineError>;

    /// Seeks back to the start of the stream for another pass.
    fn rewind(&mut self) -> Result<(), PipelineError>;

    /// Flushes and closes the source. Idempotent.
    fn finish(&mut self);
}

impl<S: MediaSource + ?Sized> MediaSource for Box<S> {
    fn info(&self) -> SourceInfo {
        (**self).info()
    }

    fn poll_frame(&mut self) -> Result<FramePoll, PipelineError> {
        (**self).poll_frame()
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        (**self).rewind()
    }

    fn finish(&mut self) {
        (**self).finish()
    }
}

/// Counters a [`SyntheticSource`] updates from the decode thread, readable
/// from the outside while the session runs.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    rewinds: AtomicU64,
    frames: AtomicU64,
    finished: AtomicBool,
}

impl SyntheticStats {
    pub fn rewinds(&self) -> u64 {
        self.rewinds.load(Ordering::Acquire)
    }

    /// Total frames produced across all passes.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Acquire)
    }

    pub fn finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// Deterministic frame generator standing in for a real decoder.
///
/// Produces `frames_per_pass` gradient frames, then reports end of stream
/// until rewound. Optional failure injection covers the fatal-decode
/// teardown path.
pub struct SyntheticSource {
    info: SourceInfo,
    frames_per_pass: u64,
    cursor: u64,
    polls: u64,
    not_ready_every: Option<u64>,
    fail_after_frames: Option<u64>,
    stats: Arc<SyntheticStats>,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, frame_rate: f64, frames_per_pass: u64) -> Self {
        Self {
            info: SourceInfo {
                width,
                height,
                frame_rate,
                strategy: HwAccel::Software,
            },
            frames_per_pass,
            cursor: 0,
            polls: 0,
            not_ready_every: None,
            fail_after_frames: None,
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    /// Makes every `n`th poll report [`FramePoll::NotReady`], imitating a
    /// decoder that buffers input before producing output.
    pub fn with_not_ready_every(mut self, n: u64) -> Self {
        self.not_ready_every = Some(n.max(2));
        self
    }

    /// Injects a fatal decode error after `frames` total frames.
    pub fn with_failure_after(mut self, frames: u64) -> Self {
        self.fail_after_frames = Some(frames);
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }

    fn render_frame(&self, index: u64) -> CpuFrame {
        let (w, h) = (self.info.width, self.info.height);
        let mut data = vec![0u8; (w * h * 4) as usize];
        let phase = (index * 7 % 256) as u8;
        for y in 0..h {
            for x in 0..w {
                let at = ((y * w + x) * 4) as usize;
                data[at] = phase.wrapping_add((x * 255 / w.max(1)) as u8);
                data[at + 1] = (y * 255 / h.max(1)) as u8;
                data[at + 2] = phase;
                data[at + 3] = 0xff;
            }
        }
        CpuFrame::rgba(w, h, data, (w * 4) as usize)
    }
}

impl MediaSource for SyntheticSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn poll_frame(&mut self) -> Result<FramePoll, PipelineError> {
        self.polls += 1;
        if let Some(limit) = self.fail_after_frames {
            if self.stats.frames.load(Ordering::Acquire) >= limit {
                return Err(PipelineError::DecodeFailed(
                    "injected decoder failure".to_owned(),
                ));
            }
        }
        if let Some(every) = self.not_ready_every {
            if self.polls % every == 0 {
                return Ok(FramePoll::NotReady);
            }
        }
        if self.cursor >= self.frames_per_pass {
            return Ok(FramePoll::EndOfStream);
        }

        let frame = self.render_frame(self.cursor);
        self.cursor += 1;
        self.stats.frames.fetch_add(1, Ordering::AcqRel);
        Ok(FramePoll::Frame(VideoFrame::Cpu(frame)))
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        self.cursor = 0;
        self.stats.rewinds.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn finish(&mut self) {
        if !self.stats.finished.swap(true, Ordering::AcqRel) {
            debug!("synthetic source closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_one_pass(source: &mut SyntheticSource) -> u64 {
        let mut produced = 0;
        loop {
            match source.poll_frame().unwrap() {
                FramePoll::Frame(frame) => {
                    assert_eq!(frame.dimensions(), (source.info.width, source.info.height));
                    produced += 1;
                }
                FramePoll::NotReady => continue,
                FramePoll::EndOfStream => return produced,
            }
        }
    }

    #[test]
    fn one_pass_produces_the_configured_frame_count() {
        let mut source = SyntheticSource::new(64, 36, 25.0, 50);
        assert_eq!(drain_one_pass(&mut source), 50);
    }

    #[test]
    fn end_of_stream_repeats_until_rewound() {
        let mut source = SyntheticSource::new(16, 16, 25.0, 2);
        drain_one_pass(&mut source);
        assert!(matches!(
            source.poll_frame().unwrap(),
            FramePoll::EndOfStream
        ));
        source.rewind().unwrap();
        assert_eq!(drain_one_pass(&mut source), 2);
        assert_eq!(source.stats().rewinds(), 1);
    }

    #[test]
    fn not_ready_polls_do_not_consume_frames() {
        let mut source = SyntheticSource::new(16, 16, 25.0, 10).with_not_ready_every(3);
        assert_eq!(drain_one_pass(&mut source), 10);
    }

    #[test]
    fn injected_failure_is_a_decode_error() {
        let mut source = SyntheticSource::new(16, 16, 25.0, 10).with_failure_after(3);
        let mut produced = 0;
        let err = loop {
            match source.poll_frame() {
                Ok(FramePoll::Frame(_)) => produced += 1,
                Ok(_) => continue,
                Err(err) => break err,
            }
        };
        assert_eq!(produced, 3);
        assert!(matches!(err, PipelineError::DecodeFailed(_)));
        // Teardown still works after the failure.
        source.finish();
        assert!(source.stats().finished());
    }

    #[test]
    fn frame_interval_falls_back_on_nonsense_rates() {
        let info = SourceInfo {
            width: 1,
            height: 1,
            frame_rate: 0.0,
            strategy: HwAccel::Software,
        };
        assert_eq!(info.frame_interval(), Duration::from_secs_f64(1.0 / 25.0));
        let info = SourceInfo {
            frame_rate: 50.0,
            ..info
        };
        assert_eq!(info.frame_interval(), Duration::from_millis(20));
    }
}
