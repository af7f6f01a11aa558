//! Player-level playback scenarios.
//!
//! These tests drive a [`framelock::Player`] against synthetic sources and
//! private pacing gates, so they need no codec libraries and no GPU. The
//! scenarios cover the full session lifecycle: paced presentation counts,
//! end-of-stream looping, stop/teardown, pause/resume, source switching,
//! and failure reporting.
//!
//! ```bash
//! cargo test --package framelock --test playback_test
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use framelock::media::{MediaSource, SyntheticSource, SyntheticStats};
use framelock::{FrameGate, PipelineError, PlaybackState, Player, SessionOutcome, SourceFactory};
use parking_lot::Mutex;

/// Counters shared with a factory: how often it ran and the stats handle of
/// the most recently opened source.
struct FactoryProbe {
    opens: AtomicU64,
    stats: Mutex<Option<Arc<SyntheticStats>>>,
}

impl FactoryProbe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            opens: AtomicU64::new(0),
            stats: Mutex::new(None),
        })
    }

    fn opens(&self) -> u64 {
        self.opens.load(Ordering::Acquire)
    }

    fn stats(&self) -> Option<Arc<SyntheticStats>> {
        self.stats.lock().clone()
    }
}

fn probed_factory(
    probe: &Arc<FactoryProbe>,
    build: impl Fn() -> SyntheticSource + Send + Sync + 'static,
) -> SourceFactory {
    let probe = Arc::clone(probe);
    Arc::new(move || {
        let source = build();
        probe.opens.fetch_add(1, Ordering::AcqRel);
        *probe.stats.lock() = Some(source.stats());
        Ok(Box::new(source) as Box<dyn MediaSource>)
    })
}

fn fast_gate() -> Arc<FrameGate> {
    let gate = FrameGate::new(Duration::from_millis(1));
    gate.start();
    gate
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}

/// One full pass of a 50-frame stream at a 25 fps cadence presents exactly
/// 50 frames: one per tick, no more, no fewer.
#[test]
fn one_pass_presents_exactly_the_frame_count() {
    // An interval the test will never reach; every tick is driven by hand.
    let gate = FrameGate::new(Duration::from_secs(3600));
    gate.start();

    let probe = FactoryProbe::new();
    let factory = probed_factory(&probe, || SyntheticSource::new(16, 16, 25.0, 50));
    let mut player = Player::with_gate(factory, Arc::clone(&gate));
    let frames = player.take_frames().unwrap();

    let presented = Arc::new(AtomicU64::new(0));
    player.set_render_request({
        let presented = Arc::clone(&presented);
        Arc::new(move || {
            presented.fetch_add(1, Ordering::AcqRel);
        })
    });

    player.play();
    assert!(wait_until(Duration::from_secs(2), || probe.stats().is_some()));
    let stats = probe.stats().unwrap();

    for release in 1..=50u64 {
        gate.tick();
        assert!(
            wait_until(Duration::from_secs(2), || {
                presented.load(Ordering::Acquire) >= release
            }),
            "tick {release} did not release a frame"
        );
    }

    // The 50th hand-off is followed by end of stream and a rewind; decoding
    // continues into the next pass without another presentation.
    assert!(wait_until(Duration::from_secs(2), || stats.rewinds() >= 1));
    assert_eq!(
        presented.load(Ordering::Acquire),
        50,
        "one pass must present exactly one frame per tick"
    );
    assert_eq!(player.state(), PlaybackState::Playing);

    // The presenter side sees the freshest frame of the pass.
    let newest = frames.take().expect("a frame was published");
    assert_eq!(newest.dimensions(), (16, 16));

    // One more tick carries the loop into the second pass.
    gate.tick();
    assert!(wait_until(Duration::from_secs(2), || {
        presented.load(Ordering::Acquire) == 51
    }));

    player.stop();
    gate.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
}

/// End of stream rewinds and keeps decoding; the session never ends by
/// itself.
#[test]
fn end_of_stream_loops_until_stopped() {
    let gate = fast_gate();
    let probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&probe, || SyntheticSource::new(16, 16, 1000.0, 4)),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || probe.stats().is_some()));
    let stats = probe.stats().unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || stats.rewinds() >= 3),
        "expected three rewinds, saw {}",
        stats.rewinds()
    );
    assert_ne!(player.state(), PlaybackState::Stopped);

    player.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
    gate.stop();
}

/// Stop is fire-and-forget but reaches a full teardown in bounded time:
/// terminal flags set, source closed, outcome delivered.
#[test]
fn stop_tears_down_and_reports_the_outcome() {
    let gate = fast_gate();
    let probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&probe, || SyntheticSource::new(16, 16, 1000.0, 100)),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        probe.stats().is_some_and(|stats| stats.frames() > 0)
    }));

    player.stop();
    // Stopping is observable only until the loop wins the race to exit.
    assert!(matches!(
        player.state(),
        PlaybackState::Stopping | PlaybackState::Stopped
    ));
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));

    let stats = probe.stats().unwrap();
    assert!(stats.finished(), "source must be closed after stop");
    assert!(matches!(
        player.take_outcome(),
        Some(SessionOutcome::Stopped { .. })
    ));
    gate.stop();
}

/// A fatal decode error runs the same teardown as a stop and reports the
/// failure.
#[test]
fn decode_failure_tears_down_and_reports_failed() {
    let gate = fast_gate();
    let probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&probe, || {
            SyntheticSource::new(16, 16, 1000.0, 100).with_failure_after(3)
        }),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));

    let stats = probe.stats().unwrap();
    assert!(stats.finished(), "teardown must run on the failure path");
    assert!(matches!(
        player.take_outcome(),
        Some(SessionOutcome::Failed(PipelineError::DecodeFailed(_)))
    ));
    gate.stop();
}

/// Pausing twice returns to the original cadence without reopening the
/// source.
#[test]
fn pause_toggle_twice_resumes_without_reopening() {
    let gate = fast_gate();
    let probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&probe, || SyntheticSource::new(16, 16, 1000.0, 1_000)),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        probe.stats().is_some_and(|stats| stats.frames() > 2)
    }));
    let stats = probe.stats().unwrap();

    player.pause();
    assert_eq!(player.state(), PlaybackState::Paused);
    thread::sleep(Duration::from_millis(20));
    let frozen = stats.frames();
    thread::sleep(Duration::from_millis(50));
    // One in-flight frame may still land after the flag flips.
    assert!(stats.frames() <= frozen + 1, "decoding continued while paused");

    player.pause();
    assert_eq!(player.state(), PlaybackState::Playing);
    let resumed_from = stats.frames();
    assert!(wait_until(Duration::from_secs(2), || {
        stats.frames() > resumed_from
    }));

    assert_eq!(probe.opens(), 1, "pause must not reopen the source");
    player.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
    gate.stop();
}

/// Switching sources while playing stops and joins the old session, then
/// starts a fresh one on the new source.
#[test]
fn set_source_restarts_on_the_new_source() {
    let gate = fast_gate();
    let old_probe = FactoryProbe::new();
    let new_probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&old_probe, || SyntheticSource::new(16, 16, 1000.0, 100)),
        Arc::clone(&gate),
    );
    let frames = player.take_frames().unwrap();

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        old_probe.stats().is_some_and(|stats| stats.frames() > 0)
    }));

    player.set_source(probed_factory(&new_probe, || {
        SyntheticSource::new(32, 32, 1000.0, 100)
    }));

    let old_stats = old_probe.stats().unwrap();
    assert!(old_stats.finished(), "old source must be closed first");
    assert!(player.state().is_active());
    assert!(wait_until(Duration::from_secs(2), || {
        new_probe.stats().is_some_and(|stats| stats.frames() > 0)
    }));
    assert_eq!(old_probe.opens(), 1);
    assert_eq!(new_probe.opens(), 1);

    // The same reader now sees the new source's frames.
    assert!(wait_until(Duration::from_secs(2), || {
        frames
            .take()
            .is_some_and(|frame| frame.dimensions() == (32, 32))
    }));

    player.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
    gate.stop();
}

/// Play after a stop discards the finished thread and opens the source
/// anew.
#[test]
fn restart_after_stop_spawns_a_fresh_session() {
    let gate = fast_gate();
    let probe = FactoryProbe::new();
    let mut player = Player::with_gate(
        probed_factory(&probe, || SyntheticSource::new(16, 16, 1000.0, 100)),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        probe.stats().is_some_and(|stats| stats.frames() > 0)
    }));
    player.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));

    player.play();
    assert_eq!(player.state(), PlaybackState::Playing);
    assert!(wait_until(Duration::from_secs(2), || probe.opens() == 2));
    assert!(wait_until(Duration::from_secs(2), || {
        probe.stats().is_some_and(|stats| stats.frames() > 0)
    }));

    player.stop();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
    gate.stop();
}

/// An open failure ends the session terminal with a `Failed` outcome.
#[test]
fn failed_open_reports_failed_outcome() {
    let gate = fast_gate();
    let mut player = Player::with_gate(
        Arc::new(|| Err(PipelineError::OpenFailed("no such uri".to_owned()))),
        Arc::clone(&gate),
    );

    player.play();
    assert!(wait_until(Duration::from_secs(2), || {
        player.state() == PlaybackState::Stopped
    }));
    assert!(matches!(
        player.take_outcome(),
        Some(SessionOutcome::Failed(PipelineError::OpenFailed(_)))
    ));
    gate.stop();
}
