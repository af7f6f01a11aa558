//! framelock: Paced video decode and presentation over wgpu.
//!
//! This crate runs one decode thread per playback session, paces every
//! produced frame on a process-wide gate, and hands the freshest frame to
//! a wgpu presenter. Hardware decoding degrades to software automatically;
//! on Windows the decoded surface can cross to the render device through a
//! shared NT handle without a CPU round trip.
//!
//! # Example
//!
//! ```ignore
//! use framelock::{HwAccel, Player};
//!
//! let mut player = Player::from_uri("demo.mp4", HwAccel::D3d11va);
//! let frames = player.take_frames().unwrap();
//! // Hand `frames` to a render::Presenter, then:
//! player.play();
//! ```
//!
//! # Feature Flags
//!
//! - `ffmpeg`: FFmpeg-backed sources ([`media::FfmpegSource`]); without it
//!   only synthetic sources are available
//! - `d3d11`: D3D11VA shared-surface hand-off on Windows (implies `ffmpeg`)

pub mod media;
pub mod player;
pub mod render;

// Re-export the foundation types so hosts depend on one crate.
pub use framelock_core::gate::{FrameGate, GateWait, DEFAULT_CADENCE_HZ};
pub use framelock_core::present_slot::{present_slot, PresentReader, PresentWriter};
pub use framelock_core::timer::DriftTimer;
pub use framelock_core::video::{
    CpuFrame, PipelineError, PixelFormat, Plane, PlaybackState, SharedTexture, VideoFrame,
};

pub use media::{
    FramePoll, HwAccel, MediaSource, SessionFlags, SessionOutcome, SourceInfo, SurfaceFormat,
    SyntheticSource,
};
pub use player::{Player, SourceFactory};
pub use render::Presenter;

#[cfg(feature = "ffmpeg")]
pub use media::FfmpegSource;
