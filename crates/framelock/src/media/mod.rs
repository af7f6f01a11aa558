//! Media side of the pipeline: stream opening, hardware negotiation, and
//! the paced decode session.
//!
//! - [`hwaccel`] - decode strategies and output-surface negotiation
//! - [`source`] - the [`MediaSource`] trait plus the synthetic test source
//! - [`session`] - the decode loop driving one source until stopped
//! - [`ffmpeg`] - FFmpeg-backed source (feature `ffmpeg`)
//! - [`runtime`] - process-wide FFmpeg runtime setup (feature `ffmpeg`)
//! - `d3d11` - shareable transfer texture (Windows with feature `d3d11`)

pub mod hwaccel;
pub mod session;
pub mod source;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ffmpeg")]
pub mod runtime;

#[cfg(all(windows, feature = "d3d11"))]
pub(crate) mod d3d11;

pub use hwaccel::{HwAccel, SurfaceFormat};
pub use session::{run_session, RenderRequest, SessionConfig, SessionFlags, SessionOutcome};
pub use source::{FramePoll, MediaSource, SourceInfo, SyntheticSource, SyntheticStats};

#[cfg(feature = "ffmpeg")]
pub use ffmpeg::FfmpegSource;
