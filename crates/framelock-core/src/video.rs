//! Core types for the decode-pace-present pipeline.
//!
//! This module defines the frame, surface, state and error types shared by
//! the decode loop, the pacing gate and the presenter. It has no codec or
//! GPU dependencies; the heavy halves of the pipeline live in `framelock`.

use std::any::Any;
use std::sync::Arc;

/// Pixel layout of a decoded or converted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 planar, three planes
    Yuv420p,
    /// Y plane + interleaved UV plane (hardware decoder output)
    Nv12,
    /// Packed RGBA, one plane (software presentation path)
    Rgba,
}

impl PixelFormat {
    /// Number of planes carried by a CPU frame of this format.
    pub fn num_planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Rgba => 1,
        }
    }

    /// Returns true for formats the fragment shader must convert to RGB.
    pub fn is_yuv(&self) -> bool {
        matches!(self, PixelFormat::Yuv420p | PixelFormat::Nv12)
    }
}

/// A single plane of pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    /// Raw pixel bytes
    pub data: Vec<u8>,
    /// Bytes per row, may include padding
    pub stride: usize,
}

/// A frame with CPU-accessible pixel data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuFrame {
    /// Pixel format of the planes below
    pub format: PixelFormat,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// One entry per plane, ordered as the format defines
    pub planes: Vec<Plane>,
}

impl CpuFrame {
    /// Creates a frame from pre-filled planes.
    pub fn new(format: PixelFormat, width: u32, height: u32, planes: Vec<Plane>) -> Self {
        Self {
            format,
            width,
            height,
            planes,
        }
    }

    /// Creates a packed RGBA frame from a single buffer.
    pub fn rgba(width: u32, height: u32, data: Vec<u8>, stride: usize) -> Self {
        Self::new(PixelFormat::Rgba, width, height, vec![Plane { data, stride }])
    }

    /// Returns the plane at `index`, if the format has that many.
    pub fn plane(&self, index: usize) -> Option<&Plane> {
        self.planes.get(index)
    }
}

/// Descriptor of a GPU surface that crosses from the decode-owning device to
/// the render-owning device.
///
/// The surface itself stays on the GPU; only the shareable handle value
/// travels. The render side opens the handle once per session and keeps
/// presenting through it while the decode side overwrites the surface
/// contents each frame. `owner` keeps the decode-side texture object alive
/// for as long as any clone of this descriptor exists.
#[derive(Clone)]
pub struct SharedTexture {
    /// OS shareable handle value (NT handle on Windows), stored as a plain
    /// integer so this type carries no platform dependency
    pub handle: isize,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Format of the underlying surface
    pub format: PixelFormat,
    /// Keep-alive for the decode-side texture backing the handle
    owner: Arc<dyn Any + Send + Sync>,
}

impl SharedTexture {
    /// Wraps a shareable handle.
    ///
    /// `owner` must be the object that owns the underlying surface; the
    /// handle value is only meaningful while that object is alive.
    pub fn new(
        handle: isize,
        width: u32,
        height: u32,
        format: PixelFormat,
        owner: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            handle,
            width,
            height,
            format,
            owner,
        }
    }

    /// The keep-alive object backing this handle.
    pub fn owner(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.owner
    }
}

impl std::fmt::Debug for SharedTexture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedTexture")
            .field("handle", &self.handle)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .finish()
    }
}

/// One presentable frame, on either delivery path.
#[derive(Debug, Clone)]
pub enum VideoFrame {
    /// Packed pixels to upload on the presentation thread
    Cpu(CpuFrame),
    /// Surface already resident on the GPU, reachable via a shared handle
    Gpu(SharedTexture),
}

impl VideoFrame {
    /// Frame dimensions in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            VideoFrame::Cpu(frame) => (frame.width, frame.height),
            VideoFrame::Gpu(surface) => (surface.width, surface.height),
        }
    }

    /// Pixel format of the payload.
    pub fn format(&self) -> PixelFormat {
        match self {
            VideoFrame::Cpu(frame) => frame.format,
            VideoFrame::Gpu(surface) => surface.format,
        }
    }

    /// Returns the CPU payload, if this frame has one.
    pub fn as_cpu(&self) -> Option<&CpuFrame> {
        match self {
            VideoFrame::Cpu(frame) => Some(frame),
            VideoFrame::Gpu(_) => None,
        }
    }

    /// Returns true when the frame lives on the GPU.
    pub fn is_gpu(&self) -> bool {
        matches!(self, VideoFrame::Gpu(_))
    }
}

/// Observable playback state, derived from the session flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// No decode thread has run yet
    Idle,
    /// Decode thread live, frames flowing
    Playing,
    /// Decode thread live, decode suspended
    Paused,
    /// Stop requested, decode thread still winding down
    Stopping,
    /// Decode thread exited, teardown complete
    Stopped,
}

impl PlaybackState {
    /// Returns true while the decode thread is alive.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            PlaybackState::Playing | PlaybackState::Paused | PlaybackState::Stopping
        )
    }
}

/// Errors raised along the pipeline.
///
/// Open-phase variants (`OpenFailed`, `NoVideoStream`, `UnsupportedCodec`)
/// abort a session before decoding starts. `HardwareInit` is recoverable:
/// the session degrades to the software strategy instead of dying.
/// `DecodeFailed`/`SeekFailed` abort the session after full teardown.
/// Retryable decoder codes never surface here; they are swallowed inside
/// the loop iteration that saw them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Input could not be opened or probed
    OpenFailed(String),
    /// The container holds no video stream
    NoVideoStream,
    /// No decoder registered under the resolved name
    UnsupportedCodec(String),
    /// Hardware device context or frame pool setup failed
    HardwareInit(String),
    /// Fatal decoder error mid-stream
    DecodeFailed(String),
    /// Rewind-to-start failed while looping
    SeekFailed(String),
    /// Presenter could not acquire or configure its target
    RenderTarget(String),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::OpenFailed(msg) => write!(f, "failed to open input: {msg}"),
            PipelineError::NoVideoStream => write!(f, "no video stream in input"),
            PipelineError::UnsupportedCodec(name) => write!(f, "unsupported codec: {name}"),
            PipelineError::HardwareInit(msg) => write!(f, "hardware init failed: {msg}"),
            PipelineError::DecodeFailed(msg) => write!(f, "decode failed: {msg}"),
            PipelineError::SeekFailed(msg) => write!(f, "seek to start failed: {msg}"),
            PipelineError::RenderTarget(msg) => write!(f, "render target error: {msg}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Returns true when the session should degrade to software decode
    /// rather than abort.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::HardwareInit(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plane_counts_match_format() {
        assert_eq!(PixelFormat::Yuv420p.num_planes(), 3);
        assert_eq!(PixelFormat::Nv12.num_planes(), 2);
        assert_eq!(PixelFormat::Rgba.num_planes(), 1);
        assert!(PixelFormat::Nv12.is_yuv());
        assert!(!PixelFormat::Rgba.is_yuv());
    }

    #[test]
    fn rgba_frame_has_single_plane() {
        let frame = CpuFrame::rgba(4, 2, vec![0u8; 4 * 2 * 4], 16);
        assert_eq!(frame.planes.len(), 1);
        assert_eq!(frame.plane(0).map(|p| p.stride), Some(16));
        assert!(frame.plane(1).is_none());
    }

    #[test]
    fn video_frame_accessors() {
        let frame = VideoFrame::Cpu(CpuFrame::rgba(8, 8, vec![0u8; 8 * 8 * 4], 32));
        assert_eq!(frame.dimensions(), (8, 8));
        assert_eq!(frame.format(), PixelFormat::Rgba);
        assert!(frame.as_cpu().is_some());
        assert!(!frame.is_gpu());
    }

    #[test]
    fn shared_texture_keeps_owner_alive() {
        let owner = Arc::new(42u32);
        let weak = Arc::downgrade(&(owner.clone() as Arc<dyn Any + Send + Sync>));
        let surface = SharedTexture::new(0x20, 1920, 1080, PixelFormat::Nv12, owner);
        let cloned = surface.clone();
        drop(surface);
        assert!(weak.upgrade().is_some());
        assert_eq!(cloned.handle, 0x20);
    }

    #[test]
    fn error_display_is_stable() {
        let err = PipelineError::UnsupportedCodec("h265".into());
        assert_eq!(err.to_string(), "unsupported codec: h265");
        assert!(PipelineError::HardwareInit("no device".into()).is_recoverable());
        assert!(!PipelineError::NoVideoStream.is_recoverable());
    }

    #[test]
    fn state_activity() {
        assert!(PlaybackState::Playing.is_active());
        assert!(PlaybackState::Stopping.is_active());
        assert!(!PlaybackState::Idle.is_active());
        assert!(!PlaybackState::Stopped.is_active());
    }
}
