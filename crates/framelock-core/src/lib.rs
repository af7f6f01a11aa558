//! framelock-core: Timing and hand-off foundation for paced video playback.
//!
//! This crate provides the decode-free, GPU-free primitives the pipeline is
//! built on. It contains:
//!
//! - Core types: [`video`] (frames, shared textures, playback state, errors)
//! - Drift-corrected interval timing: [`timer`]
//! - The process-wide presentation gate: [`gate`]
//! - Latest-frame hand-off: [`present_slot`]
//!
//! This crate has **no FFmpeg or wgpu dependency**. It is consumed by:
//! - `framelock` (decode sessions, GPU transfer, presentation)
//! - `framelock-demo` (windowed playback host)

pub mod gate;
pub mod present_slot;
pub mod timer;
pub mod video;
