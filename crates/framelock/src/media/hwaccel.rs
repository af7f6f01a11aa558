//! Hardware decode path selection.
//!
//! A session requests one [`HwAccel`] strategy up front. During codec open
//! the decoder offers its candidate surface formats and the negotiator picks
//! the one matching the strategy, or reports that nothing matched so the
//! session can reopen on the software path. Selection itself is pure; the
//! one permitted side effect is allocating the hardware frame pool on the
//! CUDA path, injected as a closure so the decision logic stays testable
//! without a device.

use std::fmt;

use framelock_core::video::PipelineError;
use tracing::{debug, warn};

/// Requested decode acceleration strategy. Selected once per session and
/// silently degraded to `Software` when the hardware path is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccel {
    /// NVIDIA CUDA/CUVID decoding.
    Cuda,
    /// Legacy DXVA2 decoding, presented through D3D11 surfaces.
    Dxva2,
    /// Native D3D11VA decoding.
    D3d11va,
    /// Plain CPU decoding.
    Software,
}

impl HwAccel {
    pub fn is_hardware(self) -> bool {
        !matches!(self, HwAccel::Software)
    }

    /// Decoder name to resolve for this strategy. CUDA uses the dedicated
    /// `_cuvid` decoder variant; every other strategy decodes with the base
    /// codec and differs only in surface negotiation.
    pub fn decoder_name(self, codec: &str) -> String {
        match self {
            HwAccel::Cuda => format!("{codec}_cuvid"),
            _ => codec.to_owned(),
        }
    }
}

impl fmt::Display for HwAccel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HwAccel::Cuda => "cuda",
            HwAccel::Dxva2 => "dxva2",
            HwAccel::D3d11va => "d3d11va",
            HwAccel::Software => "software",
        };
        f.write_str(name)
    }
}

/// Decoder output surface formats the negotiator understands. `Other`
/// stands in for every format outside the negotiation (plain YUV and the
/// like); those are never selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceFormat {
    /// CUDA device frames.
    Cuda,
    /// The intermediate format DXVA2 decoders advertise.
    Dxva2Vld,
    /// D3D11 texture array frames.
    D3d11,
    /// The D3D11 surface format the render path consumes on the DXVA2
    /// strategy.
    D3d11Vld,
    /// Anything not involved in hardware negotiation.
    Other,
}

/// Picks the surface format for `strategy` from the decoder's ordered
/// `offered` list, running `init_pool` when the chosen path needs a
/// hardware frame pool. Returns `None` when no offered format matches (or
/// pool setup failed), which the session treats as "reopen in software".
pub fn negotiate<F>(strategy: HwAccel, offered: &[SurfaceFormat], init_pool: F) -> Option<SurfaceFormat>
where
    F: FnOnce() -> Result<(), PipelineError>,
{
    match strategy {
        HwAccel::Cuda => {
            if !offered.contains(&SurfaceFormat::Cuda) {
                return None;
            }
            match init_pool() {
                Ok(()) => {
                    debug!("negotiated cuda surfaces");
                    Some(SurfaceFormat::Cuda)
                }
                Err(err) => {
                    warn!(%err, "cuda frame pool unavailable, declining hardware path");
                    None
                }
            }
        }
        // The decoder advertises the intermediate DXVA2 format; the render
        // path wants the D3D11 surface flavor, so the selection maps rather
        // than echoes.
        HwAccel::Dxva2 => offered
            .contains(&SurfaceFormat::Dxva2Vld)
            .then_some(SurfaceFormat::D3d11Vld),
        HwAccel::D3d11va => offered
            .contains(&SurfaceFormat::D3d11)
            .then_some(SurfaceFormat::D3d11),
        HwAccel::Software => None,
    }
}

/// FFmpeg-facing glue: the device context, the frame pool, and the
/// `get_format` trampoline that feeds [`negotiate`] from the decoder's
/// sentinel-terminated candidate array.
#[cfg(feature = "ffmpeg")]
pub(crate) mod av {
    use super::{negotiate, HwAccel, SurfaceFormat};
    use framelock_core::video::PipelineError;
    use std::ptr;
    use tracing::warn;

    use ffmpeg_next as ffmpeg;
    use ffmpeg_next::ffi::{
        av_buffer_ref, av_buffer_unref, av_hwdevice_ctx_create, av_hwframe_ctx_alloc,
        av_hwframe_ctx_init, AVBufferRef, AVCodecContext, AVHWDeviceType, AVHWFramesContext,
        AVPixelFormat,
    };

    fn from_av(format: AVPixelFormat) -> SurfaceFormat {
        match format {
            AVPixelFormat::AV_PIX_FMT_CUDA => SurfaceFormat::Cuda,
            AVPixelFormat::AV_PIX_FMT_DXVA2_VLD => SurfaceFormat::Dxva2Vld,
            AVPixelFormat::AV_PIX_FMT_D3D11 => SurfaceFormat::D3d11,
            AVPixelFormat::AV_PIX_FMT_D3D11VA_VLD => SurfaceFormat::D3d11Vld,
            _ => SurfaceFormat::Other,
        }
    }

    fn to_av(format: SurfaceFormat) -> AVPixelFormat {
        match format {
            SurfaceFormat::Cuda => AVPixelFormat::AV_PIX_FMT_CUDA,
            SurfaceFormat::Dxva2Vld => AVPixelFormat::AV_PIX_FMT_DXVA2_VLD,
            SurfaceFormat::D3d11 => AVPixelFormat::AV_PIX_FMT_D3D11,
            SurfaceFormat::D3d11Vld => AVPixelFormat::AV_PIX_FMT_D3D11VA_VLD,
            SurfaceFormat::Other => AVPixelFormat::AV_PIX_FMT_NONE,
        }
    }

    /// Owned reference to an `av_hwdevice_ctx`. Created before codec open
    /// with FFmpeg's automatic device selection; attached to the codec as
    /// an additional reference so teardown order does not matter.
    pub(crate) struct HwDeviceCtx {
        raw: *mut AVBufferRef,
    }

    // Only the decode thread touches the context after creation.
    unsafe impl Send for HwDeviceCtx {}

    impl HwDeviceCtx {
        pub(crate) fn create(strategy: HwAccel) -> Result<Self, PipelineError> {
            let kind = match strategy {
                HwAccel::Cuda => AVHWDeviceType::AV_HWDEVICE_TYPE_CUDA,
                HwAccel::Dxva2 => AVHWDeviceType::AV_HWDEVICE_TYPE_DXVA2,
                HwAccel::D3d11va => AVHWDeviceType::AV_HWDEVICE_TYPE_D3D11VA,
                HwAccel::Software => {
                    return Err(PipelineError::HardwareInit(
                        "software strategy binds no device".to_owned(),
                    ))
                }
            };
            let mut raw: *mut AVBufferRef = ptr::null_mut();
            let rc = unsafe { av_hwdevice_ctx_create(&mut raw, kind, c"auto".as_ptr(), ptr::null_mut(), 0) };
            if rc < 0 || raw.is_null() {
                return Err(PipelineError::HardwareInit(format!(
                    "no {strategy} device: {}",
                    ffmpeg::Error::from(rc)
                )));
            }
            Ok(Self { raw })
        }

        /// Hands the codec context its own reference to the device.
        pub(crate) fn attach(&self, ctx: *mut AVCodecContext) -> Result<(), PipelineError> {
            let reference = unsafe { av_buffer_ref(self.raw) };
            if reference.is_null() {
                return Err(PipelineError::HardwareInit(
                    "failed to reference hardware device".to_owned(),
                ));
            }
            unsafe { (*ctx).hw_device_ctx = reference };
            Ok(())
        }
    }

    impl Drop for HwDeviceCtx {
        fn drop(&mut self) {
            unsafe { av_buffer_unref(&mut self.raw) };
        }
    }

    /// Session-held reference to the CUDA frame pool, released explicitly
    /// at teardown. The codec context carries its own reference.
    pub(crate) struct HwFramesRef {
        raw: *mut AVBufferRef,
    }

    unsafe impl Send for HwFramesRef {}

    impl Drop for HwFramesRef {
        fn drop(&mut self) {
            unsafe { av_buffer_unref(&mut self.raw) };
        }
    }

    /// Per-session negotiation state reached through the codec context's
    /// opaque pointer while `get_format` runs. Boxed by the session before
    /// codec open and reclaimed at close.
    pub(crate) struct NegotiatorState {
        pub(crate) strategy: HwAccel,
        pub(crate) hw_frames: Option<HwFramesRef>,
        pub(crate) selected: Option<SurfaceFormat>,
    }

    impl NegotiatorState {
        pub(crate) fn new(strategy: HwAccel) -> Self {
            Self {
                strategy,
                hw_frames: None,
                selected: None,
            }
        }
    }

    /// Allocates and initializes the codec's hardware frame pool. One
    /// surface is enough: frames drain once per pacing tick.
    unsafe fn init_cuda_frame_pool(ctx: *mut AVCodecContext) -> Result<HwFramesRef, PipelineError> {
        if (*ctx).hw_device_ctx.is_null() {
            return Err(PipelineError::HardwareInit(
                "codec has no hardware device bound".to_owned(),
            ));
        }
        let mut frames_ref = av_hwframe_ctx_alloc((*ctx).hw_device_ctx);
        if frames_ref.is_null() {
            return Err(PipelineError::HardwareInit(
                "failed to allocate hardware frame pool".to_owned(),
            ));
        }

        let frames_ctx = (*frames_ref).data as *mut AVHWFramesContext;
        (*frames_ctx).format = AVPixelFormat::AV_PIX_FMT_CUDA;
        (*frames_ctx).sw_format = (*ctx).sw_pix_fmt;
        (*frames_ctx).width = (*ctx).coded_width;
        (*frames_ctx).height = (*ctx).coded_height;
        (*frames_ctx).initial_pool_size = 1;

        let rc = av_hwframe_ctx_init(frames_ref);
        if rc < 0 {
            av_buffer_unref(&mut frames_ref);
            return Err(PipelineError::HardwareInit(format!(
                "frame pool init failed: {}",
                ffmpeg::Error::from(rc)
            )));
        }

        let codec_ref = av_buffer_ref(frames_ref);
        if codec_ref.is_null() {
            av_buffer_unref(&mut frames_ref);
            return Err(PipelineError::HardwareInit(
                "failed to reference frame pool".to_owned(),
            ));
        }
        (*ctx).hw_frames_ctx = codec_ref;
        Ok(HwFramesRef { raw: frames_ref })
    }

    /// `AVCodecContext.get_format` entry point. Walks the sentinel-
    /// terminated candidate array, defers to [`negotiate`], and reports the
    /// selection (or the none sentinel) back to the decoder.
    ///
    /// # Safety
    /// `ctx.opaque` must point at the session's [`NegotiatorState`] and
    /// stay valid for the whole codec-open call.
    pub(crate) unsafe extern "C" fn select_surface_format(
        ctx: *mut AVCodecContext,
        fmt: *const AVPixelFormat,
    ) -> AVPixelFormat {
        let state = (*ctx).opaque as *mut NegotiatorState;
        if state.is_null() {
            return AVPixelFormat::AV_PIX_FMT_NONE;
        }

        let mut offered = Vec::new();
        let mut cursor = fmt;
        while !cursor.is_null() && *cursor != AVPixelFormat::AV_PIX_FMT_NONE {
            offered.push(from_av(*cursor));
            cursor = cursor.add(1);
        }

        let strategy = (*state).strategy;
        let selected = negotiate(strategy, &offered, || {
            let pool = init_cuda_frame_pool(ctx)?;
            (*state).hw_frames = Some(pool);
            Ok(())
        });
        (*state).selected = selected;

        match selected {
            Some(format) => to_av(format),
            None => {
                warn!(%strategy, "no matching surface format offered");
                AVPixelFormat::AV_PIX_FMT_NONE
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn no_pool() -> Result<(), PipelineError> {
        panic!("pool initializer must not run for this strategy");
    }

    #[test]
    fn cuda_selects_cuda_and_builds_the_pool() {
        let calls = Cell::new(0);
        let selected = negotiate(
            HwAccel::Cuda,
            &[SurfaceFormat::Other, SurfaceFormat::Cuda],
            || {
                calls.set(calls.get() + 1);
                Ok(())
            },
        );
        assert_eq!(selected, Some(SurfaceFormat::Cuda));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn cuda_pool_failure_declines_the_hardware_path() {
        let selected = negotiate(HwAccel::Cuda, &[SurfaceFormat::Cuda], || {
            Err(PipelineError::HardwareInit("no surfaces".to_owned()))
        });
        assert_eq!(selected, None);
    }

    #[test]
    fn dxva2_maps_to_the_d3d11_surface_flavor() {
        let selected = negotiate(
            HwAccel::Dxva2,
            &[SurfaceFormat::Cuda, SurfaceFormat::Dxva2Vld],
            no_pool,
        );
        // The offered intermediate format is never returned as-is, and the
        // earlier non-matching entry never wins.
        assert_eq!(selected, Some(SurfaceFormat::D3d11Vld));
    }

    #[test]
    fn d3d11va_matches_verbatim() {
        let selected = negotiate(
            HwAccel::D3d11va,
            &[SurfaceFormat::Other, SurfaceFormat::D3d11],
            no_pool,
        );
        assert_eq!(selected, Some(SurfaceFormat::D3d11));
    }

    #[test]
    fn unmatched_strategy_yields_none_without_pool_setup() {
        let selected = negotiate(
            HwAccel::Cuda,
            &[SurfaceFormat::Dxva2Vld, SurfaceFormat::D3d11],
            no_pool,
        );
        assert_eq!(selected, None);
    }

    #[test]
    fn software_never_negotiates() {
        let selected = negotiate(
            HwAccel::Software,
            &[SurfaceFormat::Cuda, SurfaceFormat::D3d11],
            no_pool,
        );
        assert_eq!(selected, None);
    }

    #[test]
    fn cuda_decoder_name_carries_the_cuvid_suffix() {
        assert_eq!(HwAccel::Cuda.decoder_name("h264"), "h264_cuvid");
        assert_eq!(HwAccel::D3d11va.decoder_name("h264"), "h264");
        assert_eq!(HwAccel::Software.decoder_name("hevc"), "hevc");
    }
}
