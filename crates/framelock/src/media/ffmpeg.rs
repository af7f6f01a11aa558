//! FFmpeg-backed [`MediaSource`].
//!
//! Owns the demuxer, the codec context, and the conversion scratch state
//! for one session, all driven from the decode thread. Opening resolves
//! the decoder by strategy (CUDA wants the `_cuvid` variant), binds the
//! hardware device, and wires the surface negotiator into codec open;
//! every hardware failure degrades the session to software instead of
//! killing it. Codec open itself is serialized process-wide.

use std::ffi::c_void;
use std::os::raw::c_int;

use ffmpeg_next as ffmpeg;
use ffmpeg_next::codec;
use ffmpeg_next::format::{self, Pixel};
use ffmpeg_next::media::Type;
use ffmpeg_next::software::scaling;
use ffmpeg_next::util::frame::video::Video as AvFrame;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use framelock_core::video::{CpuFrame, PipelineError, VideoFrame};

use crate::media::hwaccel::{av, HwAccel};
use crate::media::runtime;
use crate::media::source::{FramePoll, MediaSource, SourceInfo};

#[cfg(all(windows, feature = "d3d11"))]
use crate::media::d3d11::TransferTexture;

/// Codec open is not proven thread-safe across sessions; it is the one
/// step every session serializes on.
static CODEC_OPEN: Mutex<()> = Mutex::new(());

/// Planar-to-packed RGBA conversion state, rebuilt when the incoming
/// format or size changes.
struct RgbaScaler {
    key: (Pixel, u32, u32),
    ctx: scaling::Context,
}

impl RgbaScaler {
    fn new(key: (Pixel, u32, u32)) -> Result<Self, PipelineError> {
        let (format, width, height) = key;
        let ctx = scaling::Context::get(
            format,
            width,
            height,
            Pixel::RGBA,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .map_err(|err| PipelineError::DecodeFailed(format!("scaler unavailable: {err}")))?;
        Ok(Self { key, ctx })
    }

    fn run(&mut self, src: &AvFrame) -> Result<CpuFrame, PipelineError> {
        let mut rgba = AvFrame::empty();
        self.ctx
            .run(src, &mut rgba)
            .map_err(|err| PipelineError::DecodeFailed(format!("scaling failed: {err}")))?;

        let width = rgba.width() as usize;
        let height = rgba.height() as usize;
        let stride = rgba.stride(0);
        let plane = rgba.data(0);
        let mut packed = Vec::with_capacity(width * height * 4);
        for row in 0..height {
            let start = row * stride;
            packed.extend_from_slice(&plane[start..start + width * 4]);
        }
        Ok(CpuFrame::rgba(rgba.width(), rgba.height(), packed, width * 4))
    }
}

/// One open stream plus its decoder. Fields drop in reverse acquisition
/// order; the negotiator state outlives the decoder because a mid-stream
/// format change may re-enter `get_format`.
pub struct FfmpegSource {
    #[cfg(all(windows, feature = "d3d11"))]
    transfer: Option<TransferTexture>,
    scaler: Option<RgbaScaler>,
    decoder: ffmpeg::decoder::Video,
    state: Box<av::NegotiatorState>,
    device: Option<av::HwDeviceCtx>,
    input: format::context::Input,
    info: SourceInfo,
    stream_index: usize,
    finished: bool,
}

impl FfmpegSource {
    /// Opens `uri`, selects the first video stream, and resolves a decoder
    /// for `strategy`, degrading to software when the hardware path is not
    /// available on this machine or for this codec.
    pub fn open(uri: &str, strategy: HwAccel) -> Result<Self, PipelineError> {
        runtime::ensure_registered(None);
        info!(uri, %strategy, "opening media");

        let input = format::input(&uri)
            .map_err(|err| PipelineError::OpenFailed(format!("cannot open {uri}: {err}")))?;
        let (stream_index, params, frame_rate) = {
            let stream = input
                .streams()
                .best(Type::Video)
                .ok_or(PipelineError::NoVideoStream)?;
            let rate = stream.avg_frame_rate();
            let rate = if rate.numerator() > 0 && rate.denominator() > 0 {
                f64::from(rate.numerator()) / f64::from(rate.denominator())
            } else {
                25.0
            };
            (stream.index(), stream.parameters(), rate)
        };

        let codec_id = params.id();
        let base_codec = ffmpeg::decoder::find(codec_id)
            .ok_or_else(|| PipelineError::UnsupportedCodec(format!("{codec_id:?}")))?;

        // CUDA decodes through a dedicated decoder; a missing variant
        // degrades the whole session, not just the surface format.
        let mut strategy = strategy;
        let codec = if strategy == HwAccel::Cuda {
            let variant = strategy.decoder_name(base_codec.name());
            match ffmpeg::decoder::find_by_name(&variant) {
                Some(codec) => codec,
                None => {
                    warn!(variant, "hardware decoder not present, using software");
                    strategy = HwAccel::Software;
                    base_codec
                }
            }
        } else {
            base_codec
        };

        let (decoder, device, state, strategy) =
            match Self::open_decoder(params.clone(), codec, strategy) {
                Ok((decoder, device, state)) => (decoder, device, state, strategy),
                Err(err) if strategy.is_hardware() => {
                    warn!(%err, %strategy, "hardware path failed, reopening in software");
                    let (decoder, device, state) =
                        Self::open_decoder(params, base_codec, HwAccel::Software)?;
                    (decoder, device, state, HwAccel::Software)
                }
                Err(err) => return Err(err),
            };

        let info = SourceInfo {
            width: decoder.width(),
            height: decoder.height(),
            frame_rate,
            strategy,
        };
        info!(
            codec = codec.name(),
            width = info.width,
            height = info.height,
            rate = info.frame_rate,
            strategy = %info.strategy,
            "media open"
        );

        Ok(Self {
            #[cfg(all(windows, feature = "d3d11"))]
            transfer: None,
            scaler: None,
            decoder,
            state,
            device,
            input,
            info,
            stream_index,
            finished: false,
        })
    }

    fn open_decoder(
        params: codec::Parameters,
        codec: ffmpeg::Codec,
        strategy: HwAccel,
    ) -> Result<
        (
            ffmpeg::decoder::Video,
            Option<av::HwDeviceCtx>,
            Box<av::NegotiatorState>,
        ),
        PipelineError,
    > {
        let mut state = Box::new(av::NegotiatorState::new(strategy));
        let mut context = codec::context::Context::from_parameters(params)
            .map_err(|err| PipelineError::OpenFailed(format!("codec parameters: {err}")))?;

        let mut device = None;
        if strategy.is_hardware() {
            let dev = av::HwDeviceCtx::create(strategy)?;
            unsafe {
                let raw = context.as_mut_ptr();
                dev.attach(raw)?;
                (*raw).opaque = (&mut *state as *mut av::NegotiatorState).cast::<c_void>();
                (*raw).get_format = Some(av::select_surface_format);
            }
            device = Some(dev);
        }

        let opened = {
            let _serialize = CODEC_OPEN.lock();
            context
                .decoder()
                .open_as(codec)
                .map_err(|err| PipelineError::OpenFailed(format!("codec open failed: {err}")))?
        };
        let decoder = opened
            .video()
            .map_err(|err| PipelineError::OpenFailed(format!("not a video decoder: {err}")))?;
        Ok((decoder, device, state))
    }

    fn scale_to_rgba(&mut self, src: &AvFrame) -> Result<CpuFrame, PipelineError> {
        let key = (src.format(), src.width(), src.height());
        let mut scaler = match self.scaler.take() {
            Some(scaler) if scaler.key == key => scaler,
            _ => RgbaScaler::new(key)?,
        };
        let frame = scaler.run(src);
        self.scaler = Some(scaler);
        frame
    }

    /// Pulls the hardware frame back to host memory, then packs it.
    fn readback_to_rgba(&mut self, frame: &AvFrame) -> Result<CpuFrame, PipelineError> {
        let mut host = AvFrame::empty();
        let rc = unsafe {
            ffmpeg::ffi::av_hwframe_transfer_data(host.as_mut_ptr(), frame.as_ptr(), 0)
        };
        if rc < 0 {
            return Err(PipelineError::DecodeFailed(format!(
                "hardware readback failed: {}",
                ffmpeg::Error::from(rc)
            )));
        }
        self.scale_to_rgba(&host)
    }

    /// D3D11 frames carry the decoder's texture in `data[0]` and the array
    /// slice index in `data[1]`; the slice is copied into the session's
    /// shareable transfer texture.
    #[cfg(all(windows, feature = "d3d11"))]
    fn frame_from_d3d11(&mut self, frame: &AvFrame) -> Result<VideoFrame, PipelineError> {
        let (texture, index) = unsafe {
            let raw = frame.as_ptr();
            ((*raw).data[0].cast::<c_void>(), (*raw).data[1] as usize as u32)
        };
        if texture.is_null() {
            return Err(PipelineError::DecodeFailed(
                "d3d11 frame carries no texture".to_owned(),
            ));
        }

        let rebuilt_pool = self
            .transfer
            .as_ref()
            .map_or(true, |transfer| !transfer.tracks(texture));
        if rebuilt_pool {
            self.transfer = Some(TransferTexture::create_for(texture)?);
        }
        match self.transfer.as_ref() {
            Some(transfer) => {
                transfer.copy_from(texture, index)?;
                Ok(VideoFrame::Gpu(transfer.shared()))
            }
            None => Err(PipelineError::DecodeFailed(
                "transfer texture unavailable".to_owned(),
            )),
        }
    }

    #[cfg(not(all(windows, feature = "d3d11")))]
    fn frame_from_d3d11(&mut self, frame: &AvFrame) -> Result<VideoFrame, PipelineError> {
        Ok(VideoFrame::Cpu(self.readback_to_rgba(frame)?))
    }
}

impl MediaSource for FfmpegSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn poll_frame(&mut self) -> Result<FramePoll, PipelineError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(FramePoll::EndOfStream),
            Err(err) => {
                return Err(PipelineError::DecodeFailed(format!(
                    "packet read failed: {err}"
                )))
            }
        }
        // Packets from other streams are dropped without gating.
        if packet.stream() != self.stream_index {
            return Ok(FramePoll::NotReady);
        }

        self.decoder
            .send_packet(&packet)
            .map_err(|err| PipelineError::DecodeFailed(format!("packet submit failed: {err}")))?;

        let mut frame = AvFrame::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                return Ok(FramePoll::NotReady)
            }
            Err(ffmpeg::Error::Eof) => return Ok(FramePoll::NotReady),
            Err(err) => {
                return Err(PipelineError::DecodeFailed(format!(
                    "frame receive failed: {err}"
                )))
            }
        }

        let video_frame = match frame.format() {
            Pixel::CUDA | Pixel::DXVA2_VLD | Pixel::D3D11VA_VLD => {
                VideoFrame::Cpu(self.readback_to_rgba(&frame)?)
            }
            Pixel::D3D11 => self.frame_from_d3d11(&frame)?,
            _ => VideoFrame::Cpu(self.scale_to_rgba(&frame)?),
        };
        Ok(FramePoll::Frame(video_frame))
    }

    fn rewind(&mut self) -> Result<(), PipelineError> {
        let rc = unsafe {
            ffmpeg::ffi::av_seek_frame(
                self.input.as_mut_ptr(),
                -1,
                0,
                ffmpeg::ffi::AVSEEK_FLAG_BACKWARD as c_int,
            )
        };
        if rc < 0 {
            return Err(PipelineError::SeekFailed(format!(
                "seek to start failed: {}",
                ffmpeg::Error::from(rc)
            )));
        }
        debug!("rewound to start");
        Ok(())
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        // Flush with the empty packet, then drain whatever is buffered.
        if self.decoder.send_eof().is_ok() {
            let mut frame = AvFrame::empty();
            let mut drained = 0u32;
            while self.decoder.receive_frame(&mut frame).is_ok() {
                drained += 1;
            }
            if drained > 0 {
                debug!(drained, "drained decoder on close");
            }
        }
        #[cfg(all(windows, feature = "d3d11"))]
        {
            self.transfer = None;
        }
        self.scaler = None;
        debug!(
            hardware = self.device.is_some(),
            surface = ?self.state.selected,
            "media source closed"
        );
    }
}
