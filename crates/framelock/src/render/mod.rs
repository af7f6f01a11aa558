//! wgpu presentation of decoded frames.
//!
//! The presenter runs on the host's thread; the decode loop only wakes it
//! through the render-request callback and hands frames over the present
//! slot. Each render drains the slot, uploads or rebinds the image, then
//! clears the target to transparent black and draws one full-target quad.
//!
//! Software frames go through one lazily created `Rgba8Unorm` texture that
//! is rewritten in place each frame. Hardware frames arrive as an NT
//! handle; the handle is opened on the presenter's own device once and the
//! two NV12 plane views are rebuilt on every draw.

use std::borrow::Cow;
use std::num::NonZeroU64;

use tracing::{debug, warn};

use framelock_core::present_slot::PresentReader;
use framelock_core::video::{CpuFrame, PipelineError, SharedTexture, VideoFrame};

/// wgpu requires bytes_per_row to be aligned to this value.
const COPY_BYTES_PER_ROW_ALIGNMENT: u32 = 256;

/// Aligns a value up to the nearest multiple of alignment.
fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Pads plane rows out to the upload alignment. Borrows untouched data
/// when the stride is already aligned; short planes are zero-filled.
fn pad_plane_data(data: &[u8], stride: usize, height: u32) -> (u32, Cow<'_, [u8]>) {
    let stride_u32 = stride as u32;
    let aligned_stride = align_up(stride_u32, COPY_BYTES_PER_ROW_ALIGNMENT);

    if aligned_stride == stride_u32 {
        return (stride_u32, Cow::Borrowed(data));
    }

    let mut padded = Vec::with_capacity((aligned_stride * height) as usize);
    for row in 0..height as usize {
        let row_start = row * stride;
        let row_end = row_start + stride;
        if row_end <= data.len() {
            padded.extend_from_slice(&data[row_start..row_end]);
        } else {
            let available = data.len().saturating_sub(row_start);
            if available > 0 {
                padded.extend_from_slice(&data[row_start..row_start + available]);
            }
            padded.resize(padded.len() + stride - available, 0);
        }
        padded.resize(padded.len() + (aligned_stride - stride_u32) as usize, 0);
    }

    (aligned_stride, Cow::Owned(padded))
}

/// Which image the quad draws from.
enum ActiveImage {
    Blank,
    Software,
    #[cfg(all(windows, feature = "d3d11"))]
    Imported,
}

/// The reusable upload target for software frames.
struct SoftwareImage {
    texture: wgpu::Texture,
    width: u32,
    height: u32,
}

/// A shared decoder surface opened on the presenter's device. `_owner`
/// keeps the decode-side texture behind the handle alive.
#[cfg(all(windows, feature = "d3d11"))]
struct ImportedImage {
    handle: isize,
    texture: wgpu::Texture,
    _owner: SharedTexture,
}

/// Draws the freshest decoded frame into a wgpu surface.
pub struct Presenter {
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
    pipeline_nv12: wgpu::RenderPipeline,
    pipeline_rgba: wgpu::RenderPipeline,
    bind_group_layout: wgpu::BindGroupLayout,
    uniform_buffer: wgpu::Buffer,
    sampler: wgpu::Sampler,
    /// 1x1 stand-in for the chroma binding when drawing packed RGBA.
    chroma_fill: wgpu::Texture,
    frames: PresentReader<VideoFrame>,
    software: Option<SoftwareImage>,
    #[cfg(all(windows, feature = "d3d11"))]
    imported: Option<ImportedImage>,
    active: ActiveImage,
    released: bool,
    #[cfg(not(all(windows, feature = "d3d11")))]
    import_warned: bool,
}

impl Presenter {
    /// Builds the presentation pipelines over an already configured device
    /// and an unconfigured surface.
    pub fn new(
        adapter: &wgpu::Adapter,
        device: wgpu::Device,
        queue: wgpu::Queue,
        surface: wgpu::Surface<'static>,
        width: u32,
        height: u32,
        frames: PresentReader<VideoFrame>,
    ) -> Result<Self, PipelineError> {
        let config = surface
            .get_default_config(adapter, width.max(1), height.max(1))
            .ok_or_else(|| {
                PipelineError::RenderTarget("surface is not supported by this adapter".to_owned())
            })?;
        surface.configure(&device, &config);

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("video_present_shader"),
            source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(include_str!("video.wgsl"))),
        });

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("video_sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("video_transform"),
            size: 16,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        // Full-target quad; the transform stays identity.
        queue.write_buffer(&uniform_buffer, 0, bytemuck::bytes_of(&[1.0f32, 1.0, 0.0, 0.0]));

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("video_bind_group_layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::VERTEX,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: NonZeroU64::new(16),
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        view_dimension: wgpu::TextureViewDimension::D2,
                        multisampled: false,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::FRAGMENT,
                    ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("video_pipeline_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let create_pipeline = |entry_point: &str, label: &str| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(entry_point),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: config.format,
                        blend: Some(wgpu::BlendState::REPLACE),
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    strip_index_format: None,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: None,
                    polygon_mode: wgpu::PolygonMode::Fill,
                    unclipped_depth: false,
                    conservative: false,
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let pipeline_nv12 = create_pipeline("fs_nv12", "video_pipeline_nv12");
        let pipeline_rgba = create_pipeline("fs_rgba", "video_pipeline_rgba");

        let chroma_fill = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("video_chroma_fill"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rg8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });

        Ok(Self {
            device,
            queue,
            surface,
            config,
            pipeline_nv12,
            pipeline_rgba,
            bind_group_layout,
            uniform_buffer,
            sampler,
            chroma_fill,
            frames,
            software: None,
            #[cfg(all(windows, feature = "d3d11"))]
            imported: None,
            active: ActiveImage::Blank,
            released: false,
            #[cfg(not(all(windows, feature = "d3d11")))]
            import_warned: false,
        })
    }

    /// Reconfigures the swap chain when the target size changed.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        if self.config.width == width && self.config.height == height {
            return;
        }
        self.config.width = width;
        self.config.height = height;
        self.surface.configure(&self.device, &self.config);
        debug!(width, height, "render target resized");
    }

    /// One marshaled render: drain the present slot, then draw.
    pub fn render(&mut self) {
        if let Some(frame) = self.frames.take() {
            self.released = false;
            match frame {
                VideoFrame::Cpu(cpu) => self.upload_software(&cpu),
                VideoFrame::Gpu(shared) => self.bind_shared(shared),
            }
        }
        self.draw();
    }

    /// Drops the bound frame images and quiets presentation errors while
    /// playback tears down. The next frame from a new session rebinds.
    pub fn release_display(&mut self) {
        self.active = ActiveImage::Blank;
        self.software = None;
        #[cfg(all(windows, feature = "d3d11"))]
        {
            self.imported = None;
        }
        self.released = true;
        debug!("display surface released");
    }

    fn upload_software(&mut self, frame: &CpuFrame) {
        let recreate = self
            .software
            .as_ref()
            .map(|image| (image.width, image.height))
            != Some((frame.width, frame.height));
        if recreate {
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("video_software_texture"),
                size: wgpu::Extent3d {
                    width: frame.width.max(1),
                    height: frame.height.max(1),
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            debug!(
                width = frame.width,
                height = frame.height,
                "created software frame texture"
            );
            self.software = Some(SoftwareImage {
                texture,
                width: frame.width,
                height: frame.height,
            });
        }

        let Some(image) = self.software.as_ref() else {
            return;
        };
        let Some(plane) = frame.plane(0) else {
            warn!("rgba frame without a pixel plane");
            return;
        };
        let (bytes_per_row, data) = pad_plane_data(&plane.data, plane.stride, frame.height);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &image.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            &data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(bytes_per_row),
                rows_per_image: Some(frame.height),
            },
            wgpu::Extent3d {
                width: frame.width,
                height: frame.height,
                depth_or_array_layers: 1,
            },
        );
        self.active = ActiveImage::Software;
    }

    #[cfg(all(windows, feature = "d3d11"))]
    fn bind_shared(&mut self, shared: SharedTexture) {
        if self.imported.as_ref().map(|image| image.handle) == Some(shared.handle) {
            // The decoder refreshed the surface in place; draw it again.
            self.active = ActiveImage::Imported;
            return;
        }
        match unsafe { import_shared_handle(&self.device, &shared) } {
            Ok(texture) => {
                debug!(
                    handle = shared.handle,
                    width = shared.width,
                    height = shared.height,
                    "opened shared display surface"
                );
                self.imported = Some(ImportedImage {
                    handle: shared.handle,
                    texture,
                    _owner: shared,
                });
                self.active = ActiveImage::Imported;
            }
            Err(err) => warn!(%err, "shared surface import failed"),
        }
    }

    #[cfg(not(all(windows, feature = "d3d11")))]
    fn bind_shared(&mut self, _shared: SharedTexture) {
        if !self.import_warned {
            self.import_warned = true;
            warn!("gpu frame received but shared-surface import is not compiled in");
        }
    }

    fn current_binding(&self) -> Option<(&wgpu::RenderPipeline, wgpu::BindGroup)> {
        match self.active {
            ActiveImage::Blank => None,
            ActiveImage::Software => {
                let image = self.software.as_ref()?;
                let view = image
                    .texture
                    .create_view(&wgpu::TextureViewDescriptor::default());
                let fill = self
                    .chroma_fill
                    .create_view(&wgpu::TextureViewDescriptor::default());
                Some((
                    &self.pipeline_rgba,
                    self.bind_views(&view, &fill, "video_bind_group_rgba"),
                ))
            }
            #[cfg(all(windows, feature = "d3d11"))]
            ActiveImage::Imported => {
                let image = self.imported.as_ref()?;
                // Plane views are rebuilt per draw; the surface behind them
                // changes every frame.
                let luma = image.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("video_luma_view"),
                    format: Some(wgpu::TextureFormat::R8Unorm),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    aspect: wgpu::TextureAspect::Plane0,
                    ..Default::default()
                });
                let chroma = image.texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some("video_chroma_view"),
                    format: Some(wgpu::TextureFormat::Rg8Unorm),
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    aspect: wgpu::TextureAspect::Plane1,
                    ..Default::default()
                });
                Some((
                    &self.pipeline_nv12,
                    self.bind_views(&luma, &chroma, "video_bind_group_nv12"),
                ))
            }
        }
    }

    fn bind_views(
        &self,
        primary: &wgpu::TextureView,
        chroma: &wgpu::TextureView,
        label: &str,
    ) -> wgpu::BindGroup {
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: self.uniform_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(primary),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: wgpu::BindingResource::TextureView(chroma),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: wgpu::BindingResource::Sampler(&self.sampler),
                },
            ],
        })
    }

    fn draw(&mut self) {
        let surface_texture = match self.surface.get_current_texture() {
            Ok(texture) => texture,
            Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                if self.released {
                    return;
                }
                self.surface.configure(&self.device, &self.config);
                match self.surface.get_current_texture() {
                    Ok(texture) => texture,
                    Err(err) => {
                        debug!(%err, "surface unavailable after reconfigure");
                        return;
                    }
                }
            }
            Err(err) => {
                if self.released {
                    debug!(%err, "surface error during teardown");
                } else {
                    warn!(%err, "cannot acquire surface texture");
                }
                return;
            }
        };

        let target = surface_texture
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());
        let binding = self.current_binding();
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("video_present_encoder"),
            });
        {
            let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("video_present_pass"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &target,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            if let Some((pipeline, ref bind_group)) = binding {
                pass.set_pipeline(pipeline);
                pass.set_bind_group(0, bind_group, &[]);
                pass.draw(0..6, 0..1);
            }
        }
        self.queue.submit(std::iter::once(encoder.finish()));
        surface_texture.present();
    }
}

/// Opens a decoder NT handle as an NV12 texture on the presenter's device.
/// The handle stays owned by the decode side; opening only references the
/// underlying resource.
#[cfg(all(windows, feature = "d3d11"))]
unsafe fn import_shared_handle(
    device: &wgpu::Device,
    shared: &SharedTexture,
) -> Result<wgpu::Texture, PipelineError> {
    use windows::core::Interface;
    use windows::Win32::Foundation::HANDLE;
    use windows::Win32::Graphics::Direct3D12::{ID3D12Device, ID3D12Resource};

    let handle = HANDLE(shared.handle as *mut std::ffi::c_void);
    if handle.is_invalid() {
        return Err(PipelineError::RenderTarget(
            "shared handle is invalid".to_owned(),
        ));
    }

    let size = wgpu::Extent3d {
        width: shared.width,
        height: shared.height,
        depth_or_array_layers: 1,
    };
    let hal_texture = device
        .as_hal::<wgpu::hal::api::Dx12, _, Result<wgpu::hal::dx12::Texture, PipelineError>>(
            |hal_device| {
                let Some(hal_device) = hal_device else {
                    return Err(PipelineError::RenderTarget(
                        "display device is not on the d3d12 backend".to_owned(),
                    ));
                };
                let raw_device: &ID3D12Device = hal_device.raw_device();
                let resource: ID3D12Resource =
                    raw_device.OpenSharedHandle(handle).map_err(|err| {
                        PipelineError::RenderTarget(format!("OpenSharedHandle failed: {err}"))
                    })?;
                Ok(wgpu::hal::dx12::Device::texture_from_raw(
                    resource,
                    wgpu::TextureFormat::NV12,
                    wgpu::TextureDimension::D2,
                    size,
                    1,
                    1,
                ))
            },
        )?;

    Ok(
        device.create_texture_from_hal::<wgpu::hal::api::Dx12>(
            hal_texture,
            &wgpu::TextureDescriptor {
                label: Some("video_display_surface"),
                size,
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: wgpu::TextureFormat::NV12,
                usage: wgpu::TextureUsages::TEXTURE_BINDING,
                view_formats: &[],
            },
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiples() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
    }

    #[test]
    fn aligned_stride_borrows_without_copying() {
        let data = vec![7u8; 256 * 4];
        let (bytes_per_row, padded) = pad_plane_data(&data, 256, 4);
        assert_eq!(bytes_per_row, 256);
        assert!(matches!(padded, Cow::Borrowed(_)));
    }

    #[test]
    fn unaligned_stride_pads_each_row() {
        let data: Vec<u8> = (0..100u8).cycle().take(100 * 3).collect();
        let (bytes_per_row, padded) = pad_plane_data(&data, 100, 3);
        assert_eq!(bytes_per_row, 256);
        assert_eq!(padded.len(), 256 * 3);
        // Row payloads stay put at their aligned offsets.
        assert_eq!(&padded[0..100], &data[0..100]);
        assert_eq!(&padded[256..356], &data[100..200]);
        assert_eq!(&padded[100..256], &[0u8; 156][..]);
    }

    #[test]
    fn truncated_plane_zero_fills_missing_rows() {
        let data = vec![9u8; 150];
        let (bytes_per_row, padded) = pad_plane_data(&data, 100, 3);
        assert_eq!(bytes_per_row, 256);
        assert_eq!(padded.len(), 256 * 3);
        assert_eq!(&padded[512..612], &[0u8; 100][..]);
    }
}
