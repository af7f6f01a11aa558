//! D3D11 transfer surface for cross-device frame hand-off.
//!
//! The D3D11VA decoder writes into slices of one texture array that only
//! its own device can touch. Each session owns a single shareable copy
//! target instead: a one-slice texture created with the NT-handle sharing
//! flag, refreshed by `CopySubresourceRegion` every frame and exported
//! once through `IDXGIResource1::CreateSharedHandle`. The presenter opens
//! that handle on its own device, so no decoder resource ever crosses the
//! device boundary.

use std::any::Any;
use std::ffi::c_void;
use std::sync::Arc;

use tracing::debug;
use windows::core::Interface;
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11Device, ID3D11DeviceContext, ID3D11Texture2D, D3D11_BIND_SHADER_RESOURCE,
    D3D11_RESOURCE_MISC_SHARED_NTHANDLE, D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT,
};
use windows::Win32::Graphics::Dxgi::{IDXGIResource1, DXGI_SHARED_RESOURCE_READ};
use windows::Win32::Security::SECURITY_ATTRIBUTES;

use framelock_core::video::{PipelineError, PixelFormat, SharedTexture};

/// Texture, context, and handle live exactly as long as the last
/// [`SharedTexture`] referencing them; the NT handle closes on drop.
struct TransferInner {
    texture: ID3D11Texture2D,
    context: ID3D11DeviceContext,
    handle: isize,
    width: u32,
    height: u32,
}

impl Drop for TransferInner {
    fn drop(&mut self) {
        let handle = HANDLE(self.handle as *mut c_void);
        if !handle.is_invalid() {
            unsafe {
                let _ = CloseHandle(handle);
            }
        }
        debug!("transfer texture released");
    }
}

/// One session's shareable copy of the decoder's output surface.
pub(crate) struct TransferTexture {
    inner: Arc<TransferInner>,
    source_key: usize,
}

impl TransferTexture {
    /// Builds the transfer texture on the decoder's own device, from the
    /// decoder texture's description with `ArraySize` forced to 1 and the
    /// NT-handle sharing flag set.
    pub(crate) fn create_for(source: *mut c_void) -> Result<Self, PipelineError> {
        let source_key = source as usize;
        let source = unsafe { ID3D11Texture2D::from_raw_borrowed(&source) }
            .ok_or_else(|| PipelineError::DecodeFailed("decoder texture is null".to_owned()))?;

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        unsafe { source.GetDesc(&mut desc) };
        desc.ArraySize = 1;
        desc.MipLevels = 1;
        desc.Usage = D3D11_USAGE_DEFAULT;
        desc.BindFlags = D3D11_BIND_SHADER_RESOURCE.0 as u32;
        desc.CPUAccessFlags = 0;
        desc.MiscFlags = D3D11_RESOURCE_MISC_SHARED_NTHANDLE.0 as u32;

        let device = unsafe {
            let mut device: Option<ID3D11Device> = None;
            source.GetDevice(&mut device);
            device.ok_or_else(|| {
                PipelineError::DecodeFailed("decoder device unavailable".to_owned())
            })?
        };
        let context = unsafe {
            let mut context: Option<ID3D11DeviceContext> = None;
            device.GetImmediateContext(&mut context);
            context.ok_or_else(|| {
                PipelineError::DecodeFailed("immediate context unavailable".to_owned())
            })?
        };

        let texture: ID3D11Texture2D = unsafe {
            let mut texture: Option<ID3D11Texture2D> = None;
            device
                .CreateTexture2D(&desc, None, Some(&mut texture))
                .map_err(|err| {
                    PipelineError::DecodeFailed(format!(
                        "CreateTexture2D with SHARED_NTHANDLE failed: {err}"
                    ))
                })?;
            texture.ok_or_else(|| {
                PipelineError::DecodeFailed("CreateTexture2D returned null".to_owned())
            })?
        };

        let resource: IDXGIResource1 = texture.cast().map_err(|err| {
            PipelineError::DecodeFailed(format!("IDXGIResource1 cast failed: {err}"))
        })?;
        let handle = unsafe {
            resource
                .CreateSharedHandle(
                    None::<*const SECURITY_ATTRIBUTES>,
                    DXGI_SHARED_RESOURCE_READ.0,
                    None,
                )
                .map_err(|err| {
                    PipelineError::DecodeFailed(format!("CreateSharedHandle failed: {err}"))
                })?
        };

        debug!(
            width = desc.Width,
            height = desc.Height,
            format = ?desc.Format,
            handle = ?handle,
            "created shared transfer texture"
        );

        Ok(Self {
            inner: Arc::new(TransferInner {
                texture,
                context,
                handle: handle.0 as isize,
                width: desc.Width,
                height: desc.Height,
            }),
            source_key,
        })
    }

    /// Whether this transfer texture was built for `source`. The decoder
    /// keeps one array texture per frame pool, so a changed pointer means
    /// the pool was rebuilt and the copy target must follow.
    pub(crate) fn tracks(&self, source: *mut c_void) -> bool {
        self.source_key == source as usize
    }

    /// Copies array slice `index` of the decoder texture into slice 0 of
    /// the shareable texture, then flushes so the copy is submitted before
    /// the presenter's device samples it.
    pub(crate) fn copy_from(&self, source: *mut c_void, index: u32) -> Result<(), PipelineError> {
        let source = unsafe { ID3D11Texture2D::from_raw_borrowed(&source) }
            .ok_or_else(|| PipelineError::DecodeFailed("decoder texture is null".to_owned()))?;
        unsafe {
            self.inner
                .context
                .CopySubresourceRegion(&self.inner.texture, 0, 0, 0, 0, source, index, None);
            self.inner.context.Flush();
        }
        Ok(())
    }

    /// Hand-off value for the presenter. Carries the keep-alive for the
    /// texture behind the handle.
    pub(crate) fn shared(&self) -> SharedTexture {
        SharedTexture::new(
            self.inner.handle,
            self.inner.width,
            self.inner.height,
            PixelFormat::Nv12,
            Arc::clone(&self.inner) as Arc<dyn Any + Send + Sync>,
        )
    }
}
