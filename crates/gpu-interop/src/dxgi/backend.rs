//! [`DxgiBackend`]: the native half of the compositor bridge.

use std::ffi::c_void;
use std::ptr;

use gl::types::{GLuint, GLvoid};
use tracing::{debug, info, warn};
use windows::core::Interface;
use windows::Win32::Foundation::{GetLastError, HWND};
use windows::Win32::Graphics::Direct3D11::{
    ID3D11DepthStencilView, ID3D11Device, ID3D11DeviceContext, ID3D11RenderTargetView,
    ID3D11Texture2D, D3D11_BIND_DEPTH_STENCIL, D3D11_CLEAR_DEPTH, D3D11_CLEAR_STENCIL,
    D3D11_TEXTURE2D_DESC, D3D11_USAGE_DEFAULT, D3D11_VIEWPORT,
};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_COLOR_SPACE_RGB_FULL_G10_NONE_P709, DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020,
    DXGI_COLOR_SPACE_RGB_FULL_G22_NONE_P709, DXGI_COLOR_SPACE_TYPE,
    DXGI_FORMAT, DXGI_FORMAT_B8G8R8A8_UNORM, DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
    DXGI_FORMAT_R10G10B10A2_UNORM, DXGI_FORMAT_R16G16B16A16_FLOAT, DXGI_FORMAT_R8G8B8A8_UNORM,
    DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC,
};
use windows::Win32::Graphics::Dxgi::{
    IDXGIAdapter1, IDXGIFactory2, IDXGISwapChain1, IDXGISwapChain3, DXGI_PRESENT,
    DXGI_SCALING_NONE, DXGI_SWAP_CHAIN_DESC1, DXGI_SWAP_CHAIN_FLAG, DXGI_SWAP_EFFECT_FLIP_DISCARD,
    DXGI_USAGE_RENDER_TARGET_OUTPUT,
};

use interop_core::device::{AdapterInfo, SelectedDevice};
use interop_core::hdr::OutputLuminance;
use interop_core::swapchain::{PresentOutcome, SwapchainDescriptor};
use interop_core::{
    ColorFormat, ColorSpace, CompositorBackend, Extent, InteropConfig, InteropError, NativeCode,
    RawSurface,
};

use super::wgl::WglInteropFunctions;
use super::{device, hdr, hr_error};
use crate::gl_ext;

/// Flip-model swapchains accept no sRGB formats; the sRGB variants present
/// through their UNORM counterpart.
fn dxgi_format(format: ColorFormat) -> DXGI_FORMAT {
    match format {
        ColorFormat::Rgba8Unorm | ColorFormat::Rgba8Srgb => DXGI_FORMAT_R8G8B8A8_UNORM,
        ColorFormat::Bgra8Unorm | ColorFormat::Bgra8Srgb => DXGI_FORMAT_B8G8R8A8_UNORM,
        ColorFormat::Rgb10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        ColorFormat::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
    }
}

fn dxgi_color_space(space: ColorSpace) -> Option<DXGI_COLOR_SPACE_TYPE> {
    match space {
        ColorSpace::SrgbNonlinear => Some(DXGI_COLOR_SPACE_RGB_FULL_G22_NONE_P709),
        ColorSpace::ExtendedSrgbLinear => Some(DXGI_COLOR_SPACE_RGB_FULL_G10_NONE_P709),
        ColorSpace::Hdr10St2084 => Some(DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020),
        ColorSpace::DisplayP3Nonlinear => None,
    }
}

fn last_error() -> NativeCode {
    NativeCode::Win32(unsafe { GetLastError() }.0)
}

fn not_created(what: &str) -> InteropError {
    InteropError::native(format!("{what} has not been created"), NativeCode::None)
}

struct Targets {
    color: ID3D11Texture2D,
    color_view: ID3D11RenderTargetView,
    depth: Option<(ID3D11Texture2D, ID3D11DepthStencilView)>,
}

/// DXGI/D3D11 side of the compositor bridge. GL draws into the swapchain
/// back buffer through renderbuffers registered with WGL_NV_DX_interop2.
pub struct DxgiBackend {
    debug_layer: bool,
    clear_color: [f32; 4],
    factory: Option<IDXGIFactory2>,
    adapters: Vec<IDXGIAdapter1>,
    adapter: Option<IDXGIAdapter1>,
    device: Option<ID3D11Device>,
    context: Option<ID3D11DeviceContext>,
    swapchain: Option<IDXGISwapChain1>,
    extent: Extent,
    targets: Option<Targets>,
    wgl: Option<WglInteropFunctions>,
    interop_device: *mut GLvoid,
    framebuffer: GLuint,
    color_rbuf: GLuint,
    depth_rbuf: GLuint,
    /// Interop handles in lock order: color, then depth.
    registered: Vec<*mut GLvoid>,
}

impl DxgiBackend {
    pub fn new(config: &InteropConfig) -> Self {
        Self {
            debug_layer: config.validation,
            clear_color: config.clear_color,
            factory: None,
            adapters: Vec::new(),
            adapter: None,
            device: None,
            context: None,
            swapchain: None,
            extent: Extent::MIN,
            targets: None,
            wgl: None,
            interop_device: ptr::null_mut(),
            framebuffer: 0,
            color_rbuf: 0,
            depth_rbuf: 0,
            registered: Vec::new(),
        }
    }

    pub fn device(&self) -> Option<&ID3D11Device> {
        self.device.as_ref()
    }

    pub fn swapchain(&self) -> Option<&IDXGISwapChain1> {
        self.swapchain.as_ref()
    }

    fn parts(&self) -> Result<(&ID3D11Device, &ID3D11DeviceContext), InteropError> {
        match (&self.device, &self.context) {
            (Some(device), Some(context)) => Ok((device, context)),
            _ => Err(not_created("D3D11 device")),
        }
    }

    fn create_depth(
        device: &ID3D11Device,
        extent: Extent,
    ) -> Result<(ID3D11Texture2D, ID3D11DepthStencilView), InteropError> {
        let desc = D3D11_TEXTURE2D_DESC {
            Width: extent.width,
            Height: extent.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: DXGI_FORMAT_D32_FLOAT_S8X24_UINT,
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            Usage: D3D11_USAGE_DEFAULT,
            BindFlags: D3D11_BIND_DEPTH_STENCIL.0 as u32,
            CPUAccessFlags: 0,
            MiscFlags: 0,
        };
        let mut texture = None;
        unsafe { device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .map_err(|e| hr_error("ID3D11Device::CreateTexture2D(depth)", &e))?;
        let texture = texture.ok_or_else(|| not_created("depth texture"))?;

        let mut view = None;
        unsafe { device.CreateDepthStencilView(&texture, None, Some(&mut view)) }
            .map_err(|e| hr_error("ID3D11Device::CreateDepthStencilView", &e))?;
        let view = view.ok_or_else(|| not_created("depth-stencil view"))?;
        Ok((texture, view))
    }
}

impl Drop for DxgiBackend {
    fn drop(&mut self) {
        if self.device.is_some() || !self.interop_device.is_null() {
            self.destroy();
        }
    }
}

impl CompositorBackend for DxgiBackend {
    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError> {
        let factory = match &self.factory {
            Some(factory) => factory.clone(),
            None => {
                let factory = device::create_factory(self.debug_layer)?;
                self.factory = Some(factory.clone());
                factory
            }
        };
        device::enumerate(&factory, &mut self.adapters)
    }

    fn create_device(&mut self, selected: &SelectedDevice) -> Result<(), InteropError> {
        let adapter = self
            .adapters
            .get(selected.adapter_index as usize)
            .cloned()
            .ok_or_else(|| {
                InteropError::native(
                    format!("adapter {} was not enumerated", selected.adapter_index),
                    NativeCode::None,
                )
            })?;
        let (device, context) = device::create_device(&adapter, self.debug_layer)?;
        info!("compositor device on {}", selected.name);
        self.adapter = Some(adapter);
        self.device = Some(device);
        self.context = Some(context);
        Ok(())
    }

    fn create_swapchain(
        &mut self,
        surface: RawSurface,
        desc: &SwapchainDescriptor,
    ) -> Result<(), InteropError> {
        let RawSurface::Hwnd(hwnd) = surface else {
            return Err(InteropError::swapchain(
                "the compositor bridge presents to a window handle",
                NativeCode::None,
            ));
        };
        let factory = self.factory.clone().ok_or_else(|| not_created("DXGI factory"))?;
        let (device, _) = self.parts()?;

        let swap_desc = DXGI_SWAP_CHAIN_DESC1 {
            Width: desc.extent.width,
            Height: desc.extent.height,
            Format: dxgi_format(desc.format),
            SampleDesc: DXGI_SAMPLE_DESC {
                Count: 1,
                Quality: 0,
            },
            BufferUsage: DXGI_USAGE_RENDER_TARGET_OUTPUT,
            BufferCount: desc.image_count,
            Scaling: DXGI_SCALING_NONE,
            SwapEffect: DXGI_SWAP_EFFECT_FLIP_DISCARD,
            ..Default::default()
        };
        let swapchain = unsafe {
            factory.CreateSwapChainForHwnd(
                device,
                HWND(hwnd as *mut c_void),
                &swap_desc,
                None,
                None,
            )
        }
        .map_err(|e| {
            let err = hr_error("IDXGIFactory2::CreateSwapChainForHwnd", &e);
            InteropError::swapchain(err.to_string(), err.native_code())
        })?;

        match dxgi_color_space(desc.color_space) {
            Some(space) => match swapchain.cast::<IDXGISwapChain3>() {
                Ok(swapchain3) => {
                    if let Err(e) = unsafe { swapchain3.SetColorSpace1(space) } {
                        warn!("IDXGISwapChain3::SetColorSpace1 failed: {}", e.message());
                    }
                }
                Err(_) => debug!("IDXGISwapChain3 unavailable; keeping the default color space"),
            },
            None => warn!("{:?} has no DXGI color space; presenting as sRGB", desc.color_space),
        }

        info!(
            "DXGI swapchain {}x{} {:?}, {} buffers",
            desc.extent.width, desc.extent.height, desc.format, desc.image_count
        );
        self.extent = desc.extent;
        self.swapchain = Some(swapchain);
        Ok(())
    }

    fn open_interop(&mut self) -> Result<(), InteropError> {
        gl_ext::load_gl();
        let wgl = WglInteropFunctions::load().map_err(|e| {
            InteropError::native(format!("{e:#}"), NativeCode::None)
        })?;
        let (device, _) = self.parts()?;

        let interop_device = unsafe { wgl.open_device(device.as_raw()) };
        if interop_device.is_null() {
            return Err(InteropError::native(
                "wglDXOpenDeviceNV failed",
                last_error(),
            ));
        }

        let mut renderbuffers = [0; 2];
        unsafe {
            gl::GenFramebuffers(1, &mut self.framebuffer);
            gl::GenRenderbuffers(2, renderbuffers.as_mut_ptr());
        }
        [self.color_rbuf, self.depth_rbuf] = renderbuffers;
        debug!(
            "interop device {interop_device:p}, framebuffer {}, renderbuffers {:?}",
            self.framebuffer, renderbuffers
        );
        self.interop_device = interop_device;
        self.wgl = Some(wgl);
        Ok(())
    }

    fn create_targets(&mut self, extent: Extent, depth: bool) -> Result<(), InteropError> {
        let swapchain = self.swapchain.as_ref().ok_or_else(|| not_created("swapchain"))?;
        let (device, context) = self.parts()?;

        let color: ID3D11Texture2D = unsafe { swapchain.GetBuffer(0) }
            .map_err(|e| hr_error("IDXGISwapChain::GetBuffer", &e))?;
        let mut color_view = None;
        unsafe { device.CreateRenderTargetView(&color, None, Some(&mut color_view)) }
            .map_err(|e| hr_error("ID3D11Device::CreateRenderTargetView", &e))?;
        let color_view = color_view.ok_or_else(|| not_created("render target view"))?;

        let depth = if depth {
            Some(Self::create_depth(device, extent)?)
        } else {
            None
        };

        // Start from defined contents; GL may not touch every pixel.
        unsafe {
            context.ClearRenderTargetView(&color_view, &self.clear_color);
            if let Some((_, view)) = &depth {
                context.ClearDepthStencilView(
                    view,
                    (D3D11_CLEAR_DEPTH.0 | D3D11_CLEAR_STENCIL.0) as u32,
                    1.0,
                    0,
                );
            }
        }

        self.targets = Some(Targets {
            color,
            color_view,
            depth,
        });
        Ok(())
    }

    fn release_targets(&mut self) {
        self.targets = None;
    }

    fn resize_buffers(&mut self, extent: Extent) -> Result<(), InteropError> {
        let swapchain = self.swapchain.as_ref().ok_or_else(|| not_created("swapchain"))?;
        let (_, context) = self.parts()?;
        // Every outstanding reference to a back buffer must be gone first.
        unsafe {
            context.ClearState();
            context.Flush();
            swapchain.ResizeBuffers(
                0,
                extent.width,
                extent.height,
                DXGI_FORMAT_UNKNOWN,
                DXGI_SWAP_CHAIN_FLAG(0),
            )
        }
        .map_err(|e| hr_error("IDXGISwapChain::ResizeBuffers", &e))?;
        self.extent = extent;
        Ok(())
    }

    fn set_viewport(&mut self, extent: Extent) {
        self.extent = extent;
        let Some(context) = &self.context else {
            return;
        };
        let viewport = D3D11_VIEWPORT {
            TopLeftX: 0.0,
            TopLeftY: 0.0,
            Width: extent.width as f32,
            Height: extent.height as f32,
            MinDepth: 0.0,
            MaxDepth: 1.0,
        };
        unsafe { context.RSSetViewports(Some(&[viewport])) };
    }

    fn register_targets(&mut self) -> Result<(), InteropError> {
        let wgl = self.wgl.as_ref().ok_or_else(|| not_created("interop device"))?;
        let targets = self.targets.as_ref().ok_or_else(|| not_created("render targets"))?;
        if !self.registered.is_empty() {
            return Ok(());
        }

        let mut handles = Vec::with_capacity(2);
        let color = unsafe {
            wgl.register_renderbuffer(self.interop_device, targets.color.as_raw(), self.color_rbuf)
        };
        if color.is_null() {
            return Err(InteropError::native(
                "wglDXRegisterObjectNV(color) failed",
                last_error(),
            ));
        }
        handles.push(color);

        if let Some((texture, _)) = &targets.depth {
            let depth = unsafe {
                wgl.register_renderbuffer(self.interop_device, texture.as_raw(), self.depth_rbuf)
            };
            if depth.is_null() {
                let code = last_error();
                unsafe { wgl.unregister(self.interop_device, color) };
                return Err(InteropError::native(
                    "wglDXRegisterObjectNV(depth) failed",
                    code,
                ));
            }
            handles.push(depth);
        }

        if !unsafe { wgl.lock(self.interop_device, &mut handles) } {
            let code = last_error();
            for handle in &handles {
                unsafe { wgl.unregister(self.interop_device, *handle) };
            }
            return Err(InteropError::native("wglDXLockObjectsNV failed", code));
        }
        self.registered = handles;
        Ok(())
    }

    fn unregister_targets(&mut self) -> Result<(), InteropError> {
        if self.registered.is_empty() {
            return Ok(());
        }
        let wgl = self.wgl.as_ref().ok_or_else(|| not_created("interop device"))?;
        let mut handles = std::mem::take(&mut self.registered);

        let mut failure = None;
        if !unsafe { wgl.unlock(self.interop_device, &mut handles) } {
            failure = Some(InteropError::native(
                "wglDXUnlockObjectsNV failed",
                last_error(),
            ));
        }
        for handle in handles {
            if !unsafe { wgl.unregister(self.interop_device, handle) } && failure.is_none() {
                failure = Some(InteropError::native(
                    "wglDXUnregisterObjectNV failed",
                    last_error(),
                ));
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn bind_framebuffer(&mut self) -> Result<(), InteropError> {
        if self.registered.is_empty() {
            return Err(not_created("locked render targets"));
        }
        let has_depth = self.registered.len() > 1;
        gl_ext::clear_errors();
        let status = unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, self.framebuffer);
            gl::FramebufferRenderbuffer(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::RENDERBUFFER,
                self.color_rbuf,
            );
            if has_depth {
                gl::FramebufferRenderbuffer(
                    gl::FRAMEBUFFER,
                    gl::DEPTH_STENCIL_ATTACHMENT,
                    gl::RENDERBUFFER,
                    self.depth_rbuf,
                );
            }
            gl::Viewport(0, 0, self.extent.width as i32, self.extent.height as i32);
            gl::CheckFramebufferStatus(gl::FRAMEBUFFER)
        };
        if status != gl::FRAMEBUFFER_COMPLETE {
            return Err(InteropError::native(
                format!("interop framebuffer incomplete ({status:#x})"),
                NativeCode::Gl(status),
            ));
        }
        if let Some(code) = gl_ext::take_error() {
            return Err(InteropError::native("binding the interop framebuffer", code));
        }
        Ok(())
    }

    fn framebuffer(&self) -> GLuint {
        self.framebuffer
    }

    fn present(&mut self, sync_interval: u32) -> Result<PresentOutcome, InteropError> {
        let swapchain = self.swapchain.as_ref().ok_or_else(|| not_created("swapchain"))?;
        // DXGI_STATUS_OCCLUDED is a success code; the frame is simply not shown.
        unsafe { swapchain.Present(sync_interval, DXGI_PRESENT(0)) }
            .ok()
            .map_err(|e| hr_error("IDXGISwapChain::Present", &e))?;
        Ok(PresentOutcome::Presented)
    }

    fn output_luminance(&mut self, output_index: u32) -> Result<OutputLuminance, InteropError> {
        let adapter = self.adapter.as_ref().ok_or_else(|| not_created("adapter"))?;
        hdr::output_luminance(adapter, output_index)
    }

    fn destroy(&mut self) {
        if let Err(err) = self.unregister_targets() {
            warn!("unregister during destroy failed: {err}");
        }
        self.targets = None;

        if let Some(wgl) = self.wgl.take() {
            unsafe {
                gl::DeleteFramebuffers(1, &self.framebuffer);
                let renderbuffers = [self.color_rbuf, self.depth_rbuf];
                gl::DeleteRenderbuffers(2, renderbuffers.as_ptr());
                if !self.interop_device.is_null() && !wgl.close_device(self.interop_device) {
                    warn!("wglDXCloseDeviceNV failed ({})", last_error());
                }
            }
        }
        self.interop_device = ptr::null_mut();
        self.framebuffer = 0;
        self.color_rbuf = 0;
        self.depth_rbuf = 0;

        self.swapchain = None;
        if let Some(context) = self.context.take() {
            unsafe {
                context.ClearState();
                context.Flush();
            }
        }
        self.device = None;
        self.adapter = None;
        self.adapters.clear();
        self.factory = None;
        debug!("DXGI backend destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn srgb_formats_present_through_unorm() {
        assert_eq!(dxgi_format(ColorFormat::Bgra8Srgb), DXGI_FORMAT_B8G8R8A8_UNORM);
        assert_eq!(dxgi_format(ColorFormat::Rgba8Srgb), DXGI_FORMAT_R8G8B8A8_UNORM);
        assert_eq!(dxgi_format(ColorFormat::Rgba16Float), DXGI_FORMAT_R16G16B16A16_FLOAT);
    }

    #[test]
    fn display_p3_has_no_swapchain_color_space() {
        assert_eq!(dxgi_color_space(ColorSpace::DisplayP3Nonlinear), None);
        assert_eq!(
            dxgi_color_space(ColorSpace::Hdr10St2084),
            Some(DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020)
        );
    }

    #[test]
    fn fresh_backend_has_nothing_to_unregister() {
        let mut backend = DxgiBackend::new(&InteropConfig::default());
        assert!(backend.unregister_targets().is_ok());
        assert_eq!(backend.framebuffer(), 0);
        assert!(backend.bind_framebuffer().is_err());
    }
}
