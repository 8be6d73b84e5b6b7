//! Frame bridge for a desktop compositor swapchain (DXGI flip model).
//!
//! GL renders straight into the swapchain back buffer: each frame the back
//! buffer (and optional depth-stencil buffer) is registered with GL as a
//! renderbuffer and locked, drawn into through a GL framebuffer, then
//! unlocked, unregistered and presented. Locking is the synchronization
//! point; there are no exported semaphores on this path.

use gl::types::GLuint;
use tracing::{debug, error, info, warn};

use crate::bridge::{FrameBridge, FrameStatus, InitArgs, RawInstance, RawSurface};
use crate::config::InteropConfig;
use crate::device::{select_device, AdapterInfo, DeviceRequirements, SelectedDevice};
use crate::error::{InitStage, InteropError, NativeCode};
use crate::format::Extent;
use crate::hdr::{HdrProperties, OutputLuminance, OutputQueryCache};
use crate::lifecycle::{BridgeState, Lifecycle};
use crate::swapchain::{ImageUsage, PresentOutcome, SwapchainDescriptor};

/// Flip-model swapchains always use two buffers here.
pub const COMPOSITOR_BUFFER_COUNT: u32 = 2;

/// Native operations of the compositor bridge.
pub trait CompositorBackend: 'static {
    /// Hardware and software adapters alike; software ones are flagged.
    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError>;

    fn create_device(&mut self, selected: &SelectedDevice) -> Result<(), InteropError>;

    fn create_swapchain(
        &mut self,
        surface: RawSurface,
        desc: &SwapchainDescriptor,
    ) -> Result<(), InteropError>;

    /// Open the GL interop device and create the GL framebuffer and
    /// renderbuffer names.
    fn open_interop(&mut self) -> Result<(), InteropError>;

    /// Back buffer view and, if `depth`, a depth-stencil texture and view.
    fn create_targets(&mut self, extent: Extent, depth: bool) -> Result<(), InteropError>;

    fn release_targets(&mut self);

    /// Clear device state and resize the swapchain buffers. Targets must be
    /// released first.
    fn resize_buffers(&mut self, extent: Extent) -> Result<(), InteropError>;

    fn set_viewport(&mut self, extent: Extent);

    /// Register the back buffer (and depth buffer) with GL and lock them.
    /// On failure nothing is left registered.
    fn register_targets(&mut self) -> Result<(), InteropError>;

    /// Unlock and unregister. No-op when nothing is registered.
    fn unregister_targets(&mut self) -> Result<(), InteropError>;

    /// Bind the GL framebuffer and attach the locked renderbuffers.
    fn bind_framebuffer(&mut self) -> Result<(), InteropError>;

    fn framebuffer(&self) -> GLuint;

    fn present(&mut self, sync_interval: u32) -> Result<PresentOutcome, InteropError>;

    /// Raw luminance data for an output of the selected adapter.
    fn output_luminance(&mut self, output_index: u32) -> Result<OutputLuminance, InteropError>;

    /// Close the interop device and release the swapchain and device.
    fn destroy(&mut self);
}

pub struct CompositorBridge<B: CompositorBackend> {
    backend: B,
    config: InteropConfig,
    lifecycle: Lifecycle,
    extent: Extent,
    pending_resize: Option<Extent>,
    created: bool,
    registered: bool,
    transient_failures: u32,
    last_transient: Option<InteropError>,
    registration_retries: u64,
    output_cache: OutputQueryCache,
}

impl<B: CompositorBackend> CompositorBridge<B> {
    pub fn new(backend: B, config: InteropConfig) -> Self {
        Self {
            backend,
            config,
            lifecycle: Lifecycle::new(),
            extent: Extent::MIN,
            pending_resize: None,
            created: false,
            registered: false,
            transient_failures: 0,
            last_transient: None,
            registration_retries: 0,
            output_cache: OutputQueryCache::default(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn last_transient(&self) -> Option<&InteropError> {
        self.last_transient.as_ref()
    }

    /// Registrations that succeeded only on the second attempt.
    pub fn registration_retries(&self) -> u64 {
        self.registration_retries
    }

    /// HDR capability of an output. `None` when the same output was already
    /// queried last time, or any platform query fails.
    pub fn hdr_properties(&mut self, output_index: u32) -> Option<HdrProperties> {
        if !self.output_cache.begin(output_index) {
            return None;
        }
        match self.backend.output_luminance(output_index) {
            Ok(raw) => HdrProperties::from_luminance(raw),
            Err(err) => {
                warn!("HDR query for output {output_index} failed: {err}");
                None
            }
        }
    }

    /// Re-bind the GL framebuffer (after the caller bound another one).
    pub fn bind(&mut self) -> Result<(), InteropError> {
        self.lifecycle.expect("bind", &[BridgeState::RenderingFrame])?;
        self.backend.bind_framebuffer()
    }

    fn descriptor(&self) -> SwapchainDescriptor {
        SwapchainDescriptor {
            extent: self.extent,
            image_count: COMPOSITOR_BUFFER_COUNT,
            format: self.config.output_format.format,
            color_space: self.config.output_format.color_space,
            present_mode: self.config.present_mode,
            usage: ImageUsage {
                color_attachment: true,
                transfer_dst: false,
            },
        }
    }

    fn init_stages(&mut self, args: InitArgs) -> Result<(), InteropError> {
        let InitArgs {
            adapter_index,
            extent,
            mut surface,
        } = args;
        self.created = true;

        let mut adapters = self
            .backend
            .enumerate_adapters()
            .map_err(|e| e.at_stage(InitStage::DeviceSelection))?;
        if let Some(index) = adapter_index {
            adapters.retain(|adapter| adapter.index == index);
        }
        let selected = select_device(&adapters, &DeviceRequirements::default())
            .map_err(|e| e.at_stage(InitStage::DeviceSelection))?;

        self.backend
            .create_device(&selected)
            .map_err(|e| e.at_stage(InitStage::Device))?;

        let raw_surface = surface.create_surface(RawInstance::Dxgi).map_err(|e| {
            InteropError::native(format!("surface callback failed: {e:#}"), NativeCode::None)
                .at_stage(InitStage::Surface)
        })?;

        self.extent = extent.clamped();
        let desc = self.descriptor();
        desc.validate()
            .map_err(|e| e.at_stage(InitStage::Swapchain))?;
        self.backend
            .create_swapchain(raw_surface, &desc)
            .map_err(|e| e.at_stage(InitStage::Swapchain))?;

        self.backend
            .open_interop()
            .map_err(|e| e.at_stage(InitStage::LegacyTargets))?;
        self.backend
            .create_targets(self.extent, self.config.depth_buffer)
            .map_err(|e| e.at_stage(InitStage::LegacyTargets))?;
        self.backend.set_viewport(self.extent);
        Ok(())
    }

    fn apply_resize(&mut self, extent: Extent) -> Result<(), InteropError> {
        self.lifecycle.transition("on_resize", BridgeState::Resizing)?;
        self.backend.release_targets();
        self.backend.resize_buffers(extent)?;
        self.extent = extent;
        self.backend.set_viewport(extent);
        self.backend.create_targets(extent, self.config.depth_buffer)?;
        self.lifecycle.transition("on_resize", BridgeState::Ready)?;
        info!("compositor swapchain resized to {}x{}", extent.width, extent.height);
        Ok(())
    }

    /// Register and lock, retrying once after a failure.
    fn register_with_retry(&mut self) -> Result<(), InteropError> {
        match self.backend.register_targets() {
            Ok(()) => Ok(()),
            Err(first) => {
                warn!("target registration failed, retrying once: {first}");
                if let Err(err) = self.backend.unregister_targets() {
                    debug!("unregister after failed registration: {err}");
                }
                match self.backend.register_targets() {
                    Ok(()) => {
                        self.registration_retries += 1;
                        Ok(())
                    }
                    Err(second) => Err(InteropError::acquire(
                        format!("target registration failed twice: {second}"),
                        second.native_code(),
                    )),
                }
            }
        }
    }

    fn drop_frame(&mut self, cause: InteropError) -> Result<FrameStatus, InteropError> {
        self.transient_failures += 1;
        warn!(
            "frame dropped ({} in a row): {cause}",
            self.transient_failures
        );
        self.last_transient = Some(cause);
        if self.transient_failures > self.config.max_transient_failures {
            error!(
                "giving up after {} consecutive dropped frames",
                self.transient_failures
            );
            return Err(InteropError::TooManyTransientFailures {
                count: self.transient_failures,
            });
        }
        Ok(FrameStatus::Skipped)
    }

    fn release_all(&mut self) {
        if self.registered {
            if let Err(err) = self.backend.unregister_targets() {
                warn!("unregister during teardown failed: {err}");
            }
            self.registered = false;
        }
        if std::mem::take(&mut self.created) {
            self.backend.release_targets();
            self.backend.destroy();
        }
    }
}

impl<B: CompositorBackend> FrameBridge for CompositorBridge<B> {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn on_init(&mut self, args: InitArgs) -> Result<(), InteropError> {
        self.lifecycle
            .expect("on_init", &[BridgeState::Uninitialized])?;
        debug!("initializing compositor bridge: {args:?}");

        if let Err(err) = self.init_stages(args) {
            error!("compositor bridge init failed: {err} ({})", err.native_code());
            self.release_all();
            return Err(err);
        }

        self.lifecycle.transition("on_init", BridgeState::Ready)?;
        info!(
            "compositor bridge ready at {}x{}",
            self.extent.width, self.extent.height
        );
        Ok(())
    }

    fn on_resize(&mut self, width: u32, height: u32) -> Result<(), InteropError> {
        let extent = Extent::new(width, height).clamped();
        match self.lifecycle.state() {
            BridgeState::Ready => {
                self.pending_resize = None;
                if extent == self.extent {
                    return Ok(());
                }
                self.apply_resize(extent).map_err(|err| {
                    error!("resize failed: {err} ({})", err.native_code());
                    err
                })
            }
            // Targets are locked mid-frame; apply at the next frame start.
            BridgeState::RenderingFrame | BridgeState::Presenting => {
                self.pending_resize = (extent != self.extent).then_some(extent);
                Ok(())
            }
            state => Err(InteropError::InvalidState {
                op: "on_resize",
                state,
            }),
        }
    }

    fn on_destroy(&mut self) {
        if self.lifecycle.is_destroyed() {
            return;
        }
        self.release_all();
        self.lifecycle.destroy();
        info!("compositor bridge destroyed");
    }

    fn on_loop(&mut self) -> Result<FrameStatus, InteropError> {
        self.lifecycle.expect("on_loop", &[BridgeState::Ready])?;

        if let Some(extent) = self.pending_resize.take() {
            self.apply_resize(extent)?;
        }

        if let Err(err) = self.register_with_retry() {
            return self.drop_frame(err);
        }
        self.registered = true;

        self.lifecycle
            .transition("on_loop", BridgeState::RenderingFrame)?;
        self.backend.bind_framebuffer()?;
        Ok(FrameStatus::Ready)
    }

    fn swap_buffers(&mut self) -> Result<FrameStatus, InteropError> {
        match self.lifecycle.state() {
            BridgeState::RenderingFrame => {}
            BridgeState::Ready if !self.registered => return Ok(FrameStatus::Skipped),
            state => {
                return Err(InteropError::InvalidState {
                    op: "swap_buffers",
                    state,
                })
            }
        }

        self.backend.unregister_targets()?;
        self.registered = false;

        self.lifecycle
            .transition("swap_buffers", BridgeState::Presenting)?;
        let outcome = self.backend.present(self.config.sync_interval);
        self.lifecycle
            .transition("swap_buffers", BridgeState::Ready)?;

        match outcome {
            Ok(_) => {
                self.transient_failures = 0;
                if let Some(extent) = self.pending_resize.take() {
                    self.apply_resize(extent)?;
                    return Ok(FrameStatus::Skipped);
                }
                Ok(FrameStatus::Ready)
            }
            Err(err) if err.is_transient() => self.drop_frame(err),
            Err(err) => {
                error!("present failed: {err} ({})", err.native_code());
                Err(err)
            }
        }
    }

    fn framebuffer(&self) -> GLuint {
        self.backend.framebuffer()
    }

    fn state(&self) -> BridgeState {
        self.lifecycle.state()
    }

    fn extent(&self) -> Extent {
        self.extent
    }
}

impl<B: CompositorBackend> Drop for CompositorBridge<B> {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
