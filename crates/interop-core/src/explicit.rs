//! Frame bridge for an explicit low-level API (Vulkan).
//!
//! GL renders into an image owned by the low-level device. Per frame:
//!
//! 1. `on_loop`: wait the in-flight fence, acquire a presentable image, then
//!    on the GL side wait "ready", bind the shared framebuffer and clear it.
//! 2. The caller draws with GL.
//! 3. `swap_buffers`: GL signals "complete" and flushes; the low-level side
//!    copies (or blits) the shared image into the presentable image, submits
//!    waiting on {image acquired, complete} and signaling {render finished,
//!    ready}, then presents.
//!
//! Resize and format changes are deferred to the next `on_loop`, where the
//! swapchain is recreated and the shared resources re-bound before the frame
//! proceeds. A stale surface drops the current frame.

use std::time::Duration;

use gl::types::GLuint;
use tracing::{debug, error, info, warn};

use crate::binder::{SharedImageDesc, SharedResourceBackend, SharedResourceBinder, SharedResources};
use crate::bridge::{FrameBridge, FrameStatus, InitArgs, RawInstance, RawSurface};
use crate::config::InteropConfig;
use crate::device::{select_device, AdapterInfo, DeviceRequirements, SelectedDevice};
use crate::error::{InitStage, InteropError, NativeCode};
use crate::format::{ColorFormat, ColorSpace, Extent, HandoffKind, SurfaceFormat};
use crate::lifecycle::{BridgeState, Lifecycle};
use crate::swapchain::{
    AcquireOutcome, PresentOutcome, SwapchainBackend, SwapchainDescriptor, SwapchainManager,
    SwapchainRequest,
};
use crate::sync::{SyncLedger, SyncRole};

/// Native operations of the explicit bridge beyond swapchain and shared
/// resource management.
pub trait ExplicitBackend: SwapchainBackend + SharedResourceBackend + 'static {
    fn create_instance(&mut self, config: &InteropConfig) -> Result<RawInstance, InteropError>;

    /// No-op when validation is disabled or unavailable.
    fn create_debug_messenger(&mut self, config: &InteropConfig) -> Result<(), InteropError>;

    /// Take ownership of the surface created by the windowing layer.
    fn adopt_surface(&mut self, surface: RawSurface) -> Result<(), InteropError>;

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError>;

    fn device_requirements(&self) -> DeviceRequirements;

    fn create_device(&mut self, selected: &SelectedDevice) -> Result<(), InteropError>;

    /// Command pool and buffer, in-flight fence, acquire/render semaphores.
    fn create_frame_resources(&mut self) -> Result<(), InteropError>;

    /// `Ok(false)` on timeout.
    fn wait_frame_fence(&mut self, timeout: Duration) -> Result<bool, InteropError>;

    fn reset_frame_fence(&mut self) -> Result<(), InteropError>;

    /// GL-side wait on "ready".
    fn gl_wait_ready(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError>;

    /// Bind the shared framebuffer, set the viewport and clear.
    fn gl_begin_render(
        &mut self,
        shared: &SharedResources<Self>,
        clear_color: [f32; 4],
    ) -> Result<(), InteropError>;

    /// GL-side signal of "complete", then flush.
    fn gl_signal_complete(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError>;

    /// Record the layout transitions and the shared-to-presentable transfer.
    fn record_handoff(
        &mut self,
        image_index: u32,
        shared: &SharedResources<Self>,
        handoff: HandoffKind,
    ) -> Result<(), InteropError>;

    /// Submit waiting on {acquired, complete}, signaling {render finished,
    /// ready} and the in-flight fence.
    fn submit(&mut self, image_index: u32, shared: &SharedResources<Self>)
        -> Result<(), InteropError>;

    /// `Err(PresentStale)` when the surface is out of date.
    fn present(&mut self, image_index: u32) -> Result<PresentOutcome, InteropError>;

    fn destroy_frame_resources(&mut self);
    fn destroy_device(&mut self);
    fn destroy_surface(&mut self);
    /// Also destroys the debug messenger.
    fn destroy_instance(&mut self);
}

/// Native objects created so far, for teardown after a partial init.
#[derive(Debug, Default, Clone, Copy)]
struct Created {
    instance: bool,
    surface: bool,
    device: bool,
    frame_resources: bool,
}

/// Per-submission scratch.
#[derive(Debug, Clone, Copy)]
struct FrameState {
    image_index: u32,
    generation: u64,
}

pub struct ExplicitBridge<B: ExplicitBackend> {
    backend: B,
    config: InteropConfig,
    lifecycle: Lifecycle,
    swapchain: SwapchainManager,
    binder: SharedResourceBinder<B>,
    ledger: SyncLedger,
    created: Created,
    extent: Extent,
    format: SurfaceFormat,
    pending_resize: Option<Extent>,
    pending_format: Option<SurfaceFormat>,
    recreating: bool,
    frame: Option<FrameState>,
    transient_failures: u32,
    last_transient: Option<InteropError>,
}

impl<B: ExplicitBackend> ExplicitBridge<B> {
    pub fn new(backend: B, config: InteropConfig) -> Self {
        Self {
            backend,
            format: config.output_format,
            config,
            lifecycle: Lifecycle::new(),
            swapchain: SwapchainManager::new(),
            binder: SharedResourceBinder::new(),
            ledger: SyncLedger::new(),
            created: Created::default(),
            extent: Extent::MIN,
            pending_resize: None,
            pending_format: None,
            recreating: false,
            frame: None,
            transient_failures: 0,
            last_transient: None,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &InteropConfig {
        &self.config
    }

    pub fn ledger(&self) -> &SyncLedger {
        &self.ledger
    }

    pub fn swapchain(&self) -> Option<&SwapchainDescriptor> {
        self.swapchain.descriptor()
    }

    /// Completed swapchain recreations.
    pub fn recreations(&self) -> u64 {
        self.swapchain.recreations()
    }

    pub fn shared(&self) -> Option<&SharedResources<B>> {
        self.binder.bound()
    }

    /// Generation of the bound shared resources.
    pub fn shared_generation(&self) -> u64 {
        self.binder.generation()
    }

    /// The most recent dropped-frame cause.
    pub fn last_transient(&self) -> Option<&InteropError> {
        self.last_transient.as_ref()
    }

    pub fn has_pending_recreation(&self) -> bool {
        self.pending_resize.is_some() || self.pending_format.is_some()
    }

    /// Request a different presentable format. Applied on the next frame.
    pub fn set_format(&mut self, format: ColorFormat, color_space: ColorSpace) {
        let wanted = SurfaceFormat {
            format,
            color_space,
        };
        if self.pending_format.is_none() && wanted == self.format {
            return;
        }
        debug!("format change to {} / {color_space:?} pending", format.name());
        self.pending_format = Some(wanted);
    }

    fn request(&self) -> SwapchainRequest {
        SwapchainRequest {
            extent: self.extent,
            format: self.format,
            present_mode: self.config.present_mode,
        }
    }

    fn init_stages(&mut self, args: InitArgs) -> Result<(), InteropError> {
        let InitArgs {
            adapter_index,
            extent,
            mut surface,
        } = args;

        let instance = self
            .backend
            .create_instance(&self.config)
            .map_err(|e| e.at_stage(InitStage::Instance))?;
        self.created.instance = true;

        self.backend
            .create_debug_messenger(&self.config)
            .map_err(|e| e.at_stage(InitStage::DebugMessenger))?;

        let raw_surface = surface.create_surface(instance).map_err(|e| {
            InteropError::native(format!("surface callback failed: {e:#}"), NativeCode::None)
                .at_stage(InitStage::Surface)
        })?;
        self.backend
            .adopt_surface(raw_surface)
            .map_err(|e| e.at_stage(InitStage::Surface))?;
        self.created.surface = true;

        let mut adapters = self
            .backend
            .enumerate_adapters()
            .map_err(|e| e.at_stage(InitStage::DeviceSelection))?;
        if let Some(index) = adapter_index {
            adapters.retain(|adapter| adapter.index == index);
        }
        let selected = select_device(&adapters, &self.backend.device_requirements())
            .map_err(|e| e.at_stage(InitStage::DeviceSelection))?;

        self.backend
            .create_device(&selected)
            .map_err(|e| e.at_stage(InitStage::Device))?;
        self.created.device = true;

        self.extent = extent.clamped();
        let request = self.request();
        self.swapchain
            .create(&mut self.backend, &request)
            .map_err(|e| e.at_stage(InitStage::Swapchain))?;

        self.backend
            .create_frame_resources()
            .map_err(|e| e.at_stage(InitStage::FrameResources))?;
        self.created.frame_resources = true;

        self.bind_shared()
            .map_err(|e| e.at_stage(InitStage::SharedResources))?;

        Ok(())
    }

    /// Bind fresh shared resources at the swapchain's extent and format and
    /// prime them. Presentable formats GL cannot import fall back to the
    /// configured shared format.
    fn bind_shared(&mut self) -> Result<(), InteropError> {
        let (extent, presentable) = self
            .swapchain
            .descriptor()
            .map(|desc| (desc.extent, desc.format))
            .unwrap_or((self.extent, self.format.format));
        let format = if presentable.is_shareable() {
            presentable
        } else {
            self.config.shared_format
        };
        let desc = SharedImageDesc { extent, format };
        self.ledger.rebind();
        self.binder.bind(&mut self.backend, desc)?;
        self.ledger.prime(SyncRole::Ready)
    }

    /// Recreate the swapchain and re-bind the shared resources. Frames are
    /// synchronous, so at most one recreation is ever in flight.
    fn recreate(&mut self) -> Result<(), InteropError> {
        if self.recreating {
            return Ok(());
        }
        self.recreating = true;
        let result = self.recreate_inner();
        self.recreating = false;
        if let Err(err) = &result {
            error!("swapchain recreation failed: {err} ({})", err.native_code());
        }
        result
    }

    fn recreate_inner(&mut self) -> Result<(), InteropError> {
        self.lifecycle.transition("recreate", BridgeState::Resizing)?;
        if let Some(extent) = self.pending_resize.take() {
            self.extent = extent;
        }
        if let Some(format) = self.pending_format.take() {
            self.format = format;
        }
        self.frame = None;

        let request = self.request();
        let change = self.swapchain.recreate(&mut self.backend, &request)?;
        self.bind_shared()?;

        self.lifecycle.transition("recreate", BridgeState::Ready)?;
        info!(
            "bridge recreated at {}x{} (extent changed: {}, format changed: {}), shared generation {}",
            self.extent.width,
            self.extent.height,
            change.extent_changed,
            change.format_changed,
            self.binder.generation()
        );
        Ok(())
    }

    /// Record a transient failure and drop the frame, unless the session has
    /// dropped too many in a row.
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

    fn fatal(&self, op: &str, err: InteropError) -> InteropError {
        error!("{op} failed: {err} ({})", err.native_code());
        err
    }

    fn begin_frame(&mut self) -> Result<FrameStatus, InteropError> {
        if self.has_pending_recreation() {
            self.recreate()?;
        }

        match self.backend.wait_frame_fence(self.config.fence_timeout) {
            Ok(true) => {}
            Ok(false) => {
                return self.drop_frame(InteropError::acquire(
                    "in-flight fence wait timed out",
                    NativeCode::None,
                ))
            }
            Err(err) if err.is_transient() => return self.drop_frame(err),
            Err(err) => return Err(self.fatal("fence wait", err)),
        }

        let image_index = match self
            .swapchain
            .acquire_next(&mut self.backend, self.config.acquire_timeout)
        {
            Ok(AcquireOutcome::Image(index)) => index,
            Ok(AcquireOutcome::OutOfDate) => {
                let status = self.drop_frame(InteropError::PresentStale)?;
                self.recreate()?;
                return Ok(status);
            }
            Ok(AcquireOutcome::Timeout) => {
                return self.drop_frame(InteropError::acquire(
                    "swapchain image acquire timed out",
                    NativeCode::None,
                ))
            }
            Err(err) if err.is_transient() => return self.drop_frame(err),
            Err(err) => return Err(self.fatal("acquire", err)),
        };

        self.backend
            .reset_frame_fence()
            .map_err(|e| self.fatal("fence reset", e))?;

        let Some(shared) = self.binder.bound() else {
            return Err(InteropError::InvalidState {
                op: "on_loop",
                state: self.lifecycle.state(),
            });
        };
        let generation = shared.generation;

        self.lifecycle
            .transition("on_loop", BridgeState::RenderingFrame)?;
        self.ledger.wait(SyncRole::Ready)?;
        self.backend.gl_wait_ready(shared)?;
        self.backend.gl_begin_render(shared, self.config.clear_color)?;

        self.frame = Some(FrameState {
            image_index,
            generation,
        });
        Ok(FrameStatus::Ready)
    }

    fn end_frame(&mut self, frame: FrameState) -> Result<FrameStatus, InteropError> {
        let (Some(shared), Some(desc)) = (self.binder.bound(), self.swapchain.descriptor()) else {
            return Err(InteropError::InvalidState {
                op: "swap_buffers",
                state: self.lifecycle.state(),
            });
        };
        if shared.generation != frame.generation {
            return Err(InteropError::native(
                "shared resources changed during the frame",
                NativeCode::None,
            ));
        }
        let handoff = HandoffKind::between(shared.desc.format, desc.format);

        self.ledger.signal(SyncRole::Complete)?;
        self.backend.gl_signal_complete(shared)?;

        self.backend
            .record_handoff(frame.image_index, shared, handoff)?;

        self.ledger.wait(SyncRole::Complete)?;
        self.ledger.signal(SyncRole::Ready)?;
        self.backend.submit(frame.image_index, shared)?;

        self.lifecycle
            .transition("swap_buffers", BridgeState::Presenting)?;

        let outcome = self.backend.present(frame.image_index);
        self.lifecycle
            .transition("swap_buffers", BridgeState::Ready)?;

        match outcome {
            Ok(PresentOutcome::Presented) if !self.has_pending_recreation() => {
                self.transient_failures = 0;
                Ok(FrameStatus::Ready)
            }
            Ok(_) => {
                // Suboptimal, or a resize/format change arrived mid-frame.
                self.transient_failures = 0;
                self.recreate()?;
                Ok(FrameStatus::Skipped)
            }
            Err(err) if err.is_transient() => {
                let status = self.drop_frame(err)?;
                self.recreate()?;
                Ok(status)
            }
            Err(err) => Err(err),
        }
    }

    /// Release native objects in reverse creation order.
    fn release_all(&mut self) {
        if self.created.device {
            if let Err(err) = self.backend.wait_idle() {
                warn!("wait idle before teardown failed: {err}");
            }
        }
        self.frame = None;
        self.binder.unbind(&mut self.backend);
        self.swapchain.destroy(&mut self.backend);
        if std::mem::take(&mut self.created.frame_resources) {
            self.backend.destroy_frame_resources();
        }
        if std::mem::take(&mut self.created.device) {
            self.backend.destroy_device();
        }
        if std::mem::take(&mut self.created.surface) {
            self.backend.destroy_surface();
        }
        if std::mem::take(&mut self.created.instance) {
            self.backend.destroy_instance();
        }
    }
}

impl<B: ExplicitBackend> FrameBridge for ExplicitBridge<B> {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn on_init(&mut self, args: InitArgs) -> Result<(), InteropError> {
        self.lifecycle
            .expect("on_init", &[BridgeState::Uninitialized])?;
        debug!("initializing explicit bridge: {args:?}");

        if let Err(err) = self.init_stages(args) {
            error!("explicit bridge init failed: {err} ({})", err.native_code());
            self.release_all();
            return Err(err);
        }

        self.lifecycle.transition("on_init", BridgeState::Ready)?;
        info!(
            "explicit bridge ready at {}x{}",
            self.extent.width, self.extent.height
        );
        Ok(())
    }

    fn on_resize(&mut self, width: u32, height: u32) -> Result<(), InteropError> {
        if matches!(
            self.lifecycle.state(),
            BridgeState::Uninitialized | BridgeState::Destroyed
        ) {
            return Err(InteropError::InvalidState {
                op: "on_resize",
                state: self.lifecycle.state(),
            });
        }

        let extent = Extent::new(width, height).clamped();
        let unchanged = match self.pending_resize {
            Some(pending) => pending == extent,
            None => extent == self.extent,
        };
        if unchanged {
            return Ok(());
        }
        debug!("resize to {}x{} pending", extent.width, extent.height);
        self.pending_resize = Some(extent);
        Ok(())
    }

    fn on_destroy(&mut self) {
        if self.lifecycle.is_destroyed() {
            return;
        }
        self.release_all();
        self.lifecycle.destroy();
        info!("explicit bridge destroyed");
    }

    fn on_loop(&mut self) -> Result<FrameStatus, InteropError> {
        self.lifecycle.expect("on_loop", &[BridgeState::Ready])?;
        self.begin_frame()
    }

    fn swap_buffers(&mut self) -> Result<FrameStatus, InteropError> {
        match self.lifecycle.state() {
            BridgeState::RenderingFrame => {}
            BridgeState::Ready if self.frame.is_none() => return Ok(FrameStatus::Skipped),
            state => {
                return Err(InteropError::InvalidState {
                    op: "swap_buffers",
                    state,
                })
            }
        }
        let Some(frame) = self.frame.take() else {
            return Err(InteropError::InvalidState {
                op: "swap_buffers",
                state: self.lifecycle.state(),
            });
        };
        self.end_frame(frame).map_err(|err| {
            if !err.is_transient() {
                error!("swap_buffers failed: {err} ({})", err.native_code());
            }
            err
        })
    }

    fn framebuffer(&self) -> GLuint {
        self.binder
            .bound()
            .map(|shared| self.backend.framebuffer_name(&shared.target))
            .unwrap_or(0)
    }

    fn state(&self) -> BridgeState {
        self.lifecycle.state()
    }

    fn extent(&self) -> Extent {
        self.extent
    }
}

impl<B: ExplicitBackend> Drop for ExplicitBridge<B> {
    fn drop(&mut self) {
        self.on_destroy();
    }
}
