//! Common interface for GL-to-swapchain frame bridging.

use gl::types::GLuint;

use crate::error::InteropError;
use crate::format::Extent;
use crate::lifecycle::BridgeState;

/// Low-level API instance handed to the surface provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawInstance {
    /// `VkInstance` as its raw `u64` handle value, plus the loader's
    /// `vkGetInstanceProcAddr` so the provider can load surface entry points.
    Vulkan {
        instance: u64,
        get_instance_proc_addr: usize,
    },
    /// The compositor bridge has no instance object; the provider returns the
    /// window to present into.
    Dxgi,
}

/// Presentation target produced by the windowing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawSurface {
    /// `VkSurfaceKHR` raw handle. Ownership passes to the bridge.
    Vulkan(u64),
    /// `HWND`. Borrowed for the bridge's lifetime.
    Hwnd(isize),
}

/// Windowing-layer callback that creates the presentation surface.
pub trait SurfaceProvider {
    fn create_surface(&mut self, instance: RawInstance) -> anyhow::Result<RawSurface>;
}

impl<F> SurfaceProvider for F
where
    F: FnMut(RawInstance) -> anyhow::Result<RawSurface>,
{
    fn create_surface(&mut self, instance: RawInstance) -> anyhow::Result<RawSurface> {
        self(instance)
    }
}

/// Construction input for [`FrameBridge::on_init`].
pub struct InitArgs {
    /// Force a specific adapter (enumeration index). `None` picks the best.
    pub adapter_index: Option<u32>,
    pub extent: Extent,
    pub surface: Box<dyn SurfaceProvider>,
}

impl InitArgs {
    pub fn new(extent: Extent, surface: impl SurfaceProvider + 'static) -> Self {
        Self {
            adapter_index: None,
            extent,
            surface: Box::new(surface),
        }
    }

    pub fn with_adapter(mut self, index: u32) -> Self {
        self.adapter_index = Some(index);
        self
    }
}

impl std::fmt::Debug for InitArgs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitArgs")
            .field("adapter_index", &self.adapter_index)
            .field("extent", &self.extent)
            .finish_non_exhaustive()
    }
}

/// Outcome of a frame step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Proceed: draw after `on_loop`, content was presented after
    /// `swap_buffers`.
    Ready,
    /// The frame was dropped (timeout, stale surface, recreation). Skip
    /// drawing and presenting this tick.
    Skipped,
}

/// Turns GL draw calls into presented swapchain images, once per frame.
///
/// Call order per tick: `on_loop`, draw into [`framebuffer`](Self::framebuffer)
/// if it returned `Ready`, then `swap_buffers`. `on_resize` may be called at
/// any point between ticks.
pub trait FrameBridge {
    /// Downcast to the concrete bridge.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Mutable downcast to the concrete bridge.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    fn on_init(&mut self, args: InitArgs) -> Result<(), InteropError>;

    /// Zero dimensions are clamped to 1.
    fn on_resize(&mut self, width: u32, height: u32) -> Result<(), InteropError>;

    /// Release everything. Idempotent, and safe after a failed `on_init`.
    fn on_destroy(&mut self);

    /// Start a frame: acquire, apply pending recreation, bind the GL target.
    fn on_loop(&mut self) -> Result<FrameStatus, InteropError>;

    /// Finish a frame: hand the GL result over and present it. `Skipped`
    /// means a recreation happened and nothing stale was shown.
    fn swap_buffers(&mut self) -> Result<FrameStatus, InteropError>;

    /// GL framebuffer the caller draws into. 0 when none is bound.
    fn framebuffer(&self) -> GLuint;

    fn state(&self) -> BridgeState;

    fn extent(&self) -> Extent;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_surface_providers() {
        let mut calls = 0;
        let mut provider = |instance: RawInstance| {
            calls += 1;
            match instance {
                RawInstance::Dxgi => Ok(RawSurface::Hwnd(42)),
                RawInstance::Vulkan { .. } => anyhow::bail!("unexpected"),
            }
        };
        assert_eq!(
            provider.create_surface(RawInstance::Dxgi).unwrap(),
            RawSurface::Hwnd(42)
        );
        assert_eq!(calls, 1);
    }
}
