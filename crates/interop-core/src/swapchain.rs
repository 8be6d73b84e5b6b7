//! Presentable image chain: descriptor policy and the recreation protocol.
//!
//! [`SwapchainManager`] does not own native objects. It drives a
//! [`SwapchainBackend`] through create / acquire / recreate / destroy and
//! enforces the teardown order: device idle, then per-image targets, then the
//! swapchain itself. Creating in the reverse order is a driver contract
//! violation on every API we target.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{InteropError, NativeCode};
use crate::format::{ColorFormat, ColorSpace, Extent, PresentMode, SurfaceFormat};

/// How presentable images are used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageUsage {
    pub color_attachment: bool,
    pub transfer_dst: bool,
}

impl ImageUsage {
    /// Cleared by a render pass, then written by the shared-image handoff.
    pub const RENDER_AND_COPY: ImageUsage = ImageUsage {
        color_attachment: true,
        transfer_dst: true,
    };
}

impl Default for ImageUsage {
    fn default() -> Self {
        Self::RENDER_AND_COPY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDescriptor {
    pub extent: Extent,
    /// At least 2.
    pub image_count: u32,
    pub format: ColorFormat,
    pub color_space: ColorSpace,
    pub present_mode: PresentMode,
    pub usage: ImageUsage,
}

impl SwapchainDescriptor {
    pub fn validate(&self) -> Result<(), InteropError> {
        if self.extent.is_empty() {
            return Err(InteropError::swapchain(
                format!("zero-sized extent {}x{}", self.extent.width, self.extent.height),
                NativeCode::None,
            ));
        }
        if self.image_count < 2 {
            return Err(InteropError::swapchain(
                format!("image count {} below 2", self.image_count),
                NativeCode::None,
            ));
        }
        Ok(())
    }

    pub fn surface_format(&self) -> SurfaceFormat {
        SurfaceFormat {
            format: self.format,
            color_space: self.color_space,
        }
    }
}

/// What the surface supports right now.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceCapabilities {
    /// `None` when the surface lets the swapchain decide.
    pub current_extent: Option<Extent>,
    pub min_extent: Extent,
    pub max_extent: Extent,
    pub min_image_count: u32,
    /// 0 means no upper bound.
    pub max_image_count: u32,
    pub formats: Vec<SurfaceFormat>,
    pub present_modes: Vec<PresentMode>,
}

/// What the caller asks for; resolved against [`SurfaceCapabilities`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapchainRequest {
    pub extent: Extent,
    pub format: SurfaceFormat,
    pub present_mode: PresentMode,
}

/// Exact (format, color space) match, else the first reported pair.
pub fn choose_surface_format(
    available: &[SurfaceFormat],
    wanted: SurfaceFormat,
) -> Option<SurfaceFormat> {
    if available.contains(&wanted) {
        return Some(wanted);
    }
    let fallback = available.first().copied()?;
    warn!(
        "surface format {} / {:?} unavailable, using {} / {:?}",
        wanted.format.name(),
        wanted.color_space,
        fallback.format.name(),
        fallback.color_space
    );
    Some(fallback)
}

/// Preferred mode when offered, otherwise FIFO (always supported).
pub fn choose_present_mode(available: &[PresentMode], preferred: PresentMode) -> PresentMode {
    if available.contains(&preferred) {
        preferred
    } else {
        if preferred != PresentMode::Fifo {
            debug!("present mode {preferred:?} unavailable, falling back to FIFO");
        }
        PresentMode::Fifo
    }
}

pub fn choose_extent(caps: &SurfaceCapabilities, requested: Extent) -> Extent {
    match caps.current_extent {
        Some(current) => current.clamped(),
        None => requested.clamp_to(caps.min_extent, caps.max_extent).clamped(),
    }
}

/// One more than the minimum, capped by the maximum, never below 2.
pub fn choose_image_count(caps: &SurfaceCapabilities) -> u32 {
    let mut count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count.max(2)
}

pub fn resolve_descriptor(
    caps: &SurfaceCapabilities,
    request: &SwapchainRequest,
) -> Result<SwapchainDescriptor, InteropError> {
    let format = choose_surface_format(&caps.formats, request.format).ok_or_else(|| {
        InteropError::swapchain("surface reports no formats", NativeCode::None)
    })?;
    if caps.present_modes.is_empty() {
        return Err(InteropError::swapchain(
            "surface reports no present modes",
            NativeCode::None,
        ));
    }

    let desc = SwapchainDescriptor {
        extent: choose_extent(caps, request.extent),
        image_count: choose_image_count(caps),
        format: format.format,
        color_space: format.color_space,
        present_mode: choose_present_mode(&caps.present_modes, request.present_mode),
        usage: ImageUsage::RENDER_AND_COPY,
    };
    desc.validate()?;
    Ok(desc)
}

/// Result of [`SwapchainManager::acquire_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Image(u32),
    /// Surface changed; the swapchain must be recreated before use.
    OutOfDate,
    Timeout,
}

/// Result of a present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
}

/// Native operations the manager sequences.
pub trait SwapchainBackend {
    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities, InteropError>;

    fn wait_idle(&mut self) -> Result<(), InteropError>;

    /// Create the swapchain object. Returns the number of images it really has.
    fn create_swapchain(&mut self, desc: &SwapchainDescriptor) -> Result<u32, InteropError>;

    fn destroy_swapchain(&mut self);

    /// Per-image views and framebuffers. `format_changed` means anything
    /// keyed on the old format (the render pass) must be rebuilt first.
    fn create_image_targets(
        &mut self,
        desc: &SwapchainDescriptor,
        format_changed: bool,
    ) -> Result<(), InteropError>;

    fn destroy_image_targets(&mut self);

    fn acquire_next_image(&mut self, timeout: Duration) -> Result<AcquireOutcome, InteropError>;
}

/// What a recreation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapchainChange {
    pub extent_changed: bool,
    pub format_changed: bool,
}

#[derive(Debug, Default)]
pub struct SwapchainManager {
    descriptor: Option<SwapchainDescriptor>,
    recreations: u64,
}

impl SwapchainManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn descriptor(&self) -> Option<&SwapchainDescriptor> {
        self.descriptor.as_ref()
    }

    /// Completed recreations since creation.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn create<B: SwapchainBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        request: &SwapchainRequest,
    ) -> Result<SwapchainDescriptor, InteropError> {
        self.build(backend, request, None)
    }

    pub fn acquire_next<B: SwapchainBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        timeout: Duration,
    ) -> Result<AcquireOutcome, InteropError> {
        if self.descriptor.is_none() {
            return Err(InteropError::native(
                "acquire without a swapchain",
                NativeCode::None,
            ));
        }
        backend.acquire_next_image(timeout)
    }

    /// Tear down and rebuild from `request`.
    pub fn recreate<B: SwapchainBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        request: &SwapchainRequest,
    ) -> Result<SwapchainChange, InteropError> {
        let previous = self.descriptor;
        backend.wait_idle()?;
        self.teardown(backend);

        let desc = self.build(backend, request, previous.as_ref())?;
        self.recreations += 1;

        let change = match previous {
            Some(prev) => SwapchainChange {
                extent_changed: prev.extent != desc.extent,
                format_changed: prev.surface_format() != desc.surface_format(),
            },
            None => SwapchainChange {
                extent_changed: true,
                format_changed: true,
            },
        };
        info!(
            "swapchain recreated at {}x{} {} ({change:?})",
            desc.extent.width,
            desc.extent.height,
            desc.format.name()
        );
        Ok(change)
    }

    /// Idempotent.
    pub fn destroy<B: SwapchainBackend + ?Sized>(&mut self, backend: &mut B) {
        self.teardown(backend);
    }

    fn teardown<B: SwapchainBackend + ?Sized>(&mut self, backend: &mut B) {
        if self.descriptor.take().is_some() {
            backend.destroy_image_targets();
            backend.destroy_swapchain();
        }
    }

    fn build<B: SwapchainBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        request: &SwapchainRequest,
        previous: Option<&SwapchainDescriptor>,
    ) -> Result<SwapchainDescriptor, InteropError> {
        let caps = backend.surface_capabilities()?;
        let desc = resolve_descriptor(&caps, request)?;

        let image_count = backend.create_swapchain(&desc)?;
        let format_changed = previous.is_none_or(|prev| prev.format != desc.format);
        if let Err(err) = backend.create_image_targets(&desc, format_changed) {
            backend.destroy_swapchain();
            return Err(err);
        }

        debug!(
            "swapchain {}x{}, {image_count} images, {:?}",
            desc.extent.width, desc.extent.height, desc.present_mode
        );
        self.descriptor = Some(desc);
        Ok(desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> SurfaceCapabilities {
        SurfaceCapabilities {
            current_extent: None,
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(4096, 4096),
            min_image_count: 2,
            max_image_count: 3,
            formats: vec![
                SurfaceFormat {
                    format: ColorFormat::Bgra8Unorm,
                    color_space: ColorSpace::SrgbNonlinear,
                },
                SurfaceFormat {
                    format: ColorFormat::Rgba16Float,
                    color_space: ColorSpace::ExtendedSrgbLinear,
                },
            ],
            present_modes: vec![PresentMode::Fifo, PresentMode::Immediate],
        }
    }

    fn request(format: ColorFormat, color_space: ColorSpace) -> SwapchainRequest {
        SwapchainRequest {
            extent: Extent::new(800, 600),
            format: SurfaceFormat {
                format,
                color_space,
            },
            present_mode: PresentMode::Mailbox,
        }
    }

    #[test]
    fn exact_format_is_preferred() {
        let desc = resolve_descriptor(
            &caps(),
            &request(ColorFormat::Rgba16Float, ColorSpace::ExtendedSrgbLinear),
        )
        .unwrap();
        assert_eq!(desc.format, ColorFormat::Rgba16Float);
        assert_eq!(desc.present_mode, PresentMode::Fifo);
        assert_eq!(desc.image_count, 3);
    }

    #[test]
    fn missing_format_falls_back_to_first() {
        let desc = resolve_descriptor(
            &caps(),
            &request(ColorFormat::Rgb10A2Unorm, ColorSpace::Hdr10St2084),
        )
        .unwrap();
        assert_eq!(desc.format, ColorFormat::Bgra8Unorm);
        assert_eq!(desc.color_space, ColorSpace::SrgbNonlinear);
    }

    #[test]
    fn no_formats_fails() {
        let mut c = caps();
        c.formats.clear();
        let err = resolve_descriptor(
            &c,
            &request(ColorFormat::Bgra8Unorm, ColorSpace::SrgbNonlinear),
        )
        .unwrap_err();
        assert!(matches!(err, InteropError::SwapchainCreateFailed { .. }));
    }

    #[test]
    fn current_extent_wins_and_zero_is_clamped() {
        let mut c = caps();
        c.current_extent = Some(Extent::new(0, 0));
        assert_eq!(choose_extent(&c, Extent::new(640, 480)), Extent::MIN);
        c.current_extent = None;
        assert_eq!(choose_extent(&c, Extent::new(0, 9000)), Extent::new(1, 4096));
    }

    #[test]
    fn image_count_policy() {
        let mut c = caps();
        c.min_image_count = 1;
        c.max_image_count = 0;
        assert_eq!(choose_image_count(&c), 2);
        c.min_image_count = 3;
        c.max_image_count = 3;
        assert_eq!(choose_image_count(&c), 3);
    }
}
