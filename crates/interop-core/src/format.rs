//! Extents, pixel formats, color spaces and present modes shared by both
//! realizations.
//!
//! These are API-neutral; the native modules map them to `vk::Format`,
//! `DXGI_FORMAT` and GL internal formats.

use gl::types::GLenum;

/// Two-dimensional size in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    /// Smallest extent a swapchain or shared image is ever created with.
    pub const MIN: Extent = Extent {
        width: 1,
        height: 1,
    };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Either dimension is zero.
    pub fn is_empty(self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Raise each dimension to at least 1 (minimized windows report 0x0).
    pub fn clamped(self) -> Self {
        Self {
            width: self.width.max(1),
            height: self.height.max(1),
        }
    }

    /// Clamp into `[min, max]` per dimension.
    pub fn clamp_to(self, min: Extent, max: Extent) -> Self {
        Self {
            width: self.width.clamp(min.width, max.width.max(min.width)),
            height: self.height.clamp(min.height, max.height.max(min.height)),
        }
    }
}

impl From<(u32, u32)> for Extent {
    fn from((width, height): (u32, u32)) -> Self {
        Self { width, height }
    }
}

/// Color formats the bridges understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    Rgba8Unorm,
    Rgba8Srgb,
    Bgra8Unorm,
    Bgra8Srgb,
    Rgb10A2Unorm,
    Rgba16Float,
}

impl ColorFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            ColorFormat::Rgba16Float => 8,
            _ => 4,
        }
    }

    /// GL sized internal format with the same memory layout, if GL has one.
    ///
    /// BGRA layouts have no GL sized internal format, so they can be a
    /// presentable format but never the backing of a shared image.
    pub fn gl_internal_format(self) -> Option<GLenum> {
        match self {
            ColorFormat::Rgba8Unorm => Some(gl::RGBA8),
            ColorFormat::Rgba8Srgb => Some(gl::SRGB8_ALPHA8),
            ColorFormat::Rgb10A2Unorm => Some(gl::RGB10_A2),
            ColorFormat::Rgba16Float => Some(gl::RGBA16F),
            ColorFormat::Bgra8Unorm | ColorFormat::Bgra8Srgb => None,
        }
    }

    /// Usable as the backing format of a GL-imported shared image.
    pub fn is_shareable(self) -> bool {
        self.gl_internal_format().is_some()
    }

    pub fn name(self) -> &'static str {
        match self {
            ColorFormat::Rgba8Unorm => "RGBA8_UNORM",
            ColorFormat::Rgba8Srgb => "RGBA8_SRGB",
            ColorFormat::Bgra8Unorm => "BGRA8_UNORM",
            ColorFormat::Bgra8Srgb => "BGRA8_SRGB",
            ColorFormat::Rgb10A2Unorm => "RGB10A2_UNORM",
            ColorFormat::Rgba16Float => "RGBA16_SFLOAT",
        }
    }
}

/// Output color space of the presentable images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    SrgbNonlinear,
    ExtendedSrgbLinear,
    DisplayP3Nonlinear,
    Hdr10St2084,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// A (format, color space) pair reported by a presentation surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceFormat {
    pub format: ColorFormat,
    pub color_space: ColorSpace,
}

/// How the finished shared image reaches the presentable image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffKind {
    /// Raw texel copy; both images share one format.
    Copy,
    /// Format-converting blit at identical extent.
    Blit,
}

impl HandoffKind {
    pub fn between(shared: ColorFormat, presentable: ColorFormat) -> Self {
        if shared == presentable {
            HandoffKind::Copy
        } else {
            HandoffKind::Blit
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_extent_clamps_to_one() {
        assert_eq!(Extent::new(0, 0).clamped(), Extent::MIN);
        assert_eq!(Extent::new(0, 720).clamped(), Extent::new(1, 720));
        assert!(Extent::new(640, 0).is_empty());
    }

    #[test]
    fn clamp_to_surface_limits() {
        let min = Extent::new(16, 16);
        let max = Extent::new(4096, 2160);
        assert_eq!(Extent::new(8, 9000).clamp_to(min, max), Extent::new(16, 2160));
    }

    #[test]
    fn only_bgra_layouts_lack_a_gl_internal_format() {
        assert_eq!(ColorFormat::Rgba8Unorm.gl_internal_format(), Some(gl::RGBA8));
        assert_eq!(ColorFormat::Rgb10A2Unorm.gl_internal_format(), Some(gl::RGB10_A2));
        assert_eq!(ColorFormat::Rgba16Float.gl_internal_format(), Some(gl::RGBA16F));
        assert!(ColorFormat::Rgba8Srgb.is_shareable());
        assert!(!ColorFormat::Bgra8Unorm.is_shareable());
        assert!(!ColorFormat::Bgra8Srgb.is_shareable());
    }

    #[test]
    fn handoff_blits_only_on_format_mismatch() {
        assert_eq!(
            HandoffKind::between(ColorFormat::Rgba8Unorm, ColorFormat::Rgba8Unorm),
            HandoffKind::Copy
        );
        assert_eq!(
            HandoffKind::between(ColorFormat::Rgba8Unorm, ColorFormat::Bgra8Unorm),
            HandoffKind::Blit
        );
    }
}
