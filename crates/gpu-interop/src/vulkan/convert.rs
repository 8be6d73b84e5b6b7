//! Vulkan enum conversions.

use ash::vk;

use interop_core::device::AdapterKind;
use interop_core::probe::ExternalHandleType;
use interop_core::{ColorFormat, ColorSpace, Extent, PresentMode, SurfaceFormat};

pub fn vk_format(format: ColorFormat) -> vk::Format {
    match format {
        ColorFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        ColorFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
        ColorFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        ColorFormat::Bgra8Srgb => vk::Format::B8G8R8A8_SRGB,
        ColorFormat::Rgb10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        ColorFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
    }
}

pub fn color_format(format: vk::Format) -> Option<ColorFormat> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => ColorFormat::Rgba8Unorm,
        vk::Format::R8G8B8A8_SRGB => ColorFormat::Rgba8Srgb,
        vk::Format::B8G8R8A8_UNORM => ColorFormat::Bgra8Unorm,
        vk::Format::B8G8R8A8_SRGB => ColorFormat::Bgra8Srgb,
        vk::Format::A2B10G10R10_UNORM_PACK32 => ColorFormat::Rgb10A2Unorm,
        vk::Format::R16G16B16A16_SFLOAT => ColorFormat::Rgba16Float,
        _ => return None,
    })
}

pub fn vk_color_space(space: ColorSpace) -> vk::ColorSpaceKHR {
    match space {
        ColorSpace::SrgbNonlinear => vk::ColorSpaceKHR::SRGB_NONLINEAR,
        ColorSpace::ExtendedSrgbLinear => vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        ColorSpace::DisplayP3Nonlinear => vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT,
        ColorSpace::Hdr10St2084 => vk::ColorSpaceKHR::HDR10_ST2084_EXT,
    }
}

pub fn color_space(space: vk::ColorSpaceKHR) -> Option<ColorSpace> {
    Some(match space {
        vk::ColorSpaceKHR::SRGB_NONLINEAR => ColorSpace::SrgbNonlinear,
        vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT => ColorSpace::ExtendedSrgbLinear,
        vk::ColorSpaceKHR::DISPLAY_P3_NONLINEAR_EXT => ColorSpace::DisplayP3Nonlinear,
        vk::ColorSpaceKHR::HDR10_ST2084_EXT => ColorSpace::Hdr10St2084,
        _ => return None,
    })
}

/// Surface formats the bridge can name. Unknown pairs are dropped, keeping
/// the driver's order.
pub fn surface_formats(formats: &[vk::SurfaceFormatKHR]) -> Vec<SurfaceFormat> {
    formats
        .iter()
        .filter_map(|f| {
            Some(SurfaceFormat {
                format: color_format(f.format)?,
                color_space: color_space(f.color_space)?,
            })
        })
        .collect()
}

pub fn vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub fn present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    Some(match mode {
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::FIFO => PresentMode::Fifo,
        vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
        _ => return None,
    })
}

pub fn adapter_kind(ty: vk::PhysicalDeviceType) -> AdapterKind {
    match ty {
        vk::PhysicalDeviceType::DISCRETE_GPU => AdapterKind::Discrete,
        vk::PhysicalDeviceType::INTEGRATED_GPU => AdapterKind::Integrated,
        vk::PhysicalDeviceType::VIRTUAL_GPU => AdapterKind::Virtual,
        vk::PhysicalDeviceType::CPU => AdapterKind::Software,
        _ => AdapterKind::Other,
    }
}

pub fn extent(e: vk::Extent2D) -> Extent {
    Extent::new(e.width, e.height)
}

pub fn vk_extent(e: Extent) -> vk::Extent2D {
    vk::Extent2D {
        width: e.width,
        height: e.height,
    }
}

pub fn semaphore_handle_type(ty: ExternalHandleType) -> vk::ExternalSemaphoreHandleTypeFlags {
    match ty {
        ExternalHandleType::OpaqueFd => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_FD,
        ExternalHandleType::OpaqueWin32 => vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32,
        ExternalHandleType::OpaqueWin32Kmt => {
            vk::ExternalSemaphoreHandleTypeFlags::OPAQUE_WIN32_KMT
        }
        ExternalHandleType::D3d12Fence => vk::ExternalSemaphoreHandleTypeFlags::D3D12_FENCE,
        ExternalHandleType::SyncFd => vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD,
    }
}

/// `None` for semaphore-only handle types.
pub fn memory_handle_type(ty: ExternalHandleType) -> Option<vk::ExternalMemoryHandleTypeFlags> {
    match ty {
        ExternalHandleType::OpaqueFd => Some(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD),
        ExternalHandleType::OpaqueWin32 => Some(vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32),
        ExternalHandleType::OpaqueWin32Kmt => {
            Some(vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32_KMT)
        }
        ExternalHandleType::D3d12Fence | ExternalHandleType::SyncFd => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_color_format_maps_back() {
        for format in [
            ColorFormat::Rgba8Unorm,
            ColorFormat::Rgba8Srgb,
            ColorFormat::Bgra8Unorm,
            ColorFormat::Bgra8Srgb,
            ColorFormat::Rgb10A2Unorm,
            ColorFormat::Rgba16Float,
        ] {
            assert_eq!(color_format(vk_format(format)), Some(format));
        }
    }

    #[test]
    fn unknown_surface_formats_are_dropped_in_order() {
        let reported = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R5G6B5_UNORM_PACK16,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::R16G16B16A16_SFLOAT,
                color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
            },
        ];
        let formats = surface_formats(&reported);
        assert_eq!(formats.len(), 2);
        assert_eq!(formats[0].format, ColorFormat::Bgra8Unorm);
        assert_eq!(formats[1].color_space, ColorSpace::ExtendedSrgbLinear);
    }

    #[test]
    fn cpu_devices_are_software() {
        assert_eq!(adapter_kind(vk::PhysicalDeviceType::CPU), AdapterKind::Software);
        assert_eq!(
            adapter_kind(vk::PhysicalDeviceType::DISCRETE_GPU),
            AdapterKind::Discrete
        );
    }

    #[test]
    fn fence_handles_are_not_memory_handles() {
        assert!(memory_handle_type(ExternalHandleType::D3d12Fence).is_none());
        assert!(memory_handle_type(ExternalHandleType::SyncFd).is_none());
        assert_eq!(
            memory_handle_type(ExternalHandleType::OpaqueFd),
            Some(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD)
        );
    }
}
