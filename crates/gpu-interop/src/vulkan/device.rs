//! Physical adapter description and logical device creation.

use std::collections::BTreeSet;
use std::ffi::{c_char, CStr};

use ash::vk;
use tracing::{debug, info};

use interop_core::device::{AdapterInfo, QueueFamilyInfo, SelectedDevice};
use interop_core::{InteropError, NativeCode};

use super::convert::adapter_kind;
use super::instance::InstanceContext;
use super::VkResultExt;

/// Device extensions for exporting memory and semaphores to GL.
#[cfg(unix)]
pub(super) const EXTERNAL_EXTENSIONS: &[&CStr] = &[
    ash::khr::external_memory_fd::NAME,
    ash::khr::external_semaphore_fd::NAME,
];

#[cfg(windows)]
pub(super) const EXTERNAL_EXTENSIONS: &[&CStr] = &[
    ash::khr::external_memory_win32::NAME,
    ash::khr::external_semaphore_win32::NAME,
];

pub(super) fn required_extensions() -> Vec<&'static CStr> {
    let mut names = vec![ash::khr::swapchain::NAME];
    names.extend_from_slice(EXTERNAL_EXTENSIONS);
    names
}

/// Platform loaders for the external handle entry points.
pub(super) struct ExternalFns {
    #[cfg(unix)]
    pub memory_fd: ash::khr::external_memory_fd::Device,
    #[cfg(unix)]
    pub semaphore_fd: ash::khr::external_semaphore_fd::Device,
    #[cfg(windows)]
    pub memory_win32: ash::khr::external_memory_win32::Device,
    #[cfg(windows)]
    pub semaphore_win32: ash::khr::external_semaphore_win32::Device,
}

impl ExternalFns {
    fn load(instance: &ash::Instance, device: &ash::Device) -> Self {
        Self {
            #[cfg(unix)]
            memory_fd: ash::khr::external_memory_fd::Device::new(instance, device),
            #[cfg(unix)]
            semaphore_fd: ash::khr::external_semaphore_fd::Device::new(instance, device),
            #[cfg(windows)]
            memory_win32: ash::khr::external_memory_win32::Device::new(instance, device),
            #[cfg(windows)]
            semaphore_win32: ash::khr::external_semaphore_win32::Device::new(instance, device),
        }
    }
}

pub(super) struct DeviceContext {
    pub physical: vk::PhysicalDevice,
    pub device: ash::Device,
    pub graphics_family: u32,
    pub present_family: u32,
    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub swapchain_fn: ash::khr::swapchain::Device,
    pub external: ExternalFns,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Clear pass for presentable images; rebuilt when the format changes.
    pub render_pass: vk::RenderPass,
    pub render_pass_format: vk::Format,
}

/// Describe every physical device for the selector. `physical` receives the
/// handles in the same order.
pub(super) fn enumerate(
    ctx: &InstanceContext,
    surface: vk::SurfaceKHR,
    physical: &mut Vec<vk::PhysicalDevice>,
) -> Result<Vec<AdapterInfo>, InteropError> {
    let devices = unsafe { ctx.instance.enumerate_physical_devices() }
        .or_vk("vkEnumeratePhysicalDevices")?;
    physical.clear();

    let mut adapters = Vec::with_capacity(devices.len());
    for (index, &pd) in devices.iter().enumerate() {
        let props = unsafe { ctx.instance.get_physical_device_properties(pd) };
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let queue_families = unsafe {
            ctx.instance
                .get_physical_device_queue_family_properties(pd)
        }
        .iter()
        .enumerate()
        .map(|(i, family)| QueueFamilyInfo {
            index: i as u32,
            graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
            present: unsafe {
                ctx.surface_fn
                    .get_physical_device_surface_support(pd, i as u32, surface)
            }
            .unwrap_or(false),
        })
        .collect();

        let extensions: BTreeSet<String> =
            unsafe { ctx.instance.enumerate_device_extension_properties(pd) }
                .unwrap_or_default()
                .iter()
                .filter_map(|ext| ext.extension_name_as_c_str().ok())
                .map(|n| n.to_string_lossy().into_owned())
                .collect();

        let formats = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_formats(pd, surface)
        }
        .unwrap_or_default();
        let modes = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_present_modes(pd, surface)
        }
        .unwrap_or_default();

        debug!(
            "adapter {index}: {name} ({:?}, max 2D {})",
            props.device_type, props.limits.max_image_dimension2_d
        );
        adapters.push(AdapterInfo {
            index: index as u32,
            name,
            kind: adapter_kind(props.device_type),
            max_image_dimension_2d: props.limits.max_image_dimension2_d,
            queue_families,
            extensions,
            swapchain_supported: !formats.is_empty() && !modes.is_empty(),
        });
        physical.push(pd);
    }
    Ok(adapters)
}

impl DeviceContext {
    pub fn create(
        ctx: &InstanceContext,
        physical: vk::PhysicalDevice,
        selected: &SelectedDevice,
    ) -> Result<Self, InteropError> {
        let (Some(graphics_family), Some(present_family)) =
            (selected.queues.graphics, selected.queues.present)
        else {
            return Err(InteropError::native(
                format!("{} has no graphics/present queue pair", selected.name),
                NativeCode::None,
            ));
        };

        let priorities = [1.0f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = selected
            .queues
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();
        let extensions: Vec<*const c_char> =
            required_extensions().iter().map(|n| n.as_ptr()).collect();

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions);
        let device = unsafe { ctx.instance.create_device(physical, &create_info, None) }
            .or_vk("vkCreateDevice")?;

        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };
        let swapchain_fn = ash::khr::swapchain::Device::new(&ctx.instance, &device);
        let external = ExternalFns::load(&ctx.instance, &device);
        let memory_properties =
            unsafe { ctx.instance.get_physical_device_memory_properties(physical) };

        info!(
            "logical device created on {} (graphics family {graphics_family}, present family {present_family})",
            selected.name
        );
        Ok(Self {
            physical,
            device,
            graphics_family,
            present_family,
            graphics_queue,
            present_queue,
            swapchain_fn,
            external,
            memory_properties,
            render_pass: vk::RenderPass::null(),
            render_pass_format: vk::Format::UNDEFINED,
        })
    }

    /// Property flags of each reported memory type, in index order.
    pub fn memory_type_flags(&self) -> Vec<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties
            .memory_types
            .iter()
            .take(count)
            .map(|ty| ty.property_flags.as_raw())
            .collect()
    }

    pub fn destroy(self) {
        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                self.device.destroy_render_pass(self.render_pass, None);
            }
            self.device.destroy_device(None);
        }
        debug!("logical device destroyed");
    }
}
