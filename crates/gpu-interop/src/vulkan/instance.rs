//! Instance creation, validation layers and the debug messenger.

use std::ffi::{c_char, c_void, CStr};

use ash::vk;
use tracing::{debug, error, info, trace, warn};

use interop_core::{InteropConfig, InteropError, NativeCode};

use super::VkResultExt;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Surface extensions enabled when the loader reports them.
const SURFACE_EXTENSIONS: &[&CStr] = &[
    ash::khr::win32_surface::NAME,
    ash::khr::xlib_surface::NAME,
    ash::khr::xcb_surface::NAME,
    ash::khr::wayland_surface::NAME,
    ash::khr::android_surface::NAME,
];

pub(super) struct InstanceContext {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub surface_fn: ash::khr::surface::Instance,
    pub debug_utils: Option<ash::ext::debug_utils::Instance>,
    pub messenger: vk::DebugUtilsMessengerEXT,
}

impl InstanceContext {
    pub fn create(config: &InteropConfig) -> Result<Self, InteropError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|err| {
            error!("Vulkan loader unavailable: {err}");
            InteropError::native(format!("Vulkan loader unavailable: {err}"), NativeCode::None)
        })?;

        let available: Vec<vk::ExtensionProperties> =
            unsafe { entry.enumerate_instance_extension_properties(None) }
                .or_vk("vkEnumerateInstanceExtensionProperties")?;
        let has_extension = |name: &CStr| {
            available
                .iter()
                .any(|ext| ext.extension_name_as_c_str() == Ok(name))
        };

        if !has_extension(ash::khr::surface::NAME) {
            return Err(InteropError::native(
                "VK_KHR_surface is not available",
                NativeCode::None,
            ));
        }
        let mut extensions: Vec<*const c_char> = vec![ash::khr::surface::NAME.as_ptr()];
        extensions.extend(
            SURFACE_EXTENSIONS
                .iter()
                .filter(|name| has_extension(name))
                .map(|name| name.as_ptr()),
        );

        let validation = config.validation && validation_layer_present(&entry);
        if config.validation && !validation {
            warn!("validation requested but VK_LAYER_KHRONOS_validation is not installed");
        }
        let debug_utils = validation && has_extension(ash::ext::debug_utils::NAME);
        if debug_utils {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }
        let layers: Vec<*const c_char> = if validation {
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            Vec::new()
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"gpu-interop")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"gpu-interop")
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance =
            unsafe { entry.create_instance(&create_info, None) }.or_vk("vkCreateInstance")?;
        let surface_fn = ash::khr::surface::Instance::new(&entry, &instance);
        let debug_utils =
            debug_utils.then(|| ash::ext::debug_utils::Instance::new(&entry, &instance));

        info!(
            "Vulkan instance created ({} extensions, validation: {validation})",
            extensions.len()
        );
        Ok(Self {
            entry,
            instance,
            surface_fn,
            debug_utils,
            messenger: vk::DebugUtilsMessengerEXT::null(),
        })
    }

    pub fn create_messenger(&mut self) -> Result<(), InteropError> {
        let Some(debug_utils) = &self.debug_utils else {
            return Ok(());
        };
        let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));
        self.messenger = unsafe { debug_utils.create_debug_utils_messenger(&info, None) }
            .or_vk("vkCreateDebugUtilsMessengerEXT")?;
        debug!("debug messenger installed");
        Ok(())
    }

    /// `vkGetInstanceProcAddr` as an integer, for the surface provider.
    pub fn get_instance_proc_addr(&self) -> usize {
        self.entry.static_fn().get_instance_proc_addr as usize
    }

    pub fn destroy(self) {
        unsafe {
            if let Some(debug_utils) = &self.debug_utils {
                if self.messenger != vk::DebugUtilsMessengerEXT::null() {
                    debug_utils.destroy_debug_utils_messenger(self.messenger, None);
                }
            }
            self.instance.destroy_instance(None);
        }
        debug!("Vulkan instance destroyed");
    }
}

fn validation_layer_present(entry: &ash::Entry) -> bool {
    unsafe { entry.enumerate_instance_layer_properties() }
        .map(|layers| {
            layers
                .iter()
                .any(|layer| layer.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
        })
        .unwrap_or(false)
}

/// Forward validation messages to `tracing` at the matching level.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!(target: "vulkan", "[{types:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!(target: "vulkan", "[{types:?}] {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!(target: "vulkan", "[{types:?}] {message}");
    } else {
        trace!(target: "vulkan", "[{types:?}] {message}");
    }
    vk::FALSE
}
