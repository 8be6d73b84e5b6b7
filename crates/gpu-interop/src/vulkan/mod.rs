//! Explicit bridge backend: Vulkan swapchain, GL_EXT_memory_object /
//! GL_EXT_semaphore for the shared image.

mod backend;
mod convert;
mod device;
mod instance;
mod shared;
mod swapchain;

pub use backend::VulkanBackend;

use ash::vk;
use tracing::error;

use interop_core::{InteropError, NativeCode};

/// Map a failed Vulkan call onto the bridge error, logging it with its code.
pub(crate) fn vk_error(call: &str, result: vk::Result) -> InteropError {
    let code = NativeCode::Vk(result.as_raw());
    error!("{call} failed: {result:?} ({code})");
    match result {
        vk::Result::ERROR_DEVICE_LOST | vk::Result::ERROR_SURFACE_LOST_KHR => {
            InteropError::DeviceLost { code }
        }
        _ => InteropError::native(format!("{call}: {result:?}"), code),
    }
}

pub(crate) trait VkResultExt<T> {
    fn or_vk(self, call: &str) -> Result<T, InteropError>;
}

impl<T> VkResultExt<T> for Result<T, vk::Result> {
    fn or_vk(self, call: &str) -> Result<T, InteropError> {
        self.map_err(|result| vk_error(call, result))
    }
}

/// Vulkan timeouts are nanoseconds in a `u64`.
pub(crate) fn timeout_ns(timeout: std::time::Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

/// Called before any device object exists.
pub(crate) fn not_created(what: &str) -> InteropError {
    InteropError::native(format!("{what} has not been created"), NativeCode::None)
}
