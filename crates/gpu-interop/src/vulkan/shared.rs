//! Exportable Vulkan image and semaphores, imported into GL.

use ash::vk;
use gl::types::{GLenum, GLint, GLuint};
use tracing::{debug, warn};

use interop_core::binder::{
    select_memory_type, ExportedImage, SharedImageDesc, SharedResourceBackend, SharedResources,
    TextureInfo,
};
use interop_core::probe::{ExternalHandleProvider, ExternalHandleType, HandleSupport, NativeHandle};
use interop_core::{Extent, InteropError, NativeCode};

use super::backend::VulkanBackend;
use super::convert::{memory_handle_type, semaphore_handle_type, vk_format};
use super::device::DeviceContext;
use super::VkResultExt;
use crate::gl_ext::{self, gl_handle_type};

#[cfg(unix)]
const SEMAPHORE_CANDIDATES: &[ExternalHandleType] = &[ExternalHandleType::OpaqueFd];
#[cfg(unix)]
const MEMORY_CANDIDATES: &[ExternalHandleType] = &[ExternalHandleType::OpaqueFd];

#[cfg(windows)]
const SEMAPHORE_CANDIDATES: &[ExternalHandleType] = &[
    ExternalHandleType::OpaqueWin32,
    ExternalHandleType::OpaqueWin32Kmt,
    ExternalHandleType::D3d12Fence,
];
#[cfg(windows)]
const MEMORY_CANDIDATES: &[ExternalHandleType] = &[
    ExternalHandleType::OpaqueWin32,
    ExternalHandleType::OpaqueWin32Kmt,
];

/// GL renders into it, the handoff copies out of it.
const SHARED_USAGE: vk::ImageUsageFlags = vk::ImageUsageFlags::from_raw(
    vk::ImageUsageFlags::COLOR_ATTACHMENT.as_raw()
        | vk::ImageUsageFlags::TRANSFER_SRC.as_raw()
        | vk::ImageUsageFlags::SAMPLED.as_raw(),
);

/// The shared image and its dedicated allocation.
#[derive(Debug)]
pub struct SharedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

fn gl_failure(what: &str, code: NativeCode) -> InteropError {
    InteropError::native(format!("{what} failed"), code)
}

fn unsupported_type(ty: ExternalHandleType) -> InteropError {
    InteropError::native(
        format!("{ty:?} cannot be used on this platform"),
        NativeCode::None,
    )
}

#[cfg(unix)]
fn export_semaphore_handle(
    dev: &DeviceContext,
    semaphore: vk::Semaphore,
    ty: ExternalHandleType,
) -> Result<NativeHandle, InteropError> {
    if !ty.is_fd() {
        return Err(unsupported_type(ty));
    }
    let info = vk::SemaphoreGetFdInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(semaphore_handle_type(ty));
    let fd = unsafe { dev.external.semaphore_fd.get_semaphore_fd(&info) }
        .or_vk("vkGetSemaphoreFdKHR")?;
    Ok(NativeHandle::Fd(fd))
}

#[cfg(windows)]
fn export_semaphore_handle(
    dev: &DeviceContext,
    semaphore: vk::Semaphore,
    ty: ExternalHandleType,
) -> Result<NativeHandle, InteropError> {
    if ty.is_fd() {
        return Err(unsupported_type(ty));
    }
    let info = vk::SemaphoreGetWin32HandleInfoKHR::default()
        .semaphore(semaphore)
        .handle_type(semaphore_handle_type(ty));
    let handle = unsafe { dev.external.semaphore_win32.get_semaphore_win32_handle(&info) }
        .or_vk("vkGetSemaphoreWin32HandleKHR")?;
    Ok(NativeHandle::Win32(handle as isize))
}

#[cfg(unix)]
fn export_memory_handle(
    dev: &DeviceContext,
    memory: vk::DeviceMemory,
    flag: vk::ExternalMemoryHandleTypeFlags,
) -> Result<NativeHandle, InteropError> {
    let info = vk::MemoryGetFdInfoKHR::default()
        .memory(memory)
        .handle_type(flag);
    let fd = unsafe { dev.external.memory_fd.get_memory_fd(&info) }.or_vk("vkGetMemoryFdKHR")?;
    Ok(NativeHandle::Fd(fd))
}

#[cfg(windows)]
fn export_memory_handle(
    dev: &DeviceContext,
    memory: vk::DeviceMemory,
    flag: vk::ExternalMemoryHandleTypeFlags,
) -> Result<NativeHandle, InteropError> {
    let info = vk::MemoryGetWin32HandleInfoKHR::default()
        .memory(memory)
        .handle_type(flag);
    let handle = unsafe { dev.external.memory_win32.get_memory_win32_handle(&info) }
        .or_vk("vkGetMemoryWin32HandleKHR")?;
    Ok(NativeHandle::Win32(handle as isize))
}

impl ExternalHandleProvider for VulkanBackend {
    fn semaphore_candidates(&self) -> &[ExternalHandleType] {
        SEMAPHORE_CANDIDATES
    }

    fn memory_candidates(&self) -> &[ExternalHandleType] {
        MEMORY_CANDIDATES
    }
}

impl SharedResourceBackend for VulkanBackend {
    type Semaphore = vk::Semaphore;
    type Image = SharedImage;
    type MemoryObject = GLuint;
    type Texture = GLuint;
    type ImportedSemaphore = GLuint;
    type RenderTarget = GLuint;

    fn semaphore_support(&self, ty: ExternalHandleType) -> HandleSupport {
        let (Ok(ctx), Ok(dev), Ok(gl)) = (self.instance_ctx(), self.device_ctx(), self.gl_fns())
        else {
            return HandleSupport::default();
        };
        if !gl.can_import(ty) {
            return HandleSupport::default();
        }
        let flag = semaphore_handle_type(ty);
        let info = vk::PhysicalDeviceExternalSemaphoreInfo::default().handle_type(flag);
        let mut props = vk::ExternalSemaphoreProperties::default();
        unsafe {
            ctx.instance.get_physical_device_external_semaphore_properties(
                dev.physical,
                &info,
                &mut props,
            )
        };
        HandleSupport {
            exportable: props
                .external_semaphore_features
                .contains(vk::ExternalSemaphoreFeatureFlags::EXPORTABLE),
            compatible: props.compatible_handle_types.contains(flag),
        }
    }

    fn memory_support(&self, ty: ExternalHandleType, desc: &SharedImageDesc) -> HandleSupport {
        let (Ok(ctx), Ok(dev), Ok(gl)) = (self.instance_ctx(), self.device_ctx(), self.gl_fns())
        else {
            return HandleSupport::default();
        };
        let Some(flag) = memory_handle_type(ty) else {
            return HandleSupport::default();
        };
        if !gl.can_import(ty) {
            return HandleSupport::default();
        }

        let mut external_info =
            vk::PhysicalDeviceExternalImageFormatInfo::default().handle_type(flag);
        let info = vk::PhysicalDeviceImageFormatInfo2::default()
            .format(vk_format(desc.format))
            .ty(vk::ImageType::TYPE_2D)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(SHARED_USAGE)
            .push_next(&mut external_info);
        let mut external = vk::ExternalImageFormatProperties::default();
        let queried = {
            let mut props = vk::ImageFormatProperties2::default().push_next(&mut external);
            unsafe {
                ctx.instance.get_physical_device_image_format_properties2(
                    dev.physical,
                    &info,
                    &mut props,
                )
            }
        };
        if let Err(result) = queried {
            debug!("{ty:?} image format query: {result:?}");
            return HandleSupport::default();
        }

        let memory = external.external_memory_properties;
        HandleSupport {
            exportable: memory
                .external_memory_features
                .contains(vk::ExternalMemoryFeatureFlags::EXPORTABLE),
            compatible: memory.compatible_handle_types.contains(flag),
        }
    }

    fn create_export_semaphore(
        &mut self,
        ty: ExternalHandleType,
    ) -> Result<vk::Semaphore, InteropError> {
        let dev = self.device_ctx()?;
        let mut export =
            vk::ExportSemaphoreCreateInfo::default().handle_types(semaphore_handle_type(ty));
        let info = vk::SemaphoreCreateInfo::default().push_next(&mut export);
        unsafe { dev.device.create_semaphore(&info, None) }.or_vk("vkCreateSemaphore")
    }

    fn export_semaphore(
        &mut self,
        semaphore: &vk::Semaphore,
        ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError> {
        export_semaphore_handle(self.device_ctx()?, *semaphore, ty)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        if let Some(dev) = self.device.as_ref() {
            unsafe { dev.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn create_export_image(
        &mut self,
        desc: &SharedImageDesc,
        ty: ExternalHandleType,
    ) -> Result<ExportedImage<SharedImage>, InteropError> {
        let flag = memory_handle_type(ty).ok_or_else(|| unsupported_type(ty))?;
        let dev = self.device_ctx()?;
        let device = &dev.device;

        let mut external = vk::ExternalMemoryImageCreateInfo::default().handle_types(flag);
        let info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(SHARED_USAGE)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut external);
        let image = unsafe { device.create_image(&info, None) }.or_vk("vkCreateImage")?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let Some(type_index) = select_memory_type(
            requirements.memory_type_bits,
            &dev.memory_type_flags(),
            vk::MemoryPropertyFlags::DEVICE_LOCAL.as_raw(),
        ) else {
            unsafe { device.destroy_image(image, None) };
            return Err(InteropError::native(
                format!(
                    "no memory type in mask {:#x}",
                    requirements.memory_type_bits
                ),
                NativeCode::None,
            ));
        };

        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().image(image);
        let mut export = vk::ExportMemoryAllocateInfo::default().handle_types(flag);
        let alloc = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(type_index)
            .push_next(&mut dedicated)
            .push_next(&mut export);
        let memory = match unsafe { device.allocate_memory(&alloc, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { device.destroy_image(image, None) };
                return Err(super::vk_error("vkAllocateMemory", result));
            }
        };
        if let Err(result) = unsafe { device.bind_image_memory(image, memory, 0) } {
            unsafe {
                device.free_memory(memory, None);
                device.destroy_image(image, None);
            }
            return Err(super::vk_error("vkBindImageMemory", result));
        }

        debug!(
            "shared image {}x{} in memory type {type_index}, {} bytes",
            desc.extent.width, desc.extent.height, requirements.size
        );
        Ok(ExportedImage {
            image: SharedImage { image, memory },
            size: requirements.size,
            dedicated: true,
        })
    }

    fn export_memory(
        &mut self,
        image: &SharedImage,
        ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError> {
        let flag = memory_handle_type(ty).ok_or_else(|| unsupported_type(ty))?;
        export_memory_handle(self.device_ctx()?, image.memory, flag)
    }

    fn destroy_image(&mut self, image: SharedImage) {
        if let Some(dev) = self.device.as_ref() {
            unsafe {
                dev.device.destroy_image(image.image, None);
                dev.device.free_memory(image.memory, None);
            }
        }
    }

    fn import_memory(
        &mut self,
        handle: NativeHandle,
        ty: ExternalHandleType,
        size: u64,
        dedicated: bool,
    ) -> Result<GLuint, InteropError> {
        let gl_type = gl_handle_type(ty).ok_or_else(|| unsupported_type(ty))?;
        let gl = self.gl_fns()?;
        gl_ext::clear_errors();

        let memory = unsafe { gl.create_memory_object() };
        if memory == 0 {
            return Err(gl_failure(
                "glCreateMemoryObjectsEXT",
                gl_ext::take_error().unwrap_or(NativeCode::None),
            ));
        }
        unsafe { gl.set_dedicated(memory, dedicated) };
        let imported = unsafe {
            match handle {
                NativeHandle::Fd(fd) => gl.import_memory_fd(memory, size, gl_type, fd),
                NativeHandle::Win32(h) => gl.import_memory_win32(memory, size, gl_type, h),
            }
        };
        let failure = match imported {
            Err(err) => Some(InteropError::native(format!("{err:#}"), NativeCode::None)),
            Ok(()) => gl_ext::take_error().map(|code| gl_failure("glImportMemoryEXT", code)),
        };
        if let Some(err) = failure {
            unsafe { gl.delete_memory_object(memory) };
            return Err(err);
        }
        Ok(memory)
    }

    fn delete_memory_object(&mut self, memory: GLuint) {
        if let Some(gl) = self.gl.as_ref() {
            unsafe { gl.delete_memory_object(memory) };
        }
    }

    fn import_texture(
        &mut self,
        memory: &GLuint,
        desc: &SharedImageDesc,
    ) -> Result<GLuint, InteropError> {
        let internal = desc.format.gl_internal_format().ok_or_else(|| {
            InteropError::native(
                format!("{} has no GL internal format", desc.format.name()),
                NativeCode::None,
            )
        })?;
        let gl = self.gl_fns()?;
        gl_ext::clear_errors();

        let mut texture = 0;
        unsafe {
            gl::GenTextures(1, &mut texture);
            gl::BindTexture(gl::TEXTURE_2D, texture);
            gl.tex_storage_mem_2d(internal, desc.extent.width, desc.extent.height, *memory);
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        if let Some(code) = gl_ext::take_error() {
            unsafe { gl::DeleteTextures(1, &texture) };
            return Err(gl_failure("glTexStorageMem2DEXT", code));
        }
        Ok(texture)
    }

    fn texture_info(&mut self, texture: &GLuint) -> TextureInfo {
        let (mut width, mut height, mut internal): (GLint, GLint, GLint) = (0, 0, 0);
        unsafe {
            gl::BindTexture(gl::TEXTURE_2D, *texture);
            gl::GetTexLevelParameteriv(gl::TEXTURE_2D, 0, gl::TEXTURE_WIDTH, &mut width);
            gl::GetTexLevelParameteriv(gl::TEXTURE_2D, 0, gl::TEXTURE_HEIGHT, &mut height);
            gl::GetTexLevelParameteriv(
                gl::TEXTURE_2D,
                0,
                gl::TEXTURE_INTERNAL_FORMAT,
                &mut internal,
            );
            gl::BindTexture(gl::TEXTURE_2D, 0);
        }
        TextureInfo {
            extent: Extent::new(width.max(0) as u32, height.max(0) as u32),
            internal_format: internal as GLenum,
        }
    }

    fn delete_texture(&mut self, texture: GLuint) {
        unsafe { gl::DeleteTextures(1, &texture) };
    }

    fn import_semaphore(
        &mut self,
        handle: NativeHandle,
        ty: ExternalHandleType,
    ) -> Result<GLuint, InteropError> {
        let gl_type = gl_handle_type(ty).ok_or_else(|| unsupported_type(ty))?;
        let gl = self.gl_fns()?;
        gl_ext::clear_errors();

        let semaphore = unsafe { gl.gen_semaphore() };
        if semaphore == 0 {
            return Err(gl_failure(
                "glGenSemaphoresEXT",
                gl_ext::take_error().unwrap_or(NativeCode::None),
            ));
        }
        let imported = unsafe {
            match handle {
                NativeHandle::Fd(fd) => gl.import_semaphore_fd(semaphore, gl_type, fd),
                NativeHandle::Win32(h) => gl.import_semaphore_win32(semaphore, gl_type, h),
            }
        };
        let failure = match imported {
            Err(err) => Some(InteropError::native(format!("{err:#}"), NativeCode::None)),
            Ok(()) => gl_ext::take_error().map(|code| gl_failure("glImportSemaphoreEXT", code)),
        };
        if let Some(err) = failure {
            unsafe { gl.delete_semaphore(semaphore) };
            return Err(err);
        }
        Ok(semaphore)
    }

    fn delete_imported_semaphore(&mut self, semaphore: GLuint) {
        if let Some(gl) = self.gl.as_ref() {
            unsafe { gl.delete_semaphore(semaphore) };
        }
    }

    fn create_render_target(&mut self, texture: &GLuint) -> Result<GLuint, InteropError> {
        let mut fbo = 0;
        let status = unsafe {
            gl::GenFramebuffers(1, &mut fbo);
            gl::BindFramebuffer(gl::FRAMEBUFFER, fbo);
            gl::FramebufferTexture2D(
                gl::FRAMEBUFFER,
                gl::COLOR_ATTACHMENT0,
                gl::TEXTURE_2D,
                *texture,
                0,
            );
            let status = gl::CheckFramebufferStatus(gl::FRAMEBUFFER);
            gl::BindFramebuffer(gl::FRAMEBUFFER, 0);
            status
        };
        if status != gl::FRAMEBUFFER_COMPLETE {
            unsafe { gl::DeleteFramebuffers(1, &fbo) };
            return Err(gl_failure(
                "shared framebuffer completeness check",
                NativeCode::Gl(status),
            ));
        }
        Ok(fbo)
    }

    fn delete_render_target(&mut self, target: GLuint) {
        unsafe { gl::DeleteFramebuffers(1, &target) };
    }

    fn framebuffer_name(&self, target: &GLuint) -> GLuint {
        *target
    }

    #[cfg(unix)]
    fn close_handle(&mut self, handle: NativeHandle) {
        use std::os::fd::{FromRawFd, OwnedFd};
        match handle {
            NativeHandle::Fd(fd) if fd >= 0 => drop(unsafe { OwnedFd::from_raw_fd(fd) }),
            other => warn!("not closing {other:?}"),
        }
    }

    #[cfg(windows)]
    fn close_handle(&mut self, handle: NativeHandle) {
        use windows::Win32::Foundation::{CloseHandle, HANDLE};
        match handle {
            NativeHandle::Win32(h) if h != 0 => {
                if let Err(err) = unsafe { CloseHandle(HANDLE(h as *mut _)) } {
                    warn!("CloseHandle failed: {err}");
                }
            }
            other => warn!("not closing {other:?}"),
        }
    }

    fn prime(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError> {
        self.submit_prime(shared.image.image, shared.ready)
    }
}
