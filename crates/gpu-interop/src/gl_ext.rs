//! GL loading and the external-object extension entry points.
//!
//! The `gl` crate only generates core-profile bindings, so the
//! `GL_EXT_memory_object` / `GL_EXT_semaphore` families (and their `_fd` /
//! `_win32` platform halves) are resolved here at runtime through
//! `gl_loader`. A GL context must be current on the calling thread.

use std::ffi::c_void;
use std::sync::Once;

use anyhow::{bail, Result};
use gl::types::{GLenum, GLint, GLsizei, GLuint, GLuint64};
use tracing::{debug, warn};

use interop_core::probe::ExternalHandleType;
use interop_core::NativeCode;

static GL_INIT_ONCE: Once = Once::new();

pub const HANDLE_TYPE_OPAQUE_FD_EXT: GLenum = 0x9586;
pub const HANDLE_TYPE_OPAQUE_WIN32_EXT: GLenum = 0x9587;
pub const HANDLE_TYPE_OPAQUE_WIN32_KMT_EXT: GLenum = 0x9588;
pub const HANDLE_TYPE_D3D12_FENCE_EXT: GLenum = 0x9594;
pub const DEDICATED_MEMORY_OBJECT_EXT: GLenum = 0x9581;

pub const LAYOUT_TRANSFER_SRC_EXT: GLenum = 0x9592;

/// Load core GL function pointers. Runs once per process.
pub fn load_gl() {
    GL_INIT_ONCE.call_once(|| {
        gl_loader::init_gl();
        gl::load_with(|s| gl_loader::get_proc_address(s).cast());
        debug!("GL function pointers loaded");
    });
}

/// GL enum for an exported handle type, if GL can import it at all.
pub fn gl_handle_type(ty: ExternalHandleType) -> Option<GLenum> {
    match ty {
        ExternalHandleType::OpaqueFd => Some(HANDLE_TYPE_OPAQUE_FD_EXT),
        ExternalHandleType::OpaqueWin32 => Some(HANDLE_TYPE_OPAQUE_WIN32_EXT),
        ExternalHandleType::OpaqueWin32Kmt => Some(HANDLE_TYPE_OPAQUE_WIN32_KMT_EXT),
        ExternalHandleType::D3d12Fence => Some(HANDLE_TYPE_D3D12_FENCE_EXT),
        // GL_EXT_semaphore_fd only accepts opaque descriptors.
        ExternalHandleType::SyncFd => None,
    }
}

/// `glGetError()` as a native code, `None` when clean.
pub fn take_error() -> Option<NativeCode> {
    let err = unsafe { gl::GetError() };
    (err != gl::NO_ERROR).then_some(NativeCode::Gl(err))
}

/// Drain stale errors so the next [`take_error`] reports only new ones.
pub fn clear_errors() {
    for _ in 0..16 {
        if unsafe { gl::GetError() } == gl::NO_ERROR {
            return;
        }
    }
    warn!("GL error queue did not drain");
}

// ---------------------------------------------------------------------------
// Function pointer types
// ---------------------------------------------------------------------------

type GlCreateMemoryObjects = unsafe extern "system" fn(n: GLsizei, memory_objects: *mut GLuint);
type GlDeleteMemoryObjects = unsafe extern "system" fn(n: GLsizei, memory_objects: *const GLuint);
type GlMemoryObjectParameteriv =
    unsafe extern "system" fn(memory_object: GLuint, pname: GLenum, params: *const GLint);
type GlTexStorageMem2d = unsafe extern "system" fn(
    target: GLenum,
    levels: GLsizei,
    internal_format: GLenum,
    width: GLsizei,
    height: GLsizei,
    memory: GLuint,
    offset: GLuint64,
);
type GlImportMemoryFd =
    unsafe extern "system" fn(memory: GLuint, size: GLuint64, handle_type: GLenum, fd: GLint);
type GlImportMemoryWin32Handle = unsafe extern "system" fn(
    memory: GLuint,
    size: GLuint64,
    handle_type: GLenum,
    handle: *mut c_void,
);
type GlGenSemaphores = unsafe extern "system" fn(n: GLsizei, semaphores: *mut GLuint);
type GlDeleteSemaphores = unsafe extern "system" fn(n: GLsizei, semaphores: *const GLuint);
type GlImportSemaphoreFd =
    unsafe extern "system" fn(semaphore: GLuint, handle_type: GLenum, fd: GLint);
type GlImportSemaphoreWin32Handle =
    unsafe extern "system" fn(semaphore: GLuint, handle_type: GLenum, handle: *mut c_void);
type GlSemaphoreOp = unsafe extern "system" fn(
    semaphore: GLuint,
    num_buffer_barriers: GLuint,
    buffers: *const GLuint,
    num_texture_barriers: GLuint,
    textures: *const GLuint,
    layouts: *const GLenum,
);

macro_rules! load_fn {
    ($name:literal as $ty:ty) => {{
        let ptr: *const c_void = gl_loader::get_proc_address($name).cast();
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { std::mem::transmute::<*const c_void, $ty>(ptr) })
        }
    }};
}

// ---------------------------------------------------------------------------
// GlExtFunctions
// ---------------------------------------------------------------------------

/// Loaded `GL_EXT_memory_object` / `GL_EXT_semaphore` entry points.
///
/// The platform import functions are optional: a driver exposes either the
/// `_fd` or the `_win32` half.
pub struct GlExtFunctions {
    create_memory_objects: GlCreateMemoryObjects,
    delete_memory_objects: GlDeleteMemoryObjects,
    memory_object_parameteriv: GlMemoryObjectParameteriv,
    tex_storage_mem_2d: GlTexStorageMem2d,
    import_memory_fd: Option<GlImportMemoryFd>,
    import_memory_win32_handle: Option<GlImportMemoryWin32Handle>,
    gen_semaphores: GlGenSemaphores,
    delete_semaphores: GlDeleteSemaphores,
    import_semaphore_fd: Option<GlImportSemaphoreFd>,
    import_semaphore_win32_handle: Option<GlImportSemaphoreWin32Handle>,
    wait_semaphore: GlSemaphoreOp,
    signal_semaphore: GlSemaphoreOp,
}

impl GlExtFunctions {
    /// Resolve every entry point. Fails if a mandatory one is missing.
    pub fn load() -> Result<Self> {
        load_gl();

        let (
            Some(create_memory_objects),
            Some(delete_memory_objects),
            Some(memory_object_parameteriv),
            Some(tex_storage_mem_2d),
        ) = (
            load_fn!("glCreateMemoryObjectsEXT" as GlCreateMemoryObjects),
            load_fn!("glDeleteMemoryObjectsEXT" as GlDeleteMemoryObjects),
            load_fn!("glMemoryObjectParameterivEXT" as GlMemoryObjectParameteriv),
            load_fn!("glTexStorageMem2DEXT" as GlTexStorageMem2d),
        ) else {
            bail!("GL_EXT_memory_object is not available");
        };

        let (
            Some(gen_semaphores),
            Some(delete_semaphores),
            Some(wait_semaphore),
            Some(signal_semaphore),
        ) = (
            load_fn!("glGenSemaphoresEXT" as GlGenSemaphores),
            load_fn!("glDeleteSemaphoresEXT" as GlDeleteSemaphores),
            load_fn!("glWaitSemaphoreEXT" as GlSemaphoreOp),
            load_fn!("glSignalSemaphoreEXT" as GlSemaphoreOp),
        ) else {
            bail!("GL_EXT_semaphore is not available");
        };

        let fns = Self {
            create_memory_objects,
            delete_memory_objects,
            memory_object_parameteriv,
            tex_storage_mem_2d,
            import_memory_fd: load_fn!("glImportMemoryFdEXT" as GlImportMemoryFd),
            import_memory_win32_handle: load_fn!(
                "glImportMemoryWin32HandleEXT" as GlImportMemoryWin32Handle
            ),
            gen_semaphores,
            delete_semaphores,
            import_semaphore_fd: load_fn!("glImportSemaphoreFdEXT" as GlImportSemaphoreFd),
            import_semaphore_win32_handle: load_fn!(
                "glImportSemaphoreWin32HandleEXT" as GlImportSemaphoreWin32Handle
            ),
            wait_semaphore,
            signal_semaphore,
        };

        if !fns.supports_fd() && !fns.supports_win32() {
            bail!("neither GL_EXT_memory_object_fd nor GL_EXT_memory_object_win32 is available");
        }
        debug!(
            "GL external objects loaded (fd: {}, win32: {})",
            fns.supports_fd(),
            fns.supports_win32()
        );
        Ok(fns)
    }

    pub fn supports_fd(&self) -> bool {
        self.import_memory_fd.is_some() && self.import_semaphore_fd.is_some()
    }

    pub fn supports_win32(&self) -> bool {
        self.import_memory_win32_handle.is_some() && self.import_semaphore_win32_handle.is_some()
    }

    /// Whether GL can import a handle of this type.
    pub fn can_import(&self, ty: ExternalHandleType) -> bool {
        gl_handle_type(ty).is_some()
            && if ty.is_fd() {
                self.supports_fd()
            } else {
                self.supports_win32()
            }
    }

    // -- Memory objects -------------------------------------------------------

    pub unsafe fn create_memory_object(&self) -> GLuint {
        let mut memory = 0;
        (self.create_memory_objects)(1, &mut memory);
        memory
    }

    pub unsafe fn delete_memory_object(&self, memory: GLuint) {
        (self.delete_memory_objects)(1, &memory);
    }

    pub unsafe fn set_dedicated(&self, memory: GLuint, dedicated: bool) {
        let value = GLint::from(dedicated);
        (self.memory_object_parameteriv)(memory, DEDICATED_MEMORY_OBJECT_EXT, &value);
    }

    pub unsafe fn import_memory_fd(
        &self,
        memory: GLuint,
        size: u64,
        handle_type: GLenum,
        fd: i32,
    ) -> Result<()> {
        let Some(import) = self.import_memory_fd else {
            bail!("glImportMemoryFdEXT is not available");
        };
        import(memory, size, handle_type, fd);
        Ok(())
    }

    pub unsafe fn import_memory_win32(
        &self,
        memory: GLuint,
        size: u64,
        handle_type: GLenum,
        handle: isize,
    ) -> Result<()> {
        let Some(import) = self.import_memory_win32_handle else {
            bail!("glImportMemoryWin32HandleEXT is not available");
        };
        import(memory, size, handle_type, handle as *mut c_void);
        Ok(())
    }

    /// Back the texture bound to `GL_TEXTURE_2D` with `memory`.
    pub unsafe fn tex_storage_mem_2d(
        &self,
        internal_format: GLenum,
        width: u32,
        height: u32,
        memory: GLuint,
    ) {
        (self.tex_storage_mem_2d)(
            gl::TEXTURE_2D,
            1,
            internal_format,
            width as GLsizei,
            height as GLsizei,
            memory,
            0,
        );
    }

    // -- Semaphores -----------------------------------------------------------

    pub unsafe fn gen_semaphore(&self) -> GLuint {
        let mut semaphore = 0;
        (self.gen_semaphores)(1, &mut semaphore);
        semaphore
    }

    pub unsafe fn delete_semaphore(&self, semaphore: GLuint) {
        (self.delete_semaphores)(1, &semaphore);
    }

    pub unsafe fn import_semaphore_fd(
        &self,
        semaphore: GLuint,
        handle_type: GLenum,
        fd: i32,
    ) -> Result<()> {
        let Some(import) = self.import_semaphore_fd else {
            bail!("glImportSemaphoreFdEXT is not available");
        };
        import(semaphore, handle_type, fd);
        Ok(())
    }

    pub unsafe fn import_semaphore_win32(
        &self,
        semaphore: GLuint,
        handle_type: GLenum,
        handle: isize,
    ) -> Result<()> {
        let Some(import) = self.import_semaphore_win32_handle else {
            bail!("glImportSemaphoreWin32HandleEXT is not available");
        };
        import(semaphore, handle_type, handle as *mut c_void);
        Ok(())
    }

    /// GL waits on `semaphore`; `texture` is currently in `src_layout`.
    pub unsafe fn wait(&self, semaphore: GLuint, texture: GLuint, src_layout: GLenum) {
        (self.wait_semaphore)(semaphore, 0, std::ptr::null(), 1, &texture, &src_layout);
    }

    /// GL signals `semaphore` after moving `texture` to `dst_layout`.
    pub unsafe fn signal(&self, semaphore: GLuint, texture: GLuint, dst_layout: GLenum) {
        (self.signal_semaphore)(semaphore, 0, std::ptr::null(), 1, &texture, &dst_layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_fd_has_no_gl_import() {
        assert_eq!(gl_handle_type(ExternalHandleType::SyncFd), None);
        assert_eq!(
            gl_handle_type(ExternalHandleType::OpaqueFd),
            Some(HANDLE_TYPE_OPAQUE_FD_EXT)
        );
        assert_eq!(
            gl_handle_type(ExternalHandleType::D3d12Fence),
            Some(HANDLE_TYPE_D3D12_FENCE_EXT)
        );
    }
}
