//! WGL_NV_DX_interop2 entry points.

use std::ffi::{c_void, CStr};

use anyhow::{bail, Result};
use gl::types::{GLenum, GLint, GLuint, GLvoid};
use tracing::debug;
use windows::core::PCSTR;
use windows::Win32::Graphics::Gdi::HDC;
use windows::Win32::Graphics::OpenGL::{wglGetCurrentDC, wglGetProcAddress};

pub const WGL_ACCESS_READ_WRITE_NV: GLenum = 0x0001;

type WglDxOpenDeviceNv = unsafe extern "system" fn(dx_device: *mut GLvoid) -> *mut GLvoid;
type WglDxCloseDeviceNv = unsafe extern "system" fn(h_device: *mut GLvoid) -> i32;
type WglDxRegisterObjectNv = unsafe extern "system" fn(
    h_device: *mut GLvoid,
    dx_object: *mut GLvoid,
    name: GLuint,
    obj_type: GLenum,
    access: GLenum,
) -> *mut GLvoid;
type WglDxUnregisterObjectNv =
    unsafe extern "system" fn(h_device: *mut GLvoid, h_object: *mut GLvoid) -> i32;
type WglDxObjectsNv = unsafe extern "system" fn(
    h_device: *mut GLvoid,
    count: GLint,
    h_objects: *mut *mut GLvoid,
) -> i32;
type WglGetExtensionsStringArb = unsafe extern "system" fn(hdc: HDC) -> *const i8;

fn load(name: &CStr) -> Option<*mut GLvoid> {
    let addr = unsafe { wglGetProcAddress(PCSTR(name.as_ptr() as *const u8)) }?;
    let ptr = addr as usize as *mut GLvoid;
    (!ptr.is_null()).then_some(ptr)
}

/// Whether the current context's device exposes `WGL_NV_DX_interop2`.
pub fn is_available() -> bool {
    let Some(ptr) = load(c"wglGetExtensionsStringARB") else {
        return false;
    };
    unsafe {
        let get_extensions = std::mem::transmute::<*mut GLvoid, WglGetExtensionsStringArb>(ptr);
        let extensions = get_extensions(wglGetCurrentDC());
        if extensions.is_null() {
            return false;
        }
        CStr::from_ptr(extensions)
            .to_string_lossy()
            .split_ascii_whitespace()
            .any(|ext| ext == "WGL_NV_DX_interop2")
    }
}

/// Loaded WGL_NV_DX_interop2 function pointers.
pub struct WglInteropFunctions {
    open_device: WglDxOpenDeviceNv,
    close_device: WglDxCloseDeviceNv,
    register_object: WglDxRegisterObjectNv,
    unregister_object: WglDxUnregisterObjectNv,
    lock_objects: WglDxObjectsNv,
    unlock_objects: WglDxObjectsNv,
}

impl WglInteropFunctions {
    /// Requires a current GL context.
    pub fn load() -> Result<Self> {
        if !is_available() {
            bail!("WGL_NV_DX_interop2 is not exposed by the current GL context");
        }
        let (
            Some(open),
            Some(close),
            Some(register),
            Some(unregister),
            Some(lock),
            Some(unlock),
        ) = (
            load(c"wglDXOpenDeviceNV"),
            load(c"wglDXCloseDeviceNV"),
            load(c"wglDXRegisterObjectNV"),
            load(c"wglDXUnregisterObjectNV"),
            load(c"wglDXLockObjectsNV"),
            load(c"wglDXUnlockObjectsNV"),
        ) else {
            bail!("WGL_NV_DX_interop2 entry points are missing");
        };
        debug!("WGL_NV_DX_interop2 loaded");
        unsafe {
            Ok(Self {
                open_device: std::mem::transmute::<*mut GLvoid, WglDxOpenDeviceNv>(open),
                close_device: std::mem::transmute::<*mut GLvoid, WglDxCloseDeviceNv>(close),
                register_object: std::mem::transmute::<*mut GLvoid, WglDxRegisterObjectNv>(
                    register,
                ),
                unregister_object: std::mem::transmute::<*mut GLvoid, WglDxUnregisterObjectNv>(
                    unregister,
                ),
                lock_objects: std::mem::transmute::<*mut GLvoid, WglDxObjectsNv>(lock),
                unlock_objects: std::mem::transmute::<*mut GLvoid, WglDxObjectsNv>(unlock),
            })
        }
    }

    /// Null on failure.
    pub unsafe fn open_device(&self, dx_device: *mut c_void) -> *mut GLvoid {
        (self.open_device)(dx_device)
    }

    pub unsafe fn close_device(&self, device: *mut GLvoid) -> bool {
        (self.close_device)(device) != 0
    }

    /// Null on failure.
    pub unsafe fn register_renderbuffer(
        &self,
        device: *mut GLvoid,
        dx_object: *mut c_void,
        renderbuffer: GLuint,
    ) -> *mut GLvoid {
        (self.register_object)(
            device,
            dx_object,
            renderbuffer,
            gl::RENDERBUFFER,
            WGL_ACCESS_READ_WRITE_NV,
        )
    }

    pub unsafe fn unregister(&self, device: *mut GLvoid, object: *mut GLvoid) -> bool {
        (self.unregister_object)(device, object) != 0
    }

    pub unsafe fn lock(&self, device: *mut GLvoid, objects: &mut [*mut GLvoid]) -> bool {
        (self.lock_objects)(device, objects.len() as GLint, objects.as_mut_ptr()) != 0
    }

    pub unsafe fn unlock(&self, device: *mut GLvoid, objects: &mut [*mut GLvoid]) -> bool {
        (self.unlock_objects)(device, objects.len() as GLint, objects.as_mut_ptr()) != 0
    }
}
