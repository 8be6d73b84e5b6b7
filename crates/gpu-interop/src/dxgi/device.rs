//! DXGI factory, adapter enumeration and the D3D11 device.

use std::collections::BTreeSet;

use tracing::{debug, info};
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::{
    D3D_DRIVER_TYPE_UNKNOWN, D3D_FEATURE_LEVEL, D3D_FEATURE_LEVEL_11_0, D3D_FEATURE_LEVEL_11_1,
};
use windows::Win32::Graphics::Direct3D11::{
    D3D11CreateDevice, ID3D11Device, ID3D11DeviceContext, D3D11_CREATE_DEVICE_BGRA_SUPPORT,
    D3D11_CREATE_DEVICE_DEBUG, D3D11_REQ_TEXTURE2D_U_OR_V_DIMENSION, D3D11_SDK_VERSION,
};
use windows::Win32::Graphics::Dxgi::{
    CreateDXGIFactory2, IDXGIAdapter1, IDXGIFactory2, DXGI_ADAPTER_FLAG_SOFTWARE,
    DXGI_CREATE_FACTORY_DEBUG, DXGI_CREATE_FACTORY_FLAGS, DXGI_ERROR_NOT_FOUND,
};

use interop_core::device::{AdapterInfo, AdapterKind, QueueFamilyInfo};
use interop_core::InteropError;

use super::hr_error;

/// Adapters with at least this much dedicated memory count as discrete.
const DISCRETE_VRAM_BYTES: usize = 512 * 1024 * 1024;

pub(super) fn create_factory(debug_layer: bool) -> Result<IDXGIFactory2, InteropError> {
    let flags = if debug_layer {
        DXGI_CREATE_FACTORY_DEBUG
    } else {
        DXGI_CREATE_FACTORY_FLAGS(0)
    };
    match unsafe { CreateDXGIFactory2::<IDXGIFactory2>(flags) } {
        Ok(factory) => Ok(factory),
        // The debug factory needs the graphics tools feature installed.
        Err(_) if debug_layer => {
            debug!("DXGI debug factory unavailable, using the release factory");
            unsafe { CreateDXGIFactory2::<IDXGIFactory2>(DXGI_CREATE_FACTORY_FLAGS(0)) }
                .map_err(|e| hr_error("CreateDXGIFactory2", &e))
        }
        Err(e) => Err(hr_error("CreateDXGIFactory2", &e)),
    }
}

fn adapter_name(description: &[u16]) -> String {
    let len = description.iter().position(|&c| c == 0).unwrap_or(description.len());
    String::from_utf16_lossy(&description[..len])
}

/// Describe every adapter of `factory`. `handles` receives the adapters in
/// the same order.
pub(super) fn enumerate(
    factory: &IDXGIFactory2,
    handles: &mut Vec<IDXGIAdapter1>,
) -> Result<Vec<AdapterInfo>, InteropError> {
    handles.clear();
    let mut adapters = Vec::new();
    for index in 0.. {
        let adapter = match unsafe { factory.EnumAdapters1(index) } {
            Ok(adapter) => adapter,
            Err(e) if e.code() == DXGI_ERROR_NOT_FOUND => break,
            Err(e) => return Err(hr_error("IDXGIFactory1::EnumAdapters1", &e)),
        };
        let desc = unsafe { adapter.GetDesc1() }
            .map_err(|e| hr_error("IDXGIAdapter1::GetDesc1", &e))?;

        let kind = if desc.Flags & DXGI_ADAPTER_FLAG_SOFTWARE.0 as u32 != 0 {
            AdapterKind::Software
        } else if desc.DedicatedVideoMemory >= DISCRETE_VRAM_BYTES {
            AdapterKind::Discrete
        } else {
            AdapterKind::Integrated
        };
        let name = adapter_name(&desc.Description);
        debug!(
            "adapter {index}: {name} ({kind:?}, {} MiB dedicated)",
            desc.DedicatedVideoMemory / (1024 * 1024)
        );

        adapters.push(AdapterInfo {
            index,
            name,
            kind,
            max_image_dimension_2d: D3D11_REQ_TEXTURE2D_U_OR_V_DIMENSION,
            // One implicit queue that renders and presents.
            queue_families: vec![QueueFamilyInfo {
                index: 0,
                graphics: true,
                present: true,
            }],
            extensions: BTreeSet::new(),
            swapchain_supported: true,
        });
        handles.push(adapter);
    }
    Ok(adapters)
}

pub(super) fn create_device(
    adapter: &IDXGIAdapter1,
    debug_layer: bool,
) -> Result<(ID3D11Device, ID3D11DeviceContext), InteropError> {
    let levels: [D3D_FEATURE_LEVEL; 2] = [D3D_FEATURE_LEVEL_11_1, D3D_FEATURE_LEVEL_11_0];
    let mut flags = D3D11_CREATE_DEVICE_BGRA_SUPPORT;
    if debug_layer {
        flags |= D3D11_CREATE_DEVICE_DEBUG;
    }

    let mut device = None;
    let mut context = None;
    let mut level = D3D_FEATURE_LEVEL::default();
    let created = unsafe {
        D3D11CreateDevice(
            adapter,
            D3D_DRIVER_TYPE_UNKNOWN,
            HMODULE::default(),
            flags,
            Some(&levels),
            D3D11_SDK_VERSION,
            Some(&mut device as *mut _),
            Some(&mut level as *mut _),
            Some(&mut context as *mut _),
        )
    };
    // The debug layer is optional; retry without it.
    let created = match created {
        Err(_) if debug_layer => unsafe {
            debug!("D3D11 debug layer unavailable, creating a release device");
            D3D11CreateDevice(
                adapter,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                Some(&levels),
                D3D11_SDK_VERSION,
                Some(&mut device as *mut _),
                Some(&mut level as *mut _),
                Some(&mut context as *mut _),
            )
        },
        other => other,
    };
    created.map_err(|e| hr_error("D3D11CreateDevice", &e))?;

    let (Some(device), Some(context)) = (device, context) else {
        return Err(InteropError::native(
            "D3D11CreateDevice returned no device",
            interop_core::NativeCode::None,
        ));
    };
    info!(
        "D3D11 device created at feature level {:#x} ({:p})",
        level.0,
        device.as_raw()
    );
    Ok((device, context))
}
