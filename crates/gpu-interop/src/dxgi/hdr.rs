//! Output HDR query: DXGI output description plus the display-config SDR
//! white level for the same GDI device.

use tracing::debug;
use windows::core::Interface;
use windows::Win32::Devices::Display::{
    DisplayConfigGetDeviceInfo, GetDisplayConfigBufferSizes, QueryDisplayConfig,
    DISPLAYCONFIG_DEVICE_INFO_GET_SDR_WHITE_LEVEL, DISPLAYCONFIG_DEVICE_INFO_GET_SOURCE_NAME,
    DISPLAYCONFIG_DEVICE_INFO_HEADER, DISPLAYCONFIG_MODE_INFO, DISPLAYCONFIG_PATH_INFO,
    DISPLAYCONFIG_SDR_WHITE_LEVEL, DISPLAYCONFIG_SOURCE_DEVICE_NAME, QDC_ONLY_ACTIVE_PATHS,
    QDC_VIRTUAL_MODE_AWARE,
};
use windows::Win32::Foundation::{ERROR_INSUFFICIENT_BUFFER, ERROR_SUCCESS};
use windows::Win32::Graphics::Dxgi::Common::{
    DXGI_COLOR_SPACE_TYPE, DXGI_COLOR_SPACE_YCBCR_STUDIO_G22_LEFT_P2020,
    DXGI_COLOR_SPACE_YCBCR_STUDIO_G24_TOPLEFT_P2020,
};
use windows::Win32::Graphics::Dxgi::{IDXGIAdapter1, IDXGIOutput6};

use interop_core::hdr::OutputLuminance;
use interop_core::{InteropError, NativeCode};

use super::hr_error;

/// BT.2020 primaries, covering HDR10 and the YCbCr 2020 variants.
fn is_bt2020(space: DXGI_COLOR_SPACE_TYPE) -> bool {
    let first = DXGI_COLOR_SPACE_YCBCR_STUDIO_G22_LEFT_P2020.0;
    let last = DXGI_COLOR_SPACE_YCBCR_STUDIO_G24_TOPLEFT_P2020.0;
    (first..=last).contains(&space.0)
}

fn wide_eq(a: &[u16], b: &[u16]) -> bool {
    let trim = |s: &[u16]| {
        let len = s.iter().position(|&c| c == 0).unwrap_or(s.len());
        s[..len].to_vec()
    };
    trim(a) == trim(b)
}

pub(super) fn output_luminance(
    adapter: &IDXGIAdapter1,
    index: u32,
) -> Result<OutputLuminance, InteropError> {
    let output = unsafe { adapter.EnumOutputs(index) }
        .map_err(|e| hr_error("IDXGIAdapter::EnumOutputs", &e))?;
    let output6: IDXGIOutput6 = output
        .cast()
        .map_err(|e| hr_error("QueryInterface(IDXGIOutput6)", &e))?;
    let desc = unsafe { output6.GetDesc1() }.map_err(|e| hr_error("IDXGIOutput6::GetDesc1", &e))?;

    let white = sdr_white_level(&desc.DeviceName)?;
    debug!(
        "output {index}: color space {}, max {} nits, SDR white {}",
        desc.ColorSpace.0, desc.MaxLuminance, white
    );
    Ok(OutputLuminance {
        bt2020: is_bt2020(desc.ColorSpace),
        max_luminance_nits: desc.MaxLuminance,
        sdr_white_level_raw: white,
    })
}

/// SDR white level of the active display path whose source is `gdi_name`.
fn sdr_white_level(gdi_name: &[u16]) -> Result<u32, InteropError> {
    let flags = QDC_ONLY_ACTIVE_PATHS | QDC_VIRTUAL_MODE_AWARE;
    let (paths, _modes) = loop {
        let (mut path_count, mut mode_count) = (0u32, 0u32);
        let sized = unsafe { GetDisplayConfigBufferSizes(flags, &mut path_count, &mut mode_count) };
        if sized != ERROR_SUCCESS {
            return Err(InteropError::native(
                "GetDisplayConfigBufferSizes failed",
                NativeCode::Win32(sized.0),
            ));
        }
        let mut paths = vec![DISPLAYCONFIG_PATH_INFO::default(); path_count as usize];
        let mut modes = vec![DISPLAYCONFIG_MODE_INFO::default(); mode_count as usize];
        let queried = unsafe {
            QueryDisplayConfig(
                flags,
                &mut path_count,
                paths.as_mut_ptr(),
                &mut mode_count,
                modes.as_mut_ptr(),
                None,
            )
        };
        // The topology can change between the two calls.
        if queried == ERROR_INSUFFICIENT_BUFFER {
            continue;
        }
        if queried != ERROR_SUCCESS {
            return Err(InteropError::native(
                "QueryDisplayConfig failed",
                NativeCode::Win32(queried.0),
            ));
        }
        paths.truncate(path_count as usize);
        modes.truncate(mode_count as usize);
        break (paths, modes);
    };

    for path in &paths {
        let mut source = DISPLAYCONFIG_SOURCE_DEVICE_NAME {
            header: DISPLAYCONFIG_DEVICE_INFO_HEADER {
                r#type: DISPLAYCONFIG_DEVICE_INFO_GET_SOURCE_NAME,
                size: std::mem::size_of::<DISPLAYCONFIG_SOURCE_DEVICE_NAME>() as u32,
                adapterId: path.sourceInfo.adapterId,
                id: path.sourceInfo.id,
            },
            ..Default::default()
        };
        if unsafe { DisplayConfigGetDeviceInfo(&mut source.header) } != 0 {
            continue;
        }
        if !wide_eq(&source.viewGdiDeviceName, gdi_name) {
            continue;
        }

        let mut white = DISPLAYCONFIG_SDR_WHITE_LEVEL {
            header: DISPLAYCONFIG_DEVICE_INFO_HEADER {
                r#type: DISPLAYCONFIG_DEVICE_INFO_GET_SDR_WHITE_LEVEL,
                size: std::mem::size_of::<DISPLAYCONFIG_SDR_WHITE_LEVEL>() as u32,
                adapterId: path.targetInfo.adapterId,
                id: path.targetInfo.id,
            },
            ..Default::default()
        };
        let status = unsafe { DisplayConfigGetDeviceInfo(&mut white.header) };
        if status != 0 {
            return Err(InteropError::native(
                "DisplayConfigGetDeviceInfo(SDR white level) failed",
                NativeCode::Win32(status as u32),
            ));
        }
        return Ok(white.SDRWhiteLevel);
    }

    Err(InteropError::native(
        "no active display path matches the output",
        NativeCode::None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows::Win32::Graphics::Dxgi::Common::{
        DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020, DXGI_COLOR_SPACE_RGB_FULL_G22_NONE_P709,
    };

    #[test]
    fn hdr10_is_bt2020_and_srgb_is_not() {
        assert!(is_bt2020(DXGI_COLOR_SPACE_RGB_FULL_G2084_NONE_P2020));
        assert!(!is_bt2020(DXGI_COLOR_SPACE_RGB_FULL_G22_NONE_P709));
    }

    #[test]
    fn wide_names_ignore_trailing_nuls() {
        let a: Vec<u16> = "\\\\.\\DISPLAY1\0\0\0".encode_utf16().collect();
        let b: Vec<u16> = "\\\\.\\DISPLAY1\0".encode_utf16().collect();
        let c: Vec<u16> = "\\\\.\\DISPLAY2\0".encode_utf16().collect();
        assert!(wide_eq(&a, &b));
        assert!(!wide_eq(&a, &c));
    }
}
