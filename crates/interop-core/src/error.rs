//! Error taxonomy for the interop layer.
//!
//! Every failure that crosses a native API boundary carries the platform error
//! code it was raised with ([`NativeCode`]) so the log line emitted at the
//! failure site and the error surfaced to the caller agree.

use std::fmt;

use thiserror::Error;

use crate::lifecycle::BridgeState;
use crate::probe::HandleKind;

/// Platform error code attached to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NativeCode {
    /// No native code (validation or policy failure).
    #[default]
    None,
    /// A `VkResult`.
    Vk(i32),
    /// A COM `HRESULT`.
    HResult(i32),
    /// A `WIN32_ERROR` / `GetLastError()` value.
    Win32(u32),
    /// A `glGetError()` value.
    Gl(u32),
}

impl fmt::Display for NativeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeCode::None => f.write_str("no native code"),
            NativeCode::Vk(code) => write!(f, "VkResult {code}"),
            NativeCode::HResult(hr) => write!(f, "HRESULT {:#010x}", *hr as u32),
            NativeCode::Win32(code) => write!(f, "WIN32_ERROR {code}"),
            NativeCode::Gl(code) => write!(f, "GL error {code:#06x}"),
        }
    }
}

/// Construction stage that failed during `on_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Instance,
    DebugMessenger,
    Surface,
    DeviceSelection,
    Device,
    Swapchain,
    FrameResources,
    SharedResources,
    LegacyTargets,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InitStage::Instance => "instance",
            InitStage::DebugMessenger => "debug messenger",
            InitStage::Surface => "surface",
            InitStage::DeviceSelection => "device selection",
            InitStage::Device => "device",
            InitStage::Swapchain => "swapchain",
            InitStage::FrameResources => "frame resources",
            InitStage::SharedResources => "shared resources",
            InitStage::LegacyTargets => "legacy render targets",
        };
        f.write_str(name)
    }
}

/// Step of [`SharedResourceBinder::bind`](crate::binder::SharedResourceBinder::bind)
/// that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStep {
    SemaphoreCreate,
    SemaphoreExport,
    ImageCreate,
    MemoryExport,
    MemoryImport,
    TextureImport,
    TextureMismatch,
    SemaphoreImport,
    RenderTarget,
    Prime,
}

impl fmt::Display for BindStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BindStep::SemaphoreCreate => "semaphore create",
            BindStep::SemaphoreExport => "semaphore export",
            BindStep::ImageCreate => "image create",
            BindStep::MemoryExport => "memory export",
            BindStep::MemoryImport => "memory import",
            BindStep::TextureImport => "texture import",
            BindStep::TextureMismatch => "texture verification",
            BindStep::SemaphoreImport => "semaphore import",
            BindStep::RenderTarget => "render target",
            BindStep::Prime => "ready priming",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum InteropError {
    #[error("no suitable device: {reason}")]
    DeviceSelectionFailed { reason: String },

    #[error("no compatible external {kind} handle type among {candidates} candidate(s)")]
    NoCompatibleHandleType { kind: HandleKind, candidates: usize },

    #[error("swapchain creation failed: {detail} ({code})")]
    SwapchainCreateFailed { detail: String, code: NativeCode },

    #[error("shared resource bind failed at {step}: {detail} ({code})")]
    SharedResourceBindFailed {
        step: BindStep,
        detail: String,
        code: NativeCode,
    },

    #[error("frame acquire failed: {detail} ({code})")]
    FrameAcquireFailed { detail: String, code: NativeCode },

    #[error("submit failed: {detail} ({code})")]
    SubmitFailed { detail: String, code: NativeCode },

    #[error("presentation surface is out of date")]
    PresentStale,

    #[error("device lost ({code})")]
    DeviceLost { code: NativeCode },

    #[error("{detail} ({code})")]
    Native { detail: String, code: NativeCode },

    #[error("initialization failed at {stage} stage")]
    InitFailed {
        stage: InitStage,
        #[source]
        source: Box<InteropError>,
    },

    #[error("`{op}` is not valid in state {state:?}")]
    InvalidState { op: &'static str, state: BridgeState },

    #[error("giving up after {count} consecutive transient frame failures")]
    TooManyTransientFailures { count: u32 },
}

impl InteropError {
    pub fn native(detail: impl Into<String>, code: NativeCode) -> Self {
        InteropError::Native {
            detail: detail.into(),
            code,
        }
    }

    pub fn bind(step: BindStep, detail: impl Into<String>, code: NativeCode) -> Self {
        InteropError::SharedResourceBindFailed {
            step,
            detail: detail.into(),
            code,
        }
    }

    pub fn swapchain(detail: impl Into<String>, code: NativeCode) -> Self {
        InteropError::SwapchainCreateFailed {
            detail: detail.into(),
            code,
        }
    }

    pub fn acquire(detail: impl Into<String>, code: NativeCode) -> Self {
        InteropError::FrameAcquireFailed {
            detail: detail.into(),
            code,
        }
    }

    pub fn submit(detail: impl Into<String>, code: NativeCode) -> Self {
        InteropError::SubmitFailed {
            detail: detail.into(),
            code,
        }
    }

    /// Wrap a construction-time failure with the stage it happened in.
    /// Already-wrapped errors keep their original stage.
    pub fn at_stage(self, stage: InitStage) -> Self {
        match self {
            err @ InteropError::InitFailed { .. } => err,
            other => InteropError::InitFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Failures recovered from by dropping the frame (and possibly
    /// recreating the swapchain) rather than tearing the bridge down.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InteropError::FrameAcquireFailed { .. } | InteropError::PresentStale
        )
    }

    /// Native code carried by this error, looking through `InitFailed`.
    pub fn native_code(&self) -> NativeCode {
        match self {
            InteropError::SwapchainCreateFailed { code, .. }
            | InteropError::SharedResourceBindFailed { code, .. }
            | InteropError::FrameAcquireFailed { code, .. }
            | InteropError::SubmitFailed { code, .. }
            | InteropError::DeviceLost { code }
            | InteropError::Native { code, .. } => *code,
            InteropError::InitFailed { source, .. } => source.native_code(),
            _ => NativeCode::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(InteropError::PresentStale.is_transient());
        assert!(InteropError::acquire("timeout", NativeCode::Vk(2)).is_transient());
        assert!(!InteropError::submit("queue", NativeCode::Vk(-4)).is_transient());
        assert!(!InteropError::DeviceLost {
            code: NativeCode::Vk(-4)
        }
        .is_transient());
    }

    #[test]
    fn stage_wrapping_is_not_nested() {
        let err = InteropError::swapchain("no formats", NativeCode::None)
            .at_stage(InitStage::Swapchain)
            .at_stage(InitStage::SharedResources);
        match err {
            InteropError::InitFailed { stage, .. } => assert_eq!(stage, InitStage::Swapchain),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn native_code_is_visible_through_init_failure() {
        let err = InteropError::native("vkCreateInstance", NativeCode::Vk(-9))
            .at_stage(InitStage::Instance);
        assert_eq!(err.native_code(), NativeCode::Vk(-9));
        assert!(err.to_string().contains("instance"));
    }

    #[test]
    fn hresult_formats_as_hex() {
        let code = NativeCode::HResult(0x887A0005_u32 as i32);
        assert_eq!(code.to_string(), "HRESULT 0x887a0005");
    }
}
