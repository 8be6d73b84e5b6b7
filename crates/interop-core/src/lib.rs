//! Platform-neutral core of the GL interop bridges.
//!
//! Everything here is written against backend traits and has no native API
//! calls: adapter scoring, handle-type probing, the swapchain recreation
//! protocol, the shared-resource bind algorithm, semaphore alternation
//! bookkeeping and the two [`FrameBridge`] state machines. The `gpu-interop`
//! crate implements the backends for Vulkan and DXGI.

pub mod binder;
pub mod bridge;
pub mod compositor;
pub mod config;
pub mod device;
pub mod error;
pub mod explicit;
pub mod format;
pub mod hdr;
pub mod lifecycle;
pub mod logging;
pub mod probe;
pub mod swapchain;
pub mod sync;

pub use bridge::{FrameBridge, FrameStatus, InitArgs, RawInstance, RawSurface, SurfaceProvider};
pub use compositor::{CompositorBackend, CompositorBridge};
pub use config::InteropConfig;
pub use error::{BindStep, InitStage, InteropError, NativeCode};
pub use explicit::{ExplicitBackend, ExplicitBridge};
pub use format::{ColorFormat, ColorSpace, Extent, PresentMode, SurfaceFormat};
pub use lifecycle::BridgeState;
