//! Scripted in-memory backends. Every native call is appended to `calls` so
//! tests can assert ordering; objects are tracked so leaks and teardown order
//! violations show up as entries in `violations`.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use gl::types::GLuint;

use interop_core::binder::{
    ExportedImage, SharedImageDesc, SharedResourceBackend, SharedResources, TextureInfo,
};
use interop_core::bridge::{RawInstance, RawSurface};
use interop_core::compositor::CompositorBackend;
use interop_core::device::{
    AdapterInfo, AdapterKind, DeviceRequirements, QueueFamilyInfo, QueueRequirements,
    SelectedDevice,
};
use interop_core::explicit::ExplicitBackend;
use interop_core::format::{
    ColorFormat, ColorSpace, Extent, HandoffKind, PresentMode, SurfaceFormat,
};
use interop_core::hdr::OutputLuminance;
use interop_core::probe::{ExternalHandleProvider, ExternalHandleType, HandleSupport, NativeHandle};
use interop_core::swapchain::{
    AcquireOutcome, PresentOutcome, SurfaceCapabilities, SwapchainBackend, SwapchainDescriptor,
};
use interop_core::{BindStep, InteropConfig, InteropError, NativeCode};

pub fn adapter(index: u32, kind: AdapterKind, max_dim: u32) -> AdapterInfo {
    AdapterInfo {
        index,
        name: format!("mock-gpu-{index}"),
        kind,
        max_image_dimension_2d: max_dim,
        queue_families: vec![QueueFamilyInfo {
            index: 0,
            graphics: true,
            present: true,
        }],
        extensions: ["VK_KHR_swapchain".to_string()].into_iter().collect(),
        swapchain_supported: true,
    }
}

pub fn test_config() -> InteropConfig {
    InteropConfig::default()
        .with_validation(false)
        .with_present_mode(PresentMode::Fifo)
        .with_output_format(ColorFormat::Bgra8Unorm, ColorSpace::SrgbNonlinear)
        .with_shared_format(ColorFormat::Rgba8Unorm)
}

pub fn surface_ok(_: RawInstance) -> anyhow::Result<RawSurface> {
    Ok(RawSurface::Vulkan(0x5eed))
}

pub fn hwnd_ok(_: RawInstance) -> anyhow::Result<RawSurface> {
    Ok(RawSurface::Hwnd(0x1234))
}

/// Failure injection for [`MockExplicit`].
#[derive(Debug, Default, Clone)]
pub struct ExplicitScript {
    /// Step names (`"create_instance"`, `"import_memory"`, ...) that fail.
    pub fail: BTreeSet<&'static str>,
    /// 1-based acquire calls that report out of date.
    pub acquire_out_of_date: BTreeSet<u64>,
    /// 1-based acquire calls that time out.
    pub acquire_timeout: BTreeSet<u64>,
    /// 1-based present calls that report a stale surface.
    pub present_stale: BTreeSet<u64>,
    /// Imported textures report a different width.
    pub texture_mismatch: bool,
    /// Surface reports only these formats (default: BGRA8 + RGBA16F).
    pub formats: Option<Vec<SurfaceFormat>>,
    /// Handle types the driver accepts (default: opaque fd).
    pub supported_handles: Option<Vec<ExternalHandleType>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockImage {
    pub id: u32,
    pub desc: SharedImageDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockTexture {
    pub name: GLuint,
    pub info: TextureInfo,
}

pub struct MockExplicit {
    pub script: ExplicitScript,
    pub adapters: Vec<AdapterInfo>,
    pub calls: Vec<String>,
    pub violations: Vec<String>,
    /// Live native objects by kind.
    pub live: BTreeMap<&'static str, BTreeSet<u32>>,
    /// Exported handles not yet consumed or closed.
    pub open_handles: BTreeSet<i32>,
    /// Every GL texture name ever issued, in order.
    pub textures_issued: Vec<GLuint>,
    pub swapchain_live: bool,
    pub targets_live: bool,
    pub swapchains_created: u32,
    pub acquires: u64,
    pub presents: u64,
    pub image_count: u32,
    pub handoffs: Vec<HandoffKind>,
    pub selected_adapter: Option<u32>,
    semaphore_candidates: Vec<ExternalHandleType>,
    memory_candidates: Vec<ExternalHandleType>,
    next_id: u32,
}

impl MockExplicit {
    pub fn new(script: ExplicitScript) -> Self {
        Self {
            script,
            adapters: vec![adapter(0, AdapterKind::Discrete, 16384)],
            calls: Vec::new(),
            violations: Vec::new(),
            live: BTreeMap::new(),
            open_handles: BTreeSet::new(),
            textures_issued: Vec::new(),
            swapchain_live: false,
            targets_live: false,
            swapchains_created: 0,
            acquires: 0,
            presents: 0,
            image_count: 0,
            handoffs: Vec::new(),
            selected_adapter: None,
            semaphore_candidates: vec![ExternalHandleType::OpaqueFd, ExternalHandleType::SyncFd],
            memory_candidates: vec![ExternalHandleType::OpaqueFd],
            next_id: 1,
        }
    }

    pub fn with_adapters(mut self, adapters: Vec<AdapterInfo>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls.iter().position(|c| c == call)
    }

    /// Positions of every occurrence of `call`.
    pub fn positions(&self, call: &str) -> Vec<usize> {
        self.calls
            .iter()
            .enumerate()
            .filter(|(_, c)| c.as_str() == call)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.values().map(BTreeSet::len).sum()
    }

    fn record(&mut self, call: &str) {
        self.calls.push(call.to_string());
    }

    fn step(&mut self, call: &'static str) -> Result<(), InteropError> {
        self.record(call);
        if self.script.fail.contains(call) {
            Err(InteropError::native(format!("{call} failed"), NativeCode::Vk(-3)))
        } else {
            Ok(())
        }
    }

    fn create(&mut self, kind: &'static str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.live.entry(kind).or_default().insert(id);
        id
    }

    fn destroy(&mut self, kind: &'static str, id: u32) {
        let removed = self.live.get_mut(kind).is_some_and(|set| set.remove(&id));
        if !removed {
            self.violations.push(format!("double destroy of {kind} {id}"));
        }
    }

    fn export(&mut self, id: u32) -> NativeHandle {
        let fd = 1000 + id as i32;
        self.open_handles.insert(fd);
        NativeHandle::Fd(fd)
    }

    fn consume(&mut self, handle: NativeHandle) {
        if let NativeHandle::Fd(fd) = handle {
            self.open_handles.remove(&fd);
        }
    }

    fn supports(&self, ty: ExternalHandleType) -> HandleSupport {
        let ok = match &self.script.supported_handles {
            Some(list) => list.contains(&ty),
            None => ty == ExternalHandleType::OpaqueFd,
        };
        HandleSupport {
            exportable: ok,
            compatible: ok,
        }
    }
}

impl ExternalHandleProvider for MockExplicit {
    fn semaphore_candidates(&self) -> &[ExternalHandleType] {
        &self.semaphore_candidates
    }

    fn memory_candidates(&self) -> &[ExternalHandleType] {
        &self.memory_candidates
    }
}

impl SharedResourceBackend for MockExplicit {
    type Semaphore = u32;
    type Image = MockImage;
    type MemoryObject = u32;
    type Texture = MockTexture;
    type ImportedSemaphore = u32;
    type RenderTarget = GLuint;

    fn semaphore_support(&self, ty: ExternalHandleType) -> HandleSupport {
        self.supports(ty)
    }

    fn memory_support(&self, ty: ExternalHandleType, _desc: &SharedImageDesc) -> HandleSupport {
        self.supports(ty)
    }

    fn create_export_semaphore(&mut self, _ty: ExternalHandleType) -> Result<u32, InteropError> {
        self.step("create_export_semaphore")?;
        Ok(self.create("vk_semaphore"))
    }

    fn export_semaphore(
        &mut self,
        semaphore: &u32,
        _ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError> {
        self.step("export_semaphore")?;
        Ok(self.export(*semaphore))
    }

    fn destroy_semaphore(&mut self, semaphore: u32) {
        self.record("destroy_semaphore");
        self.destroy("vk_semaphore", semaphore);
    }

    fn create_export_image(
        &mut self,
        desc: &SharedImageDesc,
        _ty: ExternalHandleType,
    ) -> Result<ExportedImage<MockImage>, InteropError> {
        self.step("create_export_image")?;
        let id = self.create("vk_image");
        Ok(ExportedImage {
            image: MockImage { id, desc: *desc },
            size: u64::from(desc.extent.width)
                * u64::from(desc.extent.height)
                * u64::from(desc.format.bytes_per_pixel()),
            dedicated: true,
        })
    }

    fn export_memory(
        &mut self,
        image: &MockImage,
        _ty: ExternalHandleType,
    ) -> Result<NativeHandle, InteropError> {
        self.step("export_memory")?;
        Ok(self.export(image.id))
    }

    fn destroy_image(&mut self, image: MockImage) {
        self.record("destroy_image");
        self.destroy("vk_image", image.id);
    }

    fn import_memory(
        &mut self,
        handle: NativeHandle,
        _ty: ExternalHandleType,
        size: u64,
        _dedicated: bool,
    ) -> Result<u32, InteropError> {
        self.step("import_memory")?;
        if size == 0 {
            self.violations.push("zero-sized memory import".into());
        }
        self.consume(handle);
        Ok(self.create("gl_memory"))
    }

    fn delete_memory_object(&mut self, memory: u32) {
        self.record("delete_memory_object");
        self.destroy("gl_memory", memory);
    }

    fn import_texture(
        &mut self,
        _memory: &u32,
        desc: &SharedImageDesc,
    ) -> Result<MockTexture, InteropError> {
        self.step("import_texture")?;
        let name = self.create("gl_texture");
        self.textures_issued.push(name);
        let mut extent = desc.extent;
        if self.script.texture_mismatch {
            extent.width += 1;
        }
        Ok(MockTexture {
            name,
            info: TextureInfo {
                extent,
                internal_format: desc.format.gl_internal_format().unwrap_or_default(),
            },
        })
    }

    fn texture_info(&mut self, texture: &MockTexture) -> TextureInfo {
        self.record("texture_info");
        texture.info
    }

    fn delete_texture(&mut self, texture: MockTexture) {
        self.record("delete_texture");
        self.destroy("gl_texture", texture.name);
    }

    fn import_semaphore(
        &mut self,
        handle: NativeHandle,
        _ty: ExternalHandleType,
    ) -> Result<u32, InteropError> {
        self.step("import_semaphore")?;
        self.consume(handle);
        Ok(self.create("gl_semaphore"))
    }

    fn delete_imported_semaphore(&mut self, semaphore: u32) {
        self.record("delete_imported_semaphore");
        self.destroy("gl_semaphore", semaphore);
    }

    fn create_render_target(&mut self, _texture: &MockTexture) -> Result<GLuint, InteropError> {
        self.step("create_render_target")?;
        Ok(self.create("gl_framebuffer"))
    }

    fn delete_render_target(&mut self, target: GLuint) {
        self.record("delete_render_target");
        self.destroy("gl_framebuffer", target);
    }

    fn framebuffer_name(&self, target: &GLuint) -> GLuint {
        *target
    }

    fn close_handle(&mut self, handle: NativeHandle) {
        self.record("close_handle");
        self.consume(handle);
    }

    fn prime(&mut self, _shared: &SharedResources<Self>) -> Result<(), InteropError> {
        self.step("prime")
    }
}

impl SwapchainBackend for MockExplicit {
    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities, InteropError> {
        self.step("surface_capabilities")?;
        Ok(SurfaceCapabilities {
            current_extent: None,
            min_extent: Extent::new(1, 1),
            max_extent: Extent::new(16384, 16384),
            min_image_count: 2,
            max_image_count: 8,
            formats: self.script.formats.clone().unwrap_or_else(|| {
                vec![
                    SurfaceFormat {
                        format: ColorFormat::Bgra8Unorm,
                        color_space: ColorSpace::SrgbNonlinear,
                    },
                    SurfaceFormat {
                        format: ColorFormat::Rgba16Float,
                        color_space: ColorSpace::ExtendedSrgbLinear,
                    },
                ]
            }),
            present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
        })
    }

    fn wait_idle(&mut self) -> Result<(), InteropError> {
        self.step("wait_idle")
    }

    fn create_swapchain(&mut self, desc: &SwapchainDescriptor) -> Result<u32, InteropError> {
        self.step("create_swapchain")?;
        if self.swapchain_live {
            self.violations.push("swapchain created while one exists".into());
        }
        if desc.extent.is_empty() {
            self.violations.push("zero-sized swapchain".into());
        }
        self.swapchain_live = true;
        self.swapchains_created += 1;
        self.image_count = desc.image_count;
        Ok(desc.image_count)
    }

    fn destroy_swapchain(&mut self) {
        self.record("destroy_swapchain");
        if self.targets_live {
            self.violations
                .push("swapchain destroyed while image targets exist".into());
        }
        self.swapchain_live = false;
    }

    fn create_image_targets(
        &mut self,
        _desc: &SwapchainDescriptor,
        format_changed: bool,
    ) -> Result<(), InteropError> {
        if format_changed {
            self.record("create_render_pass");
        }
        self.step("create_image_targets")?;
        self.targets_live = true;
        Ok(())
    }

    fn destroy_image_targets(&mut self) {
        self.record("destroy_image_targets");
        self.targets_live = false;
    }

    fn acquire_next_image(&mut self, _timeout: Duration) -> Result<AcquireOutcome, InteropError> {
        self.record("acquire");
        self.acquires += 1;
        if self.script.acquire_out_of_date.contains(&self.acquires) {
            return Ok(AcquireOutcome::OutOfDate);
        }
        if self.script.acquire_timeout.contains(&self.acquires) {
            return Ok(AcquireOutcome::Timeout);
        }
        Ok(AcquireOutcome::Image(
            (self.acquires % u64::from(self.image_count.max(1))) as u32,
        ))
    }
}

impl ExplicitBackend for MockExplicit {
    fn create_instance(&mut self, _config: &InteropConfig) -> Result<RawInstance, InteropError> {
        self.step("create_instance")?;
        self.create("instance");
        Ok(RawInstance::Vulkan {
            instance: 1,
            get_instance_proc_addr: 0,
        })
    }

    fn create_debug_messenger(&mut self, _config: &InteropConfig) -> Result<(), InteropError> {
        self.step("create_debug_messenger")
    }

    fn adopt_surface(&mut self, _surface: RawSurface) -> Result<(), InteropError> {
        self.step("adopt_surface")
    }

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError> {
        self.step("enumerate_adapters")?;
        Ok(self.adapters.clone())
    }

    fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            extensions: vec!["VK_KHR_swapchain".into()],
            queues: QueueRequirements {
                graphics: true,
                present: true,
            },
            swapchain: true,
        }
    }

    fn create_device(&mut self, selected: &SelectedDevice) -> Result<(), InteropError> {
        self.step("create_device")?;
        self.selected_adapter = Some(selected.adapter_index);
        Ok(())
    }

    fn create_frame_resources(&mut self) -> Result<(), InteropError> {
        self.step("create_frame_resources")
    }

    fn wait_frame_fence(&mut self, _timeout: Duration) -> Result<bool, InteropError> {
        self.step("wait_frame_fence")?;
        Ok(true)
    }

    fn reset_frame_fence(&mut self) -> Result<(), InteropError> {
        self.step("reset_frame_fence")
    }

    fn gl_wait_ready(&mut self, _shared: &SharedResources<Self>) -> Result<(), InteropError> {
        self.step("gl_wait_ready")
    }

    fn gl_begin_render(
        &mut self,
        _shared: &SharedResources<Self>,
        _clear_color: [f32; 4],
    ) -> Result<(), InteropError> {
        self.step("gl_begin_render")
    }

    fn gl_signal_complete(&mut self, _shared: &SharedResources<Self>) -> Result<(), InteropError> {
        self.step("gl_signal_complete")
    }

    fn record_handoff(
        &mut self,
        _image_index: u32,
        _shared: &SharedResources<Self>,
        handoff: HandoffKind,
    ) -> Result<(), InteropError> {
        self.step("record_handoff")?;
        self.handoffs.push(handoff);
        Ok(())
    }

    fn submit(
        &mut self,
        _image_index: u32,
        _shared: &SharedResources<Self>,
    ) -> Result<(), InteropError> {
        self.step("submit")
    }

    fn present(&mut self, _image_index: u32) -> Result<PresentOutcome, InteropError> {
        self.step("present")?;
        self.presents += 1;
        if self.script.present_stale.contains(&self.presents) {
            return Err(InteropError::PresentStale);
        }
        Ok(PresentOutcome::Presented)
    }

    fn destroy_frame_resources(&mut self) {
        self.record("destroy_frame_resources");
    }

    fn destroy_device(&mut self) {
        self.record("destroy_device");
    }

    fn destroy_surface(&mut self) {
        self.record("destroy_surface");
    }

    fn destroy_instance(&mut self) {
        self.record("destroy_instance");
        if let Some(id) = self.live.get("instance").and_then(|s| s.iter().next().copied()) {
            self.destroy("instance", id);
        }
    }
}

// ---------------------------------------------------------------------------
// Compositor
// ---------------------------------------------------------------------------

pub struct MockCompositor {
    pub adapters: Vec<AdapterInfo>,
    pub calls: Vec<String>,
    pub fail: BTreeSet<&'static str>,
    /// Upcoming `register_targets` calls that fail.
    pub register_failures: u32,
    pub registered: bool,
    pub extent: Extent,
    pub depth: bool,
    pub luminance: BTreeMap<u32, OutputLuminance>,
}

impl MockCompositor {
    pub fn new() -> Self {
        Self {
            adapters: vec![adapter(0, AdapterKind::Discrete, 16384)],
            calls: Vec::new(),
            fail: BTreeSet::new(),
            register_failures: 0,
            registered: false,
            extent: Extent::MIN,
            depth: false,
            luminance: BTreeMap::new(),
        }
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }

    fn step(&mut self, call: &'static str) -> Result<(), InteropError> {
        self.calls.push(call.to_string());
        if self.fail.contains(call) {
            Err(InteropError::native(
                format!("{call} failed"),
                NativeCode::HResult(0x887A0005_u32 as i32),
            ))
        } else {
            Ok(())
        }
    }
}

impl CompositorBackend for MockCompositor {
    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError> {
        self.step("enumerate_adapters")?;
        Ok(self.adapters.clone())
    }

    fn create_device(&mut self, _selected: &SelectedDevice) -> Result<(), InteropError> {
        self.step("create_device")
    }

    fn create_swapchain(
        &mut self,
        _surface: RawSurface,
        desc: &SwapchainDescriptor,
    ) -> Result<(), InteropError> {
        self.step("create_swapchain")?;
        self.extent = desc.extent;
        Ok(())
    }

    fn open_interop(&mut self) -> Result<(), InteropError> {
        self.step("open_interop")
    }

    fn create_targets(&mut self, extent: Extent, depth: bool) -> Result<(), InteropError> {
        self.step("create_targets")?;
        self.extent = extent;
        self.depth = depth;
        Ok(())
    }

    fn release_targets(&mut self) {
        self.calls.push("release_targets".into());
    }

    fn resize_buffers(&mut self, _extent: Extent) -> Result<(), InteropError> {
        self.step("resize_buffers")
    }

    fn set_viewport(&mut self, _extent: Extent) {
        self.calls.push("set_viewport".into());
    }

    fn register_targets(&mut self) -> Result<(), InteropError> {
        self.step("register_targets")?;
        if self.register_failures > 0 {
            self.register_failures -= 1;
            return Err(InteropError::native(
                "wglDXLockObjectsNV failed",
                NativeCode::Win32(0xC007_006E),
            ));
        }
        self.registered = true;
        Ok(())
    }

    fn unregister_targets(&mut self) -> Result<(), InteropError> {
        self.step("unregister_targets")?;
        self.registered = false;
        Ok(())
    }

    fn bind_framebuffer(&mut self) -> Result<(), InteropError> {
        self.step("bind_framebuffer")
    }

    fn framebuffer(&self) -> GLuint {
        7
    }

    fn present(&mut self, _sync_interval: u32) -> Result<PresentOutcome, InteropError> {
        self.step("present")?;
        Ok(PresentOutcome::Presented)
    }

    fn output_luminance(&mut self, output_index: u32) -> Result<OutputLuminance, InteropError> {
        self.step("output_luminance")?;
        self.luminance.get(&output_index).copied().ok_or_else(|| {
            InteropError::native("no such output", NativeCode::HResult(0x887A0002_u32 as i32))
        })
    }

    fn destroy(&mut self) {
        self.calls.push("destroy".into());
    }
}

/// Fail-step error used by assertions.
pub fn is_bind_failure(err: &InteropError, expected: BindStep) -> bool {
    match err {
        InteropError::SharedResourceBindFailed { step, .. } => *step == expected,
        InteropError::InitFailed { source, .. } => is_bind_failure(source, expected),
        _ => false,
    }
}
