//! [`VulkanBackend`]: the native half of the explicit bridge.

use std::time::Duration;

use ash::vk;
use ash::vk::Handle;
use tracing::{debug, warn};

use interop_core::binder::SharedResources;
use interop_core::device::{AdapterInfo, DeviceRequirements, QueueRequirements, SelectedDevice};
use interop_core::format::HandoffKind;
use interop_core::swapchain::PresentOutcome;
use interop_core::{
    ExplicitBackend, InteropConfig, InteropError, NativeCode, RawInstance, RawSurface,
};

use super::device::{self, DeviceContext};
use super::instance::InstanceContext;
use super::swapchain::SwapchainState;
use super::{not_created, timeout_ns, vk_error, VkResultExt};
use crate::gl_ext::{self, GlExtFunctions};

/// Per-frame command recording and synchronization objects.
pub(super) struct FrameResources {
    pub pool: vk::CommandPool,
    pub cmd: vk::CommandBuffer,
    /// One-shot buffer for moving a fresh shared image into its handoff layout.
    pub prime_cmd: vk::CommandBuffer,
    /// Created signaled so the first frame does not block.
    pub in_flight: vk::Fence,
    pub prime_fence: vk::Fence,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
}

/// Vulkan instance, device and swapchain plus the GL import entry points.
///
/// Every native object is created and destroyed by the bridge through the
/// backend traits; a GL context must be current on the calling thread for
/// the whole session.
pub struct VulkanBackend {
    pub(super) instance: Option<InstanceContext>,
    pub(super) surface: vk::SurfaceKHR,
    pub(super) physical_devices: Vec<vk::PhysicalDevice>,
    pub(super) device: Option<DeviceContext>,
    pub(super) swapchain: SwapchainState,
    pub(super) frame: Option<FrameResources>,
    pub(super) gl: Option<GlExtFunctions>,
}

impl Default for VulkanBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl VulkanBackend {
    pub fn new() -> Self {
        Self {
            instance: None,
            surface: vk::SurfaceKHR::null(),
            physical_devices: Vec::new(),
            device: None,
            swapchain: SwapchainState::default(),
            frame: None,
            gl: None,
        }
    }

    pub(super) fn instance_ctx(&self) -> Result<&InstanceContext, InteropError> {
        self.instance.as_ref().ok_or_else(|| not_created("Vulkan instance"))
    }

    pub(super) fn device_ctx(&self) -> Result<&DeviceContext, InteropError> {
        self.device.as_ref().ok_or_else(|| not_created("Vulkan device"))
    }

    pub(super) fn gl_fns(&self) -> Result<&GlExtFunctions, InteropError> {
        self.gl.as_ref().ok_or_else(|| not_created("GL external object table"))
    }

    pub(super) fn frame_res(&self) -> Result<&FrameResources, InteropError> {
        self.frame.as_ref().ok_or_else(|| not_created("frame resources"))
    }
}

fn create_frame_resources(dev: &DeviceContext) -> Result<FrameResources, InteropError> {
    let device = &dev.device;
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(dev.graphics_family)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
    let pool = unsafe { device.create_command_pool(&pool_info, None) }
        .or_vk("vkCreateCommandPool")?;

    let mut res = FrameResources {
        pool,
        cmd: vk::CommandBuffer::null(),
        prime_cmd: vk::CommandBuffer::null(),
        in_flight: vk::Fence::null(),
        prime_fence: vk::Fence::null(),
        image_available: vk::Semaphore::null(),
        render_finished: vk::Semaphore::null(),
    };
    if let Err(err) = fill_frame_resources(device, &mut res) {
        destroy_frame_resources(device, res);
        return Err(err);
    }
    Ok(res)
}

fn fill_frame_resources(
    device: &ash::Device,
    res: &mut FrameResources,
) -> Result<(), InteropError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(res.pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(2);
    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .or_vk("vkAllocateCommandBuffers")?;
    let &[cmd, prime_cmd] = buffers.as_slice() else {
        return Err(InteropError::native(
            "command buffer allocation returned the wrong count",
            NativeCode::None,
        ));
    };
    res.cmd = cmd;
    res.prime_cmd = prime_cmd;

    let signaled = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
    res.in_flight = unsafe { device.create_fence(&signaled, None) }.or_vk("vkCreateFence")?;
    res.prime_fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }
        .or_vk("vkCreateFence")?;

    let sem_info = vk::SemaphoreCreateInfo::default();
    res.image_available =
        unsafe { device.create_semaphore(&sem_info, None) }.or_vk("vkCreateSemaphore")?;
    res.render_finished =
        unsafe { device.create_semaphore(&sem_info, None) }.or_vk("vkCreateSemaphore")?;
    Ok(())
}

fn destroy_frame_resources(device: &ash::Device, res: FrameResources) {
    unsafe {
        for sem in [res.image_available, res.render_finished] {
            if sem != vk::Semaphore::null() {
                device.destroy_semaphore(sem, None);
            }
        }
        for fence in [res.in_flight, res.prime_fence] {
            if fence != vk::Fence::null() {
                device.destroy_fence(fence, None);
            }
        }
        // Frees both command buffers.
        device.destroy_command_pool(res.pool, None);
    }
}

fn full_color_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl VulkanBackend {
    /// Record and submit the one-shot transition of a new shared image into
    /// TRANSFER_SRC_OPTIMAL, signaling "ready". Blocks until done.
    pub(super) fn submit_prime(
        &self,
        image: vk::Image,
        ready: vk::Semaphore,
    ) -> Result<(), InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;
        let device = &dev.device;
        let cmd = frame.prime_cmd;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .or_vk("vkResetCommandBuffer")?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin)
                .or_vk("vkBeginCommandBuffer")?;

            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_READ)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image)
                .subresource_range(full_color_range());
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
            device.end_command_buffer(cmd).or_vk("vkEndCommandBuffer")?;

            let cmds = [cmd];
            let signal = [ready];
            let submit = vk::SubmitInfo::default()
                .command_buffers(&cmds)
                .signal_semaphores(&signal);
            device
                .queue_submit(dev.graphics_queue, &[submit], frame.prime_fence)
                .or_vk("vkQueueSubmit")?;
            device
                .wait_for_fences(&[frame.prime_fence], true, u64::MAX)
                .or_vk("vkWaitForFences")?;
            device
                .reset_fences(&[frame.prime_fence])
                .or_vk("vkResetFences")?;
        }
        debug!("shared image primed");
        Ok(())
    }
}

impl ExplicitBackend for VulkanBackend {
    fn create_instance(&mut self, config: &InteropConfig) -> Result<RawInstance, InteropError> {
        let ctx = InstanceContext::create(config)?;
        let raw = RawInstance::Vulkan {
            instance: ctx.instance.handle().as_raw(),
            get_instance_proc_addr: ctx.get_instance_proc_addr(),
        };
        self.instance = Some(ctx);
        Ok(raw)
    }

    fn create_debug_messenger(&mut self, config: &InteropConfig) -> Result<(), InteropError> {
        if !config.validation {
            return Ok(());
        }
        match self.instance.as_mut() {
            Some(ctx) => ctx.create_messenger(),
            None => Err(not_created("Vulkan instance")),
        }
    }

    fn adopt_surface(&mut self, surface: RawSurface) -> Result<(), InteropError> {
        match surface {
            RawSurface::Vulkan(raw) if raw != 0 => {
                self.surface = vk::SurfaceKHR::from_raw(raw);
                Ok(())
            }
            other => Err(InteropError::native(
                format!("expected a Vulkan surface, got {other:?}"),
                NativeCode::None,
            )),
        }
    }

    fn enumerate_adapters(&mut self) -> Result<Vec<AdapterInfo>, InteropError> {
        let Some(ctx) = self.instance.as_ref() else {
            return Err(not_created("Vulkan instance"));
        };
        device::enumerate(ctx, self.surface, &mut self.physical_devices)
    }

    fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            extensions: device::required_extensions()
                .iter()
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            queues: QueueRequirements {
                graphics: true,
                present: true,
            },
            swapchain: true,
        }
    }

    fn create_device(&mut self, selected: &SelectedDevice) -> Result<(), InteropError> {
        let gl = GlExtFunctions::load().map_err(|err| {
            InteropError::native(format!("{err:#}"), NativeCode::None)
        })?;
        let ctx = self.instance_ctx()?;
        let physical = self
            .physical_devices
            .get(selected.adapter_index as usize)
            .copied()
            .ok_or_else(|| {
                InteropError::native(
                    format!("adapter {} was not enumerated", selected.adapter_index),
                    NativeCode::None,
                )
            })?;
        let device = DeviceContext::create(ctx, physical, selected)?;
        self.device = Some(device);
        self.gl = Some(gl);
        Ok(())
    }

    fn create_frame_resources(&mut self) -> Result<(), InteropError> {
        let res = create_frame_resources(self.device_ctx()?)?;
        self.frame = Some(res);
        Ok(())
    }

    fn wait_frame_fence(&mut self, timeout: Duration) -> Result<bool, InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;
        match unsafe {
            dev.device
                .wait_for_fences(&[frame.in_flight], true, timeout_ns(timeout))
        } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(result) => Err(vk_error("vkWaitForFences", result)),
        }
    }

    fn reset_frame_fence(&mut self) -> Result<(), InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;
        unsafe { dev.device.reset_fences(&[frame.in_flight]) }.or_vk("vkResetFences")
    }

    fn gl_wait_ready(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError> {
        let gl = self.gl_fns()?;
        unsafe {
            gl.wait(
                shared.gl_ready,
                shared.texture,
                gl_ext::LAYOUT_TRANSFER_SRC_EXT,
            )
        };
        match gl_ext::take_error() {
            None => Ok(()),
            Some(code) => Err(InteropError::acquire("glWaitSemaphoreEXT failed", code)),
        }
    }

    fn gl_begin_render(
        &mut self,
        shared: &SharedResources<Self>,
        clear_color: [f32; 4],
    ) -> Result<(), InteropError> {
        let [r, g, b, a] = clear_color;
        let extent = shared.desc.extent;
        unsafe {
            gl::BindFramebuffer(gl::FRAMEBUFFER, shared.target);
            gl::Viewport(0, 0, extent.width as i32, extent.height as i32);
            gl::ClearColor(r, g, b, a);
            gl::Clear(gl::COLOR_BUFFER_BIT);
        }
        match gl_ext::take_error() {
            None => Ok(()),
            Some(code) => Err(InteropError::native("clearing the shared target failed", code)),
        }
    }

    fn gl_signal_complete(&mut self, shared: &SharedResources<Self>) -> Result<(), InteropError> {
        let gl = self.gl_fns()?;
        unsafe {
            gl.signal(
                shared.gl_complete,
                shared.texture,
                gl_ext::LAYOUT_TRANSFER_SRC_EXT,
            );
            gl::Flush();
        }
        match gl_ext::take_error() {
            None => Ok(()),
            Some(code) => Err(InteropError::submit("glSignalSemaphoreEXT failed", code)),
        }
    }

    fn record_handoff(
        &mut self,
        image_index: u32,
        shared: &SharedResources<Self>,
        handoff: HandoffKind,
    ) -> Result<(), InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;
        let sc = &self.swapchain;
        let idx = image_index as usize;
        let (Some(&target), Some(&framebuffer)) = (sc.images.get(idx), sc.framebuffers.get(idx))
        else {
            return Err(InteropError::submit(
                format!("swapchain image {image_index} does not exist"),
                NativeCode::None,
            ));
        };
        let device = &dev.device;
        let cmd = frame.cmd;
        let src = shared.image.image;
        let src_extent = shared.desc.extent;
        let dst_extent = sc.extent;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .or_vk("vkResetCommandBuffer")?;
            let begin = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin)
                .or_vk("vkBeginCommandBuffer")?;

            // Clear pass leaves the presentable image in TRANSFER_DST_OPTIMAL.
            let clear = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            }];
            let pass_begin = vk::RenderPassBeginInfo::default()
                .render_pass(dev.render_pass)
                .framebuffer(framebuffer)
                .render_area(vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent: dst_extent,
                })
                .clear_values(&clear);
            device.cmd_begin_render_pass(cmd, &pass_begin, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(cmd);

            let width = src_extent.width.min(dst_extent.width);
            let height = src_extent.height.min(dst_extent.height);
            match handoff {
                HandoffKind::Copy => {
                    let region = vk::ImageCopy {
                        src_subresource: color_layers(),
                        src_offset: vk::Offset3D::default(),
                        dst_subresource: color_layers(),
                        dst_offset: vk::Offset3D::default(),
                        extent: vk::Extent3D {
                            width,
                            height,
                            depth: 1,
                        },
                    };
                    device.cmd_copy_image(
                        cmd,
                        src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        target,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                HandoffKind::Blit => {
                    let corner = vk::Offset3D {
                        x: width as i32,
                        y: height as i32,
                        z: 1,
                    };
                    let region = vk::ImageBlit {
                        src_subresource: color_layers(),
                        src_offsets: [vk::Offset3D::default(), corner],
                        dst_subresource: color_layers(),
                        dst_offsets: [vk::Offset3D::default(), corner],
                    };
                    device.cmd_blit_image(
                        cmd,
                        src,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        target,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                        vk::Filter::NEAREST,
                    );
                }
            }

            let to_present = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::empty())
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(target)
                .subresource_range(full_color_range());
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );

            device.end_command_buffer(cmd).or_vk("vkEndCommandBuffer")?;
        }
        Ok(())
    }

    fn submit(
        &mut self,
        _image_index: u32,
        shared: &SharedResources<Self>,
    ) -> Result<(), InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;

        let wait = [frame.image_available, shared.complete];
        let stages = [
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::PipelineStageFlags::TRANSFER,
        ];
        let signal = [frame.render_finished, shared.ready];
        let cmds = [frame.cmd];
        let submit = vk::SubmitInfo::default()
            .wait_semaphores(&wait)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(&signal);

        unsafe {
            dev.device
                .queue_submit(dev.graphics_queue, &[submit], frame.in_flight)
        }
        .map_err(|result| match vk_error("vkQueueSubmit", result) {
            InteropError::Native { detail, code } => InteropError::submit(detail, code),
            other => other,
        })
    }

    fn present(&mut self, image_index: u32) -> Result<PresentOutcome, InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;

        let wait = [frame.render_finished];
        let swapchains = [self.swapchain.swapchain];
        let indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match unsafe { dev.swapchain_fn.queue_present(dev.present_queue, &info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Err(InteropError::PresentStale),
            Err(result) => Err(vk_error("vkQueuePresentKHR", result)),
        }
    }

    fn destroy_frame_resources(&mut self) {
        let Some(res) = self.frame.take() else {
            return;
        };
        match self.device.as_ref() {
            Some(dev) => destroy_frame_resources(&dev.device, res),
            None => warn!("frame resources outlived their device"),
        }
    }

    fn destroy_device(&mut self) {
        self.gl = None;
        self.physical_devices.clear();
        if let Some(dev) = self.device.take() {
            dev.destroy();
        }
    }

    fn destroy_surface(&mut self) {
        if self.surface == vk::SurfaceKHR::null() {
            return;
        }
        if let Some(ctx) = self.instance.as_ref() {
            unsafe { ctx.surface_fn.destroy_surface(self.surface, None) };
            debug!("surface destroyed");
        }
        self.surface = vk::SurfaceKHR::null();
    }

    fn destroy_instance(&mut self) {
        if let Some(ctx) = self.instance.take() {
            ctx.destroy();
        }
    }
}
