//! Swapchain, per-image views and framebuffers, and the clear render pass.

use std::time::Duration;

use ash::vk;
use tracing::debug;

use interop_core::swapchain::{
    AcquireOutcome, SurfaceCapabilities, SwapchainBackend, SwapchainDescriptor,
};
use interop_core::{InteropError, NativeCode};

use super::backend::VulkanBackend;
use super::convert::{
    extent, present_mode, surface_formats, vk_color_space, vk_extent, vk_format, vk_present_mode,
};
use super::device::DeviceContext;
use super::{not_created, timeout_ns, vk_error, VkResultExt};

#[derive(Default)]
pub(super) struct SwapchainState {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
}

fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
) -> Result<vk::RenderPass, InteropError> {
    let attachments = [vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)];
    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let subpasses = [vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)];
    let dependencies = [
        vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE),
        vk::SubpassDependency::default()
            .src_subpass(0)
            .dst_subpass(vk::SUBPASS_EXTERNAL)
            .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_stage_mask(vk::PipelineStageFlags::TRANSFER)
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE),
    ];
    let info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);
    unsafe { device.create_render_pass(&info, None) }.or_vk("vkCreateRenderPass")
}

fn ensure_render_pass(
    dev: &mut DeviceContext,
    format: vk::Format,
    format_changed: bool,
) -> Result<(), InteropError> {
    let reusable = dev.render_pass != vk::RenderPass::null() && dev.render_pass_format == format;
    if !format_changed && reusable {
        return Ok(());
    }
    let pass = create_render_pass(&dev.device, format)?;
    if dev.render_pass != vk::RenderPass::null() {
        unsafe { dev.device.destroy_render_pass(dev.render_pass, None) };
    }
    dev.render_pass = pass;
    dev.render_pass_format = format;
    debug!("render pass rebuilt for {format:?}");
    Ok(())
}

impl SwapchainState {
    fn create_targets(&mut self, dev: &DeviceContext) -> Result<(), InteropError> {
        let device = &dev.device;
        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.create_image_view(&view_info, None) }
                .or_vk("vkCreateImageView")?;
            self.views.push(view);

            let attachments = [view];
            let fb_info = vk::FramebufferCreateInfo::default()
                .render_pass(dev.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            let framebuffer = unsafe { device.create_framebuffer(&fb_info, None) }
                .or_vk("vkCreateFramebuffer")?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_targets(&mut self, device: &ash::Device) {
        unsafe {
            for fb in self.framebuffers.drain(..) {
                device.destroy_framebuffer(fb, None);
            }
            for view in self.views.drain(..) {
                device.destroy_image_view(view, None);
            }
        }
    }
}

impl SwapchainBackend for VulkanBackend {
    fn surface_capabilities(&mut self) -> Result<SurfaceCapabilities, InteropError> {
        let ctx = self.instance_ctx()?;
        let dev = self.device_ctx()?;
        let (caps, formats, modes) = unsafe {
            (
                ctx.surface_fn
                    .get_physical_device_surface_capabilities(dev.physical, self.surface)
                    .or_vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?,
                ctx.surface_fn
                    .get_physical_device_surface_formats(dev.physical, self.surface)
                    .or_vk("vkGetPhysicalDeviceSurfaceFormatsKHR")?,
                ctx.surface_fn
                    .get_physical_device_surface_present_modes(dev.physical, self.surface)
                    .or_vk("vkGetPhysicalDeviceSurfacePresentModesKHR")?,
            )
        };

        // u32::MAX means the swapchain decides the extent.
        let current_extent =
            (caps.current_extent.width != u32::MAX).then(|| extent(caps.current_extent));
        Ok(SurfaceCapabilities {
            current_extent,
            min_extent: extent(caps.min_image_extent),
            max_extent: extent(caps.max_image_extent),
            min_image_count: caps.min_image_count,
            max_image_count: caps.max_image_count,
            formats: surface_formats(&formats),
            present_modes: modes.into_iter().filter_map(present_mode).collect(),
        })
    }

    fn wait_idle(&mut self) -> Result<(), InteropError> {
        let dev = self.device_ctx()?;
        unsafe { dev.device.device_wait_idle() }.or_vk("vkDeviceWaitIdle")
    }

    fn create_swapchain(&mut self, desc: &SwapchainDescriptor) -> Result<u32, InteropError> {
        let ctx = self.instance_ctx()?;
        let dev = self.device_ctx()?;
        let caps = unsafe {
            ctx.surface_fn
                .get_physical_device_surface_capabilities(dev.physical, self.surface)
        }
        .or_vk("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")?;

        let families = [dev.graphics_family, dev.present_family];
        let split = dev.graphics_family != dev.present_family;
        let format = vk_format(desc.format);
        let mut usage = vk::ImageUsageFlags::empty();
        if desc.usage.color_attachment {
            usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if desc.usage.transfer_dst {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let mut info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(format)
            .image_color_space(vk_color_space(desc.color_space))
            .image_extent(vk_extent(desc.extent))
            .image_array_layers(1)
            .image_usage(usage)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk_present_mode(desc.present_mode))
            .clipped(true);
        info = if split {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { dev.swapchain_fn.create_swapchain(&info, None) }
            .map_err(|result| match vk_error("vkCreateSwapchainKHR", result) {
                InteropError::Native { detail, code } => InteropError::swapchain(detail, code),
                other => other,
            })?;
        let images = match unsafe { dev.swapchain_fn.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(result) => {
                unsafe { dev.swapchain_fn.destroy_swapchain(swapchain, None) };
                return Err(InteropError::swapchain(
                    format!("vkGetSwapchainImagesKHR: {result:?}"),
                    NativeCode::Vk(result.as_raw()),
                ));
            }
        };

        let count = images.len() as u32;
        self.swapchain = SwapchainState {
            swapchain,
            images,
            views: Vec::new(),
            framebuffers: Vec::new(),
            format,
            extent: vk_extent(desc.extent),
        };
        Ok(count)
    }

    fn destroy_swapchain(&mut self) {
        let state = std::mem::take(&mut self.swapchain);
        if state.swapchain == vk::SwapchainKHR::null() {
            return;
        }
        if let Some(dev) = self.device.as_ref() {
            unsafe { dev.swapchain_fn.destroy_swapchain(state.swapchain, None) };
        }
    }

    fn create_image_targets(
        &mut self,
        desc: &SwapchainDescriptor,
        format_changed: bool,
    ) -> Result<(), InteropError> {
        let Some(dev) = self.device.as_mut() else {
            return Err(not_created("Vulkan device"));
        };
        ensure_render_pass(dev, vk_format(desc.format), format_changed)?;
        if let Err(err) = self.swapchain.create_targets(dev) {
            self.swapchain.destroy_targets(&dev.device);
            return Err(err);
        }
        debug!(
            "{} image views and framebuffers at {}x{}",
            self.swapchain.views.len(),
            desc.extent.width,
            desc.extent.height
        );
        Ok(())
    }

    fn destroy_image_targets(&mut self) {
        if let Some(dev) = self.device.as_ref() {
            self.swapchain.destroy_targets(&dev.device);
        }
    }

    fn acquire_next_image(&mut self, timeout: Duration) -> Result<AcquireOutcome, InteropError> {
        let dev = self.device_ctx()?;
        let frame = self.frame_res()?;
        let result = unsafe {
            dev.swapchain_fn.acquire_next_image(
                self.swapchain.swapchain,
                timeout_ns(timeout),
                frame.image_available,
                vk::Fence::null(),
            )
        };
        match result {
            // A suboptimal image is still usable; present reports it.
            Ok((index, _suboptimal)) => Ok(AcquireOutcome::Image(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Ok(AcquireOutcome::Timeout),
            Err(result) => Err(match vk_error("vkAcquireNextImageKHR", result) {
                InteropError::Native { detail, code } => InteropError::acquire(detail, code),
                other => other,
            }),
        }
    }
}
