// Swapchain - Window presentation
//
// Owns the chain of images we render to, their depth buffers, the render
// pass, one framebuffer per image, and the per-frame sync objects that
// pace the CPU against the GPU.

use anyhow::{Context, Result};
use ash::{extensions::khr, vk};
use std::sync::Arc;
use thiserror::Error;

use super::image::DepthResource;
use super::surface::SwapchainSupport;
use super::sync::{create_frame_syncs, FrameSync, FrameTracker, MAX_FRAMES_IN_FLIGHT};
use super::VulkanDevice;

/// Abnormal acquire/present result. Suboptimal is not one of them.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("failed to acquire swapchain image: {0}")]
    Acquire(vk::Result),
    #[error("failed to present swapchain image: {0}")]
    Present(vk::Result),
}

/// Creates one resource per swapchain image, pushing each into `out` as it
/// is made so whatever exists when `create` fails is still owned by `out`.
pub fn create_per_image<T, F>(image_count: usize, out: &mut Vec<T>, mut create: F) -> Result<()>
where
    F: FnMut(usize) -> Result<T>,
{
    out.reserve(image_count);
    for index in 0..image_count {
        out.push(create(index)?);
    }
    Ok(())
}

/// Every per-image resource list must match the swapchain image count
pub fn check_per_image_counts(image_count: usize, counts: &[usize]) -> Result<()> {
    if let Some(&count) = counts.iter().find(|&&count| count != image_count) {
        anyhow::bail!(
            "Per-image resource count {} does not match {} swapchain images",
            count,
            image_count
        );
    }
    Ok(())
}

/// Prefer BGRA8 UNORM in the sRGB color space, otherwise whatever comes first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_UNORM
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode if the surface offers it, FIFO otherwise (always supported)
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's own extent, unless it leaves the choice to us
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    vk::Extent2D {
        width: window_extent.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_extent.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum (0 means no cap)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        image_count
    }
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub depth: Vec<DepthResource>,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
    frames: [FrameSync; MAX_FRAMES_IN_FLIGHT],
    tracker: FrameTracker,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: Arc<VulkanDevice>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        log::info!(
            "Creating swapchain: {}x{}",
            window_extent.width,
            window_extent.height
        );

        let SwapchainSupport {
            capabilities,
            formats,
            present_modes,
        } = device.swapchain_support()?;

        let surface_format =
            choose_surface_format(&formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        let extent = choose_extent(&capabilities, window_extent);
        let image_count = choose_image_count(&capabilities);

        log::info!("Present mode: {:?}", present_mode);

        let depth_format = device.find_depth_format()?;
        log::info!("Depth format: {:?}", depth_format);

        let frames = create_frame_syncs(&device)?;

        let queue_family_indices = [
            device.queue_families.graphics,
            device.queue_families.present,
        ];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface.handle)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());

        create_info = if device.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices)
        };

        let swapchain_loader = khr::Swapchain::new(&device.instance.raw, &device.device);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // The driver may hand back more images than requested
        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        // From here on Drop cleans up whatever has been created so far
        let mut chain = Self {
            tracker: FrameTracker::new(images.len()),
            swapchain,
            swapchain_loader,
            images,
            image_views: Vec::new(),
            depth: Vec::new(),
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            format: surface_format.format,
            depth_format,
            extent,
            frames,
            device,
        };

        chain.create_image_views()?;
        chain.create_render_pass()?;
        chain.create_depth_resources()?;
        chain.create_framebuffers()?;

        check_per_image_counts(chain.image_count(), &chain.per_image_counts())?;

        Ok(chain)
    }

    fn create_image_views(&mut self) -> Result<()> {
        create_per_image(self.images.len(), &mut self.image_views, |index| {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(self.images[index])
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            unsafe { self.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")
        })
    }

    /// Single subpass: color (presented) + depth (discarded)
    fn create_render_pass(&mut self) -> Result<()> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let depth_attachment = vk::AttachmentDescription::builder()
            .format(self.depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let depth_attachment_ref = vk::AttachmentReference::builder()
            .attachment(1)
            .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .depth_stencil_attachment(&depth_attachment_ref)
            .build();

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();

        let attachments = &[color_attachment, depth_attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        self.render_pass = unsafe { self.device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create render pass")?;
        Ok(())
    }

    fn create_depth_resources(&mut self) -> Result<()> {
        create_per_image(self.images.len(), &mut self.depth, |_| {
            DepthResource::new(&self.device, self.depth_format, self.extent)
        })
    }

    fn create_framebuffers(&mut self) -> Result<()> {
        create_per_image(self.images.len(), &mut self.framebuffers, |index| {
            let attachments = &[self.image_views[index], self.depth[index].view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(self.render_pass)
                .attachments(attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);

            unsafe { self.device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")
        })
    }

    /// Waits until the current frame slot is free, then acquires the next
    /// presentable image. Returns the image index and whether the swapchain
    /// is suboptimal for the surface.
    pub fn acquire_next_image(&mut self) -> Result<(u32, bool)> {
        let frame = &self.frames[self.tracker.current_frame()];

        self.device.wait_for_fence(frame.in_flight_fence)?;
        self.tracker.begin_acquire();

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                frame.image_available,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok((index, suboptimal)),
            Err(e) => Err(FrameError::Acquire(e).into()),
        }
    }

    /// Submits `command_buffer` for the acquired `image_index` and queues
    /// the image for presentation. Returns whether the swapchain is suboptimal.
    pub fn submit_command_buffers(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<bool> {
        let device = &self.device;
        let frame = &self.frames[self.tracker.current_frame()];

        // Another frame may still be rendering into this image
        self.tracker
            .claim_image(image_index, frame.in_flight_fence, |fence| {
                device.wait_for_fence(fence)
            })?;

        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device
                .device
                .reset_fences(&[frame.in_flight_fence])
                .context("Failed to reset in-flight fence")?;
            device
                .device
                .queue_submit(
                    device.graphics_queue,
                    &[submit_info.build()],
                    frame.in_flight_fence,
                )
                .context("Failed to submit draw command buffer")?;
        }
        self.tracker.mark_submitted();
        debug_assert!(self.tracker.frames_in_flight() <= MAX_FRAMES_IN_FLIGHT);

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(device.present_queue, &present_info)
        };
        self.tracker.mark_presented();

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(e) => Err(FrameError::Present(e).into()),
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Image views, depth resources and framebuffers, in that order
    pub fn per_image_counts(&self) -> [usize; 3] {
        [self.image_views.len(), self.depth.len(), self.framebuffers.len()]
    }

    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.framebuffers[index]
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        // In-flight work may still reference any of these
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device wait idle failed before swapchain teardown: {:#}", e);
        }

        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(self.render_pass, None);
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        // Depth resources and frame sync objects release themselves
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn choose_surface_format_prefers_bgra_unorm_srgb() {
        let fallback = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let preferred = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[fallback, preferred]).unwrap();
        assert_eq!(chosen.format, preferred.format);
        assert_eq!(chosen.color_space, preferred.color_space);
    }

    #[test]
    fn choose_surface_format_falls_back_to_first() {
        let first = vk::SurfaceFormatKHR {
            format: vk::Format::R8G8B8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let second = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let chosen = choose_surface_format(&[first, second]).unwrap();
        assert_eq!(chosen.format, first.format);
        assert!(choose_surface_format(&[]).is_none());
    }

    #[test]
    fn choose_present_mode_uses_preference_when_available() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
            vk::PresentModeKHR::MAILBOX,
        );
        assert_eq!(chosen, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn choose_present_mode_falls_back_to_fifo() {
        let chosen = choose_present_mode(
            &[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO],
            vk::PresentModeKHR::MAILBOX,
        );
        assert_eq!(chosen, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn choose_extent_uses_current_when_fixed() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 1280,
                height: 720,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );

        assert_eq!(chosen.width, 1280);
        assert_eq!(chosen.height, 720);
    }

    #[test]
    fn choose_extent_clamps_when_variable() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 640,
                height: 480,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };

        let chosen = choose_extent(
            &capabilities,
            vk::Extent2D {
                width: 4000,
                height: 100,
            },
        );

        assert_eq!(chosen.width, 1920);
        assert_eq!(chosen.height, 480);
    }

    #[test]
    fn choose_image_count_adds_one_to_minimum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 3);
    }

    #[test]
    fn choose_image_count_respects_maximum() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 2,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&capabilities), 2);
    }

    #[test]
    fn per_image_resources_match_image_count() {
        for image_count in [2, 3, 4] {
            let images: Vec<u64> = (0..image_count as u64).collect();
            let mut views = Vec::new();
            let mut depth = Vec::new();
            let mut framebuffers = Vec::new();

            create_per_image(images.len(), &mut views, |i| Ok(images[i] + 100)).unwrap();
            create_per_image(images.len(), &mut depth, |i| Ok(images[i] + 200)).unwrap();
            create_per_image(images.len(), &mut framebuffers, |i| Ok((views[i], depth[i])))
                .unwrap();

            let counts = [views.len(), depth.len(), framebuffers.len()];
            assert_eq!(counts, [image_count; 3]);
            assert!(check_per_image_counts(image_count, &counts).is_ok());
            assert_eq!(framebuffers[1], (101, 201));
        }
    }

    #[test]
    fn failed_creation_keeps_what_was_made() {
        let mut views = Vec::new();
        let result = create_per_image(3, &mut views, |i| {
            if i == 2 {
                Err(anyhow::anyhow!(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY))
            } else {
                Ok(i)
            }
        });

        assert!(result.is_err());
        assert_eq!(views, vec![0, 1]);
    }

    #[test]
    fn mismatched_counts_are_rejected() {
        assert!(check_per_image_counts(3, &[3, 3, 3, 3]).is_ok());
        assert!(check_per_image_counts(3, &[3, 2, 3]).is_err());
        assert!(check_per_image_counts(2, &[2, 2, 3]).is_err());
    }

    #[test]
    fn frame_errors_keep_the_raw_result() {
        let error = anyhow::Error::from(FrameError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(
            error.downcast_ref::<FrameError>(),
            Some(&FrameError::Acquire(vk::Result::ERROR_OUT_OF_DATE_KHR))
        );
    }
}
