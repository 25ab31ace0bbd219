// Swapchain - Window presentation
//
// Owns everything whose lifetime follows the swapchain: images and views,
// depth buffers, render pass, framebuffers and the per-frame sync objects.
// A resize replaces the whole object; the previous one is handed to the
// new swapchain as `old_swapchain` and dropped once the new one exists.

use anyhow::{Context, Result};
use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;
use super::buffer::AllocatedImage;
use super::pipeline::{create_framebuffers, create_render_pass};
use super::sync::{FrameSync, FrameTracker};
use super::VulkanDevice;

const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode if the surface supports it; FIFO is always available
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

/// Use the surface's extent unless it leaves the choice to us
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_extent: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_extent
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_extent
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum so we never wait on the driver; a maximum of
/// zero means unbounded
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        caps.max_image_count
    } else {
        image_count
    }
}

/// `(color, depth)` format pairs match
pub fn formats_match(a: (vk::Format, vk::Format), b: (vk::Format, vk::Format)) -> bool {
    a == b
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub format: vk::Format,
    pub depth_format: vk::Format,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    depth_images: Vec<AllocatedImage>,
    frame_sync: Vec<FrameSync>,
    tracker: FrameTracker,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Create a swapchain for the device's surface.
    ///
    /// Pass the current swapchain as `previous` when recreating; it is
    /// retired through `old_swapchain` and destroyed before this returns.
    pub fn new(
        device: Arc<VulkanDevice>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        max_frames_in_flight: usize,
        previous: Option<Swapchain>,
    ) -> Result<Self> {
        let (surface_caps, formats, present_modes) = device.surface_support()?;

        let surface_format =
            choose_surface_format(&formats).context("No suitable surface format")?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        let extent = choose_extent(&surface_caps, window_extent);
        let image_count = choose_image_count(&surface_caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {:?}",
            extent.width,
            extent.height,
            surface_format.format,
            present_mode
        );

        let swapchain_loader = khr::Swapchain::new(&device.instance, &device.device);

        let old_swapchain = previous
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |old| old.swapchain);

        let queue_family_indices = [device.queue_families.graphics, device.queue_families.present];

        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if device.queue_families.is_shared() {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        } else {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_family_indices)
        };

        let depth_format = device.find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        let images = match unsafe { swapchain_loader.get_swapchain_images(swapchain) } {
            Ok(images) => images,
            Err(e) => {
                unsafe { swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e).context("Failed to get swapchain images");
            }
        };

        log::info!("Created swapchain with {} images", images.len());

        // Everything below is released by Drop if a later step fails
        let mut this = Self {
            swapchain,
            swapchain_loader,
            tracker: FrameTracker::new(max_frames_in_flight, images.len()),
            images,
            image_views: Vec::new(),
            format: surface_format.format,
            depth_format,
            extent,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            depth_images: Vec::new(),
            frame_sync: Vec::new(),
            device,
        };

        this.create_image_views()?;
        this.render_pass = create_render_pass(&this.device, this.format, this.depth_format)?;
        this.create_depth_resources()?;

        let depth_views: Vec<_> = this.depth_images.iter().map(|depth| depth.view).collect();
        this.framebuffers = create_framebuffers(
            &this.device,
            &this.image_views,
            &depth_views,
            this.render_pass,
            this.extent,
        )?;

        for _ in 0..this.tracker.max_frames_in_flight() {
            let sync = FrameSync::new(&this.device)?;
            this.frame_sync.push(sync);
        }

        // Pipelines built against the retired swapchain's render pass must
        // stay compatible with the new one
        if let Some(old) = &previous {
            if !this.compare_formats(old) {
                anyhow::bail!(
                    "Swapchain image or depth format has changed ({:?}/{:?} -> {:?}/{:?})",
                    old.format,
                    old.depth_format,
                    this.format,
                    this.depth_format
                );
            }
        }
        drop(previous);

        Ok(this)
    }

    fn create_image_views(&mut self) -> Result<()> {
        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::builder()
                .image(image)
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

            let view = unsafe { self.device.device.create_image_view(&create_info, None) }
                .context("Failed to create image view")?;
            self.image_views.push(view);
        }
        Ok(())
    }

    fn create_depth_resources(&mut self) -> Result<()> {
        for _ in 0..self.images.len() {
            let depth =
                AllocatedImage::new_depth(self.device.clone(), self.extent, self.depth_format)?;
            self.depth_images.push(depth);
        }
        Ok(())
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, index: usize) -> vk::Framebuffer {
        self.framebuffers[index]
    }

    pub fn extent_aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }

    /// Both swapchains render with the same color and depth formats, so
    /// pipelines built for one work with the other
    pub fn compare_formats(&self, other: &Swapchain) -> bool {
        formats_match(
            (self.format, self.depth_format),
            (other.format, other.depth_format),
        )
    }

    /// Wait until the current frame slot is free, then acquire an image.
    ///
    /// Also waits for any other frame still rendering into the acquired
    /// image, so its command buffer can be re-recorded right away.
    /// Returns `None` when the swapchain is out of date and must be
    /// recreated. A suboptimal swapchain still renders.
    pub fn acquire_next_image(&mut self) -> Result<Option<u32>> {
        let device = &self.device.device;
        let sync = &self.frame_sync[self.tracker.current_frame()];

        unsafe { device.wait_for_fences(&[sync.in_flight_fence], true, u64::MAX) }
            .context("Failed to wait for in-flight fence")?;

        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                sync.image_available,
                vk::Fence::null(),
            )
        };

        let image_index = match result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    log::debug!("Acquired image from suboptimal swapchain");
                }
                index
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => return Ok(None),
            Err(e) => return Err(e).context("Failed to acquire swapchain image"),
        };

        if let Some(owner) = self.tracker.claim_image(image_index as usize) {
            let fence = self.frame_sync[owner].in_flight_fence;
            unsafe { device.wait_for_fences(&[fence], true, u64::MAX) }
                .context("Failed to wait for image fence")?;
        }

        Ok(Some(image_index))
    }

    /// Submit a recorded command buffer for `image_index` and present it,
    /// then move on to the next frame slot.
    ///
    /// Returns `true` when the swapchain is out of date or suboptimal.
    pub fn submit_command_buffers(
        &mut self,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> Result<bool> {
        let device = &self.device.device;
        let sync = &self.frame_sync[self.tracker.current_frame()];
        let wait_semaphores = [sync.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();

        unsafe {
            device
                .reset_fences(&[sync.in_flight_fence])
                .context("Failed to reset fence")?;
            device
                .queue_submit(self.device.graphics_queue, &[submit_info], sync.in_flight_fence)
                .context("Failed to submit draw command buffer")?;
        }

        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&signal_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.swapchain_loader
                .queue_present(self.device.present_queue, &present_info)
        };

        self.tracker.advance();

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        let device = &self.device.device;
        unsafe {
            for sync in &self.frame_sync {
                sync.destroy(device);
            }
            for &framebuffer in &self.framebuffers {
                device.destroy_framebuffer(framebuffer, None);
            }
            self.depth_images.clear();
            if self.render_pass != vk::RenderPass::null() {
                device.destroy_render_pass(self.render_pass, None);
            }
            for &view in &self.image_views {
                device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(min: u32, max: u32, current: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: current,
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D { width: 4096, height: 2048 },
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[unorm, srgb]), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_surface_when_fixed() {
        let caps = caps(2, 3, extent(800, 600));
        assert_eq!(choose_extent(&caps, extent(1920, 1080)), extent(800, 600));
    }

    #[test]
    fn extent_clamps_window_size_when_free() {
        let caps = caps(2, 3, extent(u32::MAX, u32::MAX));
        assert_eq!(choose_extent(&caps, extent(960, 540)), extent(960, 540));
        assert_eq!(choose_extent(&caps, extent(8000, 0)), extent(4096, 1));
    }

    #[test]
    fn image_count_is_min_plus_one_within_max() {
        assert_eq!(choose_image_count(&caps(2, 8, extent(1, 1))), 3);
        assert_eq!(choose_image_count(&caps(3, 3, extent(1, 1))), 3);
        assert_eq!(choose_image_count(&caps(2, 0, extent(1, 1))), 3);
    }

    #[test]
    fn format_change_in_either_attachment_is_a_mismatch() {
        let srgb_d32 = (vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT);
        assert!(formats_match(srgb_d32, srgb_d32));
        assert!(!formats_match(srgb_d32, (vk::Format::B8G8R8A8_UNORM, vk::Format::D32_SFLOAT)));
        assert!(!formats_match(srgb_d32, (vk::Format::B8G8R8A8_SRGB, vk::Format::D24_UNORM_S8_UINT)));
    }
}
