// Synchronization primitives
//
// One set of semaphores + fence per frame in flight, plus the table that
// tracks which frame last rendered into each swapchain image.

use ash::vk;
use anyhow::{Context, Result};
use super::VulkanDevice;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // First wait must not block

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
                in_flight_fence: device.device.create_fence(&fence_info, None)
                    .context("Failed to create fence")?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Frame slot bookkeeping, independent of any Vulkan handles.
///
/// `images_in_flight[i]` holds the frame slot that last submitted work for
/// swapchain image `i`, so a slot is never reused for an image still in use.
#[derive(Debug, Clone)]
pub struct FrameTracker {
    current_frame: usize,
    max_frames_in_flight: usize,
    images_in_flight: Vec<Option<usize>>,
}

impl FrameTracker {
    pub fn new(max_frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            current_frame: 0,
            max_frames_in_flight: max_frames_in_flight.max(1),
            images_in_flight: vec![None; image_count],
        }
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }

    /// Claim `image_index` for the current frame. Returns the frame slot
    /// whose fence must be waited on first, if another slot still owns it.
    pub fn claim_image(&mut self, image_index: usize) -> Option<usize> {
        let previous = self.images_in_flight[image_index]
            .filter(|&frame| frame != self.current_frame);
        self.images_in_flight[image_index] = Some(self.current_frame);
        previous
    }

    pub fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.max_frames_in_flight;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_wrap_around() {
        let mut tracker = FrameTracker::new(2, 3);
        assert_eq!(tracker.current_frame(), 0);
        tracker.advance();
        assert_eq!(tracker.current_frame(), 1);
        tracker.advance();
        assert_eq!(tracker.current_frame(), 0);
    }

    #[test]
    fn zero_frames_in_flight_means_one() {
        let mut tracker = FrameTracker::new(0, 2);
        assert_eq!(tracker.max_frames_in_flight(), 1);
        tracker.advance();
        assert_eq!(tracker.current_frame(), 0);
    }

    #[test]
    fn image_reused_by_other_frame_must_wait() {
        let mut tracker = FrameTracker::new(2, 3);
        assert_eq!(tracker.claim_image(0), None);
        tracker.advance();
        // Frame 1 gets image 0 back while frame 0 may still be rendering to it
        assert_eq!(tracker.claim_image(0), Some(0));
        tracker.advance();
        // Frame 0 again, image 0 now owned by frame 1
        assert_eq!(tracker.claim_image(0), Some(1));
    }

    #[test]
    fn same_frame_does_not_wait_on_itself() {
        let mut tracker = FrameTracker::new(1, 2);
        assert_eq!(tracker.claim_image(1), None);
        tracker.advance();
        // Own fence was already waited on during acquire
        assert_eq!(tracker.claim_image(1), None);
    }
}
