// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, plus the host-side
// bookkeeping that decides which of them a frame uses.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use super::VulkanDevice;

/// Frames the CPU may record/submit ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder()
            .flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        // Built field by field so a partial failure still releases what exists
        let mut sync = Self {
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
            device: device.clone(),
        };

        unsafe {
            sync.image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            sync.render_finished = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create render-finished semaphore")?;
            sync.in_flight_fence = device
                .device
                .create_fence(&fence_info, None)
                .context("Failed to create in-flight fence")?;
        }

        Ok(sync)
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        // Destroying a null handle is a no-op
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Creates one [`FrameSync`] per frame in flight
pub fn create_frame_syncs(device: &Arc<VulkanDevice>) -> Result<[FrameSync; MAX_FRAMES_IN_FLIGHT]> {
    let syncs = (0..MAX_FRAMES_IN_FLIGHT)
        .map(|_| FrameSync::new(device))
        .collect::<Result<Vec<_>>>()?;

    syncs
        .try_into()
        .map_err(|_| anyhow::anyhow!("Expected {} frame sync sets", MAX_FRAMES_IN_FLIGHT))
}

/// Lifecycle of a frame slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    /// Fence waited on, image being acquired
    Acquiring,
    /// Fence reset, work enqueued
    Submitted,
    Presented,
}

/// Host-side frame bookkeeping: which slot is current, what state each
/// slot is in, and which slot's fence last used each swapchain image.
#[derive(Debug)]
pub struct FrameTracker {
    current_frame: usize,
    slots: [SlotState; MAX_FRAMES_IN_FLIGHT],
    images_in_flight: Vec<Option<vk::Fence>>,
}

impl FrameTracker {
    pub fn new(image_count: usize) -> Self {
        Self {
            current_frame: 0,
            slots: [SlotState::Idle; MAX_FRAMES_IN_FLIGHT],
            images_in_flight: vec![None; image_count],
        }
    }

    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    #[cfg(test)]
    pub fn slot_state(&self, slot: usize) -> SlotState {
        self.slots[slot]
    }

    /// Slots whose work was submitted and whose fence has not been waited on since
    pub fn frames_in_flight(&self) -> usize {
        self.slots
            .iter()
            .filter(|state| matches!(state, SlotState::Submitted | SlotState::Presented))
            .count()
    }

    /// The current slot's fence has been waited on; its previous work is done.
    pub fn begin_acquire(&mut self) {
        let slot = &mut self.slots[self.current_frame];
        debug_assert!(
            matches!(slot, SlotState::Idle | SlotState::Presented),
            "slot {} acquired while {:?}",
            self.current_frame,
            slot
        );
        *slot = SlotState::Acquiring;
        log::trace!("frame slot {} -> {:?}", self.current_frame, slot);
    }

    /// Hands `image_index` to `fence`. If another submission still owns the
    /// image, `wait` is called with its fence before ownership changes.
    pub fn claim_image<W>(&mut self, image_index: u32, fence: vk::Fence, mut wait: W) -> Result<()>
    where
        W: FnMut(vk::Fence) -> Result<()>,
    {
        let image_count = self.images_in_flight.len();
        let entry = self
            .images_in_flight
            .get_mut(image_index as usize)
            .with_context(|| {
                format!("Image index {} out of range ({} images)", image_index, image_count)
            })?;

        if let Some(previous) = *entry {
            wait(previous)?;
        }
        *entry = Some(fence);

        Ok(())
    }

    pub fn mark_submitted(&mut self) {
        let slot = &mut self.slots[self.current_frame];
        debug_assert_eq!(*slot, SlotState::Acquiring);
        *slot = SlotState::Submitted;
        log::trace!("frame slot {} -> {:?}", self.current_frame, slot);
    }

    /// Records the present request and moves on to the next slot.
    pub fn mark_presented(&mut self) -> usize {
        let slot = &mut self.slots[self.current_frame];
        debug_assert_eq!(*slot, SlotState::Submitted);
        *slot = SlotState::Presented;
        log::trace!("frame slot {} -> {:?}", self.current_frame, slot);

        self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;
        self.current_frame
    }
}
