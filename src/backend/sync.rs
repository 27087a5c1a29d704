// Synchronization primitives
//
// Fences and semaphores for the frames in flight. Slots are used round-robin;
// a slot's fence must be waited on before its command buffer is reused.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

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
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            Ok(Self {
                image_available: device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
                render_finished: device
                    .device
                    .create_semaphore(&semaphore_info, None)
                    .context("Failed to create semaphore")?,
                in_flight_fence: device
                    .device
                    .create_fence(&fence_info, None)
                    .context("Failed to create fence")?,
                device: device.clone(),
            })
        }
    }

    /// Block until the GPU is done with this slot's last submission
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .context("Failed to wait for in-flight fence")
    }

    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .context("Failed to reset in-flight fence")
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Round-robin index over the frames in flight
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCursor {
    current: usize,
}

impl FrameCursor {
    pub fn current(&self) -> usize {
        self.current
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % MAX_FRAMES_IN_FLIGHT;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_alternates_between_two_slots() {
        let mut cursor = FrameCursor::default();
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(cursor.current());
            cursor.advance();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
    }
}
