// Command pool and one-shot submission
//
// Per-frame command buffers are allocated from the pool and reset
// individually. Setup work (uploads, acceleration structure builds, the first
// storage image transition) goes through `one_shot`, which blocks until the
// queue is idle.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    queue: vk::Queue,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    /// Pool on the graphics queue family with individually resettable buffers
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(device.graphics_queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            queue: device.graphics_queue,
            device: device.clone(),
        })
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .context("Failed to allocate command buffers")
    }

    /// Record with `record`, submit, and wait for the queue to drain
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;
        let cmd = self.allocate(1)?[0];

        let result = (|| -> Result<()> {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }?;

            record(cmd)?;

            unsafe { device.end_command_buffer(cmd) }?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            unsafe {
                device
                    .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                    .context("Failed to submit one-shot command buffer")?;
                device
                    .queue_wait_idle(self.queue)
                    .context("Failed to wait for one-shot command buffer")?;
            }
            Ok(())
        })();

        unsafe { device.free_command_buffers(self.pool, &[cmd]) };
        result
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_command_pool(self.pool, None);
        }
    }
}
