// Device images with tracked layout
//
// The storage image the ray generation shader writes to. Its layout is kept on
// the value and every transition names the layout it expects to leave.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::barrier::{color_subresource_range, record_transition};
use super::buffer::allocate_memory;
use super::VulkanDevice;

pub struct DeviceImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub memory: vk::DeviceMemory,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    layout: vk::ImageLayout,
    device: Arc<VulkanDevice>,
}

impl DeviceImage {
    /// 2D device-local image plus a color view, starting in UNDEFINED
    pub fn new(
        device: &Arc<VulkanDevice>,
        format: vk::Format,
        extent: vk::Extent2D,
        usage: vk::ImageUsageFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let memory = match allocate_memory(
            device,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            image,
            view: vk::ImageView::null(),
            memory,
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            device: device.clone(),
        };

        unsafe { device.device.bind_image_memory(image, memory, 0) }
            .context("Failed to bind image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());

        this.view = unsafe { device.device.create_image_view(&view_info, None) }
            .context("Failed to create image view")?;

        Ok(this)
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    /// Record a transition from `from` to `to`
    ///
    /// Fails without recording anything when `from` is not the tracked layout
    /// or the pair is not a supported transition.
    pub fn transition(
        &mut self,
        cmd: vk::CommandBuffer,
        from: vk::ImageLayout,
        to: vk::ImageLayout,
    ) -> Result<()> {
        check_layout(self.layout, from)?;
        record_transition(&self.device.device, cmd, self.image, from, to)?;
        self.layout = to;
        Ok(())
    }
}

fn check_layout(tracked: vk::ImageLayout, expected: vk::ImageLayout) -> Result<()> {
    anyhow::ensure!(
        tracked == expected,
        "Image layout mismatch: expected {:?}, image is in {:?}",
        expected,
        tracked
    );
    Ok(())
}

impl Drop for DeviceImage {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_layout_passes() {
        assert!(check_layout(vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL).is_ok());
    }

    #[test]
    fn mismatched_layout_is_reported() {
        let err = check_layout(vk::ImageLayout::GENERAL, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
    }
}
