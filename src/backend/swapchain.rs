// Swapchain - Window presentation
//
// Owns the chain of presentable images together with everything sized to
// it: one view and one overlay framebuffer per image, plus the storage image
// the rays are traced into. The whole set is dropped and rebuilt on resize.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::image::DeviceImage;
use super::pipeline::create_framebuffers;
use super::VulkanDevice;

/// Format of the ray traced storage image
pub const STORAGE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Source of the drawable size of the window being presented to
pub trait DrawableSurface {
    /// Current size in pixels, zero while minimized
    fn drawable_extent(&self) -> vk::Extent2D;

    /// Block or pump events until the size may have changed
    fn wait_for_resize(&self);
}

/// The current size if the surface has any area
pub fn visible_extent<S: DrawableSurface + ?Sized>(surface: &S) -> Option<vk::Extent2D> {
    let extent = surface.drawable_extent();
    (extent.width > 0 && extent.height > 0).then_some(extent)
}

/// Block until the surface has a non-zero size and return it
///
/// Only returns if the size can change while blocked. A winit window on
/// Wayland updates its size during event dispatch, so mid-frame callers use
/// `visible_extent` and retry later instead.
pub fn wait_for_drawable_extent<S: DrawableSurface + ?Sized>(surface: &S) -> vk::Extent2D {
    loop {
        if let Some(extent) = visible_extent(surface) {
            return extent;
        }
        surface.wait_for_resize();
    }
}

/// Prefer 4x32 float with sRGB non-linear color space, else the first format
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::R32G32B32A32_SFLOAT
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// FIFO with vsync; otherwise MAILBOX > IMMEDIATE > FIFO (always supported)
pub fn choose_present_mode(vsync: bool, modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && image_count > caps.max_image_count {
        image_count = caps.max_image_count;
    }
    image_count
}

/// Query the surface and pick the format the swapchain will use
pub fn select_surface_format(device: &VulkanDevice) -> Result<vk::SurfaceFormatKHR> {
    let formats = unsafe {
        device
            .surface_loader
            .get_physical_device_surface_formats(device.physical_device, device.surface)
    }
    .context("Failed to query surface formats")?;

    let format = choose_surface_format(&formats).context("No suitable surface format")?;
    log::info!("Surface format: {:?} {:?}", format.format, format.color_space);
    Ok(format)
}

/// Result of asking the present engine for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Image { index: u32, suboptimal: bool },
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub storage_image: DeviceImage,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn new(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        render_pass: vk::RenderPass,
        format: vk::SurfaceFormatKHR,
        requested: vk::Extent2D,
        vsync: bool,
    ) -> Result<Self> {
        let surface_caps = device.surface_capabilities()?;

        let present_modes = unsafe {
            device
                .surface_loader
                .get_physical_device_surface_present_modes(device.physical_device, device.surface)
        }
        .context("Failed to query present modes")?;

        let present_mode = choose_present_mode(vsync, &present_modes);
        let extent = choose_extent(&surface_caps, requested);
        let image_count = choose_image_count(&surface_caps);

        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images requested",
            extent.width,
            extent.height,
            present_mode,
            image_count
        );

        let queue_families = [device.graphics_queue_family, device.present_queue_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(device.surface)
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(surface_caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        create_info = if device.graphics_queue_family != device.present_queue_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe { device.swapchain_loader.create_swapchain(&create_info, None) }
            .context("Failed to create swapchain")?;

        // Storage image first so a failure below still releases the swapchain
        let storage_image = match Self::create_storage_image(device, pool, extent) {
            Ok(image) => image,
            Err(e) => {
                unsafe { device.swapchain_loader.destroy_swapchain(swapchain, None) };
                return Err(e);
            }
        };

        let mut this = Self {
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            storage_image,
            format,
            present_mode,
            extent,
            device: device.clone(),
        };

        this.images = unsafe { device.swapchain_loader.get_swapchain_images(swapchain) }
            .context("Failed to get swapchain images")?;

        for &image in &this.images {
            let view_info = vk::ImageViewCreateInfo::builder()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(super::barrier::color_subresource_range());

            let view = unsafe { device.device.create_image_view(&view_info, None) }
                .context("Failed to create image view")?;
            this.image_views.push(view);
        }

        this.framebuffers = create_framebuffers(device, &this.image_views, render_pass, extent)?;

        log::info!("Created swapchain with {} images", this.images.len());
        Ok(this)
    }

    /// Float storage image at `extent`, moved to GENERAL before returning
    fn create_storage_image(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        extent: vk::Extent2D,
    ) -> Result<DeviceImage> {
        let mut image = DeviceImage::new(
            device,
            STORAGE_FORMAT,
            extent,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        )
        .context("Failed to create storage image")?;

        pool.one_shot(|cmd| {
            image.transition(cmd, vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL)
        })?;

        log::debug!(
            "Storage image {}x{} {:?} ready in {:?}",
            image.extent.width,
            image.extent.height,
            image.format,
            image.layout()
        );
        Ok(image)
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Acquired> {
        let result = unsafe {
            self.device.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquired::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquired::OutOfDate),
            Err(e) => Err(e).context("Failed to acquire swapchain image"),
        }
    }

    /// Present a rendered image. Returns true when the swapchain is out of
    /// date or suboptimal and should be recreated.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.device.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).context("Failed to present swapchain image"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                self.device.device.destroy_image_view(view, None);
            }
            self.device
                .swapchain_loader
                .destroy_swapchain(self.swapchain, None);
        }
        // storage_image is released by its own Drop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    fn size(extent: vk::Extent2D) -> (u32, u32) {
        (extent.width, extent.height)
    }

    fn caps(current: (u32, u32), min_count: u32, max_count: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min_count,
            max_image_count: max_count,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D { width: 16, height: 16 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2048,
            },
            ..Default::default()
        }
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(choose_present_mode(true, &modes), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_vsync_prefers_mailbox_then_immediate() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(false, &all), vk::PresentModeKHR::MAILBOX);

        let no_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            choose_present_mode(false, &no_mailbox),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(choose_present_mode(false, &fifo_only), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn surface_format_prefers_float_srgb() {
        let bgra = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let float = vk::SurfaceFormatKHR {
            format: vk::Format::R32G32B32A32_SFLOAT,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        let format_of = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(format_of(&[bgra, float]), Some(vk::Format::R32G32B32A32_SFLOAT));
        assert_eq!(format_of(&[bgra]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(format_of(&[]), None);
    }

    #[test]
    fn defined_current_extent_wins() {
        let caps = caps((1024, 768), 2, 8);
        let extent = choose_extent(&caps, vk::Extent2D { width: 10, height: 10 });
        assert_eq!(size(extent), (1024, 768));
    }

    #[test]
    fn undefined_current_extent_clamps_request() {
        let caps = caps((u32::MAX, u32::MAX), 2, 8);
        let extent = choose_extent(&caps, vk::Extent2D { width: 8000, height: 4 });
        assert_eq!(size(extent), (4096, 16));
    }

    #[test]
    fn image_count_is_min_plus_one_capped() {
        assert_eq!(choose_image_count(&caps((1, 1), 2, 8)), 3);
        assert_eq!(choose_image_count(&caps((1, 1), 3, 3)), 3);
        // Zero max means no limit
        assert_eq!(choose_image_count(&caps((1, 1), 4, 0)), 5);
    }

    /// Reports each queued size in turn, counting how often it was waited on
    struct ScriptedSurface {
        sizes: RefCell<Vec<vk::Extent2D>>,
        waits: Cell<usize>,
    }

    impl ScriptedSurface {
        fn new(sizes: &[(u32, u32)]) -> Self {
            Self {
                sizes: RefCell::new(
                    sizes
                        .iter()
                        .rev()
                        .map(|&(width, height)| vk::Extent2D { width, height })
                        .collect(),
                ),
                waits: Cell::new(0),
            }
        }
    }

    impl DrawableSurface for ScriptedSurface {
        fn drawable_extent(&self) -> vk::Extent2D {
            let sizes = self.sizes.borrow();
            *sizes.last().expect("scripted sizes exhausted")
        }

        fn wait_for_resize(&self) {
            self.waits.set(self.waits.get() + 1);
            self.sizes.borrow_mut().pop();
        }
    }

    #[test]
    fn minimized_surface_blocks_until_visible() {
        let surface = ScriptedSurface::new(&[(0, 0), (400, 300)]);
        let extent = wait_for_drawable_extent(&surface);
        assert_eq!(size(extent), (400, 300));
        assert_eq!(surface.waits.get(), 1);
    }

    #[test]
    fn visible_surface_does_not_wait() {
        let surface = ScriptedSurface::new(&[(800, 600)]);
        assert_eq!(size(wait_for_drawable_extent(&surface)), (800, 600));
        assert_eq!(surface.waits.get(), 0);
    }

    #[test]
    fn zero_width_alone_still_blocks() {
        let surface = ScriptedSurface::new(&[(0, 600), (800, 0), (640, 480)]);
        assert_eq!(size(wait_for_drawable_extent(&surface)), (640, 480));
        assert_eq!(surface.waits.get(), 2);
    }

    #[test]
    fn hidden_surface_has_no_visible_extent() {
        let surface = ScriptedSurface::new(&[(0, 0)]);
        assert!(visible_extent(&surface).is_none());
        assert_eq!(surface.waits.get(), 0);

        let surface = ScriptedSurface::new(&[(1024, 768)]);
        assert_eq!(visible_extent(&surface).map(size), Some((1024, 768)));
    }
}
