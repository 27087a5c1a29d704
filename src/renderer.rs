// =============================================================================
// RENDERER - Owns every GPU resource and drives the frame loop
// =============================================================================
//
// FRAME FLOW:
// 1. Wait for this slot's fence
// 2. Acquire swapchain image (out of date -> recreate, skip frame)
// 3. Record: trace rays -> blit storage image -> overlay pass
// 4. Submit, present (stale or resized -> recreate)
// 5. Wait for the present queue, advance slot
//
// Resources are declared so that Drop releases them after the device is idle.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::acceleration::{self, AccelerationStructure};
use crate::backend::barrier::record_transition;
use crate::backend::buffer::{upload_via_staging, DeviceBuffer};
use crate::backend::command::CommandPool;
use crate::backend::pipeline::{DescriptorResources, Descriptors, OverlayPass, RayTracingPipeline};
use crate::backend::sbt::ShaderBindingTable;
use crate::backend::swapchain::{self, visible_extent, Acquired, DrawableSurface};
use crate::backend::sync::{FrameCursor, FrameSync, MAX_FRAMES_IN_FLIGHT};
use crate::backend::{Swapchain, VulkanDevice};
use crate::camera::{Camera, SceneUniform};
use crate::config::Config;
use crate::mesh::Mesh;
use crate::overlay::{Overlay, OverlayResponse};
use crate::stats::{FrameStats, FrameTimer};

pub struct Renderer {
    // ─────────────────────────────────────────────────────────────────────────
    // PER-FRAME
    // ─────────────────────────────────────────────────────────────────────────
    frame_sync: Vec<FrameSync>,
    /// One per frame in flight, reset before each use
    command_buffers: Vec<vk::CommandBuffer>,
    cursor: FrameCursor,

    // ─────────────────────────────────────────────────────────────────────────
    // PIPELINE
    // ─────────────────────────────────────────────────────────────────────────
    sbt: ShaderBindingTable,
    pipeline: RayTracingPipeline,
    descriptors: Descriptors,

    // ─────────────────────────────────────────────────────────────────────────
    // PRESENTATION (None only while being recreated)
    // ─────────────────────────────────────────────────────────────────────────
    swapchain: Option<Swapchain>,
    overlay_pass: OverlayPass,
    surface_format: vk::SurfaceFormatKHR,

    // ─────────────────────────────────────────────────────────────────────────
    // SCENE
    // ─────────────────────────────────────────────────────────────────────────
    _tlas: AccelerationStructure,
    _blas: AccelerationStructure,
    uniform_buffer: DeviceBuffer,
    _index_buffer: DeviceBuffer,
    _vertex_buffer: DeviceBuffer,
    camera: Camera,

    // ─────────────────────────────────────────────────────────────────────────
    // STATE
    // ─────────────────────────────────────────────────────────────────────────
    vsync: bool,
    /// Set by resize notifications, consumed after the next present
    resized: bool,
    timer: FrameTimer,
    stats: FrameStats,

    command_pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl Renderer {
    pub fn new(
        device: Arc<VulkanDevice>,
        config: &Config,
        mesh: &Mesh,
        extent: vk::Extent2D,
    ) -> Result<Self> {
        mesh.validate()?;
        log::info!(
            "Initializing renderer: {} vertices, {} triangles",
            mesh.vertices.len(),
            mesh.triangle_count()
        );

        let command_pool = CommandPool::new(&device)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 1: Mesh buffers and acceleration structures
        // ─────────────────────────────────────────────────────────────────────
        let geometry_usage = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;

        let vertex_buffer = upload_via_staging(
            &device,
            &command_pool,
            &mesh.vertices,
            geometry_usage | vk::BufferUsageFlags::VERTEX_BUFFER,
        )
        .context("Failed to upload vertex buffer")?;

        let index_buffer = upload_via_staging(
            &device,
            &command_pool,
            &mesh.indices,
            geometry_usage | vk::BufferUsageFlags::INDEX_BUFFER,
        )
        .context("Failed to upload index buffer")?;

        let blas = acceleration::build_bottom_level(
            &device,
            &command_pool,
            &vertex_buffer,
            mesh.vertices.len() as u32,
            &index_buffer,
            mesh.indices.len() as u32,
        )?;
        let tlas = acceleration::build_top_level(&device, &command_pool, &blas)?;

        let uniform_buffer = DeviceBuffer::new(
            &device,
            std::mem::size_of::<SceneUniform>() as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("Failed to create uniform buffer")?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 2: Swapchain and the overlay pass drawing into it
        // ─────────────────────────────────────────────────────────────────────
        let vsync = config.graphics.vsync;
        let surface_format = swapchain::select_surface_format(&device)?;
        let overlay_pass = OverlayPass::new(&device, surface_format.format)?;
        let swapchain = Swapchain::new(
            &device,
            &command_pool,
            overlay_pass.render_pass,
            surface_format,
            extent,
            vsync,
        )?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 3: Descriptors, pipeline, shader binding table
        // ─────────────────────────────────────────────────────────────────────
        let descriptors = Descriptors::new(&device)?;
        descriptors.write_all(&DescriptorResources {
            tlas: tlas.handle,
            storage_view: swapchain.storage_image.view,
            vertex_buffer: vertex_buffer.buffer,
            index_buffer: index_buffer.buffer,
            uniform_buffer: uniform_buffer.buffer,
        });

        let pipeline = RayTracingPipeline::new(&device, descriptors.layout, &config.scene.shader_dir)?;
        let sbt = ShaderBindingTable::new(&device, &command_pool, pipeline.pipeline)?;

        // ─────────────────────────────────────────────────────────────────────
        // STEP 4: Frames in flight
        // ─────────────────────────────────────────────────────────────────────
        let command_buffers = command_pool.allocate(MAX_FRAMES_IN_FLIGHT as u32)?;
        let frame_sync = (0..MAX_FRAMES_IN_FLIGHT)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let camera = Camera::new(&config.camera, swapchain.extent.width, swapchain.extent.height);
        let stats = FrameStats {
            device_name: device.device_name.clone(),
            vsync,
            ..Default::default()
        };

        let renderer = Self {
            frame_sync,
            command_buffers,
            cursor: FrameCursor::default(),
            sbt,
            pipeline,
            descriptors,
            swapchain: Some(swapchain),
            overlay_pass,
            surface_format,
            _tlas: tlas,
            _blas: blas,
            uniform_buffer,
            _index_buffer: index_buffer,
            _vertex_buffer: vertex_buffer,
            camera,
            vsync,
            resized: false,
            timer: FrameTimer::new(Instant::now()),
            stats,
            command_pool,
            device,
        };
        renderer.write_uniform()?;

        log::info!("Renderer initialized");
        Ok(renderer)
    }

    /// The drawable size changed; recreate after the next present
    pub fn notify_resized(&mut self) {
        self.resized = true;
    }

    /// Apply a camera change and refresh the uniform buffer
    pub fn update_camera<F: FnOnce(&mut Camera)>(&mut self, update: F) -> Result<()> {
        update(&mut self.camera);
        self.write_uniform()
    }

    fn write_uniform(&self) -> Result<()> {
        self.uniform_buffer.write(&[self.camera.uniform()])
    }

    fn swapchain(&self) -> Result<&Swapchain> {
        self.swapchain.as_ref().context("Swapchain not initialized")
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// Render and present one frame. Returns false when the frame was
    /// abandoned because the swapchain had to be recreated first.
    pub fn draw_frame(
        &mut self,
        surface: &dyn DrawableSurface,
        overlay: &mut dyn Overlay,
    ) -> Result<bool> {
        let slot = self.cursor.current();
        let sync = &self.frame_sync[slot];
        let (image_available, render_finished, in_flight_fence) =
            (sync.image_available, sync.render_finished, sync.in_flight_fence);

        // STEP 1: The GPU must be done with this slot's command buffer
        sync.wait()?;

        // STEP 2: Acquire next swapchain image
        let image_index = match self.swapchain()?.acquire_next_image(image_available)? {
            Acquired::OutOfDate => {
                log::debug!("Swapchain out of date on acquire");
                self.recreate_swapchain(surface)?;
                return Ok(false);
            }
            // Suboptimal images are still presentable; present reports it again
            Acquired::Image { index, .. } => index,
        };

        self.frame_sync[slot].reset()?;

        // STEP 3: Record
        let cmd = self.command_buffers[slot];
        unsafe {
            self.device
                .device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .context("Failed to reset command buffer")?;

        self.stats.vsync = self.vsync;
        let response = self.record_commands(cmd, image_index, overlay)?;

        // STEP 4: Submit. The blit is the first use of the acquired image.
        let wait_semaphores = [image_available];
        let wait_stages = [vk::PipelineStageFlags::TRANSFER];
        let signal_semaphores = [render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                in_flight_fence,
            )
        }
        .context("Failed to submit frame")?;

        // STEP 5: Present
        let stale = self.swapchain()?.present(
            self.device.present_queue,
            image_index,
            &signal_semaphores,
        )?;

        if take_recreate(stale, &mut self.resized, response, &mut self.vsync) {
            self.recreate_swapchain(surface)?;
        }

        if self.timer.record_frame(Instant::now()) {
            self.stats.fps = self.timer.fps();
            self.stats.frame_time_ms = self.timer.frame_time_ms();
        }

        // TODO: drop this once the uniform buffer is per frame slot; the fence
        // wait already bounds the frames in flight.
        unsafe { self.device.device.queue_wait_idle(self.device.present_queue) }
            .context("Failed to wait for present queue")?;

        self.cursor.advance();
        Ok(true)
    }

    fn record_commands(
        &mut self,
        cmd: vk::CommandBuffer,
        image_index: u32,
        overlay: &mut dyn Overlay,
    ) -> Result<OverlayResponse> {
        let device = &self.device.device;
        let swapchain = self
            .swapchain
            .as_mut()
            .context("Swapchain not initialized")?;
        let extent = swapchain.extent;
        let swapchain_image = swapchain.images[image_index as usize];
        let regions = &self.sbt.regions;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin command buffer")?;

        // ─────────────────────────────────────────────────────────────────────
        // Trace into the storage image
        // ─────────────────────────────────────────────────────────────────────
        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::RAY_TRACING_KHR,
                self.pipeline.layout,
                0,
                &[self.descriptors.set],
                &[],
            );
            self.device.ray_tracing.cmd_trace_rays(
                cmd,
                &regions.raygen,
                &regions.miss,
                &regions.hit,
                &regions.callable,
                extent.width,
                extent.height,
                1,
            );
        }

        // ─────────────────────────────────────────────────────────────────────
        // Blit storage image -> swapchain image
        // ─────────────────────────────────────────────────────────────────────
        record_transition(
            device,
            cmd,
            swapchain_image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )?;
        swapchain.storage_image.transition(
            cmd,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        )?;

        let layers = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        let corners = [
            vk::Offset3D { x: 0, y: 0, z: 0 },
            vk::Offset3D {
                x: extent.width as i32,
                y: extent.height as i32,
                z: 1,
            },
        ];
        let blit = vk::ImageBlit::builder()
            .src_subresource(layers)
            .src_offsets(corners)
            .dst_subresource(layers)
            .dst_offsets(corners)
            .build();

        unsafe {
            device.cmd_blit_image(
                cmd,
                swapchain.storage_image.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                swapchain_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                vk::Filter::LINEAR,
            );
        }

        // ─────────────────────────────────────────────────────────────────────
        // Overlay on top, the pass leaves the image in PRESENT_SRC
        // ─────────────────────────────────────────────────────────────────────
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.overlay_pass.render_pass)
            .framebuffer(swapchain.framebuffers[image_index as usize])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            });

        unsafe { device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE) };
        let response = overlay.record(device, cmd, &self.stats)?;
        unsafe { device.cmd_end_render_pass(cmd) };

        swapchain.storage_image.transition(
            cmd,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::GENERAL,
        )?;

        unsafe { device.end_command_buffer(cmd) }.context("Failed to end command buffer")?;
        Ok(response)
    }

    // =========================================================================
    // SWAPCHAIN RECREATION
    // =========================================================================

    /// Rebuild the swapchain and everything sized to it
    ///
    /// While the surface has no area nothing is touched and the resize flag
    /// stays set, so the rebuild happens on the first frame after the window
    /// is visible again. Waits for the device before anything is destroyed.
    pub fn recreate_swapchain(&mut self, surface: &dyn DrawableSurface) -> Result<()> {
        let Some(extent) = visible_extent(surface) else {
            log::debug!("Surface has no area, deferring swapchain recreation");
            self.resized = true;
            return Ok(());
        };
        self.device.wait_idle()?;

        log::debug!("Recreating swapchain for {}x{}", extent.width, extent.height);

        // The surface can only have one swapchain at a time
        self.swapchain = None;

        let swapchain = Swapchain::new(
            &self.device,
            &self.command_pool,
            self.overlay_pass.render_pass,
            self.surface_format,
            extent,
            self.vsync,
        )?;

        log::debug!(
            "Swapchain recreated with {} images, {:?}, {:?}",
            swapchain.image_count(),
            swapchain.format.format,
            swapchain.present_mode
        );
        self.descriptors.write_storage_image(swapchain.storage_image.view);
        self.camera
            .set_viewport(swapchain.extent.width, swapchain.extent.height);
        self.swapchain = Some(swapchain);

        self.write_uniform()
    }
}

/// Whether the swapchain must be rebuilt after a present
///
/// Applies the overlay's vsync change first so the rebuild picks it up, and
/// consumes the pending resize flag.
fn take_recreate(
    stale: bool,
    resized: &mut bool,
    response: OverlayResponse,
    vsync: &mut bool,
) -> bool {
    if let Some(requested) = response.vsync {
        *vsync = requested;
    }
    let flagged = std::mem::take(resized) || response.resize_requested;
    stale || flagged
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer resources...");
        // Nothing below may be destroyed while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_present_recreates() {
        let mut resized = false;
        let mut vsync = true;
        assert!(take_recreate(true, &mut resized, OverlayResponse::default(), &mut vsync));
        assert!(vsync);
    }

    #[test]
    fn resize_flag_recreates_once() {
        let mut resized = true;
        let mut vsync = true;
        assert!(take_recreate(false, &mut resized, OverlayResponse::default(), &mut vsync));
        assert!(!resized);
        assert!(!take_recreate(false, &mut resized, OverlayResponse::default(), &mut vsync));
    }

    #[test]
    fn flag_is_cleared_even_when_stale() {
        let mut resized = true;
        let mut vsync = false;
        assert!(take_recreate(true, &mut resized, OverlayResponse::default(), &mut vsync));
        assert!(!resized);
    }

    #[test]
    fn overlay_toggle_flips_vsync_before_recreating() {
        let mut resized = false;
        let mut vsync = true;
        let response = OverlayResponse {
            resize_requested: true,
            vsync: Some(false),
        };
        assert!(take_recreate(false, &mut resized, response, &mut vsync));
        assert!(!vsync);
        assert!(!resized);
    }

    #[test]
    fn nothing_pending_keeps_swapchain() {
        let mut resized = false;
        let mut vsync = true;
        assert!(!take_recreate(false, &mut resized, OverlayResponse::default(), &mut vsync));
        assert!(vsync);
    }
}
