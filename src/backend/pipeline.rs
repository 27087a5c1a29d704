// Ray tracing pipeline, descriptors and the overlay render pass
//
// Descriptor bindings (set 0):
//   0  top level acceleration structure   raygen
//   1  storage image, GENERAL layout      raygen
//   2  vertex storage buffer              closest hit
//   3  index storage buffer               closest hit
//   4  scene uniform buffer               raygen

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::path::Path;
use std::sync::Arc;

use super::shader::load_shader_module;
use super::VulkanDevice;

const ENTRY_POINT: &CStr = c"main";

pub const BINDING_TLAS: u32 = 0;
pub const BINDING_STORAGE_IMAGE: u32 = 1;
pub const BINDING_VERTICES: u32 = 2;
pub const BINDING_INDICES: u32 = 3;
pub const BINDING_UNIFORM: u32 = 4;

/// Render pass the overlay draws into after the blit
///
/// Loads the blitted swapchain image, so it starts in TRANSFER_DST and ends
/// ready for presentation.
pub struct OverlayPass {
    pub render_pass: vk::RenderPass,
    device: Arc<VulkanDevice>,
}

impl OverlayPass {
    pub fn new(device: &Arc<VulkanDevice>, format: vk::Format) -> Result<Self> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let color_attachment_ref = vk::AttachmentReference::builder()
            .attachment(0)
            .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_attachments = &[color_attachment_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(color_attachments)
            .build();

        // The blit must land before the overlay reads or writes the image
        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(vk::PipelineStageFlags::TRANSFER)
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            )
            .build();

        let attachments = &[color_attachment];
        let subpasses = &[subpass];
        let dependencies = &[dependency];

        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(attachments)
            .subpasses(subpasses)
            .dependencies(dependencies);

        let render_pass = unsafe { device.device.create_render_pass(&render_pass_info, None) }
            .context("Failed to create overlay render pass")?;

        Ok(Self {
            render_pass,
            device: device.clone(),
        })
    }
}

impl Drop for OverlayPass {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// One framebuffer per swapchain image view
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> Result<Vec<vk::Framebuffer>> {
    image_views
        .iter()
        .map(|&image_view| {
            let attachments = &[image_view];
            let framebuffer_info = vk::FramebufferCreateInfo::builder()
                .render_pass(render_pass)
                .attachments(attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                .context("Failed to create framebuffer")
        })
        .collect()
}

fn descriptor_bindings() -> [vk::DescriptorSetLayoutBinding; 5] {
    let binding = |binding, ty, stage| {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(1)
            .stage_flags(stage)
            .build()
    };

    [
        binding(
            BINDING_TLAS,
            vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        binding(
            BINDING_STORAGE_IMAGE,
            vk::DescriptorType::STORAGE_IMAGE,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
        binding(
            BINDING_VERTICES,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        binding(
            BINDING_INDICES,
            vk::DescriptorType::STORAGE_BUFFER,
            vk::ShaderStageFlags::CLOSEST_HIT_KHR,
        ),
        binding(
            BINDING_UNIFORM,
            vk::DescriptorType::UNIFORM_BUFFER,
            vk::ShaderStageFlags::RAYGEN_KHR,
        ),
    ]
}

/// Pool sizes covering exactly one set of `descriptor_bindings`
fn pool_sizes(bindings: &[vk::DescriptorSetLayoutBinding]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for b in bindings {
        match sizes.iter_mut().find(|s| s.ty == b.descriptor_type) {
            Some(size) => size.descriptor_count += b.descriptor_count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: b.descriptor_type,
                descriptor_count: b.descriptor_count,
            }),
        }
    }
    sizes
}

/// Resources the descriptor set points at
pub struct DescriptorResources {
    pub tlas: vk::AccelerationStructureKHR,
    pub storage_view: vk::ImageView,
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub uniform_buffer: vk::Buffer,
}

/// Layout, pool and the single descriptor set
pub struct Descriptors {
    pub layout: vk::DescriptorSetLayout,
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    device: Arc<VulkanDevice>,
}

impl Descriptors {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let bindings = descriptor_bindings();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create descriptor set layout")?;

        let sizes = pool_sizes(&bindings);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(1);
        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e).context("Failed to create descriptor pool");
            }
        };

        let mut this = Self {
            layout,
            pool,
            set: vk::DescriptorSet::null(),
            device: device.clone(),
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        this.set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate descriptor set")?[0];

        Ok(this)
    }

    /// Point every binding at `resources`
    pub fn write_all(&self, resources: &DescriptorResources) {
        let structures = [resources.tlas];
        let mut tlas_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&structures);

        let mut tlas_write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(BINDING_TLAS)
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut tlas_info)
            .build();
        // Count is not derived from the chained struct
        tlas_write.descriptor_count = 1;

        let image_info = [storage_image_info(resources.storage_view)];
        let vertex_info = [buffer_info(resources.vertex_buffer)];
        let index_info = [buffer_info(resources.index_buffer)];
        let uniform_info = [buffer_info(resources.uniform_buffer)];

        let writes = [
            tlas_write,
            self.storage_image_write(&image_info),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.set)
                .dst_binding(BINDING_VERTICES)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&vertex_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.set)
                .dst_binding(BINDING_INDICES)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .buffer_info(&index_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(self.set)
                .dst_binding(BINDING_UNIFORM)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&uniform_info)
                .build(),
        ];

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };
    }

    /// Rebind the storage image after the swapchain was recreated
    pub fn write_storage_image(&self, view: vk::ImageView) {
        let image_info = [storage_image_info(view)];
        let write = self.storage_image_write(&image_info);
        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }

    fn storage_image_write(&self, image_info: &[vk::DescriptorImageInfo]) -> vk::WriteDescriptorSet {
        vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(BINDING_STORAGE_IMAGE)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(image_info)
            .build()
    }
}

impl Drop for Descriptors {
    fn drop(&mut self) {
        unsafe {
            // Destroying the pool frees the set
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

fn buffer_info(buffer: vk::Buffer) -> vk::DescriptorBufferInfo {
    vk::DescriptorBufferInfo {
        buffer,
        offset: 0,
        range: vk::WHOLE_SIZE,
    }
}

fn storage_image_info(view: vk::ImageView) -> vk::DescriptorImageInfo {
    vk::DescriptorImageInfo {
        sampler: vk::Sampler::null(),
        image_view: view,
        image_layout: vk::ImageLayout::GENERAL,
    }
}

/// Ray tracing pipeline with raygen, miss and closest hit groups, in that order
pub struct RayTracingPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl RayTracingPipeline {
    pub fn new(
        device: &Arc<VulkanDevice>,
        set_layout: vk::DescriptorSetLayout,
        shader_dir: &Path,
    ) -> Result<Self> {
        let set_layouts = [set_layout];
        let layout_info = vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create ray tracing pipeline layout")?;

        // Layout is owned from here so errors below clean it up
        let mut this = Self {
            pipeline: vk::Pipeline::null(),
            layout,
            device: device.clone(),
        };

        let stages_info = [
            ("raytrace.rgen.spv", vk::ShaderStageFlags::RAYGEN_KHR),
            ("raytrace.rmiss.spv", vk::ShaderStageFlags::MISS_KHR),
            ("raytrace.rchit.spv", vk::ShaderStageFlags::CLOSEST_HIT_KHR),
        ];

        let mut modules = Vec::with_capacity(stages_info.len());
        for (file, _) in &stages_info {
            match load_shader_module(device, &shader_dir.join(file)) {
                Ok(module) => modules.push(module),
                Err(e) => {
                    destroy_modules(device, &modules);
                    return Err(e);
                }
            }
        }

        let stages: Vec<_> = modules
            .iter()
            .zip(&stages_info)
            .map(|(&module, &(_, stage))| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(stage)
                    .module(module)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect();

        let general = |shader| {
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                .general_shader(shader)
                .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build()
        };

        let groups = [
            general(0),
            general(1),
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(2)
                .any_hit_shader(vk::SHADER_UNUSED_KHR)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        ];

        let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stages)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(1)
            .layout(layout)
            .build();

        let result = unsafe {
            device.ray_tracing.create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                &[create_info],
                None,
            )
        };
        destroy_modules(device, &modules);

        this.pipeline = result.context("Failed to create ray tracing pipeline")?[0];
        log::info!("Created ray tracing pipeline with {} groups", groups.len());

        Ok(this)
    }
}

fn destroy_modules(device: &VulkanDevice, modules: &[vk::ShaderModule]) {
    for &module in modules {
        unsafe { device.device.destroy_shader_module(module, None) };
    }
}

impl Drop for RayTracingPipeline {
    fn drop(&mut self) {
        unsafe {
            if self.pipeline != vk::Pipeline::null() {
                self.device.device.destroy_pipeline(self.pipeline, None);
            }
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bindings_match_shader_interface() {
        let bindings = descriptor_bindings();
        let expected = [
            (0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, vk::ShaderStageFlags::RAYGEN_KHR),
            (1, vk::DescriptorType::STORAGE_IMAGE, vk::ShaderStageFlags::RAYGEN_KHR),
            (2, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
            (3, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::CLOSEST_HIT_KHR),
            (4, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::RAYGEN_KHR),
        ];

        for (b, (binding, ty, stage)) in bindings.iter().zip(expected) {
            assert_eq!(b.binding, binding);
            assert_eq!(b.descriptor_type, ty);
            assert_eq!(b.stage_flags, stage);
            assert_eq!(b.descriptor_count, 1);
        }
    }

    #[test]
    fn pool_sizes_merge_shared_types() {
        let sizes = pool_sizes(&descriptor_bindings());
        assert_eq!(sizes.len(), 4);

        let storage = sizes
            .iter()
            .find(|s| s.ty == vk::DescriptorType::STORAGE_BUFFER)
            .unwrap();
        assert_eq!(storage.descriptor_count, 2);

        let total: u32 = sizes.iter().map(|s| s.descriptor_count).sum();
        assert_eq!(total, 5);
    }
}
