// Acceleration structures
//
// One bottom level structure over the mesh, one top level structure holding a
// single instance of it. Both are built once at load time on a one-shot
// command buffer; scratch and instance buffers die with the build.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::DeviceBuffer;
use super::command::CommandPool;
use super::VulkanDevice;
use crate::mesh::Vertex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Bottom,
    Top,
}

impl Level {
    fn ty(self) -> vk::AccelerationStructureTypeKHR {
        match self {
            Level::Bottom => vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            Level::Top => vk::AccelerationStructureTypeKHR::TOP_LEVEL,
        }
    }
}

pub struct AccelerationStructure {
    pub handle: vk::AccelerationStructureKHR,
    pub address: vk::DeviceAddress,
    pub level: Level,
    // Storage backing the structure, released after the handle
    _buffer: DeviceBuffer,
    device: Arc<VulkanDevice>,
}

impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        unsafe {
            self.device
                .acceleration_structure
                .destroy_acceleration_structure(self.handle, None);
        }
    }
}

/// Bottom level structure over one opaque triangle geometry
///
/// `vertex_buffer` holds `vertex_count` 32-byte `Vertex` records and
/// `index_buffer` holds `index_count` u32 indices. Both need
/// SHADER_DEVICE_ADDRESS and AS_BUILD_INPUT_READ_ONLY usage.
pub fn build_bottom_level(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    vertex_buffer: &DeviceBuffer,
    vertex_count: u32,
    index_buffer: &DeviceBuffer,
    index_count: u32,
) -> Result<AccelerationStructure> {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_buffer.device_address()?,
        })
        .vertex_stride(std::mem::size_of::<Vertex>() as vk::DeviceSize)
        .max_vertex(vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_buffer.device_address()?,
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build();

    let primitive_count = index_count / 3;
    let structure = build(device, pool, Level::Bottom, geometry, primitive_count)?;

    log::info!(
        "Built bottom level acceleration structure: {} triangles",
        primitive_count
    );
    Ok(structure)
}

/// Top level structure with a single instance of `bottom`
pub fn build_top_level(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    bottom: &AccelerationStructure,
) -> Result<AccelerationStructure> {
    anyhow::ensure!(
        bottom.level == Level::Bottom,
        "Top level instance must reference a bottom level structure"
    );

    let instance = top_level_instance(bottom.address);
    let instance_buffer = DeviceBuffer::with_data(
        device,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        &[instance],
    )
    .context("Failed to create instance buffer")?;

    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_buffer.device_address()?,
        })
        .build();

    let geometry = vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build();

    let structure = build(device, pool, Level::Top, geometry, 1)?;
    drop(instance_buffer);

    log::info!("Built top level acceleration structure");
    Ok(structure)
}

/// Identity-transformed, always visible, culling-disabled instance
pub fn top_level_instance(bottom_address: vk::DeviceAddress) -> vk::AccelerationStructureInstanceKHR {
    #[rustfmt::skip]
    let identity = vk::TransformMatrixKHR {
        matrix: [
            1.0, 0.0, 0.0, 0.0,
            0.0, 1.0, 0.0, 0.0,
            0.0, 0.0, 1.0, 0.0,
        ],
    };

    vk::AccelerationStructureInstanceKHR {
        transform: identity,
        instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: bottom_address,
        },
    }
}

fn build(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    level: Level,
    geometry: vk::AccelerationStructureGeometryKHR,
    primitive_count: u32,
) -> Result<AccelerationStructure> {
    let loader = &device.acceleration_structure;
    let geometries = [geometry];

    let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(level.ty())
        .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(&geometries)
        .build();

    let sizes = unsafe {
        loader.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &build_info,
            &[primitive_count],
        )
    };

    let buffer = DeviceBuffer::new(
        device,
        sizes.acceleration_structure_size,
        vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("Failed to create acceleration structure buffer")?;

    let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
        .buffer(buffer.buffer)
        .size(sizes.acceleration_structure_size)
        .ty(level.ty());

    let handle = unsafe { loader.create_acceleration_structure(&create_info, None) }
        .context("Failed to create acceleration structure")?;

    let address = unsafe {
        loader.get_acceleration_structure_device_address(
            &vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                .acceleration_structure(handle),
        )
    };

    let structure = AccelerationStructure {
        handle,
        address,
        level,
        _buffer: buffer,
        device: device.clone(),
    };

    let scratch = DeviceBuffer::new(
        device,
        sizes.build_scratch_size,
        vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("Failed to create scratch buffer")?;

    build_info.dst_acceleration_structure = handle;
    build_info.scratch_data = vk::DeviceOrHostAddressKHR {
        device_address: scratch.device_address()?,
    };

    let range = vk::AccelerationStructureBuildRangeInfoKHR::builder()
        .primitive_count(primitive_count)
        .primitive_offset(0)
        .first_vertex(0)
        .transform_offset(0)
        .build();

    pool.one_shot(|cmd| {
        unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);

            let barrier = vk::MemoryBarrier::builder()
                .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
                .dst_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR)
                .build();

            device.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::DependencyFlags::empty(),
                &[barrier],
                &[],
                &[],
            );
        }
        Ok(())
    })
    .with_context(|| format!("Failed to build {:?} level acceleration structure", level))?;

    drop(scratch);
    Ok(structure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_references_bottom_level_address() {
        let instance = top_level_instance(0xDEAD_BEEF_0000);
        let reference = unsafe { instance.acceleration_structure_reference.device_handle };
        assert_eq!(reference, 0xDEAD_BEEF_0000);
    }

    #[test]
    fn instance_has_identity_transform() {
        let instance = top_level_instance(1);
        assert_eq!(
            instance.transform.matrix,
            [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0]
        );
    }

    #[test]
    fn instance_mask_and_flags() {
        let instance = top_level_instance(1);
        assert_eq!(instance.instance_custom_index_and_mask.low_24(), 0);
        assert_eq!(instance.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(
            instance.instance_shader_binding_table_record_offset_and_flags.low_24(),
            0
        );
        assert_eq!(
            instance.instance_shader_binding_table_record_offset_and_flags.high_8() as u32,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
    }

    #[test]
    fn levels_map_to_vulkan_types() {
        assert_eq!(Level::Bottom.ty(), vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        assert_eq!(Level::Top.ty(), vk::AccelerationStructureTypeKHR::TOP_LEVEL);
    }
}
