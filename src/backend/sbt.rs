// Shader binding table
//
// Three records in a fixed order: ray generation, miss, closest hit. Each
// record starts on a shaderGroupBaseAlignment boundary so every region can use
// the same stride.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::{upload_via_staging, DeviceBuffer};
use super::command::CommandPool;
use super::device::RayTracingProperties;
use super::VulkanDevice;

/// Shader groups in table order
pub const GROUP_COUNT: u32 = 3;

pub fn align_up(value: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Record placement inside the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    pub handle_size: u32,
    pub stride: u32,
}

impl SbtLayout {
    pub fn new(properties: &RayTracingProperties) -> Self {
        Self {
            handle_size: properties.shader_group_handle_size,
            stride: align_up(
                properties.shader_group_handle_size,
                properties.shader_group_base_alignment,
            ),
        }
    }

    pub fn table_size(&self) -> usize {
        (self.stride * GROUP_COUNT) as usize
    }

    /// Copy the tightly packed `handles` into stride-aligned records
    pub fn pack(&self, handles: &[u8]) -> Result<Vec<u8>> {
        let handle_size = self.handle_size as usize;
        anyhow::ensure!(
            handles.len() == handle_size * GROUP_COUNT as usize,
            "Expected {} bytes of shader group handles, got {}",
            handle_size * GROUP_COUNT as usize,
            handles.len()
        );

        let mut table = vec![0u8; self.table_size()];
        for (i, handle) in handles.chunks_exact(handle_size).enumerate() {
            let offset = i * self.stride as usize;
            table[offset..offset + handle_size].copy_from_slice(handle);
        }
        Ok(table)
    }

    /// Regions for raygen, miss, hit and callable, starting at `base`
    pub fn regions(&self, base: vk::DeviceAddress) -> SbtRegions {
        let stride = self.stride as vk::DeviceSize;
        let region = |i: vk::DeviceSize| vk::StridedDeviceAddressRegionKHR {
            device_address: base + i * stride,
            stride,
            size: stride,
        };

        SbtRegions {
            raygen: region(0),
            miss: region(1),
            hit: region(2),
            callable: vk::StridedDeviceAddressRegionKHR::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SbtRegions {
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
    pub callable: vk::StridedDeviceAddressRegionKHR,
}

pub struct ShaderBindingTable {
    pub regions: SbtRegions,
    _buffer: DeviceBuffer,
}

impl ShaderBindingTable {
    /// Fetch the group handles of `pipeline` and upload them device-local
    pub fn new(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        pipeline: vk::Pipeline,
    ) -> Result<Self> {
        let layout = SbtLayout::new(&device.ray_tracing_properties);

        let handles = unsafe {
            device.ray_tracing.get_ray_tracing_shader_group_handles(
                pipeline,
                0,
                GROUP_COUNT,
                (layout.handle_size * GROUP_COUNT) as usize,
            )
        }
        .context("Failed to get shader group handles")?;

        let table = layout.pack(&handles)?;
        let buffer = upload_via_staging(
            device,
            pool,
            &table,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )
        .context("Failed to upload shader binding table")?;

        let regions = layout.regions(buffer.device_address()?);
        log::debug!("Shader binding table: stride {} bytes", layout.stride);

        Ok(Self {
            regions,
            _buffer: buffer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(handle_size: u32, base_alignment: u32) -> SbtLayout {
        SbtLayout::new(&RayTracingProperties {
            shader_group_handle_size: handle_size,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 1,
        })
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 16), 0);
    }

    #[test]
    fn regions_use_base_alignment_as_stride() {
        let layout = layout(32, 64);
        let regions = layout.regions(0x1000);

        for (i, region) in [regions.raygen, regions.miss, regions.hit].iter().enumerate() {
            assert_eq!(region.stride, 64);
            assert_eq!(region.size, 64);
            assert_eq!(region.device_address, 0x1000 + 64 * i as u64);
        }

        assert_eq!(regions.callable.device_address, 0);
        assert_eq!(regions.callable.stride, 0);
        assert_eq!(regions.callable.size, 0);
    }

    #[test]
    fn pack_places_handles_on_stride_boundaries() {
        let layout = layout(4, 16);
        let handles = [1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3];
        let table = layout.pack(&handles).unwrap();

        assert_eq!(table.len(), 48);
        assert_eq!(&table[0..4], &[1, 1, 1, 1]);
        assert_eq!(&table[16..20], &[2, 2, 2, 2]);
        assert_eq!(&table[32..36], &[3, 3, 3, 3]);
        // Padding stays zero
        assert!(table[4..16].iter().all(|&b| b == 0));
        assert!(table[36..48].iter().all(|&b| b == 0));
    }

    #[test]
    fn pack_rejects_wrong_handle_count() {
        let layout = layout(4, 16);
        assert!(layout.pack(&[0u8; 8]).is_err());
    }
}
