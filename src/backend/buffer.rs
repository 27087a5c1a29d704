// Buffer utilities for mesh, uniform, instance and shader binding table data
//
// Every DeviceBuffer owns its memory and frees both in Drop. Nothing is
// pooled: the allocator is `find_memory_type` plus one allocation per buffer.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::VulkanDevice;

/// First memory type (lowest index) allowed by `type_filter` whose flags
/// contain `properties`
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);
        has_type && has_properties
    })
}

/// Allocate and bind memory for `requirements`, chaining the device address
/// flag when asked
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    device_address: bool,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )
    .with_context(|| format!("Failed to find suitable memory type for {:?}", properties))?;

    let mut flags_info =
        vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

    let mut alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        alloc_info = alloc_info.push_next(&mut flags_info);
    }

    unsafe { device.device.allocate_memory(&alloc_info, None) }
        .context("Failed to allocate device memory")
}

/// A buffer and the memory bound to it
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    pub memory_flags: vk::MemoryPropertyFlags,
    /// Set when created with SHADER_DEVICE_ADDRESS usage
    pub address: Option<vk::DeviceAddress>,
    device: Arc<VulkanDevice>,
}

impl DeviceBuffer {
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_flags: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let wants_address = usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);

        let memory = match allocate_memory(device, requirements, memory_flags, wants_address) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        // From here on Drop releases both handles
        let mut this = Self {
            buffer,
            memory,
            size,
            memory_flags,
            address: None,
            device: device.clone(),
        };

        unsafe { device.device.bind_buffer_memory(buffer, memory, 0) }
            .context("Failed to bind buffer memory")?;

        if wants_address {
            let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            this.address = Some(unsafe { device.device.get_buffer_device_address(&info) });
        }

        Ok(this)
    }

    /// Host-visible coherent buffer filled with `data`
    pub fn with_data<T: Copy>(
        device: &Arc<VulkanDevice>,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let buffer = Self::new(
            device,
            size,
            usage,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.write(data)?;
        Ok(buffer)
    }

    /// Copy `data` to the start of a host-visible buffer
    pub fn write<T: Copy>(&self, data: &[T]) -> Result<()> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        anyhow::ensure!(
            self.memory_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE),
            "Cannot map a buffer without HOST_VISIBLE memory"
        );
        anyhow::ensure!(
            size <= self.size,
            "Write of {} bytes overflows buffer of {} bytes",
            size,
            self.size
        );
        if size == 0 {
            return Ok(());
        }

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut T;

            ptr.copy_from_nonoverlapping(data.as_ptr(), data.len());
            self.device.device.unmap_memory(self.memory);
        }

        Ok(())
    }

    /// Device address, for buffers created with SHADER_DEVICE_ADDRESS
    pub fn device_address(&self) -> Result<vk::DeviceAddress> {
        self.address
            .context("Buffer was not created with SHADER_DEVICE_ADDRESS usage")
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

/// Upload `data` into a new device-local buffer through a staging buffer
///
/// The destination gets `usage | TRANSFER_DST`. The copy is waited on before
/// returning and the staging buffer is freed.
pub fn upload_via_staging<T: Copy>(
    device: &Arc<VulkanDevice>,
    pool: &CommandPool,
    data: &[T],
    usage: vk::BufferUsageFlags,
) -> Result<DeviceBuffer> {
    let staging = DeviceBuffer::with_data(device, vk::BufferUsageFlags::TRANSFER_SRC, data)
        .context("Failed to create staging buffer")?;

    let destination = DeviceBuffer::new(
        device,
        staging.size,
        usage | vk::BufferUsageFlags::TRANSFER_DST,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;

    pool.one_shot(|cmd| {
        let region = vk::BufferCopy::builder().size(staging.size).build();
        unsafe {
            device
                .device
                .cmd_copy_buffer(cmd, staging.buffer, destination.buffer, &[region]);
        }
        Ok(())
    })
    .context("Failed to copy staging buffer")?;

    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (i, &property_flags) in flags.iter().enumerate() {
            props.memory_types[i] = vk::MemoryType {
                property_flags,
                heap_index: 0,
            };
        }
        props
    }

    #[test]
    fn picks_lowest_index_with_required_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let wanted = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let index = find_memory_type(&props, 0b1111, wanted).unwrap();
        assert_eq!(index, 2);
        assert!(props.memory_types[index as usize].property_flags.contains(wanted));
    }

    #[test]
    fn respects_type_filter() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(1)
        );
    }

    #[test]
    fn superset_flags_match() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        assert_eq!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn no_match_is_none() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        // Allowed type bits beyond memory_type_count are ignored
        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            None
        );
    }
}
