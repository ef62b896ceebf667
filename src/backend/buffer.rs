// Vertex buffer uploads
//
// Buffers are placed in host-visible, host-coherent memory through the
// device's allocator and filled with a plain memcpy of the vertex bytes.

use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::vertex::Vertex;
use super::VulkanDevice;

/// A GPU buffer together with the memory backing it
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub allocation: Allocation,
    pub size: vk::DeviceSize,
}

/// Create a vertex buffer and copy `vertices` into it
pub fn create_vertex_buffer(device: &VulkanDevice, name: &str, vertices: &[Vertex]) -> Result<GpuBuffer> {
    let bytes: &[u8] = bytemuck::cast_slice(vertices);
    let size = bytes.len() as vk::DeviceSize;
    if size == 0 {
        anyhow::bail!("Refusing to create empty vertex buffer {name}");
    }

    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(vk::BufferUsageFlags::VERTEX_BUFFER)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);

    let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
        .context("Failed to create buffer")?;

    let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

    // CpuToGpu = HOST_VISIBLE | HOST_COHERENT, persistently mapped
    let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
        name,
        requirements,
        location: MemoryLocation::CpuToGpu,
        linear: true,
        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
    });
    let mut allocation = match allocation {
        Ok(allocation) => allocation,
        Err(e) => {
            unsafe { device.device.destroy_buffer(buffer, None) };
            return Err(e).context("Failed to allocate buffer memory");
        }
    };

    let filled = fill_and_bind(device, buffer, &mut allocation, bytes);
    if let Err(e) = filled {
        unsafe { device.device.destroy_buffer(buffer, None) };
        let _ = device.allocator.lock().free(allocation);
        return Err(e);
    }

    Ok(GpuBuffer {
        buffer,
        allocation,
        size,
    })
}

fn fill_and_bind(
    device: &VulkanDevice,
    buffer: vk::Buffer,
    allocation: &mut Allocation,
    bytes: &[u8],
) -> Result<()> {
    let mapped = allocation
        .mapped_slice_mut()
        .context("Vertex memory is not host mapped")?;
    mapped
        .get_mut(..bytes.len())
        .context("Allocation smaller than vertex data")?
        .copy_from_slice(bytes);

    unsafe {
        device
            .device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .context("Failed to bind buffer memory")?;
    }
    Ok(())
}

/// Free a buffer created by [`create_vertex_buffer`]
pub fn destroy_buffer(device: &VulkanDevice, buffer: GpuBuffer) {
    unsafe { device.device.destroy_buffer(buffer.buffer, None) };
    if let Err(e) = device.allocator.lock().free(buffer.allocation) {
        log::warn!("Failed to free buffer memory: {}", e);
    }
}
