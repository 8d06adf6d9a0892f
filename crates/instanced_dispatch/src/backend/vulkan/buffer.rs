//! Persistently mapped buffer allocation
//!
//! Ring buffers are created once with `HOST_VISIBLE` memory and mapped for their whole
//! lifetime. Memory is preferably non-coherent, so writes must be published with
//! explicit range flushes aligned to `nonCoherentAtomSize`.
//!
//! The creation sequence is the usual one:
//! 1. Create buffer object with usage flags
//! 2. Query memory requirements
//! 3. Find suitable memory type
//! 4. Allocate and bind memory
//! 5. Map the whole allocation once

use crate::backend::{GpuError, GpuResult};
use ash::{vk, Device};

/// A buffer plus its permanently mapped device memory
pub struct PersistentAllocation {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
    mapped: *mut u8,
    coherent: bool,
}

impl PersistentAllocation {
    /// Create a buffer with host-visible memory and map it
    pub fn new(
        device: &Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> GpuResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::Api)?
        };

        let mem_requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        // Prefer cached non-coherent memory for sequential host writes, fall back to
        // anything host visible.
        let selected = find_memory_type(
            memory_properties,
            mem_requirements.memory_type_bits,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED,
        )
        .or_else(|_| {
            find_memory_type(
                memory_properties,
                mem_requirements.memory_type_bits,
                vk::MemoryPropertyFlags::HOST_VISIBLE,
            )
        });

        let memory_type_index = match selected {
            Ok(index) => index,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let coherent = memory_properties.memory_types[memory_type_index as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT);

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(mem_requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(result) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(GpuError::Api(result));
            }
        };

        let mapped = unsafe {
            device
                .bind_buffer_memory(buffer, memory, 0)
                .and_then(|()| device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()))
        };

        let mapped = match mapped {
            Ok(ptr) => ptr.cast::<u8>(),
            Err(result) => {
                unsafe {
                    device.destroy_buffer(buffer, None);
                    device.free_memory(memory, None);
                }
                return Err(GpuError::Api(result));
            }
        };

        log::debug!(
            "Persistent buffer created: {} bytes (allocation {}), coherent={}",
            size,
            mem_requirements.size,
            coherent
        );

        Ok(Self {
            buffer,
            memory,
            size,
            allocation_size: mem_requirements.size,
            mapped,
            coherent,
        })
    }

    /// Get buffer handle
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Requested size in bytes
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Host address of the mapping
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.mapped
    }

    /// Flush `offset..offset + len`, widened to the non-coherent atom size
    pub fn flush(
        &self,
        device: &Device,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
        atom_size: vk::DeviceSize,
    ) -> GpuResult<()> {
        if self.coherent || len == 0 {
            return Ok(());
        }

        let (aligned_offset, aligned_len) =
            aligned_flush_range(offset, len, atom_size, self.allocation_size);
        let range = vk::MappedMemoryRange::builder()
            .memory(self.memory)
            .offset(aligned_offset)
            .size(aligned_len)
            .build();

        unsafe {
            device
                .flush_mapped_memory_ranges(&[range])
                .map_err(GpuError::Api)
        }
    }

    /// Unmap and free; the allocation must not be used afterwards
    pub fn destroy(&mut self, device: &Device) {
        unsafe {
            device.unmap_memory(self.memory);
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
        self.mapped = std::ptr::null_mut();
    }
}

/// Widen a flush range to atom boundaries without running past the allocation
pub fn aligned_flush_range(
    offset: vk::DeviceSize,
    len: vk::DeviceSize,
    atom_size: vk::DeviceSize,
    allocation_size: vk::DeviceSize,
) -> (vk::DeviceSize, vk::DeviceSize) {
    let atom = atom_size.max(1);
    let start = offset / atom * atom;
    let end = (offset + len).div_ceil(atom) * atom;
    let end = end.min(allocation_size);
    (start, end - start)
}

/// Find memory type with required properties
fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> GpuResult<u32> {
    for i in 0..memory_properties.memory_type_count {
        if (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
        {
            return Ok(i);
        }
    }

    Err(GpuError::NoSuitableMemoryType)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_range_alignment() {
        assert_eq!(aligned_flush_range(0, 100, 64, 1024), (0, 128));
        assert_eq!(aligned_flush_range(70, 10, 64, 1024), (64, 64));
        assert_eq!(aligned_flush_range(1000, 24, 64, 1024), (960, 64));
        assert_eq!(aligned_flush_range(10, 5, 0, 1024), (10, 5));
    }

    #[test]
    fn test_memory_type_selection() {
        let mut props = vk::PhysicalDeviceMemoryProperties::default();
        props.memory_type_count = 2;
        props.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        props.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(
            find_memory_type(&props, 0b11, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            1
        );
        assert!(find_memory_type(&props, 0b01, vk::MemoryPropertyFlags::HOST_VISIBLE).is_err());
    }
}
