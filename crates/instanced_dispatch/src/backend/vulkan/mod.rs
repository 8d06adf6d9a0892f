//! Vulkan backend
//!
//! Records dispatcher work into a command buffer owned by the host. The host stays in
//! charge of render passes, swapchains and queue submission; this backend only needs:
//!
//! - the active command buffer for the frame ([`VulkanBackend::set_command_buffer`])
//! - one descriptor set per ring section holding the part/model storage bindings
//! - a pipeline, layout and push-constant offsets per registered visual state
//! - vertex/index buffers per registered mesh
//!
//! # Fences
//!
//! [`GpuBackend::insert_fence`] creates an unsignaled `VkFence` and parks it as the
//! frame's submit fence. The host must pass [`VulkanBackend::take_submit_fence`] to the
//! `vkQueueSubmit` that carries the recorded draws, otherwise the fence never signals
//! and the section wait times out on the next rotation.
//!
//! # Descriptor sets
//!
//! ```text
//! set 0: ring section set  (binding part_data, binding model_data)
//! set 1: mesh vertex set   (sorted path only)
//! ```

mod buffer;
mod sync;

pub use buffer::{aligned_flush_range, PersistentAllocation};

use super::{
    BufferHandle, BufferTarget, DrawMode, FenceHandle, FenceStatus, GpuBackend, GpuError,
    GpuResult, IndexType, MappedBuffer, UniformValue,
};
use crate::batch::{MeshDescriptor, MeshKey, ShaderUniforms, VisualState, VisualStateKey};
use ash::vk::{self, Handle};
use ash::{Device, Instance};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;

/// Descriptor set index of the ring section set
pub const RING_SET_INDEX: u32 = 0;
/// Descriptor set index of the per-mesh vertex storage set
pub const MESH_STORAGE_SET_INDEX: u32 = 1;

/// Pipeline objects backing one visual state
#[derive(Debug, Clone)]
pub struct StatePipeline {
    /// Graphics pipeline
    pub pipeline: vk::Pipeline,
    /// Pipeline layout (set 0 ring, set 1 mesh storage)
    pub layout: vk::PipelineLayout,
    /// Stages the push-constant range is visible to
    pub push_stages: vk::ShaderStageFlags,
    /// Push-constant byte offset per uniform the shader declares
    pub push_offsets: HashMap<ShaderUniforms, u32>,
}

/// Buffers backing one mesh
#[derive(Debug, Clone, Copy)]
pub struct MeshBuffers {
    /// Vertex buffer bound at binding 0
    pub vertex_buffer: vk::Buffer,
    /// Mesh element buffer
    pub index_buffer: vk::Buffer,
    /// Descriptor set exposing the vertex buffer as storage, for the sorted path
    pub storage_set: Option<vk::DescriptorSet>,
}

/// `ash` implementation of [`GpuBackend`]
pub struct VulkanBackend {
    device: Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,
    min_storage_alignment: vk::DeviceSize,
    allocations: HashMap<BufferHandle, PersistentAllocation>,
    live_fences: HashSet<vk::Fence>,
    submit_fence: Option<vk::Fence>,
    command_buffer: Option<vk::CommandBuffer>,
    ring_sets: Vec<vk::DescriptorSet>,
    ring_set_index: usize,
    pipelines: HashMap<VisualStateKey, StatePipeline>,
    meshes: HashMap<MeshKey, MeshBuffers>,
    active_pipeline: Option<VisualStateKey>,
}

impl VulkanBackend {
    /// Create a backend for `device`
    pub fn new(instance: &Instance, physical_device: vk::PhysicalDevice, device: Device) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let limits = unsafe { instance.get_physical_device_properties(physical_device) }.limits;

        log::info!(
            "Creating VulkanBackend (nonCoherentAtomSize={}, minStorageBufferOffsetAlignment={})",
            limits.non_coherent_atom_size,
            limits.min_storage_buffer_offset_alignment
        );

        Self {
            device,
            memory_properties,
            non_coherent_atom_size: limits.non_coherent_atom_size,
            min_storage_alignment: limits.min_storage_buffer_offset_alignment,
            allocations: HashMap::new(),
            live_fences: HashSet::new(),
            submit_fence: None,
            command_buffer: None,
            ring_sets: Vec::new(),
            ring_set_index: 0,
            pipelines: HashMap::new(),
            meshes: HashMap::new(),
            active_pipeline: None,
        }
    }

    /// Set the command buffer draws are recorded into
    ///
    /// The command buffer must already be recording inside a compatible render pass.
    pub fn set_command_buffer(&mut self, command_buffer: vk::CommandBuffer) {
        self.command_buffer = Some(command_buffer);
    }

    /// Provide one ring descriptor set per ring section
    pub fn set_ring_descriptor_sets(&mut self, sets: Vec<vk::DescriptorSet>) {
        self.ring_sets = sets;
        self.ring_set_index = 0;
    }

    /// Associate pipeline objects with a visual state
    pub fn register_visual_state(&mut self, key: VisualStateKey, pipeline: StatePipeline) {
        self.pipelines.insert(key, pipeline);
    }

    /// Associate GPU buffers with a mesh
    pub fn register_mesh(&mut self, key: MeshKey, buffers: MeshBuffers) {
        self.meshes.insert(key, buffers);
    }

    /// Fence the host must pass to this frame's queue submission
    pub fn take_submit_fence(&mut self) -> Option<vk::Fence> {
        self.submit_fence.take()
    }

    fn recording(&self) -> Option<vk::CommandBuffer> {
        if self.command_buffer.is_none() {
            log::warn!("VulkanBackend has no active command buffer");
        }
        self.command_buffer
    }

    fn active_pipeline(&self) -> Option<&StatePipeline> {
        self.active_pipeline.and_then(|key| self.pipelines.get(&key))
    }

    fn current_ring_set(&self) -> Option<vk::DescriptorSet> {
        self.ring_sets.get(self.ring_set_index).copied()
    }
}

impl GpuBackend for VulkanBackend {
    fn storage_offset_alignment(&self) -> u64 {
        self.min_storage_alignment.max(1)
    }

    fn create_persistent_buffer(&mut self, target: BufferTarget, size: u64) -> GpuResult<MappedBuffer> {
        let usage = match target {
            BufferTarget::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
            BufferTarget::Index => vk::BufferUsageFlags::INDEX_BUFFER,
        };

        let allocation =
            PersistentAllocation::new(&self.device, &self.memory_properties, size, usage)?;
        let ptr = NonNull::new(allocation.mapped_ptr()).ok_or_else(|| GpuError::InvalidOperation {
            reason: "vkMapMemory returned a null pointer".to_string(),
        })?;
        let handle = BufferHandle(allocation.handle().as_raw());

        self.allocations.insert(handle, allocation);
        Ok(MappedBuffer {
            handle,
            ptr,
            len: size,
        })
    }

    unsafe fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(mut allocation) = self.allocations.remove(&buffer) {
            allocation.destroy(&self.device);
        } else {
            log::warn!("Destroying unknown buffer {:?}", buffer);
        }
    }

    fn flush_mapped_range(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> GpuResult<()> {
        let allocation = self
            .allocations
            .get(&buffer)
            .ok_or(GpuError::UnknownBuffer(buffer))?;
        allocation.flush(&self.device, offset, len, self.non_coherent_atom_size)
    }

    fn insert_fence(&mut self) -> GpuResult<FenceHandle> {
        let fence = sync::create_fence(&self.device)?;
        if let Some(stale) = self.submit_fence.replace(fence) {
            log::warn!("Submit fence {:?} was never taken by the host", stale);
        }
        self.live_fences.insert(fence);
        Ok(FenceHandle(fence.as_raw()))
    }

    fn client_wait_fence(&mut self, fence: FenceHandle, timeout_ns: u64) -> FenceStatus {
        sync::wait_fence(&self.device, vk::Fence::from_raw(fence.0), timeout_ns)
    }

    fn delete_fence(&mut self, fence: FenceHandle) {
        let fence = vk::Fence::from_raw(fence.0);
        if self.live_fences.remove(&fence) {
            if self.submit_fence == Some(fence) {
                self.submit_fence = None;
            }
            sync::destroy_fence(&self.device, fence);
        }
    }

    fn bind_storage_range(&mut self, slot: u32, buffer: BufferHandle, offset: u64, len: u64) {
        let Some(set) = self.current_ring_set() else {
            log::warn!("No ring descriptor set available for storage slot {}", slot);
            return;
        };
        debug_assert_eq!(offset % self.storage_offset_alignment(), 0);

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: vk::Buffer::from_raw(buffer.0),
            offset,
            range: len,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();

        unsafe {
            self.device.update_descriptor_sets(&[write], &[]);
        }
    }

    fn bind_mesh_storage(&mut self, slot: u32, key: MeshKey, mesh: &MeshDescriptor) {
        let Some(command_buffer) = self.recording() else { return };
        let (Some(pipeline), Some(buffers)) = (self.active_pipeline(), self.meshes.get(&key)) else {
            log::warn!("Cannot bind storage for mesh '{}': missing pipeline or buffers", mesh.name());
            return;
        };
        let Some(storage_set) = buffers.storage_set else {
            log::warn!("Mesh '{}' has no storage set for slot {}", mesh.name(), slot);
            return;
        };

        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                MESH_STORAGE_SET_INDEX,
                &[storage_set],
                &[],
            );
        }
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        let Some(command_buffer) = self.recording() else { return };

        unsafe {
            self.device.cmd_bind_index_buffer(
                command_buffer,
                vk::Buffer::from_raw(buffer.0),
                offset,
                index_type.into(),
            );
        }
    }

    fn begin_visual_state(&mut self, key: VisualStateKey, state: &VisualState) {
        let Some(command_buffer) = self.recording() else { return };
        let Some(pipeline) = self.pipelines.get(&key) else {
            log::warn!("Visual state '{}' has no registered pipeline", state.name());
            self.active_pipeline = None;
            return;
        };

        unsafe {
            self.device.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.pipeline,
            );
            if let Some(set) = self.current_ring_set() {
                self.device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout,
                    RING_SET_INDEX,
                    &[set],
                    &[],
                );
            }
        }
        self.active_pipeline = Some(key);
    }

    fn end_visual_state(&mut self, _key: VisualStateKey, _state: &VisualState) {
        self.active_pipeline = None;
    }

    fn bind_mesh(&mut self, key: MeshKey, mesh: &MeshDescriptor) {
        let Some(command_buffer) = self.recording() else { return };
        let Some(buffers) = self.meshes.get(&key) else {
            log::warn!("Mesh '{}' has no registered buffers", mesh.name());
            return;
        };

        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, 0, &[buffers.vertex_buffer], &[0]);
            self.device.cmd_bind_index_buffer(
                command_buffer,
                buffers.index_buffer,
                0,
                mesh.index_type().into(),
            );
        }
    }

    fn unbind_mesh(&mut self, _key: MeshKey, _mesh: &MeshDescriptor) {
        // Vulkan bindings are replaced, never released
    }

    fn set_uniform(&mut self, value: UniformValue) {
        let Some(command_buffer) = self.recording() else { return };
        let Some(pipeline) = self.active_pipeline() else { return };
        let Some(&offset) = pipeline.push_offsets.get(&value.uniform()) else {
            log::trace!("Pipeline has no push constant for {:?}", value.uniform());
            return;
        };

        unsafe {
            self.device.cmd_push_constants(
                command_buffer,
                pipeline.layout,
                pipeline.push_stages,
                offset,
                value.as_bytes(),
            );
        }
    }

    fn draw_elements_instanced(
        &mut self,
        _mode: DrawMode,
        index_count: u32,
        _index_type: IndexType,
        instance_count: u32,
    ) {
        let Some(command_buffer) = self.recording() else { return };
        if self.active_pipeline.is_none() {
            log::trace!("Skipping instanced draw without an active pipeline");
            return;
        }

        // Topology and index width are baked into the pipeline and index binding.
        // firstInstance stays 0: shaders add the InstanceOffset push constant.
        unsafe {
            self.device
                .cmd_draw_indexed(command_buffer, index_count, instance_count, 0, 0, 0);
        }
    }

    fn draw_elements(&mut self, _mode: DrawMode, count: u32, _index_type: IndexType) {
        let Some(command_buffer) = self.recording() else { return };
        if self.active_pipeline.is_none() {
            log::trace!("Skipping sorted draw without an active pipeline");
            return;
        }

        unsafe {
            self.device.cmd_draw_indexed(command_buffer, count, 1, 0, 0, 0);
        }
    }

    fn finish_frame(&mut self) -> GpuResult<()> {
        self.active_pipeline = None;
        self.command_buffer = None;
        if !self.ring_sets.is_empty() {
            self.ring_set_index = (self.ring_set_index + 1) % self.ring_sets.len();
        }
        Ok(())
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::debug!(
            "Dropping VulkanBackend: {} buffers, {} fences",
            self.allocations.len(),
            self.live_fences.len()
        );

        for (_, mut allocation) in self.allocations.drain() {
            allocation.destroy(&self.device);
        }
        for fence in self.live_fences.drain() {
            sync::destroy_fence(&self.device, fence);
        }
    }
}
