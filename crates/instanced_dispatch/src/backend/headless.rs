//! Headless backend
//!
//! Keeps "mapped" buffers in plain heap allocations and records every command it
//! receives instead of talking to a GPU. Fences signal immediately unless a different
//! outcome is scripted with [`HeadlessBackend::set_fence_status`].

use super::{
    BufferHandle, BufferTarget, DrawMode, FenceHandle, FenceStatus, GpuBackend, GpuError,
    GpuResult, IndexType, MappedBuffer, UniformValue,
};
use crate::batch::{MeshDescriptor, MeshKey, VisualState, VisualStateKey};
use std::collections::{HashMap, HashSet};
use std::ptr::NonNull;

/// One recorded backend call
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    /// Explicit range flush
    FlushRange {
        /// Flushed buffer
        buffer: BufferHandle,
        /// Absolute byte offset
        offset: u64,
        /// Byte length
        len: u64,
    },
    /// Fence creation
    InsertFence(FenceHandle),
    /// Bounded fence wait and its outcome
    WaitFence {
        /// Waited fence
        fence: FenceHandle,
        /// Reported status
        status: FenceStatus,
    },
    /// Fence release
    DeleteFence(FenceHandle),
    /// Storage range binding
    BindStorageRange {
        /// Binding slot
        slot: u32,
        /// Bound buffer
        buffer: BufferHandle,
        /// Absolute byte offset
        offset: u64,
        /// Byte length
        len: u64,
    },
    /// Mesh vertex data bound as storage
    BindMeshStorage {
        /// Binding slot
        slot: u32,
        /// Bound mesh
        mesh: MeshKey,
    },
    /// Element buffer binding
    BindIndexBuffer {
        /// Bound buffer
        buffer: BufferHandle,
        /// Absolute byte offset
        offset: u64,
        /// Index width
        index_type: IndexType,
    },
    /// Visual state scope opened
    BeginVisualState(VisualStateKey),
    /// Visual state scope closed
    EndVisualState(VisualStateKey),
    /// Mesh bound
    BindMesh(MeshKey),
    /// Mesh unbound
    UnbindMesh(MeshKey),
    /// Uniform upload
    SetUniform(UniformValue),
    /// True instanced draw
    DrawInstanced {
        /// Topology
        mode: DrawMode,
        /// Indices per instance
        index_count: u32,
        /// Index width
        index_type: IndexType,
        /// Instances drawn
        instance_count: u32,
    },
    /// Sorted fake-instanced draw
    DrawElements {
        /// Topology
        mode: DrawMode,
        /// Total indices drawn
        count: u32,
        /// Index width
        index_type: IndexType,
    },
    /// End of frame
    FinishFrame,
}

impl GpuCommand {
    /// Whether this command issues a draw call
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::DrawInstanced { .. } | Self::DrawElements { .. })
    }
}

/// Heap allocation standing in for mapped GPU memory
struct HeadlessAllocation {
    ptr: NonNull<u8>,
    len: usize,
    target: BufferTarget,
}

impl HeadlessAllocation {
    fn new(len: usize, target: BufferTarget) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // A boxed slice pointer is never null, dangling for len == 0
        let ptr = NonNull::new(raw.cast::<u8>()).unwrap_or(NonNull::dangling());
        Self { ptr, len, target }
    }

    fn bytes(&self) -> &[u8] {
        // SAFETY: ptr/len come from a live boxed slice owned by this allocation
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for HeadlessAllocation {
    fn drop(&mut self) {
        // SAFETY: reconstructs the boxed slice leaked in `new`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.ptr.as_ptr(),
                self.len,
            )));
        }
    }
}

/// Recording backend without a GPU
pub struct HeadlessBackend {
    allocations: HashMap<BufferHandle, HeadlessAllocation>,
    live_fences: HashSet<FenceHandle>,
    next_id: u64,
    fence_status: FenceStatus,
    commands: Vec<GpuCommand>,
    frames_finished: u64,
    storage_alignment: u64,
}

impl HeadlessBackend {
    /// Create an empty headless backend
    pub fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            live_fences: HashSet::new(),
            next_id: 1,
            fence_status: FenceStatus::Signaled,
            commands: Vec::new(),
            frames_finished: 0,
            storage_alignment: 4,
        }
    }

    /// Report `alignment` as the storage offset alignment, like a device limit would
    pub fn with_storage_alignment(mut self, alignment: u64) -> Self {
        self.storage_alignment = alignment.max(1);
        self
    }

    /// Status reported by every subsequent fence wait
    pub fn set_fence_status(&mut self, status: FenceStatus) {
        self.fence_status = status;
    }

    /// Every command recorded since creation or the last [`Self::clear_commands`]
    pub fn commands(&self) -> &[GpuCommand] {
        &self.commands
    }

    /// Only the draw commands, in issue order
    pub fn draw_commands(&self) -> impl Iterator<Item = &GpuCommand> {
        self.commands.iter().filter(|command| command.is_draw())
    }

    /// Drop the recorded command log
    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Current contents of a buffer
    pub fn buffer_bytes(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.allocations.get(&buffer).map(HeadlessAllocation::bytes)
    }

    /// Handles of all live buffers created for `target`
    pub fn buffers_for(&self, target: BufferTarget) -> Vec<BufferHandle> {
        let mut handles: Vec<_> = self
            .allocations
            .iter()
            .filter(|(_, allocation)| allocation.target == target)
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort_by_key(|handle| handle.0);
        handles
    }

    /// Number of live buffers
    pub fn live_buffer_count(&self) -> usize {
        self.allocations.len()
    }

    /// Number of fences created and not yet deleted
    pub fn live_fence_count(&self) -> usize {
        self.live_fences.len()
    }

    /// Number of completed frames
    pub fn frames_finished(&self) -> u64 {
        self.frames_finished
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuBackend for HeadlessBackend {
    fn storage_offset_alignment(&self) -> u64 {
        self.storage_alignment
    }

    fn create_persistent_buffer(&mut self, target: BufferTarget, size: u64) -> GpuResult<MappedBuffer> {
        let len = usize::try_from(size).map_err(|_| GpuError::InvalidOperation {
            reason: format!("buffer size {size} does not fit in host memory"),
        })?;
        let allocation = HeadlessAllocation::new(len, target);
        let handle = BufferHandle(self.next_id());
        let mapped = MappedBuffer {
            handle,
            ptr: allocation.ptr,
            len: size,
        };
        self.allocations.insert(handle, allocation);

        log::debug!("Headless {:?} buffer {:?} created with {} bytes", target, handle, size);
        Ok(mapped)
    }

    unsafe fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.allocations.remove(&buffer).is_none() {
            log::warn!("Destroying unknown headless buffer {:?}", buffer);
        }
    }

    fn flush_mapped_range(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> GpuResult<()> {
        let allocation = self
            .allocations
            .get(&buffer)
            .ok_or(GpuError::UnknownBuffer(buffer))?;
        if offset + len > allocation.len as u64 {
            return Err(GpuError::InvalidOperation {
                reason: format!(
                    "flush range {}..{} exceeds buffer of {} bytes",
                    offset,
                    offset + len,
                    allocation.len
                ),
            });
        }

        self.commands.push(GpuCommand::FlushRange { buffer, offset, len });
        Ok(())
    }

    fn insert_fence(&mut self) -> GpuResult<FenceHandle> {
        let fence = FenceHandle(self.next_id());
        self.live_fences.insert(fence);
        self.commands.push(GpuCommand::InsertFence(fence));
        Ok(fence)
    }

    fn client_wait_fence(&mut self, fence: FenceHandle, _timeout_ns: u64) -> FenceStatus {
        let status = if self.live_fences.contains(&fence) {
            self.fence_status
        } else {
            FenceStatus::Failed
        };
        self.commands.push(GpuCommand::WaitFence { fence, status });
        status
    }

    fn delete_fence(&mut self, fence: FenceHandle) {
        self.live_fences.remove(&fence);
        self.commands.push(GpuCommand::DeleteFence(fence));
    }

    fn bind_storage_range(&mut self, slot: u32, buffer: BufferHandle, offset: u64, len: u64) {
        self.commands.push(GpuCommand::BindStorageRange {
            slot,
            buffer,
            offset,
            len,
        });
    }

    fn bind_mesh_storage(&mut self, slot: u32, key: MeshKey, _mesh: &MeshDescriptor) {
        self.commands.push(GpuCommand::BindMeshStorage { slot, mesh: key });
    }

    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType) {
        self.commands.push(GpuCommand::BindIndexBuffer {
            buffer,
            offset,
            index_type,
        });
    }

    fn begin_visual_state(&mut self, key: VisualStateKey, _state: &VisualState) {
        self.commands.push(GpuCommand::BeginVisualState(key));
    }

    fn end_visual_state(&mut self, key: VisualStateKey, _state: &VisualState) {
        self.commands.push(GpuCommand::EndVisualState(key));
    }

    fn bind_mesh(&mut self, key: MeshKey, _mesh: &MeshDescriptor) {
        self.commands.push(GpuCommand::BindMesh(key));
    }

    fn unbind_mesh(&mut self, key: MeshKey, _mesh: &MeshDescriptor) {
        self.commands.push(GpuCommand::UnbindMesh(key));
    }

    fn set_uniform(&mut self, value: UniformValue) {
        self.commands.push(GpuCommand::SetUniform(value));
    }

    fn draw_elements_instanced(
        &mut self,
        mode: DrawMode,
        index_count: u32,
        index_type: IndexType,
        instance_count: u32,
    ) {
        self.commands.push(GpuCommand::DrawInstanced {
            mode,
            index_count,
            index_type,
            instance_count,
        });
    }

    fn draw_elements(&mut self, mode: DrawMode, count: u32, index_type: IndexType) {
        self.commands.push(GpuCommand::DrawElements {
            mode,
            count,
            index_type,
        });
    }

    fn finish_frame(&mut self) -> GpuResult<()> {
        self.frames_finished += 1;
        self.commands.push(GpuCommand::FinishFrame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapped_memory_is_readable_after_write() {
        let mut backend = HeadlessBackend::new();
        let mapped = backend
            .create_persistent_buffer(BufferTarget::Storage, 16)
            .unwrap();

        unsafe {
            std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), mapped.ptr.as_ptr().add(4), 4);
        }

        let bytes = backend.buffer_bytes(mapped.handle).unwrap();
        assert_eq!(&bytes[4..8], &[1, 2, 3, 4]);
        assert_eq!(bytes[0], 0);

        unsafe { backend.destroy_buffer(mapped.handle) };
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn test_flush_out_of_range_fails() {
        let mut backend = HeadlessBackend::new();
        let mapped = backend.create_persistent_buffer(BufferTarget::Index, 8).unwrap();

        assert!(backend.flush_mapped_range(mapped.handle, 0, 8).is_ok());
        assert!(backend.flush_mapped_range(mapped.handle, 4, 8).is_err());
        assert!(backend
            .flush_mapped_range(BufferHandle(999), 0, 1)
            .is_err());
    }

    #[test]
    fn test_scripted_fence_status() {
        let mut backend = HeadlessBackend::new();
        let fence = backend.insert_fence().unwrap();
        assert_eq!(backend.client_wait_fence(fence, 0), FenceStatus::Signaled);

        backend.set_fence_status(FenceStatus::TimedOut);
        assert_eq!(backend.client_wait_fence(fence, 0), FenceStatus::TimedOut);

        backend.delete_fence(fence);
        assert_eq!(backend.live_fence_count(), 0);
        assert_eq!(backend.client_wait_fence(fence, 0), FenceStatus::Failed);
    }
}
