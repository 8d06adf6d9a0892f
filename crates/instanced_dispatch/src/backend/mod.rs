//! GPU backend abstraction
//!
//! The dispatcher never talks to a graphics API directly. Everything it needs from the
//! graphics context (persistently mapped buffers, explicit range flushes, completion
//! fences, storage bindings, visual-state scopes and the two draw entry points) goes
//! through [`GpuBackend`].
//!
//! Two implementations ship with the crate:
//!
//! - [`vulkan::VulkanBackend`]: records into a host-owned command buffer with `ash`
//! - [`headless::HeadlessBackend`]: heap-backed mappings and a recorded command log,
//!   used by tests and the stress app

pub mod headless;
pub mod vulkan;

use crate::batch::{MeshDescriptor, MeshKey, ShaderUniforms, VisualState, VisualStateKey};
use ash::vk;
use std::ptr::NonNull;

pub use headless::{GpuCommand, HeadlessBackend};
pub use vulkan::VulkanBackend;

/// Errors raised by a GPU backend
#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    /// General Vulkan API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// No suitable memory type found for allocation
    #[error("No suitable memory type found")]
    NoSuitableMemoryType,

    /// The buffer handle is not owned by this backend
    #[error("Unknown buffer handle: {0:?}")]
    UnknownBuffer(BufferHandle),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },
}

/// Result type for backend operations
pub type GpuResult<T> = Result<T, GpuError>;

/// Opaque handle to a backend buffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

/// Opaque handle to a GPU completion fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub u64);

/// What a persistent buffer is bound as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferTarget {
    /// Shader storage data (part and model rings)
    Storage,
    /// Element indices (sorted index ring)
    Index,
}

/// Outcome of a bounded fence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The GPU finished all work covered by the fence
    Signaled,
    /// The timeout elapsed first
    TimedOut,
    /// The wait call itself failed
    Failed,
}

/// Primitive topology of a mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawMode {
    /// Triangle list
    Triangles,
    /// Triangle strip
    TriangleStrip,
    /// Line list
    Lines,
    /// Line strip
    LineStrip,
    /// Point list
    Points,
}

impl DrawMode {
    /// Whether the line width uniform applies to this topology
    pub fn is_line(self) -> bool {
        matches!(self, Self::Lines | Self::LineStrip)
    }
}

/// Element index width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    /// 16-bit indices
    U16,
    /// 32-bit indices
    U32,
}

impl IndexType {
    /// Size of one index in bytes
    pub fn size_bytes(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Narrowest index type able to address `max_index`
    pub fn for_max_index(max_index: u64) -> Self {
        if max_index <= u64::from(u16::MAX) {
            Self::U16
        } else {
            Self::U32
        }
    }
}

impl From<IndexType> for vk::IndexType {
    fn from(index_type: IndexType) -> Self {
        match index_type {
            IndexType::U16 => vk::IndexType::UINT16,
            IndexType::U32 => vk::IndexType::UINT32,
        }
    }
}

/// A per-draw uniform upload
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    /// Base index of this batch inside the bound model range
    InstanceOffset(u32),
    /// Mesh index count, used by the sorted path to split vertex ids
    InstanceVertCount(u32),
    /// Projection matrix (column major)
    ProjectionMatrix([[f32; 4]; 4]),
    /// Color modulator
    ColorModulator([f32; 4]),
    /// Fog start distance
    FogStart(f32),
    /// Fog end distance
    FogEnd(f32),
    /// Fog color
    FogColor([f32; 4]),
    /// Texture matrix (column major)
    TextureMatrix([[f32; 4]; 4]),
    /// Game time
    GameTime(f32),
    /// Framebuffer size in pixels
    ScreenSize([f32; 2]),
    /// Line width, only uploaded for line topologies
    LineWidth(f32),
}

impl UniformValue {
    /// The capability flag a visual state must declare for this uniform
    pub fn uniform(&self) -> ShaderUniforms {
        match self {
            Self::InstanceOffset(_) => ShaderUniforms::INSTANCE_OFFSET,
            Self::InstanceVertCount(_) => ShaderUniforms::INSTANCE_VERT_COUNT,
            Self::ProjectionMatrix(_) => ShaderUniforms::PROJECTION_MATRIX,
            Self::ColorModulator(_) => ShaderUniforms::COLOR_MODULATOR,
            Self::FogStart(_) => ShaderUniforms::FOG_START,
            Self::FogEnd(_) => ShaderUniforms::FOG_END,
            Self::FogColor(_) => ShaderUniforms::FOG_COLOR,
            Self::TextureMatrix(_) => ShaderUniforms::TEXTURE_MATRIX,
            Self::GameTime(_) => ShaderUniforms::GAME_TIME,
            Self::ScreenSize(_) => ShaderUniforms::SCREEN_SIZE,
            Self::LineWidth(_) => ShaderUniforms::LINE_WIDTH,
        }
    }

    /// Raw bytes for push-constant style uploads
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::InstanceOffset(v) | Self::InstanceVertCount(v) => bytemuck::bytes_of(v),
            Self::ProjectionMatrix(m) | Self::TextureMatrix(m) => bytemuck::bytes_of(m),
            Self::ColorModulator(c) | Self::FogColor(c) => bytemuck::bytes_of(c),
            Self::FogStart(v) | Self::FogEnd(v) | Self::GameTime(v) | Self::LineWidth(v) => {
                bytemuck::bytes_of(v)
            }
            Self::ScreenSize(s) => bytemuck::bytes_of(s),
        }
    }
}

/// A buffer that stays mapped into host memory for its whole life
///
/// `ptr` addresses `len` writable bytes and remains valid until the buffer is passed
/// to [`GpuBackend::destroy_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct MappedBuffer {
    /// Backend handle
    pub handle: BufferHandle,
    /// Host address of byte 0
    pub ptr: NonNull<u8>,
    /// Mapped length in bytes
    pub len: u64,
}

/// Graphics context operations consumed by the dispatcher
///
/// All methods are called from the single graphics thread that owns the context.
pub trait GpuBackend {
    /// Allocate a buffer of `size` bytes and map it persistently for writing
    fn create_persistent_buffer(&mut self, target: BufferTarget, size: u64) -> GpuResult<MappedBuffer>;

    /// Unmap and free a persistent buffer
    ///
    /// # Safety
    ///
    /// Nothing may read or write through the buffer's [`MappedBuffer::ptr`] afterwards.
    unsafe fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Make host writes to `offset..offset + len` visible to the GPU
    fn flush_mapped_range(&mut self, buffer: BufferHandle, offset: u64, len: u64) -> GpuResult<()>;

    /// Create a fence that signals once the GPU finishes the current frame's work
    fn insert_fence(&mut self) -> GpuResult<FenceHandle>;

    /// Block until `fence` signals or `timeout_ns` elapses
    fn client_wait_fence(&mut self, fence: FenceHandle, timeout_ns: u64) -> FenceStatus;

    /// Release a fence
    fn delete_fence(&mut self, fence: FenceHandle);

    /// Required alignment of storage range offsets, in bytes
    fn storage_offset_alignment(&self) -> u64 {
        4
    }

    /// Bind `len` bytes of `buffer` starting at `offset` to a storage slot
    ///
    /// `offset` is a multiple of [`GpuBackend::storage_offset_alignment`].
    fn bind_storage_range(&mut self, slot: u32, buffer: BufferHandle, offset: u64, len: u64);

    /// Bind the vertex data of a mesh to a storage slot
    fn bind_mesh_storage(&mut self, slot: u32, key: MeshKey, mesh: &MeshDescriptor);

    /// Make `buffer` the active element buffer starting at byte `offset`
    fn bind_index_buffer(&mut self, buffer: BufferHandle, offset: u64, index_type: IndexType);

    /// Enter the draw scope of a visual state
    fn begin_visual_state(&mut self, key: VisualStateKey, state: &VisualState);

    /// Leave the draw scope of a visual state
    fn end_visual_state(&mut self, key: VisualStateKey, state: &VisualState);

    /// Bind a mesh's vertex and element data
    fn bind_mesh(&mut self, key: MeshKey, mesh: &MeshDescriptor);

    /// Release a mesh binding
    fn unbind_mesh(&mut self, key: MeshKey, mesh: &MeshDescriptor);

    /// Upload a uniform for the next draw
    fn set_uniform(&mut self, value: UniformValue);

    /// True hardware instanced indexed draw using the bound mesh elements
    fn draw_elements_instanced(
        &mut self,
        mode: DrawMode,
        index_count: u32,
        index_type: IndexType,
        instance_count: u32,
    );

    /// Single indexed draw over the bound element buffer
    fn draw_elements(&mut self, mode: DrawMode, count: u32, index_type: IndexType);

    /// Called once after the last draw of a frame
    fn finish_frame(&mut self) -> GpuResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_type_selection() {
        assert_eq!(IndexType::for_max_index(0), IndexType::U16);
        assert_eq!(IndexType::for_max_index(65_535), IndexType::U16);
        assert_eq!(IndexType::for_max_index(65_536), IndexType::U32);
        assert_eq!(IndexType::U16.size_bytes(), 2);
        assert_eq!(IndexType::U32.size_bytes(), 4);
    }

    #[test]
    fn test_uniform_bytes() {
        assert_eq!(UniformValue::InstanceOffset(5).as_bytes(), &5u32.to_ne_bytes());
        assert_eq!(UniformValue::ProjectionMatrix([[0.0; 4]; 4]).as_bytes().len(), 64);
        assert_eq!(UniformValue::ScreenSize([1.0, 2.0]).as_bytes().len(), 8);
        assert_eq!(
            UniformValue::LineWidth(2.0).uniform(),
            ShaderUniforms::LINE_WIDTH
        );
    }
}
