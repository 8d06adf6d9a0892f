//! Per-instance payload
//!
//! One [`InstanceRecord`] describes one rendered object for one frame: a model entry and
//! the ordered transforms of its parts. At serialization the parts go to the part ring,
//! and the model entry goes to the model ring with the index of its first part.
//!
//! ```text
//! part ring:   [p0 p1 p2][p0 p1][p0 p1 p2 p3] ...
//!               ^          ^     ^
//! model ring:  [m0        ][m1  ][m2          ]   (part_base = 0, 3, 5)
//! ```

use crate::batch::MeshKey;
use crate::ring::{RingResult, SectionedPersistentBuffer};
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix3, Matrix4};

/// Model entry as read by the vertex shader (std430 layout)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ModelData {
    /// RGBA tint
    pub color: [f32; 4],
    /// Overlay texture coordinates
    pub overlay: [i32; 2],
    /// Packed block and sky light
    pub light: [i32; 2],
    /// Index of the first part of this instance, relative to the bound part range
    pub part_base: u32,
    /// Pads to 16 bytes
    pub _padding: [u32; 3],
}

impl Default for ModelData {
    fn default() -> Self {
        Self {
            color: [1.0; 4],
            overlay: [0; 2],
            light: [0; 2],
            part_base: 0,
            _padding: [0; 3],
        }
    }
}

/// One part transform (std430 layout)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct PartData {
    /// Model-view matrix, column major
    pub model_view: [[f32; 4]; 4],
    /// Normal matrix, 3 columns padded to vec4
    pub normal: [[f32; 4]; 3],
}

impl PartData {
    /// Size of one part entry in the part ring
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;

    /// Build a part from its model-view matrix
    pub fn from_model_view(model_view: &Matrix4<f32>) -> Self {
        let upper: Matrix3<f32> = model_view.fixed_view::<3, 3>(0, 0).into_owned();
        let normal = upper.try_inverse().map_or_else(
            || {
                log::warn!("Part transform is not invertible, using identity for normal matrix");
                Matrix3::identity()
            },
            |inverse| inverse.transpose(),
        );

        let column = |c: usize| [normal[(0, c)], normal[(1, c)], normal[(2, c)], 0.0];
        Self {
            model_view: (*model_view).into(),
            normal: [column(0), column(1), column(2)],
        }
    }
}

/// Everything written to the rings for one object instance
#[derive(Debug, Clone, Default)]
pub struct InstanceRecord {
    mesh: MeshKey,
    model: ModelData,
    parts: Vec<PartData>,
    sort_depth: f32,
}

impl InstanceRecord {
    /// Empty record for `mesh`
    pub fn new(mesh: MeshKey) -> Self {
        Self {
            mesh,
            ..Self::default()
        }
    }

    /// Overwrite every field for reuse, keeping the part allocation
    pub fn reset(&mut self, mesh: MeshKey) {
        self.mesh = mesh;
        self.model = ModelData::default();
        self.parts.clear();
        self.sort_depth = 0.0;
    }

    /// Append a part transform
    pub fn push_part(&mut self, model_view: &Matrix4<f32>) {
        self.parts.push(PartData::from_model_view(model_view));
    }

    /// Set the RGBA tint
    pub fn set_color(&mut self, color: [f32; 4]) {
        self.model.color = color;
    }

    /// Set overlay texture coordinates
    pub fn set_overlay(&mut self, u: i32, v: i32) {
        self.model.overlay = [u, v];
    }

    /// Set block and sky light
    pub fn set_light(&mut self, block: i32, sky: i32) {
        self.model.light = [block, sky];
    }

    /// Set the view depth used to order sorted draws, larger is farther
    pub fn set_sort_depth(&mut self, depth: f32) {
        self.sort_depth = depth;
    }

    /// Mesh this record belongs to
    pub fn mesh(&self) -> MeshKey {
        self.mesh
    }

    /// Model entry
    pub fn model(&self) -> &ModelData {
        &self.model
    }

    /// Part transforms in draw order
    pub fn parts(&self) -> &[PartData] {
        &self.parts
    }

    /// View depth
    pub fn sort_depth(&self) -> f32 {
        self.sort_depth
    }

    /// Append this record to the part and model rings
    ///
    /// Returns the model ring reservation offset relative to the section start.
    pub fn write_to_rings(
        &self,
        part_ring: &SectionedPersistentBuffer,
        model_ring: &SectionedPersistentBuffer,
    ) -> RingResult<u64> {
        let parts = part_ring.push_bytes(bytemuck::cast_slice(&self.parts))?;

        let mut model = self.model;
        model.part_base = (parts.section_offset / PartData::SIZE) as u32;
        let entry = model_ring.push_bytes(bytemuck::bytes_of(&model))?;
        Ok(entry.section_offset)
    }
}
