//! Batching of instance records by draw bucket, visual state and mesh
//!
//! - [`VisualState`] / [`MeshDescriptor`]: what a batch is drawn with, registered once
//! - [`InstanceBatch`]: the records sharing one state and mesh in one bucket
//! - [`BakingContext`]: the explicit per-frame registry baking code fills

mod baking;
mod instance_batch;
mod mesh;
mod visual_state;

pub use baking::{BakingContext, BakingData, DrawBucket, StateGroup};
pub use instance_batch::InstanceBatch;
pub use mesh::{MeshDescriptor, RenderResources};
pub use visual_state::{DrawPath, ShaderUniforms, Transparency, VisualState, WriteMask};

slotmap::new_key_type! {
    /// Handle to a registered visual state
    pub struct VisualStateKey;

    /// Handle to a registered mesh
    pub struct MeshKey;
}
