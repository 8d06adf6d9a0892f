//! # Instanced Dispatch
//!
//! Streams per-instance model data to the GPU through persistently mapped ring buffers
//! and draws large populations of animated models with one draw call per
//! (visual state, mesh) batch instead of one per object.
//!
//! ## Frame flow
//!
//! ```text
//! baking code ──▶ BakingContext ──▶ InstancedRenderDispatcher::render_queues
//!                 (tables, registry)     │
//!                                        ├─ wait section fence
//!                                        ├─ serialize into part / model / index rings
//!                                        ├─ flush, fence, bind ranges, advance
//!                                        └─ instanced or sorted draws per batch
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use instanced_dispatch::prelude::*;
//! use nalgebra::Matrix4;
//!
//! fn main() -> Result<(), DispatchError> {
//!     let mut dispatcher = InstancedRenderDispatcher::new(HeadlessBackend::new(), DispatchConfig::default())?;
//!     let solid = dispatcher.register_visual_state(VisualState::opaque("solid"));
//!     let cube = dispatcher.register_mesh(MeshDescriptor::new("cube", DrawMode::Triangles, 36, IndexType::U16));
//!
//!     let mut baking = BakingContext::new();
//!     baking.create_current_instance(cube);
//!     if let Some(record) = baking.current_instance() {
//!         record.push_part(&Matrix4::identity());
//!     }
//!     baking.submit_current(0, solid);
//!
//!     dispatcher.render_queues(&mut baking)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod backend;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod instance;
pub mod ring;

/// Common imports for hosts
pub mod prelude {
    pub use crate::{
        backend::{DrawMode, GpuBackend, HeadlessBackend, IndexType, VulkanBackend},
        batch::{
            BakingContext, DrawPath, MeshDescriptor, MeshKey, ShaderUniforms, Transparency,
            VisualState, VisualStateKey, WriteMask,
        },
        config::{Config, DispatchConfig},
        dispatch::{
            DispatchError, DispatchResult, FrameOutcome, FrameStats, InstancedRenderDispatcher,
            ShaderGlobals,
        },
        instance::InstanceRecord,
        ring::SyncOutcome,
    };
}
