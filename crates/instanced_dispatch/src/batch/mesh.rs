//! Registered meshes and visual states

use super::{MeshKey, VisualState, VisualStateKey};
use crate::backend::{DrawMode, IndexType};
use slotmap::SlotMap;

/// Draw parameters of a baked mesh
///
/// The vertex and element data live with the backend; the dispatcher only needs the
/// topology and the element count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshDescriptor {
    name: String,
    draw_mode: DrawMode,
    index_count: u32,
    index_type: IndexType,
}

impl MeshDescriptor {
    /// Describe a mesh
    pub fn new(name: impl Into<String>, draw_mode: DrawMode, index_count: u32, index_type: IndexType) -> Self {
        Self {
            name: name.into(),
            draw_mode,
            index_count,
            index_type,
        }
    }

    /// Debug name, also the diagnostics key
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Topology
    pub fn draw_mode(&self) -> DrawMode {
        self.draw_mode
    }

    /// Elements drawn per instance
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Width of the mesh's own element buffer
    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Meshes without elements are never serialized or drawn
    pub fn is_empty(&self) -> bool {
        self.index_count == 0
    }
}

/// Visual states and meshes known to the dispatcher
#[derive(Debug, Default)]
pub struct RenderResources {
    states: SlotMap<VisualStateKey, VisualState>,
    meshes: SlotMap<MeshKey, MeshDescriptor>,
}

impl RenderResources {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visual state
    pub fn insert_state(&mut self, state: VisualState) -> VisualStateKey {
        self.states.insert(state)
    }

    /// Register a mesh
    pub fn insert_mesh(&mut self, mesh: MeshDescriptor) -> MeshKey {
        self.meshes.insert(mesh)
    }

    /// Look up a visual state
    pub fn state(&self, key: VisualStateKey) -> Option<&VisualState> {
        self.states.get(key)
    }

    /// Look up a mesh
    pub fn mesh(&self, key: MeshKey) -> Option<&MeshDescriptor> {
        self.meshes.get(key)
    }

    /// Both halves of a batch key, if the batch can be drawn at all
    pub fn drawable(&self, state: VisualStateKey, mesh: MeshKey) -> Option<(&VisualState, &MeshDescriptor)> {
        let state = self.states.get(state)?;
        let mesh = self.meshes.get(mesh)?;
        (!mesh.is_empty()).then_some((state, mesh))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mesh_is_not_drawable() {
        let mut resources = RenderResources::new();
        let state = resources.insert_state(VisualState::opaque("solid"));
        let empty = resources.insert_mesh(MeshDescriptor::new("empty", DrawMode::Triangles, 0, IndexType::U16));
        let cube = resources.insert_mesh(MeshDescriptor::new("cube", DrawMode::Triangles, 36, IndexType::U16));

        assert!(resources.drawable(state, empty).is_none());
        assert!(resources.drawable(state, cube).is_some());
        assert!(resources.drawable(VisualStateKey::default(), cube).is_none());
    }
}
