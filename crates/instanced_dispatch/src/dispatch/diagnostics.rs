//! Best-effort per-frame counters
//!
//! Nothing here feeds back into dispatch. Counts are zeroed at the start of every
//! rendered frame; model entries stay in the map once seen so an overlay can list them
//! with zero counts.

use crate::batch::MeshKey;
use std::collections::HashMap;

/// Counters for one mesh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelDebugInfo {
    /// Instances drawn this frame
    pub instances: u64,
    /// Draw calls issued this frame
    pub sets: u64,
}

#[derive(Debug, Clone)]
struct ModelEntry {
    name: String,
    info: ModelDebugInfo,
}

/// Counters for the last dispatched frame
#[derive(Debug, Clone, Default)]
pub struct FrameDiagnostics {
    models: HashMap<MeshKey, ModelEntry>,
    /// Bytes flushed from the part ring
    pub part_buffer_bytes: u64,
    /// Bytes flushed from the model ring
    pub model_buffer_bytes: u64,
    /// Bytes flushed from the sorted index ring
    pub index_buffer_bytes: u64,
}

impl FrameDiagnostics {
    /// Zero every counter
    pub fn begin_frame(&mut self) {
        for entry in self.models.values_mut() {
            entry.info = ModelDebugInfo::default();
        }
        self.part_buffer_bytes = 0;
        self.model_buffer_bytes = 0;
        self.index_buffer_bytes = 0;
    }

    /// Count one draw of `instances` instances of `mesh`, displayed as `name`
    pub fn record_draw(&mut self, mesh: MeshKey, name: &str, instances: u64) {
        let entry = self.models.entry(mesh).or_insert_with(|| ModelEntry {
            name: name.to_string(),
            info: ModelDebugInfo::default(),
        });
        entry.info.instances += instances;
        entry.info.sets += 1;
    }

    /// Counters of one mesh
    pub fn model(&self, mesh: MeshKey) -> Option<&ModelDebugInfo> {
        self.models.get(&mesh).map(|entry| &entry.info)
    }

    /// All meshes seen so far, sorted by display name
    pub fn models(&self) -> Vec<(MeshKey, &str, ModelDebugInfo)> {
        let mut models: Vec<_> = self
            .models
            .iter()
            .map(|(key, entry)| (*key, entry.name.as_str(), entry.info))
            .collect();
        models.sort_by(|a, b| a.1.cmp(b.1).then(a.0.cmp(&b.0)));
        models
    }

    /// Instances drawn across all meshes
    pub fn total_instances(&self) -> u64 {
        self.models.values().map(|entry| entry.info.instances).sum()
    }

    /// Draw calls across all meshes
    pub fn total_draw_calls(&self) -> u64 {
        self.models.values().map(|entry| entry.info.sets).sum()
    }
}
