//! Records sharing one visual state and mesh

use crate::backend::IndexType;

/// Instance records drawn together
///
/// Holds indices into the mesh's [`ModelTypeTable`](crate::instance::ModelTypeTable) in
/// submission order. For the sorted path it also remembers where its generated elements
/// were written in the index ring.
#[derive(Debug, Clone)]
pub struct InstanceBatch {
    records: Vec<u32>,
    index_type: IndexType,
    index_offset: u64,
}

impl Default for InstanceBatch {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            index_type: IndexType::U16,
            index_offset: 0,
        }
    }

    /// Append a record index
    pub fn push(&mut self, record: u32) {
        self.records.push(record);
    }

    /// Number of instances
    pub fn size(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no instances
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record indices in draw order
    pub fn records(&self) -> &[u32] {
        &self.records
    }

    /// Width of the generated elements
    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Absolute byte offset of the generated elements in the index ring
    pub fn index_offset(&self) -> u64 {
        self.index_offset
    }

    pub(crate) fn set_index_range(&mut self, index_type: IndexType, offset: u64) {
        self.index_type = index_type;
        self.index_offset = offset;
    }

    /// Forget contents, keeping the allocation
    pub fn clear(&mut self) {
        self.records.clear();
        self.index_type = IndexType::U16;
        self.index_offset = 0;
    }
}
