//! Per-mesh instance list for the current frame

use super::{InstanceRecord, InstanceRecordPool};
use crate::batch::MeshKey;

/// The records created for one mesh this frame
///
/// The last record begun is the "current" one the baking code populates. Records are
/// addressed by their index in this list, which stays stable until
/// [`reset_frame`](Self::reset_frame).
#[derive(Debug)]
pub struct ModelTypeTable {
    mesh: MeshKey,
    records: Vec<InstanceRecord>,
}

impl ModelTypeTable {
    /// Create an empty table for `mesh`
    pub fn new(mesh: MeshKey) -> Self {
        Self {
            mesh,
            records: Vec::with_capacity(64),
        }
    }

    /// Start a new instance and return its index
    pub fn begin_instance(&mut self, pool: &mut InstanceRecordPool) -> u32 {
        self.records.push(pool.acquire(self.mesh));
        (self.records.len() - 1) as u32
    }

    /// Record most recently begun
    pub fn current_instance(&mut self) -> Option<&mut InstanceRecord> {
        self.records.last_mut()
    }

    /// Index of the record most recently begun
    pub fn current_index(&self) -> Option<u32> {
        self.records.len().checked_sub(1).map(|index| index as u32)
    }

    /// Instances created this frame
    pub fn instance_count(&self) -> usize {
        self.records.len()
    }

    /// Record by index
    pub fn record(&self, index: u32) -> Option<&InstanceRecord> {
        self.records.get(index as usize)
    }

    /// Mesh this table belongs to
    pub fn mesh(&self) -> MeshKey {
        self.mesh
    }

    /// Return every record to the pool
    pub fn reset_frame(&mut self, pool: &mut InstanceRecordPool) {
        for record in self.records.drain(..) {
            pool.release(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_instance_tracks_current() {
        let mut pool = InstanceRecordPool::new();
        let mut table = ModelTypeTable::new(MeshKey::default());

        assert!(table.current_instance().is_none());
        assert_eq!(table.begin_instance(&mut pool), 0);
        table.current_instance().unwrap().set_sort_depth(1.0);
        assert_eq!(table.begin_instance(&mut pool), 1);
        table.current_instance().unwrap().set_sort_depth(2.0);

        assert_eq!(table.instance_count(), 2);
        assert_eq!(table.current_index(), Some(1));
        assert_eq!(table.record(0).unwrap().sort_depth(), 1.0);
        assert_eq!(table.record(1).unwrap().sort_depth(), 2.0);
    }

    #[test]
    fn test_reset_frame_returns_records() {
        let mut pool = InstanceRecordPool::new();
        let mut table = ModelTypeTable::new(MeshKey::default());
        for _ in 0..5 {
            table.begin_instance(&mut pool);
        }

        table.reset_frame(&mut pool);

        assert_eq!(table.instance_count(), 0);
        assert_eq!(pool.free_count(), 5);
        assert_eq!(table.current_index(), None);
    }
}
