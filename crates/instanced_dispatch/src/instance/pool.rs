//! Free list of reusable instance records

use super::InstanceRecord;
use crate::batch::MeshKey;

/// Stack of released records
///
/// Records are moved out on [`acquire`](Self::acquire) and moved back on
/// [`release`](Self::release), so a record can never be pooled twice. Reuse order does
/// not matter: every acquired record is reset before it is handed out.
#[derive(Debug, Default)]
pub struct InstanceRecordPool {
    free: Vec<InstanceRecord>,
    allocated: usize,
}

impl InstanceRecordPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pool holding `count` ready records
    pub fn with_capacity(count: usize) -> Self {
        Self {
            free: (0..count).map(|_| InstanceRecord::default()).collect(),
            allocated: count,
        }
    }

    /// Take a reset record, allocating when the pool is empty
    pub fn acquire(&mut self, mesh: MeshKey) -> InstanceRecord {
        match self.free.pop() {
            Some(mut record) => {
                record.reset(mesh);
                record
            }
            None => {
                self.allocated += 1;
                InstanceRecord::new(mesh)
            }
        }
    }

    /// Return a record for reuse
    pub fn release(&mut self, record: InstanceRecord) {
        self.free.push(record);
    }

    /// Records waiting for reuse
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Records ever allocated by this pool
    pub fn allocated_count(&self) -> usize {
        self.allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Matrix4;

    #[test]
    fn test_acquire_release_is_balanced() {
        let mut pool = InstanceRecordPool::with_capacity(4);
        let start = pool.free_count();

        for _ in 0..100 {
            let record = pool.acquire(MeshKey::default());
            pool.release(record);
        }

        assert_eq!(pool.free_count(), start);
        assert_eq!(pool.allocated_count(), 4);
    }

    #[test]
    fn test_exhausted_pool_grows() {
        let mut pool = InstanceRecordPool::new();
        let records: Vec<_> = (0..3).map(|_| pool.acquire(MeshKey::default())).collect();
        assert_eq!(pool.allocated_count(), 3);

        for record in records {
            pool.release(record);
        }
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn test_reused_record_is_reset() {
        let mut pool = InstanceRecordPool::new();
        let mut record = pool.acquire(MeshKey::default());
        record.push_part(&Matrix4::identity());
        record.set_sort_depth(9.0);
        pool.release(record);

        let reused = pool.acquire(MeshKey::default());
        assert!(reused.parts().is_empty());
        assert_eq!(reused.sort_depth(), 0.0);
    }
}
