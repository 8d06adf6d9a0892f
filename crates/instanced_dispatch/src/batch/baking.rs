//! Per-frame baking registry
//!
//! Baking code fills a [`BakingContext`] while it walks the visible objects of a frame.
//! The registry inside groups submitted records by draw-order bucket, then visual state,
//! then mesh:
//!
//! ```text
//! bucket 0 ─┬─ state "solid" ─┬─ mesh A -> [r0 r1 r2]
//!           │                 └─ mesh B -> [r0]
//!           └─ state "glass" ─── mesh B -> [r1 r2]
//! bucket 1 ─── state "solid" ─── mesh A -> [r3]
//! ```
//!
//! Buckets are visited in index order. Inside a bucket, states and meshes are visited in
//! the order they were first submitted this frame. Serialization and drawing both walk
//! this exact order, which keeps the running instance offset of the draw loop in step
//! with the model entries in the ring.

use super::{InstanceBatch, MeshKey, RenderResources, VisualStateKey};
use crate::backend::IndexType;
use crate::instance::{InstanceRecord, InstanceRecordPool, ModelTypeTable};
use crate::ring::{InstanceRings, RingError, RingResult};
use std::collections::HashMap;

/// Batches of one visual state inside a bucket
#[derive(Debug, Default)]
pub struct StateGroup {
    state: VisualStateKey,
    batches: Vec<(MeshKey, InstanceBatch)>,
    lookup: HashMap<MeshKey, usize>,
}

impl StateGroup {
    fn new(state: VisualStateKey) -> Self {
        Self {
            state,
            ..Self::default()
        }
    }

    /// Visual state of every batch in the group
    pub fn state(&self) -> VisualStateKey {
        self.state
    }

    /// Batches in first-submission order
    pub fn batches(&self) -> impl Iterator<Item = (MeshKey, &InstanceBatch)> {
        self.batches.iter().map(|(mesh, batch)| (*mesh, batch))
    }

    /// Consume the group, yielding its batches in order
    pub fn into_batches(self) -> impl Iterator<Item = (MeshKey, InstanceBatch)> {
        self.batches.into_iter()
    }
}

/// One draw-order bucket
#[derive(Debug, Default)]
pub struct DrawBucket {
    groups: Vec<StateGroup>,
    lookup: HashMap<VisualStateKey, usize>,
}

impl DrawBucket {
    /// State groups in first-submission order
    pub fn groups(&self) -> &[StateGroup] {
        &self.groups
    }

    /// Consume the bucket, yielding its groups in order
    pub fn into_groups(self) -> impl Iterator<Item = StateGroup> {
        self.groups.into_iter()
    }

    /// Whether any batch in the bucket holds an instance
    pub fn has_instances(&self) -> bool {
        self.groups
            .iter()
            .any(|group| group.batches.iter().any(|(_, batch)| !batch.is_empty()))
    }
}

/// Ordered bucket → state → mesh registry of instance batches
#[derive(Debug, Default)]
pub struct BakingData {
    buckets: Vec<DrawBucket>,
    batch_pool: Vec<InstanceBatch>,
    sort_order: Vec<u32>,
    index_scratch: Vec<u8>,
}

impl BakingData {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch for a key, created on first use
    pub fn batch_for(&mut self, bucket: usize, state: VisualStateKey, mesh: MeshKey) -> &mut InstanceBatch {
        if self.buckets.len() <= bucket {
            self.buckets.resize_with(bucket + 1, DrawBucket::default);
        }
        let draw_bucket = &mut self.buckets[bucket];

        let group_index = *draw_bucket.lookup.entry(state).or_insert_with(|| {
            draw_bucket.groups.push(StateGroup::new(state));
            draw_bucket.groups.len() - 1
        });
        let group = &mut draw_bucket.groups[group_index];

        let batch_pool = &mut self.batch_pool;
        let batch_index = *group.lookup.entry(mesh).or_insert_with(|| {
            let batch = batch_pool.pop().unwrap_or_default();
            group.batches.push((mesh, batch));
            group.batches.len() - 1
        });
        &mut group.batches[batch_index].1
    }

    /// Whether no bucket holds any instance
    pub fn is_empty_shallow(&self) -> bool {
        !self.buckets.iter().any(DrawBucket::has_instances)
    }

    /// Buckets in draw order
    pub fn buckets(&self) -> &[DrawBucket] {
        &self.buckets
    }

    /// Serialize every drawable batch into the rings, in registry order
    ///
    /// Batches whose state or mesh is unknown, or whose mesh has no elements, are
    /// skipped here and by the draw loop alike. Sorted batches also get their depth
    /// ordered elements written to the index ring.
    pub fn write_data(
        &mut self,
        tables: &HashMap<MeshKey, ModelTypeTable>,
        resources: &RenderResources,
        rings: &InstanceRings,
    ) -> RingResult<()> {
        for bucket in &mut self.buckets {
            for group in &mut bucket.groups {
                for (mesh_key, batch) in &mut group.batches {
                    let mesh_key = *mesh_key;
                    if batch.is_empty() {
                        continue;
                    }
                    let Some((state, mesh)) = resources.drawable(group.state, mesh_key) else {
                        continue;
                    };
                    let Some(table) = tables.get(&mesh_key) else {
                        log::warn!("No instance table for mesh '{}'", mesh.name());
                        continue;
                    };

                    let records = batch.records().iter().filter_map(|index| table.record(*index));
                    for record in records {
                        record.write_to_rings(&rings.part, &rings.model)?;
                    }

                    if state.requires_sorting() {
                        write_sorted_indices(
                            batch,
                            table,
                            mesh.index_count(),
                            rings,
                            &mut self.sort_order,
                            &mut self.index_scratch,
                        )?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Return a drawn batch to the batch pool
    pub fn recycle_instance_batch(&mut self, mut batch: InstanceBatch) {
        batch.clear();
        self.batch_pool.push(batch);
    }

    /// Move the buckets out for drawing, leaving the registry empty
    pub fn take_buckets(&mut self) -> Vec<DrawBucket> {
        std::mem::take(&mut self.buckets)
    }

    /// Clear the registry, recycling every remaining batch
    pub fn reset(&mut self) {
        let buckets = self.take_buckets();
        for bucket in buckets {
            for group in bucket.into_groups() {
                for (_, batch) in group.into_batches() {
                    self.recycle_instance_batch(batch);
                }
            }
        }
    }

    /// Batches waiting for reuse
    pub fn pooled_batches(&self) -> usize {
        self.batch_pool.len()
    }
}

/// Write `instance * index_count + k` for every instance, farthest instance first
///
/// The index range is reserved before any index is generated, so an oversized batch
/// fails without building its element list.
fn write_sorted_indices(
    batch: &mut InstanceBatch,
    table: &ModelTypeTable,
    index_count: u32,
    rings: &InstanceRings,
    sort_order: &mut Vec<u32>,
    scratch: &mut Vec<u8>,
) -> RingResult<()> {
    let total_indices = batch.size() as u64 * u64::from(index_count);
    let index_type = IndexType::for_max_index(total_indices.saturating_sub(1));
    // Keep the next batch's elements 4-byte aligned
    let byte_len = total_indices
        .saturating_mul(index_type.size_bytes())
        .saturating_add(3)
        & !3;

    if total_indices > u64::from(u32::MAX) {
        return Err(RingError::Overflow {
            buffer: rings.index.name(),
            requested: byte_len,
            available: rings.index.section_size().saturating_sub(rings.index.written_len()),
        });
    }
    let reservation = rings.index.reserve(byte_len)?;

    let depth = |position: u32| {
        batch
            .records()
            .get(position as usize)
            .and_then(|record| table.record(*record))
            .map_or(0.0, InstanceRecord::sort_depth)
    };

    sort_order.clear();
    sort_order.extend(0..batch.size() as u32);
    // Stable, so equal depths keep submission order
    sort_order.sort_by(|a, b| depth(*b).total_cmp(&depth(*a)));

    scratch.clear();
    scratch.reserve(byte_len as usize);
    for &instance in sort_order.iter() {
        // Bounded by `total_indices`, which fits in u32
        let base = instance * index_count;
        for k in 0..index_count {
            match index_type {
                IndexType::U16 => scratch.extend_from_slice(&((base + k) as u16).to_ne_bytes()),
                IndexType::U32 => scratch.extend_from_slice(&(base + k).to_ne_bytes()),
            }
        }
    }
    scratch.resize(byte_len as usize, 0);

    let written = rings.index.write(reservation, scratch)?;
    batch.set_index_range(index_type, written.offset);
    Ok(())
}

/// Explicit per-frame baking state
///
/// Holds the registry, the per-mesh instance tables and the record pool. Baking code
/// receives it by mutable reference; the dispatcher consumes it in
/// [`render_queues`](crate::dispatch::InstancedRenderDispatcher::render_queues) and
/// resets it for the next frame.
#[derive(Debug, Default)]
pub struct BakingContext {
    registry: BakingData,
    tables: HashMap<MeshKey, ModelTypeTable>,
    pool: InstanceRecordPool,
    current: Option<(MeshKey, u32)>,
}

impl BakingContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context whose pool starts with `records` ready records
    pub fn with_pool_capacity(records: usize) -> Self {
        Self {
            pool: InstanceRecordPool::with_capacity(records),
            ..Self::default()
        }
    }

    /// Start a new instance of `mesh` and make it current
    pub fn create_current_instance(&mut self, mesh: MeshKey) -> u32 {
        let table = self
            .tables
            .entry(mesh)
            .or_insert_with(|| ModelTypeTable::new(mesh));
        let index = table.begin_instance(&mut self.pool);
        self.current = Some((mesh, index));
        index
    }

    /// Record being populated
    pub fn current_instance(&mut self) -> Option<&mut InstanceRecord> {
        let (mesh, _) = self.current?;
        self.tables.get_mut(&mesh)?.current_instance()
    }

    /// Instances of `mesh` created this frame
    pub fn instance_count(&self, mesh: MeshKey) -> usize {
        self.tables.get(&mesh).map_or(0, ModelTypeTable::instance_count)
    }

    /// Instances created this frame across all meshes
    pub fn total_instance_count(&self) -> usize {
        self.tables.values().map(ModelTypeTable::instance_count).sum()
    }

    /// Queue the current instance for drawing in `bucket` with `state`
    ///
    /// Returns false when no instance is current.
    pub fn submit_current(&mut self, bucket: usize, state: VisualStateKey) -> bool {
        let Some((mesh, index)) = self.current else {
            return false;
        };
        self.registry.batch_for(bucket, state, mesh).push(index);
        true
    }

    /// Whether nothing was submitted this frame
    pub fn is_empty_shallow(&self) -> bool {
        self.registry.is_empty_shallow()
    }

    /// Serialize the registry into the rings
    pub fn write_data(&mut self, resources: &RenderResources, rings: &InstanceRings) -> RingResult<()> {
        self.registry.write_data(&self.tables, resources, rings)
    }

    /// The registry
    pub fn registry(&self) -> &BakingData {
        &self.registry
    }

    /// The registry, mutably
    pub fn registry_mut(&mut self) -> &mut BakingData {
        &mut self.registry
    }

    /// Instance tables of every mesh seen so far
    pub fn tables(&self) -> impl Iterator<Item = &ModelTypeTable> {
        self.tables.values()
    }

    /// The record pool
    pub fn pool(&self) -> &InstanceRecordPool {
        &self.pool
    }

    /// Clear the registry and return every record to the pool
    ///
    /// Tables are kept, empty, so later frames reuse their allocations.
    pub fn reset(&mut self) {
        self.registry.reset();
        for table in self.tables.values_mut() {
            table.reset_frame(&mut self.pool);
        }
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferTarget, DrawMode, HeadlessBackend};
    use crate::batch::{MeshDescriptor, VisualState};
    use crate::config::DispatchConfig;
    use nalgebra::Matrix4;
    use slotmap::SlotMap;

    fn keys() -> (VisualStateKey, VisualStateKey, MeshKey, MeshKey) {
        let mut states: SlotMap<VisualStateKey, ()> = SlotMap::with_key();
        let mut meshes: SlotMap<MeshKey, ()> = SlotMap::with_key();
        (states.insert(()), states.insert(()), meshes.insert(()), meshes.insert(()))
    }

    #[test]
    fn test_registry_preserves_first_submission_order() {
        let (solid, glass, a, b) = keys();
        let mut registry = BakingData::new();

        registry.batch_for(0, glass, b).push(0);
        registry.batch_for(0, solid, a).push(0);
        registry.batch_for(0, glass, a).push(1);
        registry.batch_for(0, glass, b).push(2);

        let groups = registry.buckets()[0].groups();
        assert_eq!(groups[0].state(), glass);
        assert_eq!(groups[1].state(), solid);
        let glass_batches: Vec<_> = groups[0].batches().map(|(mesh, batch)| (mesh, batch.size())).collect();
        assert_eq!(glass_batches, vec![(b, 2), (a, 1)]);
    }

    #[test]
    fn test_is_empty_shallow() {
        let (solid, _, a, _) = keys();
        let mut registry = BakingData::new();
        assert!(registry.is_empty_shallow());

        // A batch without records does not count
        registry.batch_for(2, solid, a);
        assert!(registry.is_empty_shallow());

        registry.batch_for(2, solid, a).push(0);
        assert!(!registry.is_empty_shallow());
    }

    #[test]
    fn test_reset_recycles_batches() {
        let (solid, glass, a, b) = keys();
        let mut registry = BakingData::new();
        registry.batch_for(0, solid, a).push(0);
        registry.batch_for(1, glass, b).push(0);

        registry.reset();

        assert!(registry.buckets().is_empty());
        assert_eq!(registry.pooled_batches(), 2);

        // Recycled batches come back empty
        assert!(registry.batch_for(0, solid, b).is_empty());
        assert_eq!(registry.pooled_batches(), 1);
    }

    #[test]
    fn test_context_tracks_current_instance() {
        let (solid, _, a, b) = keys();
        let mut context = BakingContext::new();
        assert!(!context.submit_current(0, solid));

        context.create_current_instance(a);
        context.current_instance().unwrap().set_sort_depth(4.0);
        assert!(context.submit_current(0, solid));
        context.create_current_instance(b);
        context.create_current_instance(a);

        assert_eq!(context.instance_count(a), 2);
        assert_eq!(context.instance_count(b), 1);
        assert_eq!(context.total_instance_count(), 3);

        context.reset();
        assert_eq!(context.total_instance_count(), 0);
        assert_eq!(context.pool().free_count(), 3);
        assert!(context.current_instance().is_none());
        assert!(context.is_empty_shallow());
    }

    #[test]
    fn test_sorted_indices_are_back_to_front() {
        let mut backend = HeadlessBackend::new();
        let config = DispatchConfig::default().with_section_sizes(4096, 4096, 4096);
        let rings = InstanceRings::new(&mut backend, &config).unwrap();

        let mut resources = RenderResources::new();
        let glass = resources.insert_state(VisualState::translucent("glass"));
        let quad = resources.insert_mesh(MeshDescriptor::new("quad", DrawMode::Triangles, 3, IndexType::U16));

        let mut context = BakingContext::new();
        for depth in [1.0, 5.0, 3.0] {
            context.create_current_instance(quad);
            let record = context.current_instance().unwrap();
            record.push_part(&Matrix4::identity());
            record.set_sort_depth(depth);
            context.submit_current(0, glass);
        }

        context.write_data(&resources, &rings).unwrap();

        let batch = context.registry().buckets()[0].groups()[0].batches().next().unwrap().1;
        assert_eq!(batch.index_type(), IndexType::U16);
        assert_eq!(batch.index_offset(), 0);

        let index_buffer = backend.buffers_for(BufferTarget::Index)[0];
        let bytes = backend.buffer_bytes(index_buffer).unwrap();
        let indices: Vec<u16> = bytes[..18]
            .chunks(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        // depth 5.0 (instance 1), then 3.0 (instance 2), then 1.0 (instance 0)
        assert_eq!(indices, vec![3, 4, 5, 6, 7, 8, 0, 1, 2]);
        assert_eq!(rings.index.written_len(), 20);
        assert_eq!(rings.model.written_len(), 3 * 48);
    }

    #[test]
    fn test_large_sorted_batch_uses_wide_indices() {
        let mut backend = HeadlessBackend::new();
        let config = DispatchConfig::default().with_section_sizes(1 << 20, 1 << 16, 1 << 20);
        let rings = InstanceRings::new(&mut backend, &config).unwrap();

        let mut resources = RenderResources::new();
        let glass = resources.insert_state(VisualState::translucent("glass"));
        let big = resources.insert_mesh(MeshDescriptor::new("big", DrawMode::Triangles, 40_000, IndexType::U32));

        let mut context = BakingContext::new();
        for _ in 0..2 {
            context.create_current_instance(big);
            context.submit_current(0, glass);
        }
        context.write_data(&resources, &rings).unwrap();

        let batch = context.registry().buckets()[0].groups()[0].batches().next().unwrap().1;
        assert_eq!(batch.index_type(), IndexType::U32);
        assert_eq!(rings.index.written_len(), 80_000 * 4);
    }

    #[test]
    fn test_oversized_sorted_batch_fails_before_generating() {
        let mut backend = HeadlessBackend::new();
        let config = DispatchConfig::default().with_section_sizes(4096, 4096, 1024);
        let rings = InstanceRings::new(&mut backend, &config).unwrap();

        let mut resources = RenderResources::new();
        let glass = resources.insert_state(VisualState::translucent("glass"));
        let huge = resources.insert_mesh(MeshDescriptor::new("huge", DrawMode::Triangles, 5_000_000, IndexType::U32));

        let mut context = BakingContext::new();
        for _ in 0..10 {
            context.create_current_instance(huge);
            context.submit_current(0, glass);
        }

        let err = context.write_data(&resources, &rings).unwrap_err();

        assert_eq!(
            err,
            RingError::Overflow { buffer: "translucency", requested: 200_000_000, available: 1024 }
        );
        assert_eq!(rings.index.written_len(), 0);
        assert_eq!(context.registry().index_scratch.capacity(), 0);
    }

    #[test]
    fn test_empty_mesh_is_not_serialized() {
        let mut backend = HeadlessBackend::new();
        let config = DispatchConfig::default().with_section_sizes(4096, 4096, 4096);
        let rings = InstanceRings::new(&mut backend, &config).unwrap();

        let mut resources = RenderResources::new();
        let solid = resources.insert_state(VisualState::opaque("solid"));
        let empty = resources.insert_mesh(MeshDescriptor::new("empty", DrawMode::Triangles, 0, IndexType::U16));

        let mut context = BakingContext::new();
        context.create_current_instance(empty);
        context.submit_current(0, solid);
        context.write_data(&resources, &rings).unwrap();

        assert_eq!(rings.model.written_len(), 0);
    }
}
