//! The per-frame render dispatcher
//!
//! One call to [`InstancedRenderDispatcher::render_queues`] runs a whole frame:
//!
//! ```text
//! Idle ──(registry empty)──────────────────────────────────────────▶ Idle
//!   │
//!   └─▶ AwaitFence ─▶ Serialize ─▶ Flush & Rebind ─▶ Draw ─▶ Reset ─▶ Idle
//! ```
//!
//! - **AwaitFence**: bounded wait on the fence of the section about to be reused
//! - **Serialize**: walk the registry and append every record to the rings
//! - **Flush & Rebind**: flush written ranges, replace the section fence, bind the part
//!   and model ranges, advance every ring
//! - **Draw**: one draw per (state, mesh) batch in registry order
//! - **Reset**: batches and records go back to their pools
//!
//! # Fence failures
//!
//! A fence wait that times out or fails is logged and the frame is rendered anyway, so
//! the GPU may still be reading the section being overwritten. Hosts that need a hard
//! guarantee must check [`FrameStats::sync`] and stop submitting on
//! [`SyncOutcome::TimedOut`](crate::ring::SyncOutcome::TimedOut).

use super::diagnostics::FrameDiagnostics;
use super::globals::{apply_shader_globals, ShaderGlobals};
use super::{DispatchResult, FrameOutcome, FrameStats};
use crate::backend::{GpuBackend, UniformValue};
use crate::batch::{
    BakingContext, DrawPath, MeshDescriptor, MeshKey, RenderResources, ShaderUniforms, VisualState,
    VisualStateKey,
};
use crate::config::DispatchConfig;
use crate::ring::{FlushedRanges, InstanceRings, SectionedSyncObjects};

/// Streams baked instance data to the GPU and issues batched draws
pub struct InstancedRenderDispatcher<B: GpuBackend> {
    backend: B,
    config: DispatchConfig,
    resources: RenderResources,
    rings: InstanceRings,
    sync: SectionedSyncObjects,
    globals: ShaderGlobals,
    diagnostics: FrameDiagnostics,
    frames_rendered: u64,
}

/// Bindings tracked across the draw loop
#[derive(Default)]
struct DrawCursor {
    state: Option<VisualStateKey>,
    mesh: Option<MeshKey>,
    mesh_elements_bound: bool,
    mesh_storage: Option<MeshKey>,
    instance_offset: u32,
}

impl<B: GpuBackend> InstancedRenderDispatcher<B> {
    /// Validate `config` and allocate the rings
    pub fn new(mut backend: B, config: DispatchConfig) -> DispatchResult<Self> {
        config.validate()?;
        config.validate_storage_alignment(backend.storage_offset_alignment())?;

        let rings = InstanceRings::new(&mut backend, &config)?;
        let sync = SectionedSyncObjects::new(config.section_count, config.fence_timeout_ns);

        log::info!(
            "InstancedRenderDispatcher created: {} sections, part {} B, model {} B, index {} B",
            config.section_count,
            config.part_section_bytes,
            config.model_section_bytes,
            config.index_section_bytes
        );

        Ok(Self {
            backend,
            config,
            resources: RenderResources::new(),
            rings,
            sync,
            globals: ShaderGlobals::default(),
            diagnostics: FrameDiagnostics::default(),
            frames_rendered: 0,
        })
    }

    /// Register a visual state
    pub fn register_visual_state(&mut self, state: VisualState) -> VisualStateKey {
        log::debug!("Registering visual state '{}' ({:?})", state.name(), state.draw_path());
        self.resources.insert_state(state)
    }

    /// Register a mesh
    pub fn register_mesh(&mut self, mesh: MeshDescriptor) -> MeshKey {
        log::debug!("Registering mesh '{}' ({} indices)", mesh.name(), mesh.index_count());
        self.resources.insert_mesh(mesh)
    }

    /// Registered states and meshes
    pub fn resources(&self) -> &RenderResources {
        &self.resources
    }

    /// Replace the frame-wide shader uniforms
    pub fn set_shader_globals(&mut self, globals: ShaderGlobals) {
        self.globals = globals;
    }

    /// Current frame-wide shader uniforms
    pub fn shader_globals(&self) -> &ShaderGlobals {
        &self.globals
    }

    /// Counters of the last frame, zeroed by empty or dropped frames
    pub fn diagnostics(&self) -> &FrameDiagnostics {
        &self.diagnostics
    }

    /// Active configuration
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// The rings
    pub fn rings(&self) -> &InstanceRings {
        &self.rings
    }

    /// The backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The backend, mutably
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Frames that issued GPU work so far
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered
    }

    /// Render everything baked into `baking` this frame, then reset it
    ///
    /// Must run after every baking producer for the frame has finished. An empty
    /// registry issues no GPU work. On error the frame's ring writes are discarded and
    /// `baking` is still reset.
    pub fn render_queues(&mut self, baking: &mut BakingContext) -> DispatchResult<FrameOutcome> {
        if baking.is_empty_shallow() {
            log::trace!("No instances baked, skipping dispatch");
            self.diagnostics.begin_frame();
            baking.reset();
            return Ok(FrameOutcome::Empty);
        }

        let result = self.dispatch_frame(baking);
        if let Err(err) = &result {
            log::error!("Instanced dispatch failed, frame dropped: {}", err);
            self.rings.discard();
            self.diagnostics.begin_frame();
        }
        baking.reset();
        result.map(FrameOutcome::Rendered)
    }

    fn dispatch_frame(&mut self, baking: &mut BakingContext) -> DispatchResult<FrameStats> {
        let section = self.sync.current_section();
        let sync = self.sync.wait_for_section(&mut self.backend, section);

        baking.write_data(&self.resources, &self.rings)?;

        let flushed = self.rings.flush(&mut self.backend)?;
        self.sync.record_fence(&mut self.backend, section)?;
        self.bind_ranges(&flushed);

        self.diagnostics.begin_frame();
        self.diagnostics.part_buffer_bytes = flushed.part.len;
        self.diagnostics.model_buffer_bytes = flushed.model.len;
        self.diagnostics.index_buffer_bytes = flushed.index.len;

        // The index ring handle stays valid after advancing; batches carry absolute offsets
        self.rings.advance();
        self.sync.next_section();

        let mut stats = FrameStats {
            frame: self.frames_rendered,
            section: section as u32,
            sync,
            flushed,
            ..FrameStats::default()
        };
        self.draw_batches(baking, &mut stats);

        self.backend.finish_frame()?;
        self.frames_rendered += 1;

        log::debug!(
            "Frame {}: {} draws ({} instanced, {} sorted), {} instances, part {} B, model {} B, index {} B",
            stats.frame,
            stats.draw_calls,
            stats.instanced_draws,
            stats.sorted_draws,
            stats.instances,
            flushed.part.len,
            flushed.model.len,
            flushed.index.len
        );
        Ok(stats)
    }

    fn bind_ranges(&mut self, flushed: &FlushedRanges) {
        let slots = self.config.bindings;
        if flushed.part.len > 0 {
            self.backend.bind_storage_range(
                slots.part_data,
                self.rings.part.handle(),
                flushed.part.offset,
                flushed.part.len,
            );
        }
        if flushed.model.len > 0 {
            self.backend.bind_storage_range(
                slots.model_data,
                self.rings.model.handle(),
                flushed.model.offset,
                flushed.model.len,
            );
        }
    }

    fn draw_batches(&mut self, baking: &mut BakingContext, stats: &mut FrameStats) {
        let mesh_storage_slot = self.config.bindings.mesh_vertices;
        let index_ring = self.rings.index.handle();
        let mut cursor = DrawCursor::default();

        let buckets = baking.registry_mut().take_buckets();
        for bucket in buckets {
            for group in bucket.into_groups() {
                let state_key = group.state();
                for (mesh_key, batch) in group.into_batches() {
                    let drawable = self
                        .resources
                        .drawable(state_key, mesh_key)
                        .filter(|_| !batch.is_empty());
                    let Some((state, mesh)) = drawable else {
                        baking.registry_mut().recycle_instance_batch(batch);
                        continue;
                    };

                    if cursor.state != Some(state_key) {
                        if let Some(previous) = cursor.state {
                            if let Some(previous_state) = self.resources.state(previous) {
                                self.backend.end_visual_state(previous, previous_state);
                            }
                        }
                        self.backend.begin_visual_state(state_key, state);
                        cursor.state = Some(state_key);
                    }

                    let sorted = state.draw_path() == DrawPath::SortedIndexed;
                    let mesh_changed = cursor.mesh != Some(mesh_key);
                    if mesh_changed || (!sorted && !cursor.mesh_elements_bound) {
                        if let Some(previous) = cursor.mesh.filter(|_| mesh_changed) {
                            if let Some(previous_mesh) = self.resources.mesh(previous) {
                                self.backend.unbind_mesh(previous, previous_mesh);
                            }
                        }
                        self.backend.bind_mesh(mesh_key, mesh);
                        cursor.mesh = Some(mesh_key);
                        cursor.mesh_elements_bound = true;
                    }
                    if sorted && cursor.mesh_storage != Some(mesh_key) {
                        self.backend.bind_mesh_storage(mesh_storage_slot, mesh_key, mesh);
                        cursor.mesh_storage = Some(mesh_key);
                    }

                    apply_shader_globals(&mut self.backend, state, &self.globals, mesh.draw_mode());
                    if state.declares(ShaderUniforms::INSTANCE_OFFSET) {
                        self.backend
                            .set_uniform(UniformValue::InstanceOffset(cursor.instance_offset));
                    }

                    let instance_count = batch.size() as u32;
                    if sorted {
                        if state.declares(ShaderUniforms::INSTANCE_VERT_COUNT) {
                            self.backend
                                .set_uniform(UniformValue::InstanceVertCount(mesh.index_count()));
                        }
                        // The mesh's own elements were bound for earlier instanced draws
                        self.backend
                            .bind_index_buffer(index_ring, batch.index_offset(), batch.index_type());
                        cursor.mesh_elements_bound = false;
                        self.backend.draw_elements(
                            mesh.draw_mode(),
                            mesh.index_count() * instance_count,
                            batch.index_type(),
                        );
                        stats.sorted_draws += 1;
                    } else {
                        self.backend.draw_elements_instanced(
                            mesh.draw_mode(),
                            mesh.index_count(),
                            mesh.index_type(),
                            instance_count,
                        );
                        stats.instanced_draws += 1;
                    }

                    log::trace!(
                        "Drew {} x '{}' with '{}' at offset {}",
                        instance_count,
                        mesh.name(),
                        state.name(),
                        cursor.instance_offset
                    );

                    cursor.instance_offset += instance_count;
                    stats.draw_calls += 1;
                    stats.instances += instance_count;
                    self.diagnostics
                        .record_draw(mesh_key, mesh.name(), u64::from(instance_count));

                    baking.registry_mut().recycle_instance_batch(batch);
                }
            }
        }

        if let Some(key) = cursor.mesh {
            if let Some(mesh) = self.resources.mesh(key) {
                self.backend.unbind_mesh(key, mesh);
            }
        }
        if let Some(key) = cursor.state {
            if let Some(state) = self.resources.state(key) {
                self.backend.end_visual_state(key, state);
            }
        }
    }
}

impl<B: GpuBackend> Drop for InstancedRenderDispatcher<B> {
    fn drop(&mut self) {
        log::debug!(
            "Dropping InstancedRenderDispatcher after {} frames",
            self.frames_rendered
        );
        self.sync.destroy(&mut self.backend);
        self.rings.destroy(&mut self.backend);
    }
}
