//! Instancing stress run
//!
//! Bakes a large random crowd of multi-part models every frame and pushes it through
//! the dispatcher on the headless backend, then prints per-model draw statistics.
//!
//! Usage: `instancing_stress [config.toml|config.ron]`

use instanced_dispatch::config::{Config, ConfigError};
use instanced_dispatch::prelude::*;
use nalgebra::{Matrix4, Perspective3, Rotation3, Vector3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Stress run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StressConfig {
    /// Frames to render
    frames: u32,
    /// Objects baked per frame
    objects_per_frame: u32,
    /// Upper bound of parts per object
    parts_per_object: u32,
    /// Share of objects drawn translucent, 0..=1
    translucent_share: f32,
    /// Draw buckets objects are spread across
    buckets: usize,
    /// RNG seed
    seed: u64,
    /// Dispatcher settings
    dispatch: DispatchConfig,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            objects_per_frame: 5_000,
            parts_per_object: 4,
            translucent_share: 0.05,
            buckets: 3,
            seed: 0x5EED,
            dispatch: DispatchConfig::default(),
        }
    }
}

impl Config for StressConfig {}

struct Palette {
    states: Vec<VisualStateKey>,
    translucent: Vec<VisualStateKey>,
    meshes: Vec<MeshKey>,
}

fn register_palette(dispatcher: &mut InstancedRenderDispatcher<HeadlessBackend>) -> Palette {
    let states = vec![
        dispatcher.register_visual_state(VisualState::opaque("hull")),
        dispatcher.register_visual_state(VisualState::new(
            "engine_glow",
            Transparency::Additive,
            WriteMask::ColorOnly,
            ShaderUniforms::all(),
        )),
    ];
    let translucent = vec![
        dispatcher.register_visual_state(VisualState::translucent("shield")),
        dispatcher.register_visual_state(VisualState::new(
            "debris",
            Transparency::Crumbling,
            WriteMask::ColorAndDepth,
            ShaderUniforms::all(),
        )),
    ];
    let meshes = vec![
        dispatcher.register_mesh(MeshDescriptor::new("hull", DrawMode::Triangles, 360, IndexType::U16)),
        dispatcher.register_mesh(MeshDescriptor::new("turret", DrawMode::Triangles, 96, IndexType::U16)),
        dispatcher.register_mesh(MeshDescriptor::new("beam", DrawMode::Lines, 2, IndexType::U16)),
    ];

    Palette {
        states,
        translucent,
        meshes,
    }
}

fn bake_frame(baking: &mut BakingContext, palette: &Palette, config: &StressConfig, time: f32, rng: &mut StdRng) {
    for _ in 0..config.objects_per_frame {
        let mesh = palette.meshes[rng.gen_range(0..palette.meshes.len())];
        baking.create_current_instance(mesh);
        let Some(record) = baking.current_instance() else {
            continue;
        };

        let position = Vector3::<f32>::new(
            rng.gen_range(-50.0..50.0),
            rng.gen_range(-50.0..50.0),
            rng.gen_range(-200.0..-5.0),
        );
        let spin = Rotation3::from_euler_angles(0.0, time * rng.gen_range(0.1f32..2.0), 0.0);
        let root = Matrix4::new_translation(&position) * spin.to_homogeneous();

        for part in 0..rng.gen_range(1..=config.parts_per_object.max(1)) {
            let offset = Matrix4::new_translation(&Vector3::new(0.0, part as f32 * 0.5, 0.0));
            record.push_part(&(root * offset));
        }
        record.set_color([rng.gen(), rng.gen(), rng.gen(), 1.0]);
        record.set_sort_depth(-position.z);

        let translucent = rng.gen::<f32>() < config.translucent_share;
        let state = if translucent {
            palette.translucent[rng.gen_range(0..palette.translucent.len())]
        } else {
            palette.states[rng.gen_range(0..palette.states.len())]
        };
        baking.submit_current(rng.gen_range(0..config.buckets.max(1)), state);
    }
}

fn load_config() -> Result<StressConfig, ConfigError> {
    match std::env::args().nth(1) {
        Some(path) => {
            log::info!("Loading stress config from {}", path);
            StressConfig::load_from_file(&path)
        }
        None => Ok(StressConfig::default()),
    }
}

fn run(config: &StressConfig) -> Result<(), Box<dyn std::error::Error>> {
    let mut dispatcher = InstancedRenderDispatcher::new(HeadlessBackend::new(), config.dispatch.clone())?;
    let palette = register_palette(&mut dispatcher);

    let mut globals = ShaderGlobals::default();
    globals.projection = Perspective3::new(16.0 / 9.0, 45f32.to_radians(), 0.1, 500.0).to_homogeneous();
    globals.screen_size = [1920.0, 1080.0];
    dispatcher.set_shader_globals(globals);

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut baking = BakingContext::with_pool_capacity(config.objects_per_frame as usize);
    let mut dropped = 0u32;
    let mut draw_calls = 0u64;
    let mut instances = 0u64;
    let started = Instant::now();

    for frame in 0..config.frames {
        let time = frame as f32 / 60.0;
        bake_frame(&mut baking, &palette, config, time, &mut rng);

        let mut globals = *dispatcher.shader_globals();
        globals.game_time = time;
        dispatcher.set_shader_globals(globals);

        match dispatcher.render_queues(&mut baking) {
            Ok(FrameOutcome::Rendered(stats)) => {
                draw_calls += u64::from(stats.draw_calls);
                instances += u64::from(stats.instances);
            }
            Ok(FrameOutcome::Empty) => {}
            Err(DispatchError::Ring(err)) => {
                log::warn!("Frame {} dropped: {}", frame, err);
                dropped += 1;
            }
            Err(err) => return Err(err.into()),
        }
        dispatcher.backend_mut().clear_commands();
    }

    let elapsed = started.elapsed();
    log::info!(
        "{} frames in {:.2?} ({:.2?}/frame), {} dropped",
        config.frames,
        elapsed,
        elapsed / config.frames.max(1),
        dropped
    );
    log::info!("{} draw calls for {} instances", draw_calls, instances);

    let diagnostics = dispatcher.diagnostics();
    println!(
        "last frame: part {} B, model {} B, index {} B",
        diagnostics.part_buffer_bytes,
        diagnostics.model_buffer_bytes,
        diagnostics.index_buffer_bytes
    );
    for (_, model, info) in diagnostics.models() {
        println!("  {:<8} {:>7} instances in {:>3} draws", model, info.instances, info.sets);
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let config = load_config()?;
    log::info!(
        "Stress run: {} frames x {} objects, up to {} parts each",
        config.frames,
        config.objects_per_frame,
        config.parts_per_object
    );

    run(&config)
}
