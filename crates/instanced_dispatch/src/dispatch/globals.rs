//! Frame-wide shader uniforms

use crate::backend::{DrawMode, GpuBackend, UniformValue};
use crate::batch::VisualState;
use nalgebra::Matrix4;

/// Uniform values shared by every draw of a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShaderGlobals {
    /// Projection matrix
    pub projection: Matrix4<f32>,
    /// Color modulator
    pub color_modulator: [f32; 4],
    /// Fog start distance
    pub fog_start: f32,
    /// Fog end distance
    pub fog_end: f32,
    /// Fog color
    pub fog_color: [f32; 4],
    /// Texture matrix
    pub texture_matrix: Matrix4<f32>,
    /// Game time
    pub game_time: f32,
    /// Framebuffer width and height in pixels
    pub screen_size: [f32; 2],
    /// Line width for line topologies
    pub line_width: f32,
}

impl Default for ShaderGlobals {
    fn default() -> Self {
        Self {
            projection: Matrix4::identity(),
            color_modulator: [1.0; 4],
            fog_start: 0.0,
            fog_end: 1.0,
            fog_color: [0.0, 0.0, 0.0, 1.0],
            texture_matrix: Matrix4::identity(),
            game_time: 0.0,
            screen_size: [1.0, 1.0],
            line_width: 1.0,
        }
    }
}

/// Upload every global the state's shader declares
pub(crate) fn apply_shader_globals<B: GpuBackend>(
    backend: &mut B,
    state: &VisualState,
    globals: &ShaderGlobals,
    draw_mode: DrawMode,
) {
    let values = [
        UniformValue::ProjectionMatrix(globals.projection.into()),
        UniformValue::ColorModulator(globals.color_modulator),
        UniformValue::FogStart(globals.fog_start),
        UniformValue::FogEnd(globals.fog_end),
        UniformValue::FogColor(globals.fog_color),
        UniformValue::TextureMatrix(globals.texture_matrix.into()),
        UniformValue::GameTime(globals.game_time),
        UniformValue::ScreenSize(globals.screen_size),
    ];

    for value in values {
        if state.declares(value.uniform()) {
            backend.set_uniform(value);
        }
    }

    let line_width = UniformValue::LineWidth(globals.line_width);
    if draw_mode.is_line() && state.declares(line_width.uniform()) {
        backend.set_uniform(line_width);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuCommand, HeadlessBackend};
    use crate::batch::{ShaderUniforms, Transparency, WriteMask};

    #[test]
    fn test_only_declared_uniforms_are_uploaded() {
        let mut backend = HeadlessBackend::new();
        let state = VisualState::new(
            "fogless",
            Transparency::None,
            WriteMask::ColorAndDepth,
            ShaderUniforms::PROJECTION_MATRIX | ShaderUniforms::GAME_TIME,
        );
        let globals = ShaderGlobals {
            game_time: 2.5,
            ..ShaderGlobals::default()
        };

        apply_shader_globals(&mut backend, &state, &globals, DrawMode::Triangles);

        assert_eq!(
            backend.commands(),
            &[
                GpuCommand::SetUniform(UniformValue::ProjectionMatrix(Matrix4::identity().into())),
                GpuCommand::SetUniform(UniformValue::GameTime(2.5)),
            ]
        );
    }

    #[test]
    fn test_line_width_only_for_lines() {
        let state = VisualState::new(
            "lines",
            Transparency::None,
            WriteMask::ColorAndDepth,
            ShaderUniforms::LINE_WIDTH,
        );
        let globals = ShaderGlobals::default();

        let mut backend = HeadlessBackend::new();
        apply_shader_globals(&mut backend, &state, &globals, DrawMode::Triangles);
        assert!(backend.commands().is_empty());

        apply_shader_globals(&mut backend, &state, &globals, DrawMode::LineStrip);
        assert_eq!(
            backend.commands(),
            &[GpuCommand::SetUniform(UniformValue::LineWidth(1.0))]
        );
    }
}
