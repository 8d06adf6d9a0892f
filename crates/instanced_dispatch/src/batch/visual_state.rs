//! Visual states and their draw path
//!
//! A visual state bundles the fixed-function settings a batch is drawn with. Whether a
//! state can use hardware instancing is decided once, when the state is defined:
//!
//! | transparency | write mask     | path          |
//! |--------------|----------------|---------------|
//! | none         | any            | instanced     |
//! | additive     | color only     | instanced     |
//! | other        | any            | sorted indexed |

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Blending mode of a visual state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transparency {
    /// Opaque
    None,
    /// Additive blending
    Additive,
    /// Additive lightning blending
    Lightning,
    /// Glint (enchantment style) blending
    Glint,
    /// Crumbling overlay blending
    Crumbling,
    /// Regular alpha blending
    Translucent,
}

/// Which attachments a visual state writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteMask {
    /// Color and depth
    ColorAndDepth,
    /// Color only, depth writes disabled
    ColorOnly,
    /// Depth only
    DepthOnly,
}

/// How batches of a visual state are drawn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DrawPath {
    /// One hardware instanced draw per batch
    Instanced,
    /// One indexed draw per batch over generated, depth sorted indices
    SortedIndexed,
}

impl DrawPath {
    /// Resolve the draw path for a blend and write mask combination
    pub fn resolve(transparency: Transparency, write_mask: WriteMask) -> Self {
        match (transparency, write_mask) {
            (Transparency::None, _) | (Transparency::Additive, WriteMask::ColorOnly) => Self::Instanced,
            _ => Self::SortedIndexed,
        }
    }
}

bitflags! {
    /// Uniforms a visual state's shader declares
    ///
    /// Uniforms missing from this set are never uploaded for the state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderUniforms: u32 {
        /// Base instance of the batch inside the model range
        const INSTANCE_OFFSET = 1 << 0;
        /// Mesh index count for the sorted path
        const INSTANCE_VERT_COUNT = 1 << 1;
        /// Projection matrix
        const PROJECTION_MATRIX = 1 << 2;
        /// Color modulator
        const COLOR_MODULATOR = 1 << 3;
        /// Fog start
        const FOG_START = 1 << 4;
        /// Fog end
        const FOG_END = 1 << 5;
        /// Fog color
        const FOG_COLOR = 1 << 6;
        /// Texture matrix
        const TEXTURE_MATRIX = 1 << 7;
        /// Game time
        const GAME_TIME = 1 << 8;
        /// Screen size
        const SCREEN_SIZE = 1 << 9;
        /// Line width
        const LINE_WIDTH = 1 << 10;
    }
}

/// A registered rendering state
#[derive(Debug, Clone, PartialEq)]
pub struct VisualState {
    name: String,
    transparency: Transparency,
    write_mask: WriteMask,
    uniforms: ShaderUniforms,
    draw_path: DrawPath,
}

impl VisualState {
    /// Define a visual state
    pub fn new(
        name: impl Into<String>,
        transparency: Transparency,
        write_mask: WriteMask,
        uniforms: ShaderUniforms,
    ) -> Self {
        Self {
            name: name.into(),
            transparency,
            write_mask,
            uniforms,
            draw_path: DrawPath::resolve(transparency, write_mask),
        }
    }

    /// Opaque state declaring every uniform
    pub fn opaque(name: impl Into<String>) -> Self {
        Self::new(name, Transparency::None, WriteMask::ColorAndDepth, ShaderUniforms::all())
    }

    /// Alpha blended state declaring every uniform
    pub fn translucent(name: impl Into<String>) -> Self {
        Self::new(name, Transparency::Translucent, WriteMask::ColorAndDepth, ShaderUniforms::all())
    }

    /// Debug name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blending mode
    pub fn transparency(&self) -> Transparency {
        self.transparency
    }

    /// Attachment write mask
    pub fn write_mask(&self) -> WriteMask {
        self.write_mask
    }

    /// Declared uniforms
    pub fn uniforms(&self) -> ShaderUniforms {
        self.uniforms
    }

    /// Whether the shader declares `uniform`
    pub fn declares(&self, uniform: ShaderUniforms) -> bool {
        self.uniforms.contains(uniform)
    }

    /// Draw path resolved at definition
    pub fn draw_path(&self) -> DrawPath {
        self.draw_path
    }

    /// Whether batches must go through the sorted indexed path
    pub fn requires_sorting(&self) -> bool {
        self.draw_path == DrawPath::SortedIndexed
    }
}
