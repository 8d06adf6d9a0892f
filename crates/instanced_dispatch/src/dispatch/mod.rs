//! Frame dispatch: fence wait, serialization, flush, draw emission

mod diagnostics;
mod dispatcher;
mod globals;

pub use diagnostics::{FrameDiagnostics, ModelDebugInfo};
pub use dispatcher::InstancedRenderDispatcher;
pub use globals::ShaderGlobals;

use crate::backend::GpuError;
use crate::config::ConfigError;
use crate::ring::{FlushedRanges, RingError, SyncOutcome};

/// Errors surfaced by [`InstancedRenderDispatcher`]
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    /// A ring section ran out of space
    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingError),

    /// The backend rejected an operation
    #[error("GPU backend error: {0}")]
    Gpu(#[from] GpuError),

    /// The configuration is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result type for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Statistics of one rendered frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    /// Index of the rendered frame
    pub frame: u64,
    /// Ring section written by the frame
    pub section: u32,
    /// Outcome of the section fence wait
    pub sync: SyncOutcome,
    /// Ranges flushed from each ring
    pub flushed: FlushedRanges,
    /// Draw calls issued
    pub draw_calls: u32,
    /// Hardware instanced draws
    pub instanced_draws: u32,
    /// Sorted indexed draws
    pub sorted_draws: u32,
    /// Instances drawn
    pub instances: u32,
}

/// What [`InstancedRenderDispatcher::render_queues`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Nothing was baked, no GPU work was issued
    Empty,
    /// The frame was dispatched
    Rendered(FrameStats),
}

impl FrameOutcome {
    /// Statistics if the frame was dispatched
    pub fn stats(&self) -> Option<&FrameStats> {
        match self {
            Self::Empty => None,
            Self::Rendered(stats) => Some(stats),
        }
    }
}
