//! # Dispatch Configuration
//!
//! Sizing of the three ring buffers (part transforms, model entries, generated sort
//! indices), the number of ring sections, the fence wait timeout and the storage
//! binding slots the shaders expect.

use super::{Config, ConfigError};
use serde::{Deserialize, Serialize};

/// Default number of ring sections (triple buffering)
pub const DEFAULT_SECTION_COUNT: u32 = 3;
/// Default bytes per part ring section (8.75 MiB)
pub const DEFAULT_PART_SECTION_BYTES: u64 = 9_175_040;
/// Default bytes per model ring section (512 KiB)
pub const DEFAULT_MODEL_SECTION_BYTES: u64 = 524_288;
/// Default bytes per sorted index ring section (512 KiB)
pub const DEFAULT_INDEX_SECTION_BYTES: u64 = 512 * 1024;
/// Default fence wait timeout, 10 seconds in nanoseconds
pub const DEFAULT_FENCE_TIMEOUT_NS: u64 = 10_000_000_000;

/// Shader storage binding slots used by the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingSlots {
    /// Slot receiving the part transform range
    pub part_data: u32,
    /// Slot receiving the model entry range
    pub model_data: u32,
    /// Slot receiving mesh vertex data on the sorted path
    pub mesh_vertices: u32,
}

impl Default for BindingSlots {
    fn default() -> Self {
        Self {
            part_data: 1,
            model_data: 2,
            mesh_vertices: 3,
        }
    }
}

/// # Dispatch Configuration
///
/// Every ring buffer is allocated as `section_count` equally sized sections. The
/// per-section sizes bound how much instance data a single frame may stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Number of ring sections per buffer
    pub section_count: u32,
    /// Bytes per section of the part transform ring
    pub part_section_bytes: u64,
    /// Bytes per section of the model entry ring
    pub model_section_bytes: u64,
    /// Bytes per section of the sorted index ring
    pub index_section_bytes: u64,
    /// Bounded wait applied to section fences, in nanoseconds
    pub fence_timeout_ns: u64,
    /// Storage binding slots
    pub bindings: BindingSlots,
}

impl DispatchConfig {
    /// Set the number of ring sections
    pub fn with_section_count(mut self, count: u32) -> Self {
        self.section_count = count;
        self
    }

    /// Set per-section sizes for the part, model and index rings
    pub fn with_section_sizes(mut self, part: u64, model: u64, index: u64) -> Self {
        self.part_section_bytes = part;
        self.model_section_bytes = model;
        self.index_section_bytes = index;
        self
    }

    /// Set the fence wait timeout
    pub fn with_fence_timeout_ns(mut self, timeout_ns: u64) -> Self {
        self.fence_timeout_ns = timeout_ns;
        self
    }

    /// Set the storage binding slots
    pub fn with_bindings(mut self, bindings: BindingSlots) -> Self {
        self.bindings = bindings;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.section_count == 0 {
            return Err(ConfigError::Invalid(
                "section count must be at least 1".to_string(),
            ));
        }

        if self.section_count > 8 {
            return Err(ConfigError::Invalid(format!(
                "section count {} exceeds the maximum of 8",
                self.section_count
            )));
        }

        for (name, size) in [
            ("part", self.part_section_bytes),
            ("model", self.model_section_bytes),
            ("index", self.index_section_bytes),
        ] {
            if size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} section size cannot be zero"
                )));
            }
            if size % 4 != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} section size {size} is not 4-byte aligned"
                )));
            }
        }

        let slots = self.bindings;
        if slots.part_data == slots.model_data
            || slots.part_data == slots.mesh_vertices
            || slots.model_data == slots.mesh_vertices
        {
            return Err(ConfigError::Invalid(format!(
                "binding slots must be distinct: {slots:?}"
            )));
        }

        Ok(())
    }

    /// Check that every storage ring section starts on an `alignment` boundary
    ///
    /// Sections are bound at `index * section_bytes`, so the part and model section
    /// sizes must be multiples of the device's storage offset alignment.
    pub fn validate_storage_alignment(&self, alignment: u64) -> Result<(), ConfigError> {
        let alignment = alignment.max(1);
        for (name, size) in [
            ("part", self.part_section_bytes),
            ("model", self.model_section_bytes),
        ] {
            if size % alignment != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} section size {size} is not a multiple of the storage offset alignment {alignment}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            section_count: DEFAULT_SECTION_COUNT,
            part_section_bytes: DEFAULT_PART_SECTION_BYTES,
            model_section_bytes: DEFAULT_MODEL_SECTION_BYTES,
            index_section_bytes: DEFAULT_INDEX_SECTION_BYTES,
            fence_timeout_ns: DEFAULT_FENCE_TIMEOUT_NS,
            bindings: BindingSlots::default(),
        }
    }
}

impl Config for DispatchConfig {}
