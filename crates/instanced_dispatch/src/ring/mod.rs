//! Sectioned ring buffers and their fences
//!
//! Every per-frame GPU payload lives in a persistently mapped buffer split into equal
//! sections. The CPU writes section `k` while the GPU may still be reading the sections
//! written by earlier frames; one fence per section tells the CPU when a section may be
//! overwritten.
//!
//! ```text
//!            section 0        section 1        section 2
//!         +----------------+----------------+----------------+
//! buffer  |  GPU reading   |  CPU writing   |  free          |
//!         +----------------+----------------+----------------+
//! fences      fence[0]          (pending)        fence[2]
//! ```

mod persistent_buffer;
mod sync_objects;

pub use persistent_buffer::{FlushedRange, Reservation, SectionedPersistentBuffer, WrittenRange};
pub use sync_objects::{SectionedSyncObjects, SyncOutcome};

use crate::backend::{BufferTarget, GpuBackend, GpuResult};
use crate::config::DispatchConfig;

/// Errors raised by ring buffer reservations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RingError {
    /// A reservation would run past the end of the current section
    #[error("ring '{buffer}' overflow: requested {requested} bytes, {available} available in section")]
    Overflow {
        /// Name of the overflowing ring
        buffer: &'static str,
        /// Bytes requested by the reservation
        requested: u64,
        /// Bytes still free in the current section
        available: u64,
    },

    /// The ring's GPU buffer has been released
    #[error("ring '{buffer}' has been released")]
    Released {
        /// Name of the released ring
        buffer: &'static str,
    },

    /// A reservation was written through a ring that did not issue it
    #[error("reservation written to ring '{buffer}' was issued by another ring")]
    ForeignReservation {
        /// Name of the ring the write was attempted on
        buffer: &'static str,
    },
}

/// Result type for ring operations
pub type RingResult<T> = Result<T, RingError>;

/// The three rings written every frame
pub struct InstanceRings {
    /// Part transforms, bound at the part data slot
    pub part: SectionedPersistentBuffer,
    /// Model entries, bound at the model data slot
    pub model: SectionedPersistentBuffer,
    /// Generated elements for sorted draws
    pub index: SectionedPersistentBuffer,
}

/// Ranges published by [`InstanceRings::flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushedRanges {
    /// Part ring range
    pub part: FlushedRange,
    /// Model ring range
    pub model: FlushedRange,
    /// Index ring range
    pub index: FlushedRange,
}

impl InstanceRings {
    /// Allocate all three rings with the configured section sizes
    pub(crate) fn new<B: GpuBackend>(backend: &mut B, config: &DispatchConfig) -> GpuResult<Self> {
        let sections = config.section_count;
        Ok(Self {
            part: SectionedPersistentBuffer::new(
                backend,
                "part",
                BufferTarget::Storage,
                config.part_section_bytes,
                sections,
            )?,
            model: SectionedPersistentBuffer::new(
                backend,
                "model",
                BufferTarget::Storage,
                config.model_section_bytes,
                sections,
            )?,
            index: SectionedPersistentBuffer::new(
                backend,
                "translucency",
                BufferTarget::Index,
                config.index_section_bytes,
                sections,
            )?,
        })
    }

    /// Flush the written range of every ring
    pub fn flush<B: GpuBackend>(&mut self, backend: &mut B) -> GpuResult<FlushedRanges> {
        Ok(FlushedRanges {
            part: self.part.flush(backend)?,
            model: self.model.flush(backend)?,
            index: self.index.flush(backend)?,
        })
    }

    /// Move every ring to its next section
    pub fn advance(&mut self) {
        self.part.advance_section();
        self.model.advance_section();
        self.index.advance_section();
    }

    /// Drop this frame's writes in every ring
    pub fn discard(&mut self) {
        self.part.discard_section();
        self.model.discard_section();
        self.index.discard_section();
    }

    /// Section all rings are writing
    pub fn current_section(&self) -> u32 {
        self.part.current_section()
    }

    /// Release the GPU buffers; later reservations fail with [`RingError::Released`]
    pub(crate) fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        self.part.destroy(backend);
        self.model.destroy(backend);
        self.index.destroy(backend);
    }
}
