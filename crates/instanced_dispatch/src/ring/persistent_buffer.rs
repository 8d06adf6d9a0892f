//! Persistently mapped ring buffer with an atomic write cursor

use super::{RingError, RingResult};
use crate::backend::{BufferHandle, BufferTarget, GpuBackend, GpuResult};
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// A byte range handed out by [`SectionedPersistentBuffer::reserve`]
///
/// A reservation borrows its ring, so the section cannot advance or be released while
/// it is outstanding. It is consumed by [`SectionedPersistentBuffer::write`], which
/// makes every reserved range writable exactly once.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation is only filled by passing it to `write`"]
pub struct Reservation<'a> {
    owner: usize,
    offset: u64,
    section_offset: u64,
    len: u64,
    ring: PhantomData<&'a SectionedPersistentBuffer>,
}

impl Reservation<'_> {
    /// Absolute byte offset inside the whole buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte offset relative to the start of the current section
    pub fn section_offset(&self) -> u64 {
        self.section_offset
    }

    /// Reserved length in bytes
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing was reserved
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Where a write landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrittenRange {
    /// Absolute byte offset inside the whole buffer
    pub offset: u64,
    /// Byte offset relative to the start of the section
    pub section_offset: u64,
    /// Bytes written
    pub len: u64,
}

/// The range published by a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushedRange {
    /// Absolute byte offset of the section start
    pub offset: u64,
    /// Bytes written this frame
    pub len: u64,
}

/// GPU buffer split into `section_count` equal sections used round robin
///
/// Producers append with [`reserve`](Self::reserve) / [`push_bytes`](Self::push_bytes),
/// which only need `&self`: the cursor is advanced with an atomic read-modify-write, so
/// baking workers may append concurrently. Flushing and advancing take `&mut self` and
/// therefore only happen once every producer borrow has ended.
///
/// Rings are created and released by the dispatcher that owns both the ring and the
/// backend the mapping belongs to. Once released, every reservation fails with
/// [`RingError::Released`].
pub struct SectionedPersistentBuffer {
    name: &'static str,
    handle: BufferHandle,
    base: Option<NonNull<u8>>,
    section_size: u64,
    section_count: u32,
    current_section: u32,
    position: AtomicU64,
}

// SAFETY: the mapping is owned by this buffer until `destroy` and concurrent writers
// only touch the disjoint ranges handed out by the atomic cursor.
unsafe impl Send for SectionedPersistentBuffer {}
unsafe impl Sync for SectionedPersistentBuffer {}

impl SectionedPersistentBuffer {
    /// Allocate and map `section_size * section_count` bytes
    ///
    /// `backend` must outlive the ring and the ring must be released with
    /// [`destroy`](Self::destroy) on that same backend.
    pub(crate) fn new<B: GpuBackend>(
        backend: &mut B,
        name: &'static str,
        target: BufferTarget,
        section_size: u64,
        section_count: u32,
    ) -> GpuResult<Self> {
        let total = section_size * u64::from(section_count);
        let mapped = backend.create_persistent_buffer(target, total)?;

        log::info!(
            "Ring '{}' created: {} sections x {} bytes",
            name,
            section_count,
            section_size
        );

        Ok(Self {
            name,
            handle: mapped.handle,
            base: Some(mapped.ptr),
            section_size,
            section_count,
            current_section: 0,
            position: AtomicU64::new(0),
        })
    }

    fn owner_id(&self) -> usize {
        self as *const Self as usize
    }

    /// Reserve `len` bytes at the end of the current section
    pub fn reserve(&self, len: u64) -> RingResult<Reservation<'_>> {
        if self.base.is_none() {
            return Err(RingError::Released { buffer: self.name });
        }

        let section_size = self.section_size;
        let result = self
            .position
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |position| {
                position
                    .checked_add(len)
                    .filter(|end| *end <= section_size)
            });

        match result {
            Ok(section_offset) => Ok(Reservation {
                owner: self.owner_id(),
                offset: self.section_start() + section_offset,
                section_offset,
                len,
                ring: PhantomData,
            }),
            Err(position) => Err(RingError::Overflow {
                buffer: self.name,
                requested: len,
                available: section_size.saturating_sub(position),
            }),
        }
    }

    /// Copy `bytes` into a reserved range of this ring
    pub fn write(&self, reservation: Reservation<'_>, bytes: &[u8]) -> RingResult<WrittenRange> {
        let base = self.base.ok_or(RingError::Released { buffer: self.name })?;
        if reservation.owner != self.owner_id() {
            return Err(RingError::ForeignReservation { buffer: self.name });
        }

        let len = bytes.len() as u64;
        if len > reservation.len {
            return Err(RingError::Overflow {
                buffer: self.name,
                requested: len,
                available: reservation.len,
            });
        }

        // SAFETY: the reservation was issued by this ring for the current section, lies
        // inside the live mapping and is consumed here, so no other writer owns the range.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                base.as_ptr().add(reservation.offset as usize),
                bytes.len(),
            );
        }
        Ok(WrittenRange {
            offset: reservation.offset,
            section_offset: reservation.section_offset,
            len,
        })
    }

    /// Reserve and write in one step
    pub fn push_bytes(&self, bytes: &[u8]) -> RingResult<WrittenRange> {
        let reservation = self.reserve(bytes.len() as u64)?;
        self.write(reservation, bytes)
    }

    /// Bytes written into the current section so far
    pub fn written_len(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    /// Absolute byte offset of the current section
    pub fn section_start(&self) -> u64 {
        u64::from(self.current_section) * self.section_size
    }

    /// Publish this frame's writes to the GPU
    ///
    /// Only the written sub-range is flushed. Nothing is flushed for an empty section.
    pub fn flush<B: GpuBackend>(&mut self, backend: &mut B) -> GpuResult<FlushedRange> {
        let range = FlushedRange {
            offset: self.section_start(),
            len: *self.position.get_mut(),
        };

        if range.len > 0 {
            backend.flush_mapped_range(self.handle, range.offset, range.len)?;
            log::trace!("Ring '{}' flushed {} bytes at {}", self.name, range.len, range.offset);
        }
        Ok(range)
    }

    /// Move to the next section and rewind the cursor
    pub fn advance_section(&mut self) {
        self.current_section = (self.current_section + 1) % self.section_count;
        *self.position.get_mut() = 0;
    }

    /// Drop everything written into the current section without advancing
    pub fn discard_section(&mut self) {
        *self.position.get_mut() = 0;
    }

    /// Index of the section being written
    pub fn current_section(&self) -> u32 {
        self.current_section
    }

    /// Number of sections
    pub fn section_count(&self) -> u32 {
        self.section_count
    }

    /// Size of one section in bytes
    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Backend buffer handle
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    /// Debug name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the mapping has been released
    pub fn is_released(&self) -> bool {
        self.base.is_none()
    }

    /// Release the GPU buffer; later reservations fail with [`RingError::Released`]
    pub(crate) fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        if self.base.take().is_none() {
            return;
        }
        log::debug!("Destroying ring '{}'", self.name);
        // SAFETY: the mapping pointer was dropped above and `&mut self` guarantees no
        // reservation is outstanding, so nothing can write into the buffer afterwards.
        unsafe { backend.destroy_buffer(self.handle) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{GpuCommand, HeadlessBackend};
    use std::collections::HashSet;

    fn ring(backend: &mut HeadlessBackend, section_size: u64) -> SectionedPersistentBuffer {
        SectionedPersistentBuffer::new(backend, "test", BufferTarget::Storage, section_size, 3).unwrap()
    }

    #[test]
    fn test_reservations_are_contiguous() {
        let mut backend = HeadlessBackend::new();
        let mut buffer = ring(&mut backend, 64);
        buffer.advance_section();

        let a = buffer.reserve(16).unwrap();
        let b = buffer.reserve(8).unwrap();

        assert_eq!((a.offset(), a.section_offset(), a.len()), (64, 0, 16));
        assert_eq!((b.offset(), b.section_offset(), b.len()), (80, 16, 8));
        assert_eq!(buffer.written_len(), 24);
    }

    #[test]
    fn test_overflow_is_reported_not_wrapped() {
        let mut backend = HeadlessBackend::new();
        let buffer = ring(&mut backend, 32);

        let _ = buffer.reserve(24).unwrap();
        let err = buffer.reserve(16).unwrap_err();

        assert_eq!(
            err,
            RingError::Overflow { buffer: "test", requested: 16, available: 8 }
        );
        // Failed reservation leaves the cursor untouched
        assert_eq!(buffer.written_len(), 24);
        assert!(buffer.reserve(8).is_ok());
        assert_eq!(buffer.written_len(), 32);
    }

    #[test]
    fn test_write_lands_in_current_section() {
        let mut backend = HeadlessBackend::new();
        let mut buffer = ring(&mut backend, 16);
        buffer.advance_section();
        buffer.advance_section();

        buffer.push_bytes(&[7, 8, 9]).unwrap();

        let bytes = backend.buffer_bytes(buffer.handle()).unwrap();
        assert_eq!(&bytes[32..35], &[7, 8, 9]);
        assert!(bytes[..32].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_longer_than_reservation_fails() {
        let mut backend = HeadlessBackend::new();
        let buffer = ring(&mut backend, 16);
        let reservation = buffer.reserve(2).unwrap();

        assert!(buffer.write(reservation, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_reservation_from_another_ring_is_rejected() {
        let mut backend = HeadlessBackend::new();
        let first = ring(&mut backend, 16);
        let second = ring(&mut backend, 16);
        let _ = second.reserve(8).unwrap();

        let reservation = first.reserve(8).unwrap();
        assert_eq!(
            second.write(reservation, &[1; 8]),
            Err(RingError::ForeignReservation { buffer: "test" })
        );
    }

    #[test]
    fn test_destroyed_ring_rejects_writes() {
        let mut backend = HeadlessBackend::new();
        let mut buffer = ring(&mut backend, 64);
        buffer.push_bytes(&[1; 8]).unwrap();

        buffer.destroy(&mut backend);

        assert!(buffer.is_released());
        assert_eq!(backend.live_buffer_count(), 0);
        assert_eq!(
            buffer.push_bytes(&[0xAB; 64]),
            Err(RingError::Released { buffer: "test" })
        );
        assert!(matches!(buffer.reserve(1), Err(RingError::Released { .. })));

        // A second release is a no-op
        buffer.destroy(&mut backend);
        assert!(buffer.is_released());
    }

    #[test]
    fn test_section_rotation_is_cyclic() {
        let mut backend = HeadlessBackend::new();
        let mut buffer = ring(&mut backend, 16);

        let start = buffer.current_section();
        let _ = buffer.reserve(4).unwrap();
        for _ in 0..buffer.section_count() {
            buffer.advance_section();
            assert_eq!(buffer.written_len(), 0);
        }
        assert_eq!(buffer.current_section(), start);
    }

    #[test]
    fn test_flush_only_written_range() {
        let mut backend = HeadlessBackend::new();
        let mut buffer = ring(&mut backend, 64);

        let empty = buffer.flush(&mut backend).unwrap();
        assert_eq!(empty.len, 0);
        assert!(backend.commands().is_empty());

        buffer.advance_section();
        let _ = buffer.reserve(10).unwrap();
        let range = buffer.flush(&mut backend).unwrap();

        assert_eq!(range, FlushedRange { offset: 64, len: 10 });
        assert_eq!(
            backend.commands(),
            &[GpuCommand::FlushRange { buffer: buffer.handle(), offset: 64, len: 10 }]
        );
    }

    #[test]
    fn test_concurrent_reservations_are_disjoint() {
        const THREADS: u64 = 8;
        const PER_THREAD: u64 = 200;
        const CHUNK: u64 = 12;

        let mut backend = HeadlessBackend::new();
        let buffer = ring(&mut backend, THREADS * PER_THREAD * CHUNK);

        let offsets: Vec<u64> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..THREADS)
                .map(|t| {
                    let buffer = &buffer;
                    scope.spawn(move || {
                        (0..PER_THREAD)
                            .map(|_| {
                                let bytes = [t as u8; CHUNK as usize];
                                buffer.push_bytes(&bytes).unwrap().offset
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect()
        });

        let unique: HashSet<_> = offsets.iter().copied().collect();
        assert_eq!(unique.len() as u64, THREADS * PER_THREAD);
        assert!(offsets.iter().all(|offset| offset % CHUNK == 0));
        assert_eq!(buffer.written_len(), THREADS * PER_THREAD * CHUNK);
        assert!(buffer.reserve(1).is_err());

        // Every chunk holds a single writer's bytes
        let bytes = backend.buffer_bytes(buffer.handle()).unwrap();
        for chunk in bytes[..(THREADS * PER_THREAD * CHUNK) as usize].chunks(CHUNK as usize) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }
}
