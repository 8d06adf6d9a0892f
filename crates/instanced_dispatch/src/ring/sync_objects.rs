//! One completion fence per ring section
//!
//! A failed or timed out wait is logged and the frame goes ahead anyway. The section
//! may then still be read by the GPU while the CPU overwrites it.

use crate::backend::{FenceHandle, FenceStatus, GpuBackend, GpuResult};

/// Result of waiting on a section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncOutcome {
    /// No fence was recorded for the section yet
    #[default]
    NoFence,
    /// The GPU is done with the section
    Signaled,
    /// The wait timed out, the section is reused anyway
    TimedOut,
    /// The wait failed, the section is reused anyway
    Failed,
}

/// Fence slots mirroring the sections of the ring buffers
pub struct SectionedSyncObjects {
    fences: Vec<Option<FenceHandle>>,
    current: usize,
    timeout_ns: u64,
}

impl SectionedSyncObjects {
    /// Create `section_count` empty fence slots
    pub fn new(section_count: u32, timeout_ns: u64) -> Self {
        Self {
            fences: vec![None; section_count as usize],
            current: 0,
            timeout_ns,
        }
    }

    /// Block until the fence recorded for `section` signals or the timeout elapses
    pub fn wait_for_section<B: GpuBackend>(&mut self, backend: &mut B, section: usize) -> SyncOutcome {
        let Some(fence) = self.fences.get(section).copied().flatten() else {
            return SyncOutcome::NoFence;
        };

        match backend.client_wait_fence(fence, self.timeout_ns) {
            FenceStatus::Signaled => SyncOutcome::Signaled,
            FenceStatus::TimedOut => {
                log::error!(
                    "Fence for ring section {} timed out after {} ns, reusing section anyway",
                    section,
                    self.timeout_ns
                );
                SyncOutcome::TimedOut
            }
            FenceStatus::Failed => {
                log::error!("Fence wait for ring section {} failed, reusing section anyway", section);
                SyncOutcome::Failed
            }
        }
    }

    /// Replace the fence of `section` with a new one covering the work submitted so far
    pub fn record_fence<B: GpuBackend>(&mut self, backend: &mut B, section: usize) -> GpuResult<FenceHandle> {
        if let Some(previous) = self.fences.get_mut(section).and_then(Option::take) {
            backend.delete_fence(previous);
        }

        let fence = backend.insert_fence()?;
        if let Some(slot) = self.fences.get_mut(section) {
            *slot = Some(fence);
        }
        Ok(fence)
    }

    /// Fence currently stored for `section`
    pub fn fence(&self, section: usize) -> Option<FenceHandle> {
        self.fences.get(section).copied().flatten()
    }

    /// Section the next frame writes into
    pub fn current_section(&self) -> usize {
        self.current
    }

    /// Advance the current slot
    pub fn next_section(&mut self) {
        self.current = (self.current + 1) % self.fences.len().max(1);
    }

    /// Delete every stored fence
    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        for fence in self.fences.iter_mut().filter_map(Option::take) {
            backend.delete_fence(fence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_wait_without_fence_is_immediate() {
        let mut backend = HeadlessBackend::new();
        let mut sync = SectionedSyncObjects::new(3, 1_000);

        assert_eq!(sync.wait_for_section(&mut backend, 0), SyncOutcome::NoFence);
        assert!(backend.commands().is_empty());
    }

    #[test]
    fn test_record_replaces_and_releases_previous_fence() {
        let mut backend = HeadlessBackend::new();
        let mut sync = SectionedSyncObjects::new(3, 1_000);

        let first = sync.record_fence(&mut backend, 1).unwrap();
        let second = sync.record_fence(&mut backend, 1).unwrap();

        assert_ne!(first, second);
        assert_eq!(sync.fence(1), Some(second));
        assert_eq!(backend.live_fence_count(), 1);
        assert_eq!(sync.wait_for_section(&mut backend, 1), SyncOutcome::Signaled);
    }

    #[test]
    fn test_timeout_is_reported_not_fatal() {
        let mut backend = HeadlessBackend::new();
        let mut sync = SectionedSyncObjects::new(2, 1_000);
        sync.record_fence(&mut backend, 0).unwrap();

        backend.set_fence_status(FenceStatus::TimedOut);
        assert_eq!(sync.wait_for_section(&mut backend, 0), SyncOutcome::TimedOut);

        backend.set_fence_status(FenceStatus::Failed);
        assert_eq!(sync.wait_for_section(&mut backend, 0), SyncOutcome::Failed);
    }

    #[test]
    fn test_current_section_wraps() {
        let mut sync = SectionedSyncObjects::new(3, 0);
        for expected in [1, 2, 0, 1] {
            sync.next_section();
            assert_eq!(sync.current_section(), expected);
        }
    }

    #[test]
    fn test_destroy_releases_all_fences() {
        let mut backend = HeadlessBackend::new();
        let mut sync = SectionedSyncObjects::new(3, 0);
        for section in 0..3 {
            sync.record_fence(&mut backend, section).unwrap();
        }

        sync.destroy(&mut backend);
        assert_eq!(backend.live_fence_count(), 0);
        assert_eq!(sync.fence(0), None);
    }
}
