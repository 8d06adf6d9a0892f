//! Fence helpers for CPU/GPU section handoff
//!
//! Section fences are created unsignaled and handed to the host's queue submission,
//! so a fence only signals after the GPU has consumed every draw recorded for the
//! frame that wrote the section.
//!
//! ```text
//! CPU: write section k -> insert fence k -> host submits with fence k
//! GPU:                                        [reading section k ...] -> signal k
//! CPU (k frames later): wait fence k -> reuse section k
//! ```

use crate::backend::{FenceStatus, GpuError, GpuResult};
use ash::{vk, Device};

/// Create an unsignaled fence
pub fn create_fence(device: &Device) -> GpuResult<vk::Fence> {
    let create_info = vk::FenceCreateInfo::builder();

    unsafe {
        device
            .create_fence(&create_info, None)
            .map_err(GpuError::Api)
    }
}

/// Wait for a fence with a bounded timeout
pub fn wait_fence(device: &Device, fence: vk::Fence, timeout_ns: u64) -> FenceStatus {
    match unsafe { device.wait_for_fences(&[fence], true, timeout_ns) } {
        Ok(()) => FenceStatus::Signaled,
        Err(vk::Result::TIMEOUT) => FenceStatus::TimedOut,
        Err(result) => {
            log::error!("vkWaitForFences failed: {:?}", result);
            FenceStatus::Failed
        }
    }
}

/// Destroy a fence
pub fn destroy_fence(device: &Device, fence: vk::Fence) {
    unsafe {
        device.destroy_fence(fence, None);
    }
}
