// Per-frame errors
//
// Setup paths use anyhow; the frame loop needs to tell a stale swapchain
// and an expired wait apart from a real driver failure.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The swapchain no longer matches the surface and must be rebuilt
    #[error("swapchain is out of date")]
    OutOfDate,

    /// A bounded fence wait or image acquisition expired
    #[error("timed out waiting for the GPU")]
    Timeout,

    /// The presentation engine handed back an index the frame loop does not track
    #[error("swapchain image {0} is outside the tracked image range")]
    ImageIndexOutOfRange(u32),

    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for FrameError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DATE_KHR => FrameError::OutOfDate,
            vk::Result::TIMEOUT | vk::Result::NOT_READY => FrameError::Timeout,
            other => FrameError::Vulkan(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_vulkan_results() {
        assert_eq!(FrameError::from(vk::Result::ERROR_OUT_OF_DATE_KHR), FrameError::OutOfDate);
        assert_eq!(FrameError::from(vk::Result::TIMEOUT), FrameError::Timeout);
        assert_eq!(FrameError::from(vk::Result::NOT_READY), FrameError::Timeout);
        assert_eq!(
            FrameError::from(vk::Result::ERROR_DEVICE_LOST),
            FrameError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        );
    }
}
