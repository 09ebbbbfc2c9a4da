// Error taxonomy for the frame core
//
// Fatal conditions (creation rejected, submission rejected, fence or acquire
// timeout, device loss) are "device-level failures": the caller halts rendering.
// Recoverable presentation conditions never reach this type, the swapchain
// manager absorbs them and reports them as plain outcomes.

use ash::vk;
use thiserror::Error;

pub type RenderResult<T> = Result<T, RenderError>;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("failed to create {what}: {result}")]
    Creation { what: &'static str, result: vk::Result },

    #[error("timed out waiting on the fence of frame slot {slot}")]
    FenceTimeout { slot: usize },

    #[error("timed out acquiring a swapchain image")]
    AcquireTimeout,

    #[error("device lost during {op}")]
    DeviceLost { op: &'static str },

    #[error("queue submission rejected: {0}")]
    SubmitRejected(vk::Result),

    #[error("{op} failed: {result}")]
    Vulkan { op: &'static str, result: vk::Result },

    #[error("no supported surface format")]
    NoSurfaceFormat,

    #[error("offset overflow: slot {slot} * stride {stride} + base {base}")]
    OffsetOverflow { slot: u64, stride: u64, base: u64 },

    #[error("slot {slot} out of range for a range of {count} elements")]
    SlotOutOfRange { slot: u64, count: u64 },

    #[error("mapped region exhausted: requested {requested} bytes, {available} available")]
    ArenaExhausted { requested: u64, available: u64 },

    #[error("mapped region is {len} bytes, write ends at {end}")]
    RegionTooSmall { len: usize, end: u64 },

    #[error("invalid meshlet configuration: {0}")]
    InvalidMeshletConfig(String),

    #[error("invalid mesh data: {0}")]
    InvalidMesh(String),
}

impl RenderError {
    /// True for the fatal class that means the device can no longer render.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::Creation { .. }
                | Self::FenceTimeout { .. }
                | Self::AcquireTimeout
                | Self::DeviceLost { .. }
                | Self::SubmitRejected(_)
                | Self::Vulkan { .. }
        )
    }

    /// Map a raw result from a generic device call.
    pub fn vulkan(op: &'static str, result: vk::Result) -> Self {
        if result == vk::Result::ERROR_DEVICE_LOST {
            Self::DeviceLost { op }
        } else {
            Self::Vulkan { op, result }
        }
    }

    pub fn creation(what: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |result| Self::Creation { what, result }
    }
}
