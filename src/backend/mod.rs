// Backend module - frame core on top of Vulkan
//
// Sync, swapchain and command code only talk to the GPU through `GpuDevice`;
// `VulkanDevice` is the ash implementation, `mock` the in-memory one for tests.

pub mod buffer;
pub mod commands;
pub mod device;
pub mod gpu;
pub mod image;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub mod mock;

pub use buffer::HostBuffer;
pub use commands::{CommandPipeline, DrawItem, FrameParameters, PipelineBinding, RenderTarget};
pub use device::VulkanDevice;
pub use gpu::{DescriptorBinding, GpuDevice, QueueInfo};
pub use image::{ImageAllocation, DEPTH_FORMAT};
pub use swapchain::{AcquireOutcome, SurfaceProperties, SwapchainManager};
pub use sync::{FenceState, FrameSync, PoolResetToken};
