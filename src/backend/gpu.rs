// Device seam
//
// Every call the frame core makes against the logical device, its queues and
// the presentation engine goes through `GpuDevice`. `VulkanDevice` is the real
// implementation; tests drive the same protocol against an in-memory device.

use ash::prelude::VkResult;
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use super::image::ImageAllocation;

/// A queue and the family it was created from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueInfo {
    pub family: u32,
    pub queue: vk::Queue,
}

/// Everything needed to build a swapchain, already negotiated
#[derive(Debug, Clone)]
pub struct SwapchainDesc<'a> {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub sharing_mode: vk::SharingMode,
    pub queue_families: &'a [u32],
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub present_mode: vk::PresentModeKHR,
    pub old_swapchain: vk::SwapchainKHR,
}

/// One primary command buffer submission with its frame-slot signaling
#[derive(Debug, Clone, Copy)]
pub struct SubmitDesc {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Dynamic rendering targets for one pass
#[derive(Debug, Clone, Copy)]
pub struct RenderingDesc {
    pub color_view: vk::ImageView,
    pub depth_view: Option<vk::ImageView>,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// Device address of a descriptor buffer plus how it is used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub address: vk::DeviceAddress,
    pub usage: vk::BufferUsageFlags,
}

pub trait GpuDevice {
    fn graphics_queue(&self) -> QueueInfo;
    fn present_queue(&self) -> QueueInfo;

    /// Distinct queue family indices taking part in presentation
    fn unique_queue_families(&self) -> Vec<u32> {
        let graphics = self.graphics_queue().family;
        let present = self.present_queue().family;
        if graphics == present {
            vec![graphics]
        } else {
            vec![graphics, present]
        }
    }

    // -- synchronization --------------------------------------------------

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// Returns `Err(vk::Result::TIMEOUT)` when the bound expires
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;
    fn wait_idle(&self) -> VkResult<()>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;

    // -- commands ---------------------------------------------------------

    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn reset_command_pool(&self, pool: vk::CommandPool) -> VkResult<()>;
    fn allocate_primary_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> VkResult<()>;
    fn cmd_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        aspect: vk::ImageAspectFlags,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    );
    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, desc: &RenderingDesc);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_set_viewports(&self, cmd: vk::CommandBuffer, viewports: &[vk::Viewport]);
    fn cmd_set_scissors(&self, cmd: vk::CommandBuffer, scissors: &[vk::Rect2D]);
    fn cmd_bind_descriptor_buffers(&self, cmd: vk::CommandBuffer, bindings: &[DescriptorBinding]);
    fn cmd_set_descriptor_buffer_offsets(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        buffer_indices: &[u32],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_draw_mesh_tasks(&self, cmd: vk::CommandBuffer, group_count: u32);
    fn queue_submit(&self, queue: vk::Queue, submit: &SubmitDesc) -> VkResult<()>;

    // -- presentation -----------------------------------------------------

    fn create_surface(
        &self,
        display: RawDisplayHandle,
        window: RawWindowHandle,
    ) -> VkResult<vk::SurfaceKHR>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
    fn surface_capabilities(&self, surface: vk::SurfaceKHR) -> VkResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self, surface: vk::SurfaceKHR) -> VkResult<Vec<vk::PresentModeKHR>>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// `Ok((index, suboptimal))` like `vkAcquireNextImageKHR`
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;
    /// `Ok(suboptimal)` like `vkQueuePresentKHR`
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> VkResult<bool>;

    // -- images -----------------------------------------------------------

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Device-owned depth attachment sized to `extent`
    fn create_depth_target(&self, extent: vk::Extent2D) -> VkResult<ImageAllocation>;
    /// Release an image the application allocated itself
    fn destroy_device_image(
        &self,
        image: vk::Image,
        allocation: Option<gpu_allocator::vulkan::Allocation>,
    );
}
